//! Quality gates over a marker history.
//!
//! Two rule families:
//!
//! - **Finding gating**: every `FINDING` needs a `STAT:ci` and a
//!   `STAT:effect_size` within the preceding window of lines.
//! - **ML pipeline gating**: once any `METRIC` subtype names a model metric,
//!   the history must also report a baseline, cross-validation, and an
//!   interpretation metric.
//!
//! Violations are data: evaluation always succeeds and is recomputed from
//! scratch on every call.

use crate::marker::{Marker, MarkerType};
use serde::{Deserialize, Serialize};

/// Subtypes that mark a METRIC as a model-quality metric (substring match)
pub const ML_METRIC_VOCABULARY: [&str; 9] = [
    "accuracy",
    "precision",
    "recall",
    "f1",
    "auc",
    "rmse",
    "mae",
    "r2",
    "mse",
];

/// Subtypes that count as model interpretation (substring match)
pub const INTERPRETATION_VOCABULARY: [&str; 5] = [
    "feature_importance",
    "top_features",
    "shap",
    "permutation_importance",
    "interpretation",
];

/// Gate configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Lines before a finding searched for supporting statistics
    pub finding_window: usize,
    /// Penalty for a finding without a confidence interval
    pub penalty_no_ci: u32,
    /// Penalty for a finding without an effect size
    pub penalty_no_effect_size: u32,
    /// Penalty for an ML pipeline without a baseline
    pub penalty_no_baseline: u32,
    /// Penalty for an ML pipeline without cross-validation
    pub penalty_no_cv: u32,
    /// Penalty for an ML pipeline without interpretation
    pub penalty_no_interpretation: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            finding_window: 10,
            penalty_no_ci: 30,
            penalty_no_effect_size: 30,
            penalty_no_baseline: 20,
            penalty_no_cv: 25,
            penalty_no_interpretation: 15,
        }
    }
}

/// Kind of quality violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    /// Finding without a preceding confidence interval
    FindingNoCi,
    /// Finding without a preceding effect size
    FindingNoEffectSize,
    /// ML metrics without a baseline
    MlNoBaseline,
    /// ML metrics without cross-validation
    MlNoCv,
    /// ML metrics without interpretation
    MlNoInterpretation,
}

impl ViolationKind {
    /// Stable upper-case code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::FindingNoCi => "FINDING_NO_CI",
            Self::FindingNoEffectSize => "FINDING_NO_EFFECT_SIZE",
            Self::MlNoBaseline => "ML_NO_BASELINE",
            Self::MlNoCv => "ML_NO_CV",
            Self::MlNoInterpretation => "ML_NO_INTERPRETATION",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A single rule violation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Violation kind
    #[serde(rename = "type")]
    pub kind: ViolationKind,
    /// Human-readable explanation
    pub message: String,
    /// Line of the marker that triggered the rule
    pub line_number: usize,
    /// Content of the marker that triggered the rule
    pub content: String,
    /// Points deducted from the score
    pub penalty: u32,
}

/// Finding verification counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingsValidation {
    /// Findings seen
    pub total: usize,
    /// Findings with both a CI and an effect size in range
    pub verified: usize,
    /// Findings missing at least one
    pub unverified: usize,
}

/// ML pipeline checks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MlValidation {
    /// Whether any model metric was reported
    pub detected: bool,
    /// A `baseline*` metric was reported
    pub has_baseline: bool,
    /// A `cv*` metric was reported
    pub has_cv: bool,
    /// An interpretation metric was reported
    pub has_interpretation: bool,
}

/// Result of a gate evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityGateResult {
    /// True iff there are no violations
    pub passed: bool,
    /// Violations in rule order
    pub violations: Vec<Violation>,
    /// `max(0, 100 - sum of penalties)`
    pub score: u32,
    /// Finding counts
    pub findings_validation: FindingsValidation,
    /// ML checks
    pub ml_validation: MlValidation,
}

impl QualityGateResult {
    /// Total penalty applied
    #[must_use]
    pub fn total_penalty(&self) -> u32 {
        self.violations.iter().map(|v| v.penalty).sum()
    }
}

/// Quality gate evaluator
#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    config: GateConfig,
}

impl QualityGate {
    /// Create a gate with default rules
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with custom configuration
    #[must_use]
    pub fn with_config(config: GateConfig) -> Self {
        Self { config }
    }

    /// Get configuration
    #[must_use]
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Evaluate the full marker history
    #[must_use]
    pub fn evaluate(&self, markers: &[Marker]) -> QualityGateResult {
        let mut violations = Vec::new();

        let findings_validation = self.check_findings(markers, &mut violations);
        let ml_validation = self.check_ml_pipeline(markers, &mut violations);

        let penalty: u32 = violations.iter().map(|v: &Violation| v.penalty).sum();
        QualityGateResult {
            passed: violations.is_empty(),
            score: 100u32.saturating_sub(penalty),
            violations,
            findings_validation,
            ml_validation,
        }
    }

    /// Evaluate raw text
    #[must_use]
    pub fn evaluate_text(&self, text: &str) -> QualityGateResult {
        self.evaluate(&crate::marker::parse(text))
    }

    fn check_findings(&self, markers: &[Marker], violations: &mut Vec<Violation>) -> FindingsValidation {
        let mut counts = FindingsValidation::default();

        for finding in markers.iter().filter(|m| m.marker_type == MarkerType::Finding) {
            counts.total += 1;
            let has_ci = self.stat_in_window(markers, finding.line_number, "ci");
            let has_effect = self.stat_in_window(markers, finding.line_number, "effect_size");

            if !has_ci {
                violations.push(Violation {
                    kind: ViolationKind::FindingNoCi,
                    message: format!(
                        "Finding on line {} has no [STAT:ci] within the previous {} lines",
                        finding.line_number, self.config.finding_window
                    ),
                    line_number: finding.line_number,
                    content: finding.content.clone(),
                    penalty: self.config.penalty_no_ci,
                });
            }
            if !has_effect {
                violations.push(Violation {
                    kind: ViolationKind::FindingNoEffectSize,
                    message: format!(
                        "Finding on line {} has no [STAT:effect_size] within the previous {} lines",
                        finding.line_number, self.config.finding_window
                    ),
                    line_number: finding.line_number,
                    content: finding.content.clone(),
                    penalty: self.config.penalty_no_effect_size,
                });
            }

            if has_ci && has_effect {
                counts.verified += 1;
            } else {
                counts.unverified += 1;
            }
        }

        counts
    }

    /// Window is `[max(1, line - window), line)`
    fn stat_in_window(&self, markers: &[Marker], line: usize, subtype: &str) -> bool {
        let start = line.saturating_sub(self.config.finding_window).max(1);
        markers.iter().any(|m| {
            m.is(MarkerType::Stat, subtype) && m.line_number >= start && m.line_number < line
        })
    }

    fn check_ml_pipeline(&self, markers: &[Marker], violations: &mut Vec<Violation>) -> MlValidation {
        let metrics: Vec<&Marker> = markers
            .iter()
            .filter(|m| m.marker_type == MarkerType::Metric)
            .collect();

        let Some(trigger) = metrics.iter().find(|m| {
            let subtype = m.subtype_str();
            ML_METRIC_VOCABULARY.iter().any(|word| subtype.contains(word))
        }) else {
            return MlValidation::default();
        };

        let validation = MlValidation {
            detected: true,
            has_baseline: metrics.iter().any(|m| m.subtype_str().starts_with("baseline")),
            has_cv: metrics.iter().any(|m| m.subtype_str().starts_with("cv")),
            has_interpretation: metrics.iter().any(|m| {
                let subtype = m.subtype_str();
                INTERPRETATION_VOCABULARY.iter().any(|word| subtype.contains(word))
            }),
        };

        let mut push = |kind: ViolationKind, message: &str, penalty: u32| {
            violations.push(Violation {
                kind,
                message: message.to_string(),
                line_number: trigger.line_number,
                content: trigger.content.clone(),
                penalty,
            });
        };

        if !validation.has_baseline {
            push(
                ViolationKind::MlNoBaseline,
                "Model metrics reported without a [METRIC:baseline_*] comparison",
                self.config.penalty_no_baseline,
            );
        }
        if !validation.has_cv {
            push(
                ViolationKind::MlNoCv,
                "Model metrics reported without a [METRIC:cv_*] cross-validation result",
                self.config.penalty_no_cv,
            );
        }
        if !validation.has_interpretation {
            push(
                ViolationKind::MlNoInterpretation,
                "Model metrics reported without feature importance or other interpretation",
                self.config.penalty_no_interpretation,
            );
        }

        validation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(result: &QualityGateResult) -> Vec<ViolationKind> {
        result.violations.iter().map(|v| v.kind).collect()
    }

    #[test]
    fn test_supported_finding_passes() {
        let gate = QualityGate::new();
        let result = gate.evaluate_text(
            "[STAT:ci] 95% CI [0.1,0.2]\n[STAT:effect_size] d=0.5\n[FINDING] effect confirmed",
        );
        assert!(result.passed);
        assert!(result.violations.is_empty());
        assert_eq!(result.score, 100);
        assert_eq!(result.findings_validation.total, 1);
        assert_eq!(result.findings_validation.verified, 1);
        assert_eq!(result.findings_validation.unverified, 0);
    }

    #[test]
    fn test_lone_finding_two_violations() {
        let result = QualityGate::new().evaluate_text("[FINDING] x");
        assert!(!result.passed);
        assert_eq!(
            kinds(&result),
            vec![ViolationKind::FindingNoCi, ViolationKind::FindingNoEffectSize]
        );
        assert_eq!(result.score, 40);
        assert_eq!(result.violations[0].line_number, 1);
        assert_eq!(result.violations[0].content, "x");
        assert_eq!(result.findings_validation.unverified, 1);
    }

    #[test]
    fn test_ml_metric_without_support() {
        let result = QualityGate::new().evaluate_text("[METRIC:accuracy] 0.9");
        assert_eq!(
            kinds(&result),
            vec![
                ViolationKind::MlNoBaseline,
                ViolationKind::MlNoCv,
                ViolationKind::MlNoInterpretation
            ]
        );
        assert_eq!(result.total_penalty(), 60);
        assert_eq!(result.score, 40);
        assert!(result.ml_validation.detected);
        assert!(!result.ml_validation.has_baseline);
    }

    #[test]
    fn test_ml_pipeline_complete() {
        let text = "\
[METRIC:baseline_accuracy] 0.62
[METRIC:cv_accuracy_mean] 0.88
[METRIC:test_f1] 0.86
[METRIC:top_features] tenure, plan
";
        let result = QualityGate::new().evaluate_text(text);
        assert!(result.passed);
        assert_eq!(result.score, 100);
        assert!(result.ml_validation.has_baseline);
        assert!(result.ml_validation.has_cv);
        assert!(result.ml_validation.has_interpretation);
    }

    #[test]
    fn test_non_ml_metric_does_not_trigger() {
        let result = QualityGate::new().evaluate_text("[METRIC:row_count] 1200\n[METRIC:latency_ms] 40");
        assert!(result.passed);
        assert!(!result.ml_validation.detected);
    }

    #[test]
    fn test_window_boundary_ten_lines() {
        // STAT on line 1, FINDING on line 11: exactly 10 lines before
        let mut lines = vec!["[STAT:ci] ci".to_string()];
        lines.extend((0..9).map(|i| format!("filler {}", i)));
        lines.push("[FINDING] f".to_string());
        let text = lines.join("\n");

        let result = QualityGate::new().evaluate_text(&text);
        assert_eq!(kinds(&result), vec![ViolationKind::FindingNoEffectSize]);
    }

    #[test]
    fn test_window_boundary_eleven_lines() {
        // STAT on line 1, FINDING on line 12: 11 lines before
        let mut lines = vec!["[STAT:ci] ci".to_string()];
        lines.extend((0..10).map(|i| format!("filler {}", i)));
        lines.push("[FINDING] f".to_string());
        let text = lines.join("\n");

        let result = QualityGate::new().evaluate_text(&text);
        assert_eq!(
            kinds(&result),
            vec![ViolationKind::FindingNoCi, ViolationKind::FindingNoEffectSize]
        );
    }

    #[test]
    fn test_stat_after_finding_does_not_count() {
        let result = QualityGate::new()
            .evaluate_text("[FINDING] f\n[STAT:ci] late\n[STAT:effect_size] late");
        assert_eq!(result.violations.len(), 2);
    }

    #[test]
    fn test_subtype_exact_for_stats() {
        let result = QualityGate::new()
            .evaluate_text("[STAT:ci_lower] 0.1\n[STAT:effect_size] 0.4\n[FINDING] f");
        assert_eq!(kinds(&result), vec![ViolationKind::FindingNoCi]);
    }

    #[test]
    fn test_score_floors_at_zero() {
        let text = "[FINDING] a\n[FINDING] b\n[METRIC:auc] 0.7";
        let result = QualityGate::new().evaluate_text(text);
        assert_eq!(result.total_penalty(), 180);
        assert_eq!(result.score, 0);
    }

    #[test]
    fn test_evaluate_idempotent() {
        let gate = QualityGate::new();
        let markers = crate::marker::parse("[FINDING] a\n[METRIC:rmse] 3.1");
        assert_eq!(gate.evaluate(&markers), gate.evaluate(&markers));
    }

    #[test]
    fn test_custom_config() {
        let gate = QualityGate::with_config(GateConfig {
            finding_window: 1,
            ..GateConfig::default()
        });
        let result = gate.evaluate_text("[STAT:ci] a\n[STAT:effect_size] b\n[FINDING] c");
        // Only line 2 is inside a one-line window
        assert_eq!(kinds(&result), vec![ViolationKind::FindingNoCi]);
    }

    #[test]
    fn test_violation_serde_code() {
        let result = QualityGate::new().evaluate_text("[FINDING] x");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["violations"][0]["type"], "FINDING_NO_CI");
        assert_eq!(json["violations"][0]["penalty"], 30);
    }
}
