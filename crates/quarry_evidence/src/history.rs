//! Session-wide marker history.
//!
//! Output arrives one execution at a time. The history numbers every chunk
//! by its position in the concatenated session stream, so marker line
//! numbers are monotonic across executions and match what `parse` returns
//! on the concatenation.

use crate::marker::{Marker, parse_with_offset};

/// Accumulated markers over a session's output stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerHistory {
    markers: Vec<Marker>,
    lines: usize,
}

impl MarkerHistory {
    /// Create an empty history
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a history from chunks in stream order
    #[must_use]
    pub fn from_chunks<'a, I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut history = Self::new();
        for chunk in chunks {
            history.push_chunk(chunk);
        }
        history
    }

    /// Append one chunk of output and return the markers found in it
    ///
    /// Returned markers carry stream-wide line numbers.
    pub fn push_chunk(&mut self, text: &str) -> Vec<Marker> {
        let found = parse_with_offset(text, self.lines);
        self.lines += text.lines().count();
        self.markers.extend(found.iter().cloned());
        found
    }

    /// All markers in stream order
    #[must_use]
    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    /// Number of lines seen so far
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.lines
    }

    /// Number of markers seen so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.markers.len()
    }

    /// Whether no markers have been seen
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

/// Join chunks the way the history numbers them
///
/// Each non-empty chunk is terminated by a newline so line counts agree
/// with [`MarkerHistory::push_chunk`].
#[must_use]
pub fn concat_chunks<'a, I>(chunks: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out = String::new();
    for chunk in chunks {
        out.push_str(chunk);
        if !chunk.is_empty() && !chunk.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::parse;

    #[test]
    fn test_push_chunk_offsets() {
        let mut history = MarkerHistory::new();
        let first = history.push_chunk("[STAT:ci] a\nnoise\n");
        let second = history.push_chunk("[FINDING] b");

        assert_eq!(first[0].line_number, 1);
        assert_eq!(second[0].line_number, 3);
        assert_eq!(history.len(), 2);
        assert_eq!(history.line_count(), 3);
    }

    #[test]
    fn test_history_matches_concatenated_parse() {
        let chunks = ["[DATA] rows=5\nplain", "", "x\n[FINDING] y\n", "[STAT:ci] z"];
        let history = MarkerHistory::from_chunks(chunks);
        let whole = parse(&concat_chunks(chunks));
        assert_eq!(history.markers(), whole.as_slice());
    }

    #[test]
    fn test_monotonic_across_chunks() {
        let history = MarkerHistory::from_chunks(["[INFO] a\n[INFO] b\n", "[INFO] c\n"]);
        let lines: Vec<usize> = history.markers().iter().map(|m| m.line_number).collect();
        assert_eq!(lines, vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_history() {
        let history = MarkerHistory::new();
        assert!(history.is_empty());
        assert_eq!(history.line_count(), 0);
    }
}
