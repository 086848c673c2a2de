//! Bridge configuration.

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::MAX_FRAME_LEN;
use quarry_core::{CoreError, SessionId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the runtime directory
pub const ENV_RUNTIME_DIR: &str = "QUARRY_RUNTIME_DIR";

/// Bridge configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Ephemeral directory holding lock files and socket endpoints
    pub runtime_dir: PathBuf,
    /// How long a spawned worker has to complete the ready handshake
    pub handshake_timeout_ms: u64,
    /// Default wait for `execute` when the caller passes no timeout
    pub execute_timeout_ms: u64,
    /// Interval for lock refreshes and worker heartbeats
    pub heartbeat_interval_ms: u64,
    /// Heartbeat age after which a lock owner is considered gone
    pub lock_stale_after_ms: u64,
    /// Bounded wait for a worker to exit after a shutdown request
    pub shutdown_grace_ms: u64,
    /// Largest frame either side may send, in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_max_frame_bytes() -> usize {
    MAX_FRAME_LEN
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            handshake_timeout_ms: 15_000,
            execute_timeout_ms: 300_000,
            heartbeat_interval_ms: 5_000,
            lock_stale_after_ms: 30_000,
            shutdown_grace_ms: 3_000,
            max_frame_bytes: MAX_FRAME_LEN,
        }
    }
}

impl BridgeConfig {
    /// Create a config rooted at a specific runtime directory
    #[must_use]
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
            ..Self::default()
        }
    }

    /// Load defaults, then apply `QUARRY_*` environment overrides
    ///
    /// # Errors
    ///
    /// Returns error if a numeric override does not parse
    pub fn from_env() -> BridgeResult<Self> {
        let mut config = Self::default();
        config.handshake_timeout_ms =
            env_millis("QUARRY_HANDSHAKE_TIMEOUT_MS", config.handshake_timeout_ms)?;
        config.execute_timeout_ms =
            env_millis("QUARRY_EXECUTE_TIMEOUT_MS", config.execute_timeout_ms)?;
        config.heartbeat_interval_ms =
            env_millis("QUARRY_HEARTBEAT_INTERVAL_MS", config.heartbeat_interval_ms)?;
        config.lock_stale_after_ms =
            env_millis("QUARRY_LOCK_STALE_AFTER_MS", config.lock_stale_after_ms)?;
        config.shutdown_grace_ms = env_millis("QUARRY_SHUTDOWN_GRACE_MS", config.shutdown_grace_ms)?;
        config.max_frame_bytes = env_number("QUARRY_MAX_FRAME_BYTES", config.max_frame_bytes as u64, "bytes")? as usize;
        Ok(config)
    }

    /// Set the handshake timeout
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout_ms: u64) -> Self {
        self.handshake_timeout_ms = timeout_ms;
        self
    }

    /// Set the default execute timeout
    #[must_use]
    pub fn with_execute_timeout(mut self, timeout_ms: u64) -> Self {
        self.execute_timeout_ms = timeout_ms;
        self
    }

    /// Set the heartbeat interval
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    /// Set the lock staleness grace period
    #[must_use]
    pub fn with_lock_stale_after(mut self, stale_after_ms: u64) -> Self {
        self.lock_stale_after_ms = stale_after_ms;
        self
    }

    /// Set the shutdown grace period
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace_ms: u64) -> Self {
        self.shutdown_grace_ms = grace_ms;
        self
    }

    /// Set the frame limit
    #[must_use]
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Lock file for a session
    #[must_use]
    pub fn lock_path(&self, session_id: &SessionId) -> PathBuf {
        lock_path_in(&self.runtime_dir, session_id)
    }

    /// Socket endpoint for a session
    #[must_use]
    pub fn socket_path(&self, session_id: &SessionId) -> PathBuf {
        socket_path_in(&self.runtime_dir, session_id)
    }

    /// Heartbeat interval as a duration
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    /// Lock grace period as a duration
    #[must_use]
    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_millis(self.lock_stale_after_ms)
    }
}

/// Lock file path inside a runtime directory
#[must_use]
pub fn lock_path_in(runtime_dir: &Path, session_id: &SessionId) -> PathBuf {
    runtime_dir.join(format!("{}.lock", session_id))
}

/// Socket path inside a runtime directory
///
/// Named by a short hash of the session id so the path stays well under
/// the Unix socket path limit.
#[must_use]
pub fn socket_path_in(runtime_dir: &Path, session_id: &SessionId) -> PathBuf {
    let hash = blake3::hash(session_id.as_str().as_bytes()).to_hex();
    runtime_dir.join(format!("{}.sock", &hash.as_str()[..16]))
}

/// OS-appropriate ephemeral directory for locks and sockets
///
/// `$QUARRY_RUNTIME_DIR`, then `$XDG_RUNTIME_DIR/quarry`, then
/// `<tmp>/quarry-<user>`. Never inside a project tree.
#[must_use]
pub fn default_runtime_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(ENV_RUNTIME_DIR).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    if let Some(dir) = std::env::var_os("XDG_RUNTIME_DIR").filter(|v| !v.is_empty()) {
        return PathBuf::from(dir).join("quarry");
    }
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "user".to_string());
    std::env::temp_dir().join(format!("quarry-{}", user))
}

fn env_millis(name: &str, default: u64) -> BridgeResult<u64> {
    env_number(name, default, "milliseconds")
}

fn env_number(name: &str, default: u64, unit: &str) -> BridgeResult<u64> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<u64>().map_err(|_| {
            BridgeError::InvalidSession(CoreError::Validation {
                field: name.to_string(),
                reason: format!("expected {}, got {:?}", unit, raw),
            })
        }),
        Err(_) => Ok(default),
    }
}
