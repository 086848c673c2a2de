//! Session lock.
//!
//! One JSON lock file per session in the runtime directory. Ownership is
//! established with an exclusive create and kept alive by rewriting
//! `heartbeat_at`. A lock whose heartbeat is older than the grace period is
//! treated as abandoned and may be reclaimed; the recorded pid is
//! informational only and never used for liveness.

use crate::config::{lock_path_in, socket_path_in};
use crate::error::{BridgeError, BridgeResult};
use quarry_core::fs::write_atomic_with_mode;
use quarry_core::{OwnerId, SessionId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const LOCK_FILE_MODE: u32 = 0o600;
const RUNTIME_DIR_MODE: u32 = 0o700;
const ACQUIRE_ATTEMPTS: usize = 3;

/// Contents of a lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Locked session
    pub session_id: SessionId,
    /// Owning supervisor
    pub owner: OwnerId,
    /// Owner's process id, for operators
    pub pid: u32,
    /// When the lock was first taken
    pub acquired_at: Timestamp,
    /// Last refresh by the owner
    pub heartbeat_at: Timestamp,
    /// Socket endpoint of the running worker, if any
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
}

impl LockRecord {
    fn fresh(session_id: SessionId, owner: OwnerId) -> Self {
        let now = Timestamp::now();
        Self {
            session_id,
            owner,
            pid: std::process::id(),
            acquired_at: now,
            heartbeat_at: now,
            socket_path: None,
        }
    }

    /// Time since the last heartbeat
    #[must_use]
    pub fn heartbeat_age(&self) -> Duration {
        self.heartbeat_at.age()
    }

    /// Whether the owner has refreshed within the grace period
    #[must_use]
    pub fn is_live(&self, stale_after: Duration) -> bool {
        self.heartbeat_age() <= stale_after
    }
}

/// One entry of [`list`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Session named by the lock file
    pub session_id: SessionId,
    /// Parsed record, `None` if the file was unreadable
    pub record: Option<LockRecord>,
    /// Whether an owner is considered alive
    pub live: bool,
}

/// What a conflicting lock file looks like right now
#[derive(Debug)]
enum Holder {
    /// Readable and refreshed within the grace period
    Live(LockRecord),
    /// Unreadable but recently modified (likely mid-create)
    Young,
    /// Abandoned
    Stale(Option<LockRecord>),
    /// Disappeared between the create attempt and the check
    Gone,
}

fn inspect_holder(path: &Path, stale_after: Duration) -> BridgeResult<Holder> {
    match read_record(path) {
        Ok(Some(record)) if record.is_live(stale_after) => Ok(Holder::Live(record)),
        Ok(Some(record)) => Ok(Holder::Stale(Some(record))),
        Ok(None) => Ok(Holder::Gone),
        Err(_) => {
            let modified = match fs::metadata(path).and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Holder::Gone),
                Err(e) => return Err(BridgeError::io("stat lock file")(e)),
            };
            let age = SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO);
            if age <= stale_after {
                Ok(Holder::Young)
            } else {
                Ok(Holder::Stale(None))
            }
        }
    }
}

/// Read a lock record; `Ok(None)` if the file does not exist
fn read_record(path: &Path) -> Result<Option<LockRecord>, String> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.to_string()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| e.to_string())
}

/// Create the runtime directory with owner-only permissions
///
/// # Errors
///
/// Returns error if the directory cannot be created
pub fn ensure_runtime_dir(dir: &Path) -> BridgeResult<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(RUNTIME_DIR_MODE);
    }
    builder
        .create(dir)
        .map_err(BridgeError::io(format!("create runtime dir {}", dir.display())))
}

fn locked_error(session_id: &SessionId, record: Option<&LockRecord>) -> BridgeError {
    BridgeError::SessionLocked {
        session_id: session_id.clone(),
        owner: record.map(|r| r.owner),
        pid: record.map(|r| r.pid),
        heartbeat_age_ms: record.map(|r| r.heartbeat_age().as_millis() as u64),
    }
}

/// Exclusive hold on one session
///
/// Dropping the lock without [`SessionLock::release`] still removes the
/// file if this owner holds it.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
    record: LockRecord,
    released: bool,
}

impl SessionLock {
    /// Acquire the lock for `session_id` in `runtime_dir`
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::SessionLocked`] while another owner's heartbeat
    /// is within `stale_after`, or an I/O error
    pub fn acquire(
        runtime_dir: &Path,
        session_id: &SessionId,
        stale_after: Duration,
    ) -> BridgeResult<Self> {
        ensure_runtime_dir(runtime_dir)?;
        let path = lock_path_in(runtime_dir, session_id);
        let owner = OwnerId::new();

        for attempt in 0..ACQUIRE_ATTEMPTS {
            let record = LockRecord::fresh(session_id.clone(), owner);
            match create_exclusive(&path, &record) {
                Ok(()) => {
                    info!(session = %session_id, owner = %owner, "Acquired session lock");
                    return Ok(Self {
                        path,
                        record,
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(BridgeError::io("create lock file")(e)),
            }

            match inspect_holder(&path, stale_after)? {
                Holder::Live(existing) => return Err(locked_error(session_id, Some(&existing))),
                Holder::Young => return Err(locked_error(session_id, None)),
                Holder::Gone => {
                    debug!(session = %session_id, attempt, "Lock vanished, retrying");
                }
                Holder::Stale(existing) => {
                    warn!(
                        session = %session_id,
                        previous_owner = ?existing.as_ref().map(|r| r.owner),
                        "Reclaiming stale session lock"
                    );
                    reclaim(&path, stale_after)?;
                }
            }
        }

        Err(locked_error(session_id, None))
    }

    /// Current record as last written by this owner
    #[must_use]
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Path of the lock file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Owner identity of this holder
    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.record.owner
    }

    /// Refresh `heartbeat_at`
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::LockLost`] if the file was removed or taken
    /// over by another owner
    pub fn refresh(&mut self) -> BridgeResult<()> {
        self.verify_owned()?;
        let mut next = self.record.clone();
        next.heartbeat_at = Timestamp::now();
        self.write(next)
    }

    /// Record the socket endpoint of the running worker
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::LockLost`] if the lock is no longer held
    pub fn set_socket_path(&mut self, socket_path: Option<PathBuf>) -> BridgeResult<()> {
        self.verify_owned()?;
        let mut next = self.record.clone();
        next.socket_path = socket_path;
        next.heartbeat_at = Timestamp::now();
        self.write(next)
    }

    /// Remove the lock file
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::LockLost`] if another owner holds the file;
    /// that file is left in place
    pub fn release(mut self) -> BridgeResult<()> {
        self.released = true;
        self.verify_owned()?;
        remove_if_present(&self.path)?;
        info!(session = %self.record.session_id, "Released session lock");
        Ok(())
    }

    pub(crate) fn verify_owned(&self) -> BridgeResult<()> {
        match read_record(&self.path) {
            Ok(Some(current)) if current.owner == self.record.owner => Ok(()),
            _ => Err(BridgeError::LockLost {
                session_id: self.record.session_id.clone(),
            }),
        }
    }

    fn write(&mut self, next: LockRecord) -> BridgeResult<()> {
        let bytes = serde_json::to_vec_pretty(&next)
            .map_err(|e| BridgeError::Protocol(format!("encode lock record: {}", e)))?;
        write_atomic_with_mode(&self.path, &bytes, Some(LOCK_FILE_MODE))
            .map_err(BridgeError::io("rewrite lock file"))?;
        self.record = next;
        Ok(())
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.verify_owned().is_ok() {
            let _ = fs::remove_file(&self.path);
            debug!(session = %self.record.session_id, "Removed lock file on drop");
        }
    }
}

fn create_exclusive(path: &Path, record: &LockRecord) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(LOCK_FILE_MODE);
    }
    let mut file = options.open(path)?;
    let bytes = serde_json::to_vec_pretty(record)?;
    file.write_all(&bytes)?;
    file.sync_all()
}

/// Move a stale lock aside, putting it back if it turned out to be live
fn reclaim(path: &Path, stale_after: Duration) -> BridgeResult<()> {
    let tombstone = path.with_extension(format!(
        "stale-{}",
        uuid::Uuid::new_v4().simple()
    ));
    match fs::rename(path, &tombstone) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(BridgeError::io("move stale lock aside")(e)),
    }

    // The owner may have refreshed between our check and the rename.
    if let Ok(Some(record)) = read_record(&tombstone) {
        if record.is_live(stale_after) {
            warn!(session = %record.session_id, "Lock came back to life, restoring");
            let _ = fs::hard_link(&tombstone, path);
        }
    }
    remove_if_present(&tombstone)
}

fn remove_if_present(path: &Path) -> BridgeResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BridgeError::io(format!("remove {}", path.display()))(e)),
    }
}

/// Read the lock record for a session without taking it
///
/// # Errors
///
/// Returns error if the file exists but cannot be parsed
pub fn inspect(runtime_dir: &Path, session_id: &SessionId) -> BridgeResult<Option<LockRecord>> {
    read_record(&lock_path_in(runtime_dir, session_id)).map_err(BridgeError::Protocol)
}

/// Enumerate lock files in the runtime directory, sorted by session id
///
/// # Errors
///
/// Returns error if the directory exists but cannot be read
pub fn list(runtime_dir: &Path, stale_after: Duration) -> BridgeResult<Vec<SessionInfo>> {
    let entries = match fs::read_dir(runtime_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BridgeError::io("read runtime dir")(e)),
    };

    let mut sessions = Vec::new();
    for entry in entries {
        let entry = entry.map_err(BridgeError::io("read runtime dir entry"))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("lock") {
            continue;
        }
        let Some(session_id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| SessionId::parse(s).ok())
        else {
            continue;
        };
        let (record, live) = match inspect_holder(&path, stale_after)? {
            Holder::Live(record) => (Some(record), true),
            Holder::Young => (None, true),
            Holder::Stale(record) => (record, false),
            Holder::Gone => continue,
        };
        sessions.push(SessionInfo {
            session_id,
            record,
            live,
        });
    }
    sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
    Ok(sessions)
}

/// Remove a session's lock and socket endpoint
///
/// Refuses a live lock unless `force` is set. Returns whether a lock file
/// was removed.
///
/// # Errors
///
/// Returns [`BridgeError::SessionLocked`] for a live lock without `force`
pub fn unlock(
    runtime_dir: &Path,
    session_id: &SessionId,
    stale_after: Duration,
    force: bool,
) -> BridgeResult<bool> {
    let path = lock_path_in(runtime_dir, session_id);
    let record = match inspect_holder(&path, stale_after)? {
        Holder::Gone => {
            remove_if_present(&socket_path_in(runtime_dir, session_id))?;
            return Ok(false);
        }
        Holder::Live(record) if !force => return Err(locked_error(session_id, Some(&record))),
        Holder::Young if !force => return Err(locked_error(session_id, None)),
        Holder::Live(record) => Some(record),
        Holder::Young => None,
        Holder::Stale(record) => record,
    };

    remove_if_present(&path)?;
    let socket = record
        .and_then(|r| r.socket_path)
        .unwrap_or_else(|| socket_path_in(runtime_dir, session_id));
    remove_if_present(&socket)?;
    warn!(session = %session_id, force, "Unlocked session");
    Ok(true)
}
