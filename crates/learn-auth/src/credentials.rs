//! Credential pair storage
//!
//! The store is synchronous: every operation is a short critical section over
//! an in-memory copy, and the file backend writes through to disk with an
//! atomic temp-file + rename so a crash can never leave a half-written pair.
//! Readers always see either the old pair or the new pair, never a mix.
//!
//! On disk the pair is a JSON object with two string entries, `access_token`
//! and `refresh_token`. A missing `access_token` means logged out.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// The access/refresh credential pair.
///
/// `refresh` is optional: some login flows only hand out an access token.
#[derive(Debug, Clone)]
pub struct CredentialPair {
    pub access: Secret<String>,
    pub refresh: Option<Secret<String>>,
}

impl CredentialPair {
    pub fn new(access: impl Into<String>, refresh: Option<String>) -> Self {
        Self {
            access: Secret::new(access.into()),
            refresh: refresh.map(Secret::new),
        }
    }

    /// Build the pair that follows a successful refresh.
    ///
    /// The access token is always replaced. The refresh token is replaced only
    /// when the endpoint rotated it; otherwise the current one is kept.
    pub fn rotated(&self, access: String, refresh: Option<String>) -> Self {
        Self {
            access: Secret::new(access),
            refresh: refresh.map(Secret::new).or_else(|| self.refresh.clone()),
        }
    }
}

/// Durable, synchronous storage for the credential pair.
///
/// Implementations must make `set` atomic with respect to `get`, and `clear`
/// idempotent. `clear` reports whether a pair was actually removed so callers
/// can avoid emitting duplicate teardown signals.
///
/// Operations are called from async tasks, sometimes while the client's
/// session locks are held, so they must be short: a local write at most,
/// never a network round trip.
pub trait CredentialStore: Send + Sync {
    /// Current pair, or `None` when logged out. Never fails.
    fn get(&self) -> Option<CredentialPair>;

    /// Replace the stored pair.
    fn set(&self, pair: &CredentialPair) -> Result<()>;

    /// Remove the stored pair. Returns `true` if one was present.
    fn clear(&self) -> Result<bool>;
}

/// Serialized form of the pair, keyed by the fixed storage keys.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
}

impl StoredCredentials {
    fn into_pair(self) -> Option<CredentialPair> {
        let access = self.access_token.filter(|t| !t.is_empty())?;
        Some(CredentialPair::new(
            access,
            self.refresh_token.filter(|t| !t.is_empty()),
        ))
    }

    fn from_pair(pair: &CredentialPair) -> Self {
        Self {
            access_token: Some(pair.access.expose().clone()),
            refresh_token: pair.refresh.as_ref().map(|r| r.expose().clone()),
        }
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked. The
/// guarded value is always a complete pair (or none), so it stays valid.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// File-backed credential store that survives process restarts.
pub struct FileCredentialStore {
    path: PathBuf,
    state: Mutex<Option<CredentialPair>>,
}

impl FileCredentialStore {
    /// Load the pair from `path`.
    ///
    /// A missing file is a logged-out store; the file is only created by the
    /// first `set`. A file holding a refresh token without an access token is
    /// also treated as logged out.
    pub fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let stored: StoredCredentials = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            let pair = stored.into_pair();
            info!(path = %path.display(), logged_in = pair.is_some(), "loaded credentials");
            pair
        } else {
            info!(path = %path.display(), "credential file not found, starting logged out");
            None
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Option<CredentialPair> {
        lock(&self.state).clone()
    }

    fn set(&self, pair: &CredentialPair) -> Result<()> {
        let mut state = lock(&self.state);
        write_atomic(&self.path, &StoredCredentials::from_pair(pair))?;
        *state = Some(pair.clone());
        debug!(has_refresh = pair.refresh.is_some(), "stored credential pair");
        Ok(())
    }

    fn clear(&self) -> Result<bool> {
        let mut state = lock(&self.state);
        // Memory follows disk: on a failed removal the pair stays in both.
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed credential file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to remove credential file");
                return Err(Error::Io(format!("removing credential file: {e}")));
            }
        }
        Ok(state.take().is_some())
    }
}

/// In-process store for tests and for hosts that manage persistence themselves.
#[derive(Default)]
pub struct MemoryCredentialStore {
    state: Mutex<Option<CredentialPair>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            state: Mutex::new(Some(pair)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<CredentialPair> {
        lock(&self.state).clone()
    }

    fn set(&self, pair: &CredentialPair) -> Result<()> {
        *lock(&self.state) = Some(pair.clone());
        Ok(())
    }

    fn clear(&self) -> Result<bool> {
        Ok(lock(&self.state).take().is_some())
    }
}

/// Temp file the next write goes through, next to the target.
fn temp_path(path: &Path) -> PathBuf {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    dir.join(format!(".credentials.tmp.{}", std::process::id()))
}

/// Write the pair to a file atomically.
///
/// The temp file is created 0600 (owner read/write) on unix since it holds
/// bearer tokens, then renamed over the target.
fn write_atomic(path: &Path, data: &StoredCredentials) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let tmp_path = temp_path(path);
    // A leftover from an interrupted write may carry other permissions.
    match std::fs::remove_file(&tmp_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::Io(format!("removing stale temp credential file: {e}"))),
    }

    if let Err(e) = write_private(&tmp_path, json.as_bytes()) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(Error::Io(format!("writing temp credential file: {e}")));
    }

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(Error::Io(format!("renaming temp credential file: {e}")));
    }

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}

fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
