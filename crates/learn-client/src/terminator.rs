//! Session teardown
//!
//! The terminator is the only place that clears credentials because of an
//! auth failure or logout, and the only place that announces the session's
//! end. The hosting application subscribes to `SessionEvent`s and decides what
//! "leave the authenticated area" means (navigate to a login screen, exit a
//! CLI, etc.); the client itself never navigates.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use common::Secret;
use learn_auth::{CredentialPair, CredentialStore};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the session event channel. Events are rare (one per login or
/// teardown), so a lagging subscriber only ever misses stale history.
const EVENT_CAPACITY: usize = 16;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The user logged out.
    Logout,
    /// The access token could not be renewed.
    RefreshFailed,
}

impl TerminationReason {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            TerminationReason::Logout => "logout",
            TerminationReason::RefreshFailed => "refresh_failed",
        }
    }
}

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Unauthenticated → authenticated (login).
    Authenticated,
    /// Authenticated → unauthenticated. Emitted once per teardown.
    Terminated { reason: TerminationReason },
}

/// Result of storing a refreshed pair.
#[derive(Debug)]
pub enum Rotation {
    /// The refreshed pair replaced the one that was rejected.
    Stored,
    /// A login replaced the session during the refresh; its token is kept.
    Replaced(Secret<String>),
    /// The session ended during the refresh; nothing was stored.
    Ended,
}

/// Clears credentials and announces the end of a session, exactly once.
///
/// Transitions are serialized by a mutex over the authenticated flag, and the
/// store is cleared while it is held, so concurrent `terminate` calls produce
/// one event between them. Logins and refreshed pairs are written under the
/// same lock, so a teardown never erases a session it did not observe.
pub struct SessionTerminator {
    store: Arc<dyn CredentialStore>,
    authenticated: Mutex<bool>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionTerminator {
    /// A store that already holds a pair (restored from disk) starts authenticated.
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        let authenticated = store.get().is_some();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            authenticated: Mutex::new(authenticated),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        *self.lock()
    }

    /// Store a freshly issued pair and mark the session authenticated.
    ///
    /// Emits `Authenticated` on the transition only; a re-login on an already
    /// authenticated session is silent.
    pub fn establish(&self, pair: &CredentialPair) -> learn_auth::Result<()> {
        let mut authenticated = self.lock();
        self.store.set(pair)?;
        if !*authenticated {
            *authenticated = true;
            let _ = self.events.send(SessionEvent::Authenticated);
        }
        Ok(())
    }

    /// Clear credentials and notify subscribers.
    ///
    /// Returns `true` if this call ended a session. Calling it while already
    /// unauthenticated with an empty store is a no-op that returns `false`.
    pub fn terminate(&self, reason: TerminationReason) -> bool {
        let mut authenticated = self.lock();
        self.end(&mut authenticated, reason)
    }

    /// End the session that presented `rejected_access`, unless the store
    /// already holds a different pair (a login happened meanwhile).
    ///
    /// Returns the newer access token when the session was replaced and left
    /// alone, `None` when the teardown ran.
    pub fn terminate_unless_replaced(
        &self,
        reason: TerminationReason,
        rejected_access: &str,
    ) -> Option<Secret<String>> {
        let mut authenticated = self.lock();
        if let Some(pair) = self.store.get()
            && !pair.access.matches(rejected_access)
        {
            debug!(reason = reason.label(), "session replaced, skipping teardown");
            return Some(pair.access);
        }
        self.end(&mut authenticated, reason);
        None
    }

    /// Store a refreshed pair if the session that asked for it is still the
    /// current one.
    pub fn rotate(
        &self,
        rejected_access: &str,
        rotated: &CredentialPair,
    ) -> learn_auth::Result<Rotation> {
        let _authenticated = self.lock();
        match self.store.get() {
            None => {
                debug!("session ended during refresh, discarding new token");
                Ok(Rotation::Ended)
            }
            Some(pair) if !pair.access.matches(rejected_access) => {
                debug!("session replaced during refresh, keeping newer token");
                Ok(Rotation::Replaced(pair.access))
            }
            Some(_) => {
                self.store.set(rotated)?;
                Ok(Rotation::Stored)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.authenticated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn end(&self, authenticated: &mut bool, reason: TerminationReason) -> bool {
        let cleared = match self.store.clear() {
            Ok(cleared) => cleared,
            Err(e) => {
                // The pair is still stored; a later failure retries the teardown.
                warn!(reason = reason.label(), error = %e, "failed to clear credential store");
                return false;
            }
        };

        let was_authenticated = std::mem::replace(authenticated, false);
        if !was_authenticated && !cleared {
            debug!(reason = reason.label(), "session already terminated");
            return false;
        }

        info!(reason = reason.label(), "session terminated");
        metrics::counter!("session_terminations_total", "reason" => reason.label()).increment(1);
        let _ = self.events.send(SessionEvent::Terminated { reason });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use learn_auth::MemoryCredentialStore;
    use tokio::sync::broadcast::error::TryRecvError;

    /// Store whose pair cannot be removed.
    struct StuckStore(MemoryCredentialStore);

    impl CredentialStore for StuckStore {
        fn get(&self) -> Option<CredentialPair> {
            self.0.get()
        }

        fn set(&self, pair: &CredentialPair) -> learn_auth::Result<()> {
            self.0.set(pair)
        }

        fn clear(&self) -> learn_auth::Result<bool> {
            Err(learn_auth::Error::Io("read-only file system".into()))
        }
    }

    fn logged_in_store() -> Arc<dyn CredentialStore> {
        Arc::new(MemoryCredentialStore::with_pair(CredentialPair::new(
            "T1",
            Some("R1".into()),
        )))
    }

    #[test]
    fn restored_store_starts_authenticated() {
        let terminator = SessionTerminator::new(logged_in_store());
        assert!(terminator.is_authenticated());

        let empty = SessionTerminator::new(Arc::new(MemoryCredentialStore::new()));
        assert!(!empty.is_authenticated());
    }

    #[test]
    fn terminate_clears_store_and_notifies_once() {
        let store = logged_in_store();
        let terminator = SessionTerminator::new(store.clone());
        let mut events = terminator.subscribe();

        assert!(terminator.terminate(TerminationReason::RefreshFailed));
        assert!(!terminator.terminate(TerminationReason::RefreshFailed));
        assert!(!terminator.terminate(TerminationReason::Logout));

        assert!(store.get().is_none());
        assert!(!terminator.is_authenticated());
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Terminated {
                reason: TerminationReason::RefreshFailed
            }
        );
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn logout_on_empty_store_is_silent() {
        let terminator = SessionTerminator::new(Arc::new(MemoryCredentialStore::new()));
        let mut events = terminator.subscribe();

        assert!(!terminator.terminate(TerminationReason::Logout));
        assert!(!terminator.terminate(TerminationReason::Logout));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn concurrent_terminations_emit_one_event() {
        let terminator = Arc::new(SessionTerminator::new(logged_in_store()));
        let mut events = terminator.subscribe();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let terminator = terminator.clone();
                std::thread::spawn(move || terminator.terminate(TerminationReason::RefreshFailed))
            })
            .collect();
        let ended: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();

        assert_eq!(ended, 1);
        assert!(events.try_recv().is_ok());
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn establish_emits_on_transition_only() {
        let store: Arc<dyn CredentialStore> = Arc::new(MemoryCredentialStore::new());
        let terminator = SessionTerminator::new(store.clone());
        let mut events = terminator.subscribe();

        terminator.establish(&CredentialPair::new("T1", None)).unwrap();
        terminator.establish(&CredentialPair::new("T2", None)).unwrap();
        assert_eq!(store.get().unwrap().access.expose(), "T2");

        assert_eq!(events.try_recv().unwrap(), SessionEvent::Authenticated);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        assert!(terminator.terminate(TerminationReason::Logout));
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Terminated {
                reason: TerminationReason::Logout
            }
        );
    }

    #[test]
    fn replaced_session_survives_teardown() {
        let store = logged_in_store();
        let terminator = SessionTerminator::new(store.clone());
        let mut events = terminator.subscribe();

        terminator
            .establish(&CredentialPair::new("T9", Some("R9".into())))
            .unwrap();
        let newer = terminator.terminate_unless_replaced(TerminationReason::RefreshFailed, "T1");

        assert_eq!(newer.unwrap().expose(), "T9");
        assert_eq!(store.get().unwrap().access.expose(), "T9");
        assert!(terminator.is_authenticated());
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn current_session_is_torn_down() {
        let store = logged_in_store();
        let terminator = SessionTerminator::new(store.clone());
        let mut events = terminator.subscribe();

        assert!(
            terminator
                .terminate_unless_replaced(TerminationReason::RefreshFailed, "T1")
                .is_none()
        );
        assert!(store.get().is_none());
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Terminated {
                reason: TerminationReason::RefreshFailed
            }
        );
    }

    #[test]
    fn failed_clear_leaves_session_up() {
        let store: Arc<dyn CredentialStore> = Arc::new(StuckStore(
            MemoryCredentialStore::with_pair(CredentialPair::new("T1", Some("R1".into()))),
        ));
        let terminator = SessionTerminator::new(store.clone());
        let mut events = terminator.subscribe();

        assert!(!terminator.terminate(TerminationReason::RefreshFailed));
        assert!(terminator.is_authenticated());
        assert!(store.get().is_some());
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn rotate_respects_newer_login() {
        let store = logged_in_store();
        let terminator = SessionTerminator::new(store.clone());
        let refreshed = CredentialPair::new("T2", Some("R1".into()));

        assert!(matches!(terminator.rotate("T1", &refreshed), Ok(Rotation::Stored)));
        assert_eq!(store.get().unwrap().access.expose(), "T2");

        match terminator.rotate("T1", &CredentialPair::new("T3", None)) {
            Ok(Rotation::Replaced(access)) => assert_eq!(access.expose(), "T2"),
            other => panic!("expected Replaced, got {other:?}"),
        }

        terminator.terminate(TerminationReason::Logout);
        assert!(matches!(terminator.rotate("T2", &refreshed), Ok(Rotation::Ended)));
        assert!(store.get().is_none());
    }
}
