//! Single-flight access token refresh
//!
//! When several requests are rejected at once, only the first starts a
//! refresh; the rest await the same shared future and replay with whatever
//! token it produces. The refresh itself runs on a spawned task, so a caller
//! dropping its future (request cancelled, timeout) never leaves the state
//! stuck in `Refreshing`.
//!
//! Episode lifecycle:
//! 1. `recover()` finds the state `Idle` and installs `Refreshing(shared)`
//! 2. The spawned task calls the refresh endpoint and stores the new pair
//! 3. On failure the session is terminated before the state is reset, unless
//!    a login replaced it while the refresh was in flight
//! 4. The state returns to `Idle`; the next expiry starts a fresh episode

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use common::Secret;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use learn_auth::{CredentialPair, CredentialStore};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::RefreshError;
use crate::terminator::{Rotation, SessionTerminator, TerminationReason};

type RefreshOutcome = Result<Secret<String>, RefreshError>;

enum RefreshState {
    Idle,
    Refreshing(Shared<BoxFuture<'static, RefreshOutcome>>),
}

/// Guarantees at most one refresh call in flight per session.
pub struct RefreshCoordinator {
    http: reqwest::Client,
    base_url: String,
    store: Arc<dyn CredentialStore>,
    terminator: Arc<SessionTerminator>,
    state: Mutex<RefreshState>,
    episodes: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        store: Arc<dyn CredentialStore>,
        terminator: Arc<SessionTerminator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            http,
            base_url: base_url.into(),
            store,
            terminator,
            state: Mutex::new(RefreshState::Idle),
            episodes: AtomicU64::new(0),
        })
    }

    /// Obtain a usable access token after `rejected_access` was refused.
    ///
    /// `rejected_access` is the token the failed request carried, `None` if it
    /// was sent without one. If the store already holds a different access
    /// token (another request finished a refresh, or the user logged in
    /// again), that token is returned without calling the refresh endpoint.
    /// Otherwise the caller joins the in-flight episode or starts one.
    ///
    /// On error the session has already been terminated.
    pub async fn recover(self: &Arc<Self>, rejected_access: Option<&str>) -> RefreshOutcome {
        let episode = {
            let mut state = self.state.lock().await;
            match &*state {
                RefreshState::Refreshing(episode) => {
                    debug!("joining in-flight refresh");
                    episode.clone()
                }
                RefreshState::Idle => {
                    let Some(pair) = self.store.get() else {
                        self.terminator.terminate(TerminationReason::RefreshFailed);
                        return Err(RefreshError::NoCredentials);
                    };
                    if !rejected_access.is_some_and(|rejected| pair.access.matches(rejected)) {
                        debug!("access token already replaced, skipping refresh");
                        return Ok(pair.access);
                    }
                    let episode = self.start_episode(pair);
                    *state = RefreshState::Refreshing(episode.clone());
                    episode
                }
            }
        };
        episode.await
    }

    /// Number of refresh episodes started so far.
    pub fn episodes(&self) -> u64 {
        self.episodes.load(Ordering::Relaxed)
    }

    pub async fn is_refreshing(&self) -> bool {
        matches!(*self.state.lock().await, RefreshState::Refreshing(_))
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn terminator(&self) -> &Arc<SessionTerminator> {
        &self.terminator
    }

    fn start_episode(
        self: &Arc<Self>,
        current: CredentialPair,
    ) -> Shared<BoxFuture<'static, RefreshOutcome>> {
        let episode = self.episodes.fetch_add(1, Ordering::Relaxed) + 1;
        info!(episode, "starting token refresh");

        let rejected = current.access.clone();
        let task = tokio::spawn(Arc::clone(self).run_episode(episode, current));
        let this = Arc::clone(self);
        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // The task only fails by panic or runtime shutdown, before
                    // it could settle the state itself.
                    let outcome = this.abandon(&rejected, RefreshError::Aborted(e.to_string()));
                    this.reset().await;
                    outcome
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn run_episode(self: Arc<Self>, episode: u64, current: CredentialPair) -> RefreshOutcome {
        let outcome = match self.perform_refresh(&current).await {
            Ok(access) => {
                info!(episode, "token refresh succeeded");
                metrics::counter!("auth_refresh_total", "outcome" => "success").increment(1);
                Ok(access)
            }
            Err(e) => {
                warn!(episode, error = %e, "token refresh failed");
                metrics::counter!("auth_refresh_total", "outcome" => "failure").increment(1);
                self.abandon(&current.access, e)
            }
        };
        // Teardown happens before the reset so a request arriving afterwards
        // sees an empty store rather than the rejected pair.
        self.reset().await;
        outcome
    }

    /// Tear down the session whose refresh failed, unless a login replaced it
    /// in the meantime; then the newer token is handed to the waiters.
    fn abandon(&self, rejected: &Secret<String>, err: RefreshError) -> RefreshOutcome {
        match self
            .terminator
            .terminate_unless_replaced(TerminationReason::RefreshFailed, rejected.expose())
        {
            Some(access) => Ok(access),
            None => Err(err),
        }
    }

    async fn reset(&self) {
        *self.state.lock().await = RefreshState::Idle;
    }

    async fn perform_refresh(&self, current: &CredentialPair) -> RefreshOutcome {
        let refresh = current
            .refresh
            .as_ref()
            .ok_or(RefreshError::MissingRefreshToken)?;

        let response =
            learn_auth::refresh_token(&self.http, &self.base_url, refresh.expose()).await?;
        let rotated = current.rotated(response.access, response.refresh);

        let rotation = self
            .terminator
            .rotate(current.access.expose(), &rotated)
            .map_err(|e| RefreshError::Storage(e.to_string()))?;
        match rotation {
            Rotation::Stored => Ok(rotated.access),
            Rotation::Replaced(access) => Ok(access),
            Rotation::Ended => Err(RefreshError::NoCredentials),
        }
    }
}
