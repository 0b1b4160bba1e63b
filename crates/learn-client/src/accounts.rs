//! Session facade over the accounts endpoints
//!
//! `Accounts` is what an application shell talks to: it logs in and out,
//! restores a persisted session at startup, and keeps the current user's
//! identity cached. Login and registration go straight to the token endpoints
//! without the pipeline; profile reads and updates go through it and so
//! benefit from transparent refresh.

use std::sync::{PoisonError, RwLock};

use learn_auth::{CredentialPair, LoginRequest, PROFILE_PATH, RegisterRequest};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ApiError;
use crate::pipeline::ApiClient;
use crate::terminator::TerminationReason;

/// One entry of a user's level history.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LevelChange {
    #[serde(default)]
    pub old_level: Option<serde_json::Value>,
    #[serde(default)]
    pub new_level: Option<serde_json::Value>,
    #[serde(default)]
    pub reason: Option<String>,
    pub timestamp: String,
}

/// The authenticated user as returned by the profile endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SessionIdentity {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub cognitive_level: Option<serde_json::Value>,
    #[serde(default)]
    pub has_taken_placement_test: bool,
    #[serde(default)]
    pub level_history: Vec<LevelChange>,
}

impl SessionIdentity {
    pub fn display_name(&self) -> String {
        match (self.first_name.as_deref(), self.last_name.as_deref()) {
            (Some(first), Some(last)) if !first.is_empty() && !last.is_empty() => {
                format!("{first} {last}")
            }
            (Some(first), _) if !first.is_empty() => first.to_string(),
            _ => self.username.clone(),
        }
    }
}

/// Login, logout and identity cache for one session.
pub struct Accounts {
    client: ApiClient,
    identity: RwLock<Option<SessionIdentity>>,
}

impl Accounts {
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            identity: RwLock::new(None),
        }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Exchange credentials for a token pair, persist it and load the profile.
    pub async fn login(&self, username: &str, password: &str) -> Result<SessionIdentity, ApiError> {
        let request = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let pair =
            learn_auth::obtain_token_pair(self.client.http(), self.client.base_url(), &request)
                .await?;

        self.client
            .terminator()
            .establish(&CredentialPair::new(pair.access, pair.refresh))?;
        info!(username, "logged in");

        self.profile().await
    }

    /// Create an account. Does not log in.
    pub async fn register(&self, request: &RegisterRequest) -> Result<serde_json::Value, ApiError> {
        let created =
            learn_auth::register(self.client.http(), self.client.base_url(), request).await?;
        info!(username = %request.username, "account registered");
        Ok(created)
    }

    pub async fn profile(&self) -> Result<SessionIdentity, ApiError> {
        let identity: SessionIdentity = self.client.get_json(PROFILE_PATH).await?;
        self.cache(identity.clone());
        Ok(identity)
    }

    /// Partially update the profile. Read-only fields are ignored by the backend.
    pub async fn update_profile<P: Serialize + ?Sized>(
        &self,
        patch: &P,
    ) -> Result<SessionIdentity, ApiError> {
        let identity: SessionIdentity = self.client.patch_json(PROFILE_PATH, patch).await?;
        self.cache(identity.clone());
        Ok(identity)
    }

    /// Cached identity; `None` once the session has ended.
    pub fn identity(&self) -> Option<SessionIdentity> {
        if !self.client.is_authenticated() {
            self.forget();
            return None;
        }
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resume a persisted session. Returns `None` when no credentials are stored.
    pub async fn restore(&self) -> Result<Option<SessionIdentity>, ApiError> {
        if self.client.store().get().is_none() {
            debug!("no stored session to restore");
            return Ok(None);
        }
        self.profile().await.map(Some)
    }

    /// End the session. Safe to call when already logged out.
    pub fn logout(&self) -> bool {
        self.forget();
        self.client.terminator().terminate(TerminationReason::Logout)
    }

    fn cache(&self, identity: SessionIdentity) {
        *self
            .identity
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(identity);
    }

    fn forget(&self) {
        *self
            .identity
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_tolerates_sparse_profile() {
        let identity: SessionIdentity = serde_json::from_str(
            r#"{"id": 3, "username": "sara", "email": "", "role": "student", "cognitive_level": 2}"#,
        )
        .unwrap();
        assert_eq!(identity.id, 3);
        assert!(!identity.has_taken_placement_test);
        assert!(identity.level_history.is_empty());
        assert_eq!(identity.cognitive_level, Some(serde_json::json!(2)));
        assert_eq!(identity.display_name(), "sara");
    }

    #[test]
    fn identity_parses_level_history() {
        let identity: SessionIdentity = serde_json::from_str(
            r#"{
                "id": 7,
                "username": "ali",
                "first_name": "Ali",
                "last_name": "Karimi",
                "has_taken_placement_test": true,
                "level_history": [
                    {"old_level": 1, "new_level": 2, "reason": "placement test", "timestamp": "2024-05-01T10:00:00Z"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(identity.display_name(), "Ali Karimi");
        assert_eq!(identity.level_history.len(), 1);
        assert_eq!(identity.level_history[0].reason.as_deref(), Some("placement test"));
    }
}
