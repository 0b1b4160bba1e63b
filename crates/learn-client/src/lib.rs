//! Authenticated API client for the learning platform
//!
//! `ApiClient` attaches the stored access token to every request and recovers
//! from token expiry on its own: the first rejected request starts a refresh,
//! concurrent rejections wait for that same refresh, and every waiter replays
//! its request once with the new token. If the refresh fails, the session is
//! torn down once and a `SessionEvent::Terminated` is broadcast.
//!
//! ```no_run
//! # async fn demo() -> Result<(), learn_client::ApiError> {
//! use std::sync::Arc;
//! use learn_auth::MemoryCredentialStore;
//! use learn_client::{Accounts, ApiClient, ClientOptions};
//!
//! let client = ApiClient::new(ClientOptions::default(), Arc::new(MemoryCredentialStore::new()))?;
//! let accounts = Accounts::new(client.clone());
//! accounts.login("sara", "secret").await?;
//! let history: serde_json::Value = client.get_json("/assessment/my-history/").await?;
//! # let _ = history;
//! # Ok(())
//! # }
//! ```

pub mod accounts;
pub mod classify;
pub mod coordinator;
pub mod error;
pub mod pipeline;
pub mod request;
pub mod terminator;

pub use accounts::{Accounts, LevelChange, SessionIdentity};
pub use classify::{ResponseClass, TOKEN_NOT_VALID, classify_response, is_refresh_path};
pub use coordinator::RefreshCoordinator;
pub use error::{ApiError, RefreshError};
pub use pipeline::{ApiClient, ClientOptions, DEFAULT_TIMEOUT};
pub use request::{ApiRequest, ApiResponse, MultipartForm, RequestBody};
pub use terminator::{Rotation, SessionEvent, SessionTerminator, TerminationReason};
