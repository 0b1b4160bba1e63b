//! Credential storage and token endpoint calls for the learning platform API
//!
//! This crate owns everything that touches the credential pair itself: the
//! `CredentialStore` abstraction and its file/memory backends, and the three
//! unauthenticated calls against the accounts endpoints (login, register,
//! refresh). It knows nothing about request replay; that lives in
//! `learn-client`.
//!
//! Credential flow:
//! 1. `token::obtain_token_pair()` exchanges username/password for a pair
//! 2. The pair is persisted via `CredentialStore::set()`
//! 3. On expiry the client's refresh coordinator calls `token::refresh_token()`
//! 4. The rotated pair replaces the stored one; on failure the store is cleared

pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use constants::*;
pub use credentials::{CredentialPair, CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use error::{Error, Result};
pub use token::{
    LoginRequest, RefreshResponse, RegisterRequest, TokenPair, obtain_token_pair, refresh_token,
    register,
};
