//! Shared types for the learning platform client workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
