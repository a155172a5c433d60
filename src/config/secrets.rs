//! Secret handling utilities.
//!
//! Re-exports secrecy types used for the cluster API token.

pub use secrecy::{ExposeSecret, SecretString};

/// Header carrying the API token on every authenticated request.
pub const AUTH_HEADER: &str = "ph-auth-token";
