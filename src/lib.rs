// src/lib.rs

//! Validation of Azure Entra ID bearer tokens.
//!
//! A [`validator::Validator`] checks a token's algorithm, signature, expiry,
//! issuer and audience against keys fetched (and cached) by a
//! [`client::KeyMaterialCache`], then normalizes the claims into an
//! [`identity::IdentityRecord`].

pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod model;
pub mod validator;

/// The public prelude for the `entra-auth` crate.
///
/// This module re-exports the most commonly used types for convenience.
pub mod prelude {
    pub use crate::client::KeyMaterialCache;
    pub use crate::config::{ProviderSettings, ProviderSettingsBuilder};
    pub use crate::error::EntraAuthError;
    pub use crate::identity::{IdentityRecord, TokenClaims, UserResponse};
    pub use crate::validator::{extract_bearer, Validator};
    pub use jsonwebtoken::Algorithm;
}
