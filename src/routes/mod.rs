//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group. All handlers except
//! [`health`] and the magic-link exchange require a session cookie, enforced
//! by the [`crate::auth::AuthSession`] extractor.

pub mod access;
pub mod auth;
pub mod files;
pub mod health;
