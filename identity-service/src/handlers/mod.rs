//! HTTP handlers for identity-service.

pub mod api_keys;
pub mod auth;
pub mod health;
pub mod sessions;
pub mod users;

mod extract;

pub use extract::ValidatedJson;
