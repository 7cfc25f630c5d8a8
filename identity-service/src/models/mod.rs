//! Domain models for identities and their credentials.

mod api_key;
mod identity;
mod refresh_token;
mod role;

pub use api_key::ApiKey;
pub use identity::{Identity, ProviderUserInfo, SanitizedIdentity};
pub use refresh_token::{NewRefreshToken, RefreshToken, SessionInfo, TokenState};
pub use role::Role;
