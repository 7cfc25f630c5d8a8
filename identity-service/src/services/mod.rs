pub mod cleanup;
pub mod clock;
pub mod error;
pub mod identity;
pub mod rotation;
pub mod token_issuer;

pub use cleanup::SessionCleaner;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{IssueError, RotationError, ServiceError, TokenError};
pub use identity::{CreatedApiKey, IdentityService, LoginOutcome};
pub use rotation::{RotationCoordinator, Rotated};
pub use token_issuer::{AccessTokenClaims, ClientInfo, TokenIssuer, TokenPair};
