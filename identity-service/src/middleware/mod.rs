pub mod cookies;
pub mod session;

pub use cookies::SessionCookies;
pub use session::{
    session_middleware, AuthenticatedCaller, Caller, ACCESS_TOKEN_REFRESHED_HEADER,
    REFRESH_TOKEN_DELETED_HEADER,
};
