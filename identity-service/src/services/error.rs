use service_core::error::AppError;
use thiserror::Error;

use crate::authz::AuthzError;
use crate::store::StoreError;

/// Access-token failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token expired")]
    Expired,

    #[error("malformed token claims")]
    MalformedClaims,

    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// Failure while minting and persisting a credential pair.
#[derive(Debug, Error)]
pub enum IssueError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Refresh-token rotation failures.
#[derive(Debug, Error)]
pub enum RotationError {
    #[error("refresh token not found")]
    NotFound,

    #[error("refresh token revoked")]
    Revoked,

    #[error("refresh token expired")]
    Expired,

    /// The presented token is dead but its lineage still has a live successor,
    /// which the client most likely already holds.
    #[error("refresh token superseded")]
    Superseded,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RotationError {
    /// Label used for metrics and logs.
    pub fn outcome(&self) -> &'static str {
        match self {
            RotationError::NotFound => "not_found",
            RotationError::Revoked => "revoked",
            RotationError::Expired => "expired",
            RotationError::Superseded => "superseded",
            RotationError::Token(_) => "token_error",
            RotationError::Store(StoreError::Timeout(_)) => "timeout",
            RotationError::Store(_) => "store_error",
        }
    }

    /// The presented token can never succeed again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RotationError::NotFound
                | RotationError::Revoked
                | RotationError::Expired
                | RotationError::Superseded
        )
    }

    /// The whole session is gone, so the client's cookies should be cleared.
    pub fn ends_session(&self) -> bool {
        self.is_terminal() && !matches!(self, RotationError::Superseded)
    }
}

impl From<IssueError> for RotationError {
    fn from(err: IssueError) -> Self {
        match err {
            IssueError::Token(e) => RotationError::Token(e),
            IssueError::Store(e) => RotationError::Store(e),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Rotation(#[from] RotationError),

    #[error(transparent)]
    Authz(#[from] AuthzError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<IssueError> for ServiceError {
    fn from(err: IssueError) -> Self {
        match err {
            IssueError::Token(e) => ServiceError::Token(e),
            IssueError::Store(e) => ServiceError::Store(e),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Timeout(_) => AppError::ServiceUnavailable,
            other => AppError::DatabaseError(anyhow::Error::new(other)),
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Token(TokenError::Signing(e)) => {
                AppError::InternalError(anyhow::anyhow!("Failed to sign token: {}", e))
            }
            ServiceError::Token(e) => AppError::AuthError(anyhow::anyhow!(e)),
            ServiceError::Rotation(RotationError::Store(e)) => e.into(),
            ServiceError::Rotation(e) => AppError::AuthError(anyhow::anyhow!(e)),
            ServiceError::Authz(AuthzError::Unauthenticated) => {
                AppError::Unauthorized(anyhow::anyhow!("Authentication required"))
            }
            ServiceError::Authz(AuthzError::Denied(_)) => {
                AppError::NotFound(anyhow::anyhow!("Resource not found"))
            }
            ServiceError::Store(e) => e.into(),
            ServiceError::NotFound(_) => AppError::NotFound(anyhow::anyhow!("Resource not found")),
            ServiceError::Forbidden(e) => AppError::Forbidden(anyhow::anyhow!(e)),
            ServiceError::Validation(e) => AppError::BadRequest(anyhow::anyhow!(e)),
        }
    }
}
