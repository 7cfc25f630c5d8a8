//! Request-scoped authorization context.
//!
//! The trust marker can only be raised from inside this crate; nothing that
//! parses request input can construct `System` or `OAuthFlow`.

use crate::models::Identity;

/// Elevated trust attached to an internal call path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TrustMarker {
    #[default]
    None,
    /// Internal system call (credential lookup, rotation, seeding, cleanup).
    System,
    /// In the middle of completing an external login for `subject`.
    OAuthFlow { subject: String },
}

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    identity: Option<Identity>,
    trust: TrustMarker,
}

impl RequestContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(identity: Identity) -> Self {
        Self {
            identity: Some(identity),
            trust: TrustMarker::None,
        }
    }

    pub fn from_identity(identity: Option<Identity>) -> Self {
        Self {
            identity,
            trust: TrustMarker::None,
        }
    }

    pub(crate) fn system() -> Self {
        Self {
            identity: None,
            trust: TrustMarker::System,
        }
    }

    pub(crate) fn oauth_flow(subject: impl Into<String>) -> Self {
        Self {
            identity: None,
            trust: TrustMarker::OAuthFlow {
                subject: subject.into(),
            },
        }
    }

    pub(crate) fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn trust(&self) -> &TrustMarker {
        &self.trust
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }
}
