use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Role;

/// A platform identity, keyed by the auth provider's subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    /// Subject issued by the external auth provider. Unique.
    pub external_id: String,
    pub display_name: String,
    pub role: Role,
    pub email: Option<String>,
    pub profile_image: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(external_id: String, display_name: String, role: Role, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_id,
            display_name,
            role,
            email: None,
            profile_image: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn sanitized(&self) -> SanitizedIdentity {
        SanitizedIdentity {
            id: self.id,
            display_name: self.display_name.clone(),
            role: self.role,
            profile_image: self.profile_image.clone(),
            created_at: self.created_at,
        }
    }
}

/// Public view of an identity returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizedIdentity {
    pub id: Uuid,
    pub display_name: String,
    pub role: Role,
    pub profile_image: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// User info returned by the provider after a completed code exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderUserInfo {
    pub subject: String,
    pub preferred_username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub profile_image: Option<String>,
}
