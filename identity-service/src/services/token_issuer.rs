use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use rand::{rngs::OsRng, RngCore};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::clock::Clock;
use super::error::{IssueError, TokenError};
use crate::config::JwtConfig;
use crate::models::{Identity, NewRefreshToken, RefreshToken};
use crate::store::{with_deadline, IdentityStore};

/// Bytes of randomness in a raw refresh token.
const REFRESH_TOKEN_BYTES: usize = 32;

/// Claims for access tokens (short-lived, never persisted)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessTokenClaims {
    /// Subject (provider external id)
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    /// Display name
    pub username: String,
}

/// A freshly minted credential pair. The raw refresh token exists only here.
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub refresh: RefreshToken,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"[redacted]")
            .field("refresh_token", &"[redacted]")
            .field("refresh", &self.refresh.id)
            .finish()
    }
}

/// Request metadata recorded on refresh tokens.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Mints HMAC-signed access tokens and opaque refresh tokens.
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    leeway_seconds: i64,
    store: Arc<dyn IdentityStore>,
    clock: Arc<dyn Clock>,
    store_timeout: std::time::Duration,
}

impl TokenIssuer {
    pub fn new(
        config: &JwtConfig,
        store: Arc<dyn IdentityStore>,
        clock: Arc<dyn Clock>,
        store_timeout: std::time::Duration,
    ) -> Self {
        let secret = config.signing_key.expose_secret().as_bytes();
        tracing::info!(issuer = %config.issuer, "Token issuer initialized with HS256 key");

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            access_ttl: Duration::minutes(config.access_token_expiry_minutes),
            refresh_ttl: Duration::days(config.refresh_token_expiry_days),
            leeway_seconds: config.leeway_seconds as i64,
            store,
            clock,
            store_timeout,
        }
    }

    pub fn access_token_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn refresh_token_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    /// Sign an access token for `identity`.
    pub fn create_access_token(&self, identity: &Identity) -> Result<String, TokenError> {
        let now = self.clock.now();
        let claims = AccessTokenClaims {
            sub: identity.external_id.clone(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + self.access_ttl).timestamp(),
            username: identity.display_name.clone(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    /// Mint and persist a refresh token plus a matching access token.
    ///
    /// `original_created_at` carries the session's creation time across
    /// rotations; `lineage` is `None` for a fresh login.
    pub async fn create_refresh_token_pair(
        &self,
        identity: &Identity,
        client: &ClientInfo,
        original_created_at: Option<DateTime<Utc>>,
        lineage: Option<Uuid>,
    ) -> Result<TokenPair, IssueError> {
        let access_token = self.create_access_token(identity)?;
        let (raw, new_token) = self.mint_refresh_token(identity, client, original_created_at, lineage);

        let refresh = with_deadline(self.store_timeout, self.store.insert_refresh_token(new_token)).await?;

        tracing::debug!(
            identity_id = %identity.id,
            lineage_id = %refresh.lineage_id,
            token = %refresh.hash_prefix(),
            "Refresh token issued"
        );

        Ok(TokenPair {
            access_token,
            refresh_token: raw,
            refresh,
        })
    }

    fn mint_refresh_token(
        &self,
        identity: &Identity,
        client: &ClientInfo,
        original_created_at: Option<DateTime<Utc>>,
        lineage: Option<Uuid>,
    ) -> (String, NewRefreshToken) {
        let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let raw = URL_SAFE_NO_PAD.encode(bytes);

        let now = self.clock.now();
        let id = Uuid::new_v4();
        let token = NewRefreshToken {
            id,
            owner_id: identity.id,
            lineage_id: lineage.unwrap_or(id),
            token_hash: RefreshToken::hash_token(&raw),
            expires_at: now + self.refresh_ttl,
            created_at: original_created_at.unwrap_or(now),
            issued_at: now,
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
        };
        (raw, token)
    }

    /// Verify and decode an access token. Only HMAC algorithms are accepted.
    pub fn parse_access_token(&self, token: &str) -> Result<AccessTokenClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "nbf", "iss", "aud", "sub"]);
        // Time claims are checked against the injected clock below.
        validation.validate_exp = false;
        validation.validate_nbf = false;

        let claims = decode::<AccessTokenClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    TokenError::InvalidSignature
                }
                _ => TokenError::MalformedClaims,
            })?;

        let now = self.clock.now().timestamp();
        if claims.exp < now - self.leeway_seconds {
            return Err(TokenError::Expired);
        }
        if claims.nbf > now + self.leeway_seconds {
            return Err(TokenError::MalformedClaims);
        }
        Ok(claims)
    }
}
