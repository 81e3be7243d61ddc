use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parley_models::ResponseEnvelope;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub const ROLE_ADMIN: &str = "admin";

/// Validated identity cached on a session for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimSet {
    pub user_id: String,
    pub email: String,
    pub role: String,
    pub expires_at: DateTime<Utc>,
}

impl ClaimSet {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// The identity collaborator: resolves a bearer token to a claim set.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn validate_token(&self, token: &str) -> Result<ClaimSet, CoreError>;
}

/// Strips an optional `Bearer ` prefix from an authorization value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let value = header_value.trim();
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value)
        .trim();
    (!token.is_empty()).then_some(token)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: String,
    pub exp: usize,
    pub iat: usize,
}

/// HS256 tokens validated locally against the shared secret.
pub struct JwtIdentity {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtIdentity {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn issue_token(
        &self,
        user_id: &str,
        email: &str,
        role: &str,
        ttl: Duration,
    ) -> Result<String, CoreError> {
        let now = Utc::now().timestamp() as usize;
        let claims = Claims {
            sub: user_id.to_string(),
            email: email.to_string(),
            role: role.to_string(),
            iat: now,
            exp: now + ttl.as_secs() as usize,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| CoreError::Internal(format!("token encode: {e}")))
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentity {
    async fn validate_token(&self, token: &str) -> Result<ClaimSet, CoreError> {
        let claims = decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|_| CoreError::Unauthenticated("invalid token".into()))?;
        if claims.sub.trim().is_empty() {
            return Err(CoreError::Unauthenticated("token has no subject".into()));
        }
        let expires_at = Utc
            .timestamp_opt(claims.exp as i64, 0)
            .single()
            .ok_or_else(|| CoreError::Unauthenticated("invalid expiry".into()))?;
        let claims = ClaimSet {
            user_id: claims.sub,
            email: claims.email,
            role: claims.role,
            expires_at,
        };
        if claims.is_expired(Utc::now()) {
            return Err(CoreError::Unauthenticated("token expired".into()));
        }
        Ok(claims)
    }
}

#[derive(Serialize)]
struct ValidateTokenRequest<'a> {
    token: &'a str,
}

/// Calls the user directory's `ValidateToken` RPC.
pub struct RemoteIdentity {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteIdentity {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Internal(format!("identity client: {e}")))?;
        let base = base_url.trim_end_matches('/');
        let base = if base.starts_with("http://") || base.starts_with("https://") {
            base.to_string()
        } else {
            format!("http://{base}")
        };
        Ok(Self {
            client,
            endpoint: format!("{base}/rpc/user.UserService/ValidateToken"),
        })
    }
}

#[async_trait]
impl IdentityProvider for RemoteIdentity {
    async fn validate_token(&self, token: &str) -> Result<ClaimSet, CoreError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&ValidateTokenRequest { token })
            .send()
            .await
            .map_err(|e| CoreError::Unavailable(format!("identity service: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(CoreError::Unauthenticated("token rejected".into()));
        }
        if status.is_server_error() {
            return Err(CoreError::Unavailable(format!(
                "identity service returned {status}"
            )));
        }

        let envelope: ResponseEnvelope<ClaimSet> = response
            .json()
            .await
            .map_err(|e| CoreError::Unavailable(format!("identity response: {e}")))?;
        let claims = envelope
            .into_value()
            .map_err(|e| CoreError::Unauthenticated(e.message))?;
        if claims.user_id.trim().is_empty() || claims.is_expired(Utc::now()) {
            return Err(CoreError::Unauthenticated("token expired".into()));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-that-is-at-least-32-bytes!!";

    #[tokio::test]
    async fn jwt_round_trip_yields_claims() {
        let identity = JwtIdentity::new(SECRET);
        let token = identity
            .issue_token("u1", "u1@example.com", "member", Duration::from_secs(60))
            .unwrap();
        let claims = identity.validate_token(&token).await.unwrap();
        assert_eq!(claims.user_id, "u1");
        assert_eq!(claims.email, "u1@example.com");
        assert!(!claims.is_admin());
        assert!(!claims.is_expired(Utc::now()));
    }

    #[tokio::test]
    async fn expired_and_foreign_tokens_are_rejected() {
        let identity = JwtIdentity::new(SECRET);
        let expired = identity
            .issue_token("u1", "", "member", Duration::from_secs(0))
            .unwrap();
        assert!(matches!(
            identity.validate_token(&expired).await,
            Err(CoreError::Unauthenticated(_))
        ));

        let other = JwtIdentity::new("another-secret-that-is-also-32-bytes!!");
        let foreign = other
            .issue_token("u1", "", "admin", Duration::from_secs(60))
            .unwrap();
        assert!(identity.validate_token(&foreign).await.is_err());
    }

    #[test]
    fn bearer_prefix_is_optional() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("abc"), Some("abc"));
        assert_eq!(bearer_token("Bearer   "), None);
    }

    #[tokio::test]
    async fn unreachable_identity_service_is_unavailable() {
        let remote = RemoteIdentity::new("127.0.0.1:9", Duration::from_millis(200)).unwrap();
        assert!(matches!(
            remote.validate_token("t").await,
            Err(CoreError::Unavailable(_))
        ));
    }
}
