//! Per-`(audience, token_type)` OAuth2 credential cache, generalized from a
//! single Blender audience to the DSS Client's `getCachedCredentials`
//! contract: a cached token is returned only while it has at least
//! [`MIN_REMAINING_SECS`] of life left; otherwise it is refreshed atomically.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use jsonwebtoken::{encode, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::errors::DssError;

const TOKEN_REFRESH_LEEWAY_SECS: u64 = 60;
const MIN_REMAINING_SECS: u64 = 120;

/// Scope requested depends on which DSS capability the token is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    Rid,
    Scd,
}

impl TokenType {
    fn scope(self) -> &'static str {
        match self {
            TokenType::Rid => "dss.read.identification_service_areas dss.write.identification_service_areas",
            TokenType::Scd => "utm.strategic_coordination",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DssOAuthConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    grant_type: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
    scope: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Claims for the self-issued test-audience JWT. Unverified on the
/// receiving end (test/localhost audiences bypass signature checks), but
/// the token still has to be a structurally valid JWT.
#[derive(Debug, Serialize, Deserialize)]
struct SelfIssuedClaims {
    iss: String,
    sub: String,
    aud: String,
    scope: String,
    exp: i64,
    iat: i64,
}

/// Caches DSS/auth-server credentials keyed by `(audience, token_type)`.
/// Audiences recognized as localhost/test (see [`is_test_audience`]) get a
/// locally self-issued payload instead of a real OAuth round trip.
pub struct TokenCache {
    oauth: Option<DssOAuthConfig>,
    client: Client,
    cached: RwLock<HashMap<(String, TokenTypeKey), CachedToken>>,
}

type TokenTypeKey = &'static str;

fn token_type_key(token_type: TokenType) -> TokenTypeKey {
    match token_type {
        TokenType::Rid => "rid",
        TokenType::Scd => "scd",
    }
}

/// Localhost and `.local`/`test` suffixed audiences are treated as test
/// audiences: a self-issued payload is returned instead of contacting an
/// OAuth token endpoint.
pub fn is_test_audience(audience: &str) -> bool {
    audience.contains("localhost") || audience.ends_with(".local") || audience.contains("test")
}

impl TokenCache {
    pub fn new(oauth: Option<DssOAuthConfig>) -> Self {
        Self {
            oauth,
            client: Client::new(),
            cached: RwLock::new(HashMap::new()),
        }
    }

    /// Returns a token with at least [`MIN_REMAINING_SECS`] of remaining
    /// life, refreshing it first if necessary.
    pub async fn get_cached_credentials(&self, audience: &str, token_type: TokenType) -> Result<String, DssError> {
        let key = (audience.to_string(), token_type_key(token_type));

        if let Some(token) = self.lookup(&key).await {
            return Ok(token);
        }

        let fresh = if is_test_audience(audience) {
            self.self_issue(audience, token_type)
        } else {
            self.fetch_oauth_token(audience, token_type).await?
        };

        let token = fresh.access_token.clone();
        let mut guard = self.cached.write().await;
        guard.insert(key, fresh);
        Ok(token)
    }

    async fn lookup(&self, key: &(String, TokenTypeKey)) -> Option<String> {
        let guard = self.cached.read().await;
        let cached = guard.get(key)?;
        let remaining = cached.expires_at.saturating_duration_since(Instant::now());
        if remaining >= Duration::from_secs(MIN_REMAINING_SECS) {
            Some(cached.access_token.clone())
        } else {
            None
        }
    }

    fn self_issue(&self, audience: &str, token_type: TokenType) -> CachedToken {
        let now = chrono::Utc::now().timestamp();
        let claims = SelfIssuedClaims {
            iss: "https://utm-server.local".to_string(),
            sub: "utm-server".to_string(),
            aud: audience.to_string(),
            scope: token_type.scope().to_string(),
            exp: now + 3600,
            iat: now,
        };

        let access_token = encode(&Header::default(), &claims, &EncodingKey::from_secret(b"utm-server-self-issued"))
            .expect("encoding a JWT with a fixed HS256 key never fails");

        CachedToken {
            access_token,
            expires_at: Instant::now() + Duration::from_secs(3600 - TOKEN_REFRESH_LEEWAY_SECS),
        }
    }

    async fn fetch_oauth_token(&self, audience: &str, token_type: TokenType) -> Result<CachedToken, DssError> {
        let oauth = self
            .oauth
            .as_ref()
            .ok_or_else(|| DssError::Auth(format!("no OAuth config for production audience {audience}")))?;

        let request = TokenRequest {
            grant_type: "client_credentials",
            client_id: oauth.client_id.as_str(),
            client_secret: oauth.client_secret.as_str(),
            scope: token_type.scope(),
        };

        let response = self
            .client
            .post(oauth.token_url.as_str())
            .form(&request)
            .send()
            .await
            .map_err(|e| DssError::Unreachable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(DssError::Auth("token endpoint rejected client credentials".into()));
        }
        if !response.status().is_success() {
            return Err(DssError::Client {
                code: response.status().as_u16(),
                message: "token request failed".into(),
            });
        }

        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|e| DssError::Auth(format!("malformed token response: {e}")))?;

        let ttl = payload
            .expires_in
            .unwrap_or(3600)
            .saturating_sub(TOKEN_REFRESH_LEEWAY_SECS)
            .max(MIN_REMAINING_SECS);

        Ok(CachedToken {
            access_token: payload.access_token,
            expires_at: Instant::now() + Duration::from_secs(ttl),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_audience_self_issues_without_oauth_config() {
        let cache = TokenCache::new(None);
        let token = cache
            .get_cached_credentials("http://localhost:8080", TokenType::Scd)
            .await
            .expect("self-issued token");
        assert_eq!(token.split('.').count(), 3);
    }

    #[tokio::test]
    async fn test_audience_is_cached_across_calls() {
        let cache = TokenCache::new(None);
        let first = cache
            .get_cached_credentials("http://localhost:8080", TokenType::Rid)
            .await
            .unwrap();
        let second = cache
            .get_cached_credentials("http://localhost:8080", TokenType::Rid)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn production_audience_without_oauth_config_errors() {
        let cache = TokenCache::new(None);
        let result = cache
            .get_cached_credentials("https://dss.example.com", TokenType::Scd)
            .await;
        assert!(matches!(result, Err(DssError::Auth(_))));
    }
}
