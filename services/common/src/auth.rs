//! Refresh-token -> access-token manager. Serializes refresh under a
//! mutex while allowing lock-free cached reads, per the contract that
//! concurrent callers must never trigger overlapping refreshes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::config::BrokerCredentials;
use crate::errors::PipelineError;

const SANDBOX_TOKEN_URL: &str = "https://signin.tradestation.com/oauth/token";
const LIVE_TOKEN_URL: &str = "https://signin.tradestation.com/oauth/token";
const MIN_VALIDITY: Duration = Duration::from_secs(60);
/// Spec §7: auth failures are recoverable by retry, but become a
/// critical/fatal condition (escalated logging) after this many
/// consecutive failures rather than crashing the process outright,
/// matching the store-error escalation in `IngestionEngine`.
const MAX_CONSECUTIVE_AUTH_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
}

/// Holds brokerage credentials plus a cached `(access_token,
/// expires_at)`. `get_headers` is the only operation callers need.
pub struct AuthManager {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    refresh_token: RwLock<String>,
    token_url: String,
    cached: RwLock<Option<CachedToken>>,
    refresh_lock: tokio::sync::Mutex<()>,
    consecutive_failures: std::sync::atomic::AtomicU32,
}

impl AuthManager {
    pub fn new(creds: BrokerCredentials) -> Arc<Self> {
        let token_url = if creds.use_sandbox {
            SANDBOX_TOKEN_URL
        } else {
            LIVE_TOKEN_URL
        };
        Self::new_with_token_url(creds, token_url.to_string())
    }

    /// Same as `new`, but with an explicit token endpoint rather than
    /// the hardcoded live/sandbox hosts. Used to point at a mock
    /// server in tests for other crates that depend on an
    /// `AuthManager` but can't reach the real TradeStation host.
    pub fn new_with_token_url(creds: BrokerCredentials, token_url: String) -> Arc<Self> {
        Arc::new(Self {
            http: reqwest::Client::new(),
            client_id: creds.client_id,
            client_secret: creds.client_secret,
            refresh_token: RwLock::new(creds.refresh_token),
            token_url,
            cached: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            consecutive_failures: std::sync::atomic::AtomicU32::new(0),
        })
    }

    /// Returns an `Authorization: Bearer <token>` header value whose
    /// token is valid for at least 60s, refreshing first if needed.
    pub async fn get_headers(&self) -> Result<(String, String), PipelineError> {
        if let Some(token) = self.cached_if_valid() {
            return Ok((
                "Authorization".to_string(),
                format!("Bearer {token}"),
            ));
        }
        let _guard = self.refresh_lock.lock().await;
        // Re-check: another caller may have refreshed while we waited.
        if let Some(token) = self.cached_if_valid() {
            return Ok((
                "Authorization".to_string(),
                format!("Bearer {token}"),
            ));
        }
        self.refresh_access_token().await?;
        let token = self
            .cached_if_valid()
            .ok_or_else(|| PipelineError::Auth("refresh succeeded but no token cached".into()))?;
        Ok(("Authorization".to_string(), format!("Bearer {token}")))
    }

    fn cached_if_valid(&self) -> Option<String> {
        let guard = self.cached.read();
        let entry = guard.as_ref()?;
        if entry.expires_at.saturating_duration_since(Instant::now()) >= MIN_VALIDITY {
            Some(entry.access_token.clone())
        } else {
            None
        }
    }

    async fn refresh_access_token(&self) -> Result<(), PipelineError> {
        let refresh_token = self.refresh_token.read().clone();
        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token.as_str()),
        ];
        let resp = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| PipelineError::Auth(format!("token request failed: {e}")))?;

        if !resp.status().is_success() {
            let failures = self
                .consecutive_failures
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                + 1;
            if failures >= MAX_CONSECUTIVE_AUTH_FAILURES {
                error!(
                    status = %resp.status(),
                    failures,
                    "token refresh failed {failures} times consecutively, auth is critical"
                );
            } else {
                warn!(status = %resp.status(), failures, "token refresh failed");
            }
            return Err(PipelineError::Auth(format!(
                "token endpoint returned {}",
                resp.status()
            )));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| PipelineError::Auth(format!("malformed token response: {e}")))?;

        if let Some(new_refresh) = body.refresh_token {
            *self.refresh_token.write() = new_refresh;
        }
        *self.cached.write() = Some(CachedToken {
            access_token: body.access_token,
            expires_at: Instant::now() + Duration::from_secs(body.expires_in),
        });
        self.consecutive_failures
            .store(0, std::sync::atomic::Ordering::SeqCst);
        info!("refreshed access token, expires_in={}s", body.expires_in);
        Ok(())
    }

    /// Drops the cached token and current refresh token. Only used at
    /// process teardown; a fresh instance is the intended replacement.
    pub fn clear(&self) {
        *self.cached.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AuthManager {
        AuthManager {
            http: reqwest::Client::new(),
            client_id: "id".into(),
            client_secret: "secret".into(),
            refresh_token: RwLock::new("rt".into()),
            token_url: LIVE_TOKEN_URL.into(),
            cached: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            consecutive_failures: std::sync::atomic::AtomicU32::new(0),
        }
    }

    #[test]
    fn no_cached_token_is_invalid() {
        let m = manager();
        assert!(m.cached_if_valid().is_none());
    }

    #[test]
    fn token_within_min_validity_window_is_rejected() {
        let m = manager();
        *m.cached.write() = Some(CachedToken {
            access_token: "tok".into(),
            expires_at: Instant::now() + Duration::from_secs(30),
        });
        assert!(m.cached_if_valid().is_none());
    }

    #[test]
    fn token_past_min_validity_window_is_accepted() {
        let m = manager();
        *m.cached.write() = Some(CachedToken {
            access_token: "tok".into(),
            expires_at: Instant::now() + Duration::from_secs(120),
        });
        assert_eq!(m.cached_if_valid().as_deref(), Some("tok"));
    }

    fn manager_with_url(url: String) -> AuthManager {
        AuthManager {
            token_url: url,
            ..manager()
        }
    }

    #[tokio::test]
    async fn refresh_populates_cache_and_rotates_refresh_token() {
        use wiremock::matchers::{body_string_contains, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access-token",
                "refresh_token": "rotated-refresh-token",
                "expires_in": 1200
            })))
            .mount(&server)
            .await;

        let m = manager_with_url(server.uri());
        m.refresh_access_token().await.unwrap();

        assert_eq!(m.cached_if_valid().as_deref(), Some("new-access-token"));
        assert_eq!(*m.refresh_token.read(), "rotated-refresh-token");
    }

    #[tokio::test]
    async fn non_200_token_response_is_auth_error_and_counts_failure() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let m = manager_with_url(server.uri());
        let err = m.refresh_access_token().await.unwrap_err();
        assert!(matches!(err, PipelineError::Auth(_)));
        assert_eq!(m.consecutive_failures.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(m.cached_if_valid().is_none());
    }

    #[tokio::test]
    async fn three_consecutive_failures_cross_the_critical_threshold() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let m = manager_with_url(server.uri());
        for _ in 0..MAX_CONSECUTIVE_AUTH_FAILURES {
            assert!(m.refresh_access_token().await.is_err());
        }
        assert_eq!(
            m.consecutive_failures.load(std::sync::atomic::Ordering::SeqCst),
            MAX_CONSECUTIVE_AUTH_FAILURES
        );
    }
}
