use crate::errors::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

/// Tokens are renewed this long before the issuer's stated expiry
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);
const DEFAULT_LIFETIME: Duration = Duration::from_secs(3600);

/// Source of bearer credentials for the stream and the fleet API.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A valid token, fetching one only if none is cached or it expired.
    async fn current_token(&self) -> Result<String>;

    /// A freshly issued token. Concurrent callers share one refresh.
    async fn force_refresh(&self) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN < self.expires_at
    }
}

/// OAuth2 client-credentials provider.
///
/// The cache lives behind an async mutex that is held across the token
/// request. A forced refresh notes the generation before queueing on the
/// mutex and reuses whatever token a concurrent refresh produced meanwhile.
pub struct OAuthTokenProvider {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
    /// Bumped on every successful fetch
    generation: AtomicU64,
}

impl OAuthTokenProvider {
    pub fn new(
        client: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    async fn fetch(&self) -> Result<CachedToken> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        let status = response.status();
        if matches!(status.as_u16(), 400 | 401 | 403) {
            return Err(Error::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            return Err(Error::Auth(format!(
                "token request failed with status {}",
                status
            )));
        }

        let body: TokenResponse = response.json().await?;
        let lifetime = body
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_LIFETIME);

        info!("Got a new access token (expires in {}s)", lifetime.as_secs());

        Ok(CachedToken {
            access_token: body.access_token,
            expires_at: Instant::now() + lifetime,
        })
    }

    /// Fetches into the locked cache slot and bumps the generation.
    async fn fetch_into(&self, slot: &mut Option<CachedToken>) -> Result<String> {
        let token = self.fetch().await?;
        let access_token = token.access_token.clone();
        *slot = Some(token);
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(access_token)
    }
}

/// Acquires the first token at startup.
///
/// Credentials the issuer rejects are returned as an error. Any other failure
/// is logged and left to the stream's reconnect loop.
pub async fn check_credentials(tokens: &dyn TokenProvider) -> Result<()> {
    match tokens.current_token().await {
        Ok(_) => Ok(()),
        Err(e) if e.is_credential_rejection() => Err(e),
        Err(e) => {
            warn!("Token issuer unavailable at startup: {}", e);
            Ok(())
        }
    }
}

#[async_trait]
impl TokenProvider for OAuthTokenProvider {
    async fn current_token(&self) -> Result<String> {
        let mut slot = self.token.lock().await;

        if let Some(token) = slot.as_ref().filter(|token| token.is_fresh()) {
            return Ok(token.access_token.clone());
        }

        self.fetch_into(&mut slot).await
    }

    async fn force_refresh(&self) -> Result<String> {
        let observed = self.generation.load(Ordering::SeqCst);
        let mut slot = self.token.lock().await;

        if self.generation.load(Ordering::SeqCst) != observed {
            if let Some(token) = slot.as_ref() {
                return Ok(token.access_token.clone());
            }
        }

        self.fetch_into(&mut slot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn spawn_token_server(status: StatusCode) -> (String, Arc<AtomicUsize>) {
        let issued = Arc::new(AtomicUsize::new(0));

        async fn issue(
            State((issued, status)): State<(Arc<AtomicUsize>, StatusCode)>,
        ) -> (StatusCode, Json<serde_json::Value>) {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let n = issued.fetch_add(1, Ordering::SeqCst) + 1;
            (
                status,
                Json(serde_json::json!({
                    "access_token": format!("token-{}", n),
                    "expires_in": 3600
                })),
            )
        }

        let app = Router::new()
            .route("/token", post(issue))
            .with_state((Arc::clone(&issued), status));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}/token", addr), issued)
    }

    fn provider(url: String) -> OAuthTokenProvider {
        OAuthTokenProvider::new(reqwest::Client::new(), url, "key", "secret")
    }

    #[tokio::test]
    async fn test_current_token_is_cached() {
        let (url, issued) = spawn_token_server(StatusCode::OK).await;
        let tokens = provider(url);

        assert_eq!(tokens.current_token().await.unwrap(), "token-1");
        assert_eq!(tokens.current_token().await.unwrap(), "token-1");
        assert_eq!(issued.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_request() {
        let (url, issued) = spawn_token_server(StatusCode::OK).await;
        let tokens = Arc::new(provider(url));
        assert_eq!(tokens.current_token().await.unwrap(), "token-1");

        let (a, b, c) = tokio::join!(
            tokens.force_refresh(),
            tokens.force_refresh(),
            tokens.force_refresh()
        );

        assert_eq!(a.unwrap(), "token-2");
        assert_eq!(b.unwrap(), "token-2");
        assert_eq!(c.unwrap(), "token-2");
        assert_eq!(issued.load(Ordering::SeqCst), 2);

        assert_eq!(tokens.force_refresh().await.unwrap(), "token-3");
    }

    #[tokio::test]
    async fn test_rejected_credentials_surface_unauthorized() {
        let (url, _) = spawn_token_server(StatusCode::UNAUTHORIZED).await;
        let tokens = provider(url);

        let result = tokens.current_token().await;
        assert!(matches!(result, Err(Error::Unauthorized(401))));
    }

    #[tokio::test]
    async fn test_issuer_failure_is_auth_error() {
        let (url, _) = spawn_token_server(StatusCode::BAD_GATEWAY).await;
        let tokens = provider(url);

        let result = tokens.current_token().await;
        assert!(matches!(result, Err(Error::Auth(_))));
    }

    #[tokio::test]
    async fn test_startup_check_fails_on_rejected_credentials() {
        let (url, _) = spawn_token_server(StatusCode::UNAUTHORIZED).await;
        let result = check_credentials(&provider(url)).await;
        assert!(matches!(result, Err(Error::Unauthorized(401))));

        let (url, _) = spawn_token_server(StatusCode::FORBIDDEN).await;
        assert!(check_credentials(&provider(url)).await.is_err());
    }

    #[tokio::test]
    async fn test_startup_check_tolerates_unavailable_issuer() {
        let (url, _) = spawn_token_server(StatusCode::SERVICE_UNAVAILABLE).await;
        assert!(check_credentials(&provider(url)).await.is_ok());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/token", listener.local_addr().unwrap());
        drop(listener);
        assert!(check_credentials(&provider(url)).await.is_ok());

        let (url, issued) = spawn_token_server(StatusCode::OK).await;
        let tokens = provider(url);
        assert!(check_credentials(&tokens).await.is_ok());
        assert_eq!(tokens.current_token().await.unwrap(), "token-1");
        assert_eq!(issued.load(Ordering::SeqCst), 1);
    }
}
