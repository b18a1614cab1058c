//! Socket token acquisition.
//!
//! Every WebSocket connect is preceded by fetching a short-lived, single-use
//! socket token over HTTP. [`TokenProvider`] abstracts where tokens come
//! from: [`HttpTokenProvider`] calls the platform's token endpoint with the
//! caller's identity headers, while [`StaticTokenProvider`] hands out a fixed
//! string for tests and tooling that already hold one.

use havenchat_proto::auth::{
    HEADER_USER_ID, HEADER_USER_NAME, HEADER_USER_ROLE, SOCKET_TOKEN_PATH, TokenResponse,
    UserIdentity,
};

/// Errors that can occur while fetching a socket token.
#[derive(Debug, thiserror::Error)]
pub enum TokenFetchError {
    /// The HTTP request never produced a response.
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The request did not complete within the connect deadline.
    #[error("token request timed out")]
    TimedOut,

    /// The endpoint answered with a non-success status.
    #[error("token endpoint returned status {status}")]
    Status {
        /// The HTTP status code of the response.
        status: u16,
    },

    /// The response body did not carry a usable token.
    #[error("token response malformed: {0}")]
    Malformed(String),
}

/// Source of single-use socket tokens.
///
/// A fresh token is fetched for every connection attempt, including
/// reconnects, because the gateway consumes each token on redemption.
pub trait TokenProvider: Send + Sync {
    /// Fetch a fresh socket token.
    fn fetch_token(
        &self,
    ) -> impl std::future::Future<Output = Result<String, TokenFetchError>> + Send;
}

/// Fetches tokens from the platform's `/auth/socket-token` endpoint.
///
/// The caller's identity travels in the `x-user-id`, `x-user-name` and
/// `x-user-role` headers, which is what the development gateway expects.
#[derive(Debug, Clone)]
pub struct HttpTokenProvider {
    client: reqwest::Client,
    base_url: String,
    identity: UserIdentity,
}

impl HttpTokenProvider {
    /// Create a provider targeting `base_url` (e.g. `http://127.0.0.1:9300`).
    #[must_use]
    pub fn new(base_url: impl Into<String>, identity: UserIdentity) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            identity,
        }
    }

    /// The identity this provider authenticates as.
    #[must_use]
    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    fn token_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{base}{SOCKET_TOKEN_PATH}")
    }
}

impl TokenProvider for HttpTokenProvider {
    async fn fetch_token(&self) -> Result<String, TokenFetchError> {
        let response = self
            .client
            .post(self.token_url())
            .header(HEADER_USER_ID, self.identity.user_id.as_str())
            .header(HEADER_USER_NAME, &self.identity.display_name)
            .header(HEADER_USER_ROLE, self.identity.role.as_str())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TokenFetchError::Status {
                status: status.as_u16(),
            });
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| TokenFetchError::Malformed(e.to_string()))?;

        if !body.success || body.socket_token.is_empty() {
            return Err(TokenFetchError::Malformed(
                "endpoint did not return a socket token".to_string(),
            ));
        }

        Ok(body.socket_token)
    }
}

/// Hands out the same token on every fetch.
///
/// Useful in tests and for tooling that obtained a token out of band.
/// Because gateway tokens are single-use, a static token authenticates the
/// first connection only; any reconnect with it is rejected.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Create a provider that always yields `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    async fn fetch_token(&self) -> Result<String, TokenFetchError> {
        Ok(self.token.clone())
    }
}
