//! Caller authentication.

use http::{header, HeaderMap, StatusCode};
use kube::{api::PostParams, Api, Client};
use std::collections::BTreeMap;
use tracing::debug;
use tunnel_broker_k8s_api::{TokenReview, TokenReviewSpec};

/// The identity a token authenticated as.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct UserInfo {
    pub name: String,
    pub groups: Vec<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no bearer token")]
    MissingToken,

    #[error("token was not authenticated: {0}")]
    Unauthenticated(String),

    #[error("not authorized")]
    Forbidden,

    #[error("kubernetes API request failed: {0}")]
    Api(#[from] kube::Error),

    #[error("invalid review response: {0}")]
    InvalidResponse(&'static str),
}

#[async_trait::async_trait]
pub trait Authenticate: Send + Sync + 'static {
    async fn authenticate(&self, token: &str) -> Result<UserInfo, Error>;
}

/// Authenticates bearer tokens with the Kubernetes `TokenReview` API.
#[derive(Clone)]
pub struct TokenReviewer {
    api: Api<TokenReview>,
}

// === impl Error ===

impl Error {
    /// The status a caller sees. Messages are always generic.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingToken | Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Api(_) | Self::InvalidResponse(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Extracts the bearer token from a request's `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

// === impl TokenReviewer ===

impl TokenReviewer {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait::async_trait]
impl Authenticate for TokenReviewer {
    async fn authenticate(&self, token: &str) -> Result<UserInfo, Error> {
        let review = TokenReview {
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let status = self
            .api
            .create(&PostParams::default(), &review)
            .await?
            .status
            .ok_or(Error::InvalidResponse("missing status"))?;

        if !status.authenticated.unwrap_or(false) {
            return Err(Error::Unauthenticated(
                status.error.unwrap_or_else(|| "token rejected".to_string()),
            ));
        }
        let user = status
            .user
            .ok_or(Error::InvalidResponse("missing user"))?;
        let name = user
            .username
            .filter(|n| !n.is_empty())
            .ok_or(Error::InvalidResponse("missing username"))?;
        debug!(user = %name, "Authenticated");
        Ok(UserInfo {
            name,
            groups: user.groups.unwrap_or_default(),
            extra: user.extra.unwrap_or_default(),
        })
    }
}

impl std::fmt::Debug for TokenReviewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenReviewer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn extracts_bearer_tokens() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer  xyz "));
        assert_eq!(bearer_token(&headers), Some("xyz"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }
}
