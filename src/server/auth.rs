//! Upgrade-time authentication
//!
//! Checked against the HTTP upgrade request before the WebSocket handshake
//! completes. A rejected request gets a 401 and never reaches Open.

use std::borrow::Cow;

use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use url::form_urlencoded;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authentication required")]
    MissingToken,

    #[error("Authentication failed")]
    InvalidToken,
}

impl AuthError {
    /// HTTP response sent instead of the upgrade
    pub fn to_response(&self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.to_string()));
        *response.status_mut() = StatusCode::UNAUTHORIZED;
        response
    }
}

/// Decides whether an upgrade request may open a session
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, request: &Request) -> Result<(), AuthError>;
}

/// Accepts every request
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _request: &Request) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Requires a shared token, sent either as `Authorization: Bearer <token>`
/// or as a `token` query parameter
#[derive(Debug, Clone)]
pub struct TokenAuthenticator {
    token: String,
}

impl TokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Token from the header, else the percent-decoded `token` parameter
    fn presented(request: &Request) -> Option<Cow<'_, str>> {
        let bearer = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| Cow::Borrowed(token.trim()));
        bearer.or_else(|| {
            let query = request.uri().query()?;
            form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "token")
                .map(|(_, value)| value)
        })
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, request: &Request) -> Result<(), AuthError> {
        match Self::presented(request) {
            None => Err(AuthError::MissingToken),
            Some(token) if bool::from(token.as_bytes().ct_eq(self.token.as_bytes())) => Ok(()),
            Some(_) => Err(AuthError::InvalidToken),
        }
    }
}

/// Build the authenticator for an optional configured token
pub fn authenticator_for(token: Option<&str>) -> Box<dyn Authenticator> {
    match token {
        Some(token) => Box::new(TokenAuthenticator::new(token)),
        None => Box::new(AllowAll),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, authorization: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_allow_all() {
        assert!(AllowAll.authenticate(&request("/", None)).is_ok());
    }

    #[test]
    fn test_bearer_header() {
        let auth = TokenAuthenticator::new("secret");
        assert!(auth
            .authenticate(&request("/", Some("Bearer secret")))
            .is_ok());
        assert_eq!(
            auth.authenticate(&request("/", Some("Bearer wrong"))),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn test_query_token() {
        let auth = TokenAuthenticator::new("secret");
        assert!(auth
            .authenticate(&request("/ws?room=1&token=secret", None))
            .is_ok());
        assert_eq!(
            auth.authenticate(&request("/ws?token=nope", None)),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn test_query_token_is_percent_decoded() {
        let auth = TokenAuthenticator::new("s3cr+t/=");
        assert_eq!(
            auth.authenticate(&request("ws://localhost/?token=s3cr%2Bt%2F%3D", None)),
            Ok(())
        );
        // An unencoded '+' decodes to a space
        assert_eq!(
            auth.authenticate(&request("/?token=s3cr+t/=", None)),
            Err(AuthError::InvalidToken)
        );
        assert!(TokenAuthenticator::new("a b")
            .authenticate(&request("/?token=a+b", None))
            .is_ok());
    }

    #[test]
    fn test_missing_token() {
        let auth = TokenAuthenticator::new("secret");
        assert_eq!(
            auth.authenticate(&request("/ws", None)),
            Err(AuthError::MissingToken)
        );
        assert_eq!(
            auth.authenticate(&request("/ws", Some("Basic c2VjcmV0"))),
            Err(AuthError::MissingToken)
        );
    }

    #[test]
    fn test_rejection_is_unauthorized() {
        let response = AuthError::InvalidToken.to_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.body().as_deref(), Some("Authentication failed"));
    }

    #[test]
    fn test_authenticator_for_config() {
        let open = authenticator_for(None);
        assert!(open.authenticate(&request("/", None)).is_ok());

        let guarded = authenticator_for(Some("t"));
        assert!(guarded.authenticate(&request("/", None)).is_err());
        assert!(guarded.authenticate(&request("/?token=t", None)).is_ok());
    }
}
