use axum::body::Body;
use axum::http::{HeaderValue, Response, StatusCode, header};
use axum::response::IntoResponse;

use crate::github::GitHubError;

/// Failures on the forwarding path. Each variant maps to the status the
/// caller sees; upstream replies are relayed with their own status and body.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Request body is missing or not in JSON format")]
    InvalidBody,
    #[error("auth token not found")]
    MissingToken,
    #[error("auth token is invalid")]
    InvalidToken,
    #[error("{0}")]
    TokenExchange(#[from] GitHubError),
    #[error("upstream request failed: {0}")]
    UpstreamTransport(#[source] reqwest::Error),
    #[error("{body}")]
    Upstream { status: StatusCode, body: String },
}

impl BridgeError {
    pub fn status(&self) -> StatusCode {
        match self {
            BridgeError::InvalidBody
            | BridgeError::MissingToken
            | BridgeError::InvalidToken
            | BridgeError::TokenExchange(_) => StatusCode::BAD_REQUEST,
            BridgeError::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            BridgeError::Upstream { status, .. } => *status,
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let mut text = self.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        let mut resp = Response::new(Body::from(text));
        *resp.status_mut() = status;
        resp.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        resp.headers_mut().insert(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        );
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn client_side_failures_are_bad_request() {
        assert_eq!(BridgeError::InvalidBody.status(), StatusCode::BAD_REQUEST);
        assert_eq!(BridgeError::MissingToken.status(), StatusCode::BAD_REQUEST);
        assert_eq!(BridgeError::InvalidToken.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            BridgeError::TokenExchange(GitHubError::MissingField("token")).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn upstream_reply_keeps_its_status_and_body() {
        let err = BridgeError::Upstream {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: "{\"error\":\"rate limited\"}".to_string(),
        };
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.to_string(), "{\"error\":\"rate limited\"}");
    }

    #[tokio::test]
    async fn into_response_is_plain_text_with_newline() {
        let resp = BridgeError::MissingToken.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"auth token not found\n");
    }
}
