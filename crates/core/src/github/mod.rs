//! GitHub side of the credential exchange.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::StatusCode;
use axum::http::header::InvalidHeaderValue;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{EditorSettings, GitHubSettings};
use crate::headers::{
    mask_token, subscription_headers, token_exchange_headers, user_check_headers,
};

mod device;

pub use self::device::{DEVICE_GRANT_TYPE, DeviceCode, DevicePoll};
use self::device::AccessTokenResponse;

#[derive(Debug, thiserror::Error)]
pub enum GitHubError {
    #[error("request to GitHub failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{endpoint} request failed: {status}")]
    Status {
        endpoint: &'static str,
        status: StatusCode,
    },
    #[error("{0} missing from GitHub response")]
    MissingField(&'static str),
    #[error("token contains characters not allowed in a header")]
    InvalidHeader(#[from] InvalidHeaderValue),
}

/// Short-lived Copilot API token obtained from a GitHub user token.
#[derive(Debug, Clone)]
pub struct CopilotAccessToken {
    pub token: String,
    pub expires_at: Option<SystemTime>,
}

#[derive(Debug, Deserialize)]
struct CopilotTokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    expires_at: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionResponse {
    #[serde(default)]
    sku: Option<String>,
}

/// Accepts unix seconds or milliseconds, as a number or a numeric string.
fn parse_expires_at(value: &serde_json::Value) -> Option<SystemTime> {
    let raw = match value {
        serde_json::Value::Number(n) => n.as_i64()?,
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    if raw <= 0 {
        return None;
    }
    let secs = if raw > 10_000_000_000 { raw / 1000 } else { raw };
    Some(UNIX_EPOCH + Duration::from_secs(secs as u64))
}

#[derive(Clone)]
pub struct GitHubClient {
    http: Client,
    settings: GitHubSettings,
    editor: EditorSettings,
}

impl GitHubClient {
    pub fn new(http: Client, settings: GitHubSettings, editor: EditorSettings) -> Self {
        Self {
            http,
            settings,
            editor,
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{path}", self.settings.api_base.trim_end_matches('/'))
    }

    fn login_url(&self, path: &str) -> String {
        format!("{}{path}", self.settings.login_base.trim_end_matches('/'))
    }

    /// `true` iff `GET /user` answers 200 for this token.
    pub async fn validate_user_token(&self, user_token: &str) -> bool {
        let headers = match user_check_headers(user_token) {
            Ok(h) => h,
            Err(_) => return false,
        };
        match self
            .http
            .get(self.api_url("/user"))
            .headers(headers)
            .send()
            .await
        {
            Ok(resp) => {
                let ok = resp.status() == StatusCode::OK;
                if !ok {
                    debug!(
                        "user token {} rejected by /user: {}",
                        mask_token(user_token),
                        resp.status()
                    );
                }
                ok
            }
            Err(err) => {
                warn!("user token validation failed: {}", err);
                false
            }
        }
    }

    pub async fn exchange_copilot_token(
        &self,
        user_token: &str,
    ) -> Result<CopilotAccessToken, GitHubError> {
        let resp = self
            .http
            .get(self.api_url("/copilot_internal/v2/token"))
            .headers(token_exchange_headers(user_token, &self.editor)?)
            .send()
            .await?;
        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            warn!(
                "copilot token exchange failed for {}: {} {}",
                mask_token(user_token),
                status.as_u16(),
                body
            );
            return Err(GitHubError::Status {
                endpoint: "copilot token",
                status,
            });
        }
        let payload: CopilotTokenResponse = resp.json().await?;
        let token = payload
            .token
            .filter(|t| !t.trim().is_empty())
            .ok_or(GitHubError::MissingField("token"))?;
        Ok(CopilotAccessToken {
            token,
            expires_at: payload.expires_at.as_ref().and_then(parse_expires_at),
        })
    }

    pub async fn request_device_code(&self) -> Result<DeviceCode, GitHubError> {
        let resp = self
            .http
            .post(self.login_url("/login/device/code"))
            .header("Accept", "application/json")
            .form(&[("client_id", self.settings.client_id.as_str())])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GitHubError::Status {
                endpoint: "device code",
                status,
            });
        }
        let payload: serde_json::Value = resp.json().await?;
        let field = |key: &str| {
            payload
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let device_code = field("device_code").ok_or(GitHubError::MissingField("device code"))?;
        let user_code = field("user_code").ok_or(GitHubError::MissingField("user code"))?;
        Ok(DeviceCode {
            device_code,
            user_code,
            verification_uri: field("verification_uri")
                .unwrap_or_else(|| self.login_url("/login/device")),
            expires_in: payload
                .get("expires_in")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            interval: payload
                .get("interval")
                .and_then(|v| v.as_u64())
                .filter(|&n| n > 0)
                .unwrap_or(5),
        })
    }

    pub async fn poll_device_code(&self, device_code: &str) -> Result<DevicePoll, GitHubError> {
        let resp = self
            .http
            .post(self.login_url("/login/oauth/access_token"))
            .header("Accept", "application/json")
            .form(&[
                ("client_id", self.settings.client_id.as_str()),
                ("device_code", device_code),
                ("grant_type", DEVICE_GRANT_TYPE),
            ])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GitHubError::Status {
                endpoint: "device token",
                status,
            });
        }
        let payload: AccessTokenResponse = resp.json().await?;
        Ok(payload.into())
    }

    /// Copilot plan of the account behind `user_token`, `None` when it has none.
    pub async fn subscription_sku(&self, user_token: &str) -> Result<Option<String>, GitHubError> {
        let resp = self
            .http
            .get(self.api_url("/copilot_internal/v2/token"))
            .headers(subscription_headers(user_token)?)
            .send()
            .await?;
        let status = resp.status();
        if status != StatusCode::OK {
            return Err(GitHubError::Status {
                endpoint: "subscription",
                status,
            });
        }
        let payload: SubscriptionResponse = resp.json().await?;
        Ok(payload.sku.filter(|s| !s.trim().is_empty()))
    }
}
