//! Device-flow helper endpoints (`/auth`, `/auth/check`, `/auth/checkGhu`).
//!
//! Replies use a small envelope: `code` is `"0"` on success and `"1"` otherwise.

use axum::Json;
use axum::body::Body;
use axum::extract::{Form, FromRequest, Query};
use axum::http::{Method, Request, header};
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::ProxyService;
use crate::github::{DevicePoll, GitHubError};
use crate::headers::mask_token;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub code: String,
    pub msg: String,
    pub data: serde_json::Value,
}

fn success(data: serde_json::Value) -> Response {
    Json(Envelope {
        code: "0".to_string(),
        msg: "success".to_string(),
        data,
    })
    .into_response()
}

fn failure(msg: impl Into<String>) -> Response {
    Json(Envelope {
        code: "1".to_string(),
        msg: msg.into(),
        data: serde_json::Value::String(String::new()),
    })
    .into_response()
}

/// Parameters of an `/auth*` call; `is_empty` means the caller sent nothing usable.
trait AuthParams: DeserializeOwned + Default {
    fn is_empty(&self) -> bool;
}

#[derive(Debug, Default, Deserialize)]
struct DeviceCheckParams {
    #[serde(default, rename = "deviceCode", alias = "device_code")]
    device_code: Option<String>,
}

impl AuthParams for DeviceCheckParams {
    fn is_empty(&self) -> bool {
        self.device_code.as_deref().is_none_or(|s| s.trim().is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
struct GhuParams {
    #[serde(default)]
    ghu: Option<String>,
}

impl AuthParams for GhuParams {
    fn is_empty(&self) -> bool {
        self.ghu.as_deref().is_none_or(|s| s.trim().is_empty())
    }
}

/// Body values (urlencoded form or JSON) win over the query string, which is
/// still honoured on POST.
async fn read_params<T: AuthParams>(req: Request<Body>) -> T {
    let query: T = Query::try_from_uri(req.uri())
        .map(|Query(v)| v)
        .unwrap_or_default();
    if req.method() == Method::GET || req.method() == Method::HEAD {
        return query;
    }

    let is_json = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"));
    let body: T = if is_json {
        Json::<T>::from_request(req, &())
            .await
            .map(|Json(v)| v)
            .unwrap_or_default()
    } else {
        Form::<T>::from_request(req, &())
            .await
            .map(|Form(v)| v)
            .unwrap_or_default()
    };
    if body.is_empty() { query } else { body }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

pub(super) async fn start_device_flow(proxy: ProxyService) -> Response {
    match proxy.github.request_device_code().await {
        Ok(code) => {
            info!(
                "device flow started: user_code={} verification_uri={}",
                code.user_code, code.verification_uri
            );
            match serde_json::to_value(&code) {
                Ok(data) => success(data),
                Err(err) => failure(err.to_string()),
            }
        }
        Err(err) => {
            warn!("device code request failed: {}", err);
            failure(format!("failed to get device code: {err}"))
        }
    }
}

pub(super) async fn check_device_code(proxy: ProxyService, req: Request<Body>) -> Response {
    let params: DeviceCheckParams = read_params(req).await;
    let Some(device_code) = non_empty(params.device_code) else {
        return failure("device code null");
    };
    match proxy.github.poll_device_code(&device_code).await {
        Ok(DevicePoll::Authorized { access_token }) => {
            info!("device flow authorized: {}", mask_token(&access_token));
            success(serde_json::Value::String(access_token))
        }
        Ok(other) => failure(other.reason().unwrap_or("token null")),
        Err(err) => {
            warn!("device token poll failed: {}", err);
            failure(err.to_string())
        }
    }
}

pub(super) async fn check_subscription(proxy: ProxyService, req: Request<Body>) -> Response {
    let params: GhuParams = read_params(req).await;
    let Some(ghu) = non_empty(params.ghu) else {
        return failure("ghu null");
    };
    if !ghu.starts_with("gh") {
        return failure("invalid ghu token format");
    }
    let info = match proxy.github.subscription_sku(&ghu).await {
        Ok(Some(sku)) => sku,
        Ok(None) => "not subscribed".to_string(),
        Err(GitHubError::Status { status, .. }) => format!("query failed: {}", status.as_u16()),
        Err(err) => {
            warn!("subscription lookup for {} failed: {}", mask_token(&ghu), err);
            "query failed".to_string()
        }
    };
    success(serde_json::Value::String(info))
}
