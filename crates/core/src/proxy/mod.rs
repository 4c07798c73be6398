use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::Router;
use axum::body::{Body, Bytes, to_bytes};
use axum::http::{HeaderMap, HeaderValue, Request, Response, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use reqwest::Client;
use tracing::{debug, info, instrument, warn};

mod auth;
mod stream;

pub use self::stream::{SseLineRewriter, rewrite_sse_stream};

use crate::config::{BridgeConfig, CopilotSettings};
use crate::error::BridgeError;
use crate::github::{GitHubClient, GitHubError};
use crate::headers::{RequestIds, copilot_headers, mask_token};
use crate::token_cache::TokenCache;

/// The two OpenAI-compatible routes relayed to Copilot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    ChatCompletions,
    Embeddings,
}

impl Endpoint {
    pub fn label(self) -> &'static str {
        match self {
            Endpoint::ChatCompletions => "chat/completions",
            Endpoint::Embeddings => "embeddings",
        }
    }

    fn upstream_url(self, copilot: &CopilotSettings) -> String {
        match self {
            Endpoint::ChatCompletions => copilot.completions_url(),
            Endpoint::Embeddings => copilot.embeddings_url(),
        }
    }
}

/// RFC 9110 connection-scoped headers; never relayed.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Framing and type are set by the proxy itself.
const PROXY_OWNED: &[&str] = &[
    "content-length",
    "content-encoding",
    "content-type",
    "set-cookie",
];

/// Extra header names an upstream marked as connection-scoped via `Connection: a, b`.
fn connection_listed(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Upstream headers worth relaying to the caller.
fn filter_response_headers(src: &HeaderMap) -> HeaderMap {
    let listed = connection_listed(src);
    let mut out = HeaderMap::new();
    for (name, value) in src.iter() {
        // `HeaderName` is always lowercase.
        let name_str = name.as_str();
        let dropped = HOP_BY_HOP.contains(&name_str)
            || PROXY_OWNED.contains(&name_str)
            || listed.iter().any(|t| t == name_str);
        if !dropped {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Token from `Authorization: <scheme> <token>`; only GitHub tokens (`gh*`) qualify.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (_, token) = raw.trim().split_once(' ')?;
    let token = token.trim();
    token.starts_with("gh").then_some(token)
}

/// `"stream": true`, also accepting the string `"true"` some clients send.
fn wants_stream(body: &serde_json::Value) -> bool {
    match body.get("stream") {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => s == "true",
        _ => false,
    }
}

#[derive(Clone)]
pub struct ProxyService {
    client: Client,
    github: GitHubClient,
    cache: Arc<TokenCache>,
    config: Arc<BridgeConfig>,
}

impl ProxyService {
    pub fn new(client: Client, config: Arc<BridgeConfig>) -> Result<Self> {
        let cache = Arc::new(TokenCache::new(config.copilot.token_ttl()?));
        let _ = TokenCache::spawn_sweeper(&cache, config.copilot.sweep_interval()?);
        let github = GitHubClient::new(
            client.clone(),
            config.github.clone(),
            config.editor.clone(),
        );
        Ok(Self {
            client,
            github,
            cache,
            config,
        })
    }

    pub fn token_cache(&self) -> Arc<TokenCache> {
        self.cache.clone()
    }

    /// Cached access token, or validate + exchange on a miss.
    async fn access_token_for(&self, user_token: &str) -> Result<String, BridgeError> {
        if let Some(token) = self.cache.get(user_token) {
            debug!("access token cache hit for {}", mask_token(user_token));
            return Ok(token);
        }

        if !self.github.validate_user_token(user_token).await {
            warn!("rejected invalid user token {}", mask_token(user_token));
            return Err(BridgeError::InvalidToken);
        }

        let access = self.github.exchange_copilot_token(user_token).await?;
        if !self.cache.insert(user_token, &access) {
            debug!(
                "access token for {} expires too soon to cache",
                mask_token(user_token)
            );
        }
        Ok(access.token)
    }

    async fn forward(
        &self,
        endpoint: Endpoint,
        req: Request<Body>,
    ) -> Result<Response<Body>, BridgeError> {
        let (parts, body) = req.into_parts();

        let raw_body = to_bytes(body, self.config.server.max_body_bytes)
            .await
            .map_err(|_| BridgeError::InvalidBody)?;
        let json: serde_json::Value =
            serde_json::from_slice(&raw_body).map_err(|_| BridgeError::InvalidBody)?;
        if !json.is_object() {
            return Err(BridgeError::InvalidBody);
        }

        let user_token = bearer_token(&parts.headers).ok_or(BridgeError::MissingToken)?;
        let access_token = self.access_token_for(user_token).await?;
        let is_stream = wants_stream(&json);

        let ids = RequestIds::generate();
        let upstream_headers = copilot_headers(&access_token, &self.config.editor, &ids)
            .map_err(|e| BridgeError::TokenExchange(GitHubError::from(e)))?;
        let target_url = endpoint.upstream_url(&self.config.copilot);
        debug!(
            "forwarding to {} request_id={} stream={}",
            target_url, ids.request_id, is_stream
        );

        let upstream = self
            .client
            .post(&target_url)
            .headers(upstream_headers)
            .body(raw_body)
            .send()
            .await
            .map_err(BridgeError::UpstreamTransport)?;

        let status = upstream.status();
        if status != StatusCode::OK {
            let body = match upstream.text().await {
                Ok(body) => body,
                Err(err) => {
                    warn!(
                        "reading upstream {} error body failed: {}",
                        endpoint.label(),
                        err
                    );
                    String::new()
                }
            };
            warn!(
                "upstream {} returned {}: {}",
                endpoint.label(),
                status.as_u16(),
                body
            );
            // A rejected access token must not be reused.
            self.cache.remove(user_token);
            return Err(BridgeError::Upstream { status, body });
        }

        let mut headers = filter_response_headers(upstream.headers());
        let mut resp = if is_stream {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream; charset=utf-8"),
            );
            Response::new(Body::from_stream(rewrite_sse_stream(
                upstream.bytes_stream(),
            )))
        } else {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json; charset=utf-8"),
            );
            let bytes: Bytes = upstream
                .bytes()
                .await
                .map_err(BridgeError::UpstreamTransport)?;
            Response::new(Body::from(bytes))
        };
        *resp.status_mut() = StatusCode::OK;
        *resp.headers_mut() = headers;
        Ok(resp)
    }
}

#[instrument(skip_all, fields(endpoint = endpoint.label()))]
pub async fn handle_forward(
    proxy: ProxyService,
    endpoint: Endpoint,
    req: Request<Body>,
) -> Response<Body> {
    let start = Instant::now();
    let mut resp = match proxy.forward(endpoint, req).await {
        Ok(resp) => {
            info!(
                status = resp.status().as_u16(),
                ms = start.elapsed().as_millis() as u64,
                "relayed"
            );
            resp
        }
        Err(err) => {
            let resp = err.into_response();
            info!(
                status = resp.status().as_u16(),
                ms = start.elapsed().as_millis() as u64,
                "rejected"
            );
            resp
        }
    };
    resp.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, must-revalidate"),
    );
    resp
}

async fn index(proxy: ProxyService) -> String {
    format!(
        r#"curl --location 'http://{}:{}/v1/chat/completions' \
--header 'Content-Type: application/json' \
--header 'Authorization: Bearer ghu_xxx' \
--data '{{
  "model": "gpt-4",
  "messages": [{{"role": "user", "content": "hi"}}]
}}'
"#,
        proxy.config.server.host, proxy.config.server.port
    )
}

pub fn router(proxy: ProxyService) -> Router {
    let p0 = proxy.clone();
    let p1 = proxy.clone();
    let p2 = proxy.clone();
    let p3 = proxy.clone();
    let p4 = proxy.clone();
    let p5 = proxy.clone();
    let p6 = proxy.clone();
    let p7 = proxy.clone();

    Router::new()
        .route("/", get(move || index(p0.clone())))
        .route(
            "/v1/chat/completions",
            post(move |req| handle_forward(p1.clone(), Endpoint::ChatCompletions, req)),
        )
        .route(
            "/v1/embeddings",
            post(move |req| handle_forward(p2.clone(), Endpoint::Embeddings, req)),
        )
        .route("/auth", get(move || auth::start_device_flow(p3.clone())))
        .route(
            "/auth/check",
            get(move |req| auth::check_device_code(p4.clone(), req))
                .post(move |req| auth::check_device_code(p5.clone(), req)),
        )
        .route(
            "/auth/checkGhu",
            get(move |req| auth::check_subscription(p6.clone(), req))
                .post(move |req| auth::check_subscription(p7.clone(), req)),
        )
}
