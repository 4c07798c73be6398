//! Upstream header sets.
//!
//! Copilot only serves clients that look like a first-party editor plugin, so
//! every upstream call carries an editor identity plus per-request ids.

use std::sync::OnceLock;

use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use axum::http::header::InvalidHeaderValue;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::EditorSettings;

/// Identity used by the JetBrains plugin; the subscription lookup is only
/// answered with a `sku` for this client.
pub const JETBRAINS_EDITOR_VERSION: &str = "JetBrains-IU/232.10203.10";
pub const JETBRAINS_PLUGIN_VERSION: &str = "copilot-intellij/1.3.3.3572";
pub const JETBRAINS_USER_AGENT: &str = "GithubCopilot/1.129.0";

pub const GITHUB_REST_API_VERSION: &str = "2022-11-28";

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn sha256_hex(input: &[u8]) -> String {
    format!("{:x}", Sha256::digest(input))
}

/// Stable for the lifetime of the process.
pub fn machine_id() -> &'static str {
    static ID: OnceLock<String> = OnceLock::new();
    ID.get_or_init(|| sha256_hex(Uuid::new_v4().to_string().as_bytes()))
}

pub fn new_session_id() -> String {
    format!("{}{}", Uuid::new_v4(), now_ms())
}

/// Per-request ids sent alongside the editor identity.
#[derive(Debug, Clone)]
pub struct RequestIds {
    pub request_id: String,
    pub session_id: String,
}

impl RequestIds {
    pub fn generate() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            session_id: new_session_id(),
        }
    }
}

/// Render a secret for logs without leaking it.
pub fn mask_token(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{prefix}…(len={})", token.chars().count())
}

fn put(map: &mut HeaderMap, name: HeaderName, value: &str) -> Result<(), InvalidHeaderValue> {
    map.insert(name, HeaderValue::from_str(value)?);
    Ok(())
}

fn put_static(map: &mut HeaderMap, name: &'static str, value: &str) -> Result<(), InvalidHeaderValue> {
    put(map, HeaderName::from_static(name), value)
}

/// Headers for `POST /chat/completions` and `POST /embeddings`.
pub fn copilot_headers(
    access_token: &str,
    editor: &EditorSettings,
    ids: &RequestIds,
) -> Result<HeaderMap, InvalidHeaderValue> {
    let mut h = HeaderMap::new();
    put(&mut h, AUTHORIZATION, &format!("Bearer {access_token}"))?;
    put_static(&mut h, "x-request-id", &ids.request_id)?;
    put_static(&mut h, "x-github-api-version", &editor.api_version)?;
    put_static(&mut h, "vscode-sessionid", &ids.session_id)?;
    put_static(&mut h, "vscode-machineid", machine_id())?;
    put_static(&mut h, "editor-version", &editor.editor_version)?;
    put_static(&mut h, "editor-plugin-version", &editor.plugin_version)?;
    put_static(&mut h, "openai-organization", "github-copilot")?;
    put_static(&mut h, "openai-intent", "conversation-panel")?;
    put(&mut h, CONTENT_TYPE, "application/json")?;
    put(&mut h, USER_AGENT, &editor.user_agent)?;
    put_static(&mut h, "copilot-integration-id", &editor.integration_id)?;
    put(&mut h, ACCEPT, "*/*")?;
    Ok(h)
}

/// Headers for `GET /copilot_internal/v2/token` when exchanging a user token.
pub fn token_exchange_headers(
    user_token: &str,
    editor: &EditorSettings,
) -> Result<HeaderMap, InvalidHeaderValue> {
    let mut h = HeaderMap::new();
    put(&mut h, AUTHORIZATION, &format!("token {user_token}"))?;
    put_static(&mut h, "editor-version", &editor.editor_version)?;
    put_static(&mut h, "editor-plugin-version", &editor.plugin_version)?;
    put(&mut h, USER_AGENT, &editor.user_agent)?;
    put(&mut h, ACCEPT, "*/*")?;
    Ok(h)
}

/// Headers for the subscription (`sku`) lookup.
pub fn subscription_headers(user_token: &str) -> Result<HeaderMap, InvalidHeaderValue> {
    let mut h = HeaderMap::new();
    put(&mut h, AUTHORIZATION, &format!("Bearer {user_token}"))?;
    put_static(&mut h, "editor-version", JETBRAINS_EDITOR_VERSION)?;
    put_static(&mut h, "editor-plugin-version", JETBRAINS_PLUGIN_VERSION)?;
    put(&mut h, USER_AGENT, JETBRAINS_USER_AGENT)?;
    Ok(h)
}

/// Headers for `GET /user`.
pub fn user_check_headers(user_token: &str) -> Result<HeaderMap, InvalidHeaderValue> {
    let mut h = HeaderMap::new();
    put(&mut h, ACCEPT, "application/vnd.github+json")?;
    put(&mut h, AUTHORIZATION, &format!("Bearer {user_token}"))?;
    put_static(&mut h, "x-github-api-version", GITHUB_REST_API_VERSION)?;
    Ok(h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn get<'a>(h: &'a HeaderMap, name: &str) -> &'a str {
        h.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
    }

    #[test]
    fn copilot_headers_carry_identity_and_ids() {
        let editor = EditorSettings::default();
        let ids = RequestIds {
            request_id: "req-1".to_string(),
            session_id: "sess-1".to_string(),
        };
        let h = copilot_headers("tid=abc;exp=1", &editor, &ids).unwrap();
        assert_eq!(get(&h, "authorization"), "Bearer tid=abc;exp=1");
        assert_eq!(get(&h, "x-request-id"), "req-1");
        assert_eq!(get(&h, "vscode-sessionid"), "sess-1");
        assert_eq!(get(&h, "vscode-machineid"), machine_id());
        assert_eq!(get(&h, "x-github-api-version"), "2023-07-07");
        assert_eq!(get(&h, "editor-version"), "vscode/1.85.1");
        assert_eq!(get(&h, "editor-plugin-version"), "copilot-chat/0.11.1");
        assert_eq!(get(&h, "openai-organization"), "github-copilot");
        assert_eq!(get(&h, "openai-intent"), "conversation-panel");
        assert_eq!(get(&h, "copilot-integration-id"), "vscode-chat");
        assert_eq!(get(&h, "user-agent"), "GitHubCopilotChat/0.11.1");
        assert_eq!(get(&h, "content-type"), "application/json");
    }

    #[test]
    fn exchange_uses_token_scheme() {
        let h = token_exchange_headers("ghu_x", &EditorSettings::default()).unwrap();
        assert_eq!(get(&h, "authorization"), "token ghu_x");
        assert_eq!(get(&h, "accept"), "*/*");
    }

    #[test]
    fn control_characters_are_rejected() {
        assert!(user_check_headers("ghu_\nbad").is_err());
    }

    #[test]
    fn machine_id_is_stable_sha256_hex() {
        let id = machine_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, machine_id());
    }

    #[test]
    fn session_id_is_uuid_followed_by_millis() {
        let sid = new_session_id();
        let (uuid_part, millis) = sid.split_at(36);
        assert!(Uuid::parse_str(uuid_part).is_ok());
        assert!(millis.parse::<u64>().is_ok());
    }

    #[test]
    fn mask_token_keeps_prefix_only() {
        assert_eq!(mask_token("ghu_secretsecret"), "ghu_…(len=16)");
        assert_eq!(mask_token("gh"), "gh…(len=2)");
    }
}
