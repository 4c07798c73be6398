use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

pub const DEFAULT_PORT: u16 = 8081;
pub const DEFAULT_CLIENT_ID: &str = "Iv1.b507a08c87ecfe98";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound for inbound request bodies.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubSettings {
    /// REST API root (`/user`, `/copilot_internal/v2/token`).
    #[serde(default = "default_github_api_base")]
    pub api_base: String,
    /// OAuth root (`/login/device/code`, `/login/oauth/access_token`).
    #[serde(default = "default_github_login_base")]
    pub login_base: String,
    /// OAuth app client id used for the device flow.
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

impl Default for GitHubSettings {
    fn default() -> Self {
        Self {
            api_base: default_github_api_base(),
            login_base: default_github_login_base(),
            client_id: default_client_id(),
        }
    }
}

fn default_github_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_github_login_base() -> String {
    "https://github.com".to_string()
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopilotSettings {
    #[serde(default = "default_copilot_api_base")]
    pub api_base: String,
    /// How long an exchanged access token is reused, e.g. `"14m"`.
    #[serde(default = "default_token_ttl")]
    pub token_ttl: String,
    /// How often expired cache entries are swept, e.g. `"60m"`.
    #[serde(default = "default_cache_sweep_interval")]
    pub cache_sweep_interval: String,
}

impl Default for CopilotSettings {
    fn default() -> Self {
        Self {
            api_base: default_copilot_api_base(),
            token_ttl: default_token_ttl(),
            cache_sweep_interval: default_cache_sweep_interval(),
        }
    }
}

fn default_copilot_api_base() -> String {
    "https://api.githubcopilot.com".to_string()
}

fn default_token_ttl() -> String {
    "14m".to_string()
}

fn default_cache_sweep_interval() -> String {
    "60m".to_string()
}

impl CopilotSettings {
    pub fn token_ttl(&self) -> Result<Duration> {
        parse_positive_duration("copilot.token_ttl", &self.token_ttl)
    }

    pub fn sweep_interval(&self) -> Result<Duration> {
        parse_positive_duration("copilot.cache_sweep_interval", &self.cache_sweep_interval)
    }

    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }

    pub fn embeddings_url(&self) -> String {
        format!("{}/embeddings", self.api_base.trim_end_matches('/'))
    }
}

fn parse_positive_duration(field: &str, raw: &str) -> Result<Duration> {
    let d = humantime::parse_duration(raw.trim())
        .with_context(|| format!("invalid duration for {field}: {raw:?}"))?;
    if d.is_zero() {
        anyhow::bail!("{field} must be greater than zero");
    }
    Ok(d)
}

/// Client identity presented to Copilot; these values are what the upstream
/// checks to decide it is talking to an editor plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditorSettings {
    #[serde(default = "default_editor_version")]
    pub editor_version: String,
    #[serde(default = "default_plugin_version")]
    pub plugin_version: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_integration_id")]
    pub integration_id: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

impl Default for EditorSettings {
    fn default() -> Self {
        Self {
            editor_version: default_editor_version(),
            plugin_version: default_plugin_version(),
            user_agent: default_user_agent(),
            integration_id: default_integration_id(),
            api_version: default_api_version(),
        }
    }
}

fn default_editor_version() -> String {
    "vscode/1.85.1".to_string()
}

fn default_plugin_version() -> String {
    "copilot-chat/0.11.1".to_string()
}

fn default_user_agent() -> String {
    "GitHubCopilotChat/0.11.1".to_string()
}

fn default_integration_id() -> String {
    "vscode-chat".to_string()
}

fn default_api_version() -> String {
    "2023-07-07".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogConfig {
    /// When set, runtime logs are written to a daily-rolling file in this directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    /// Optional config schema version for future migrations
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub github: GitHubSettings,
    #[serde(default)]
    pub copilot: CopilotSettings,
    #[serde(default)]
    pub editor: EditorSettings,
    #[serde(default)]
    pub log: LogConfig,
}

impl BridgeConfig {
    /// Apply `PORT` / `COPILOT_BRIDGE_HOST` on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = env::var("PORT")
            && !raw.trim().is_empty()
        {
            match raw.trim().parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!("ignoring invalid PORT value {:?}", raw),
            }
        }
        if let Ok(host) = env::var("COPILOT_BRIDGE_HOST")
            && !host.trim().is_empty()
        {
            self.server.host = host.trim().to_string();
        }
    }

    /// Fail fast on values that would otherwise only break at request time.
    pub fn validate(&self) -> Result<()> {
        self.copilot.token_ttl()?;
        self.copilot.sweep_interval()?;
        for (field, url) in [
            ("github.api_base", &self.github.api_base),
            ("github.login_base", &self.github.login_base),
            ("copilot.api_base", &self.copilot.api_base),
        ] {
            reqwest::Url::parse(url).with_context(|| format!("invalid {field}: {url}"))?;
        }
        if self.github.client_id.trim().is_empty() {
            anyhow::bail!("github.client_id must not be empty");
        }
        Ok(())
    }
}

const CONFIG_VERSION: u32 = 1;

fn ensure_config_version(cfg: &mut BridgeConfig) {
    if cfg.version.is_none() {
        cfg.version = Some(CONFIG_VERSION);
    }
}

const CONFIG_TOML_TEMPLATE: &str = r#"# copilot-bridge config.toml
#
# Every field is optional; the commented values are the defaults.
#
# Path:
# - Linux/macOS: `~/.copilot-bridge/config.toml`
# - Windows:     `%USERPROFILE%\.copilot-bridge\config.toml`
# - Override the directory with COPILOT_BRIDGE_HOME.
#
# Environment overrides: PORT, COPILOT_BRIDGE_HOST.

version = 1

[server]
# host = "127.0.0.1"
# port = 8081
# max_body_bytes = 10485760

[github]
# api_base = "https://api.github.com"
# login_base = "https://github.com"
# client_id = "Iv1.b507a08c87ecfe98"

[copilot]
# api_base = "https://api.githubcopilot.com"
# Access tokens are reused for this long (capped by the token's own expiry).
# token_ttl = "14m"
# cache_sweep_interval = "60m"

[editor]
# editor_version = "vscode/1.85.1"
# plugin_version = "copilot-chat/0.11.1"
# user_agent = "GitHubCopilotChat/0.11.1"
# integration_id = "vscode-chat"
# api_version = "2023-07-07"

[log]
# Write runtime logs to a daily-rolling file instead of stderr.
# dir = "/var/log/copilot-bridge"
"#;

/// Home directory for config and logs.
pub fn proxy_home_dir() -> PathBuf {
    if let Ok(dir) = env::var("COPILOT_BRIDGE_HOME") {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".copilot-bridge")
}

/// Return the config file path that will be used by `load_config()`.
pub fn config_file_path() -> PathBuf {
    proxy_home_dir().join("config.toml")
}

fn config_backup_path() -> PathBuf {
    proxy_home_dir().join("config.toml.bak")
}

pub async fn init_config_toml(force: bool) -> Result<PathBuf> {
    let dir = proxy_home_dir();
    fs::create_dir_all(&dir).await?;
    let path = config_file_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config.toml already exists at {:?}; use --force to overwrite",
            path
        );
    }

    if path.exists() {
        let backup_path = config_backup_path();
        if let Err(err) = fs::copy(&path, &backup_path).await {
            warn!("failed to backup {:?} to {:?}: {}", path, backup_path, err);
        }
    }

    let tmp_path = dir.join("config.toml.tmp");
    fs::write(&tmp_path, CONFIG_TOML_TEMPLATE.as_bytes()).await?;
    fs::rename(&tmp_path, &path).await?;
    Ok(path)
}

pub fn parse_config_toml(text: &str) -> Result<BridgeConfig> {
    let mut cfg = toml::from_str::<BridgeConfig>(text)?;
    ensure_config_version(&mut cfg);
    Ok(cfg)
}

pub async fn load_config() -> Result<BridgeConfig> {
    let path = config_file_path();
    if path.exists() {
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {:?}", path))?;
        return parse_config_toml(&text).with_context(|| format!("failed to parse {:?}", path));
    }

    let mut cfg = BridgeConfig::default();
    ensure_config_version(&mut cfg);
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = parse_config_toml("").unwrap();
        assert_eq!(cfg.version, Some(1));
        assert_eq!(cfg.server.port, 8081);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.github.client_id, DEFAULT_CLIENT_ID);
        assert_eq!(cfg.copilot.token_ttl().unwrap(), Duration::from_secs(14 * 60));
        assert_eq!(
            cfg.copilot.sweep_interval().unwrap(),
            Duration::from_secs(60 * 60)
        );
        assert!(cfg.log.dir.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn template_parses_to_defaults() {
        let cfg = parse_config_toml(CONFIG_TOML_TEMPLATE).unwrap();
        assert_eq!(cfg.server.port, DEFAULT_PORT);
        assert_eq!(cfg.editor.editor_version, "vscode/1.85.1");
        assert_eq!(cfg.copilot.api_base, "https://api.githubcopilot.com");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = parse_config_toml(
            r#"
[server]
port = 9000

[copilot]
token_ttl = "5m"
"#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.copilot.token_ttl().unwrap(), Duration::from_secs(300));
        assert_eq!(cfg.copilot.api_base, "https://api.githubcopilot.com");
    }

    #[test]
    fn upstream_urls_are_joined_without_double_slash() {
        let settings = CopilotSettings {
            api_base: "http://127.0.0.1:9/".to_string(),
            ..CopilotSettings::default()
        };
        assert_eq!(
            settings.completions_url(),
            "http://127.0.0.1:9/chat/completions"
        );
        assert_eq!(settings.embeddings_url(), "http://127.0.0.1:9/embeddings");
    }

    #[test]
    fn validate_rejects_zero_and_garbage_ttl() {
        let mut cfg = BridgeConfig::default();
        cfg.copilot.token_ttl = "0s".to_string();
        assert!(cfg.validate().is_err());
        cfg.copilot.token_ttl = "soon".to_string();
        assert!(cfg.validate().is_err());
    }

    struct ScopedEnv {
        saved: Vec<(String, Option<String>)>,
    }

    impl ScopedEnv {
        fn new() -> Self {
            Self { saved: Vec::new() }
        }

        unsafe fn set_str(&mut self, key: &str, value: &str) {
            self.saved.push((key.to_string(), std::env::var(key).ok()));
            unsafe { std::env::set_var(key, value) };
        }
    }

    impl Drop for ScopedEnv {
        fn drop(&mut self) {
            for (key, old) in self.saved.drain(..).rev() {
                unsafe {
                    match old {
                        Some(v) => std::env::set_var(&key, v),
                        None => std::env::remove_var(&key),
                    }
                }
            }
        }
    }

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: std::sync::OnceLock<std::sync::Mutex<()>> = std::sync::OnceLock::new();
        match LOCK.get_or_init(|| std::sync::Mutex::new(())).lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    #[test]
    fn env_overrides_port_and_host() {
        let _lock = env_lock();
        let mut env = ScopedEnv::new();
        unsafe {
            env.set_str("PORT", "9911");
            env.set_str("COPILOT_BRIDGE_HOST", "0.0.0.0");
        }
        let mut cfg = BridgeConfig::default();
        cfg.apply_env_overrides();
        assert_eq!(cfg.server.port, 9911);
        assert_eq!(cfg.server.host, "0.0.0.0");
    }

    #[test]
    fn invalid_port_env_is_ignored() {
        let _lock = env_lock();
        let mut env = ScopedEnv::new();
        unsafe {
            env.set_str("PORT", "eighty");
            env.set_str("COPILOT_BRIDGE_HOST", "");
        }
        let mut cfg = BridgeConfig::default();
        cfg.apply_env_overrides();
        assert_eq!(cfg.server.port, DEFAULT_PORT);
        assert_eq!(cfg.server.host, "127.0.0.1");
    }

    #[test]
    fn home_dir_honours_env_override() {
        let _lock = env_lock();
        let mut env = ScopedEnv::new();
        unsafe {
            env.set_str("COPILOT_BRIDGE_HOME", "/tmp/copilot-bridge-test-home");
        }
        assert_eq!(
            config_file_path(),
            PathBuf::from("/tmp/copilot-bridge-test-home/config.toml")
        );
    }

    #[test]
    fn validate_rejects_bad_base_url() {
        let mut cfg = BridgeConfig::default();
        cfg.copilot.api_base = "not a url".to_string();
        assert!(cfg.validate().is_err());
    }
}
