use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dirs::home_dir;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://chat.sensetime.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Bearer key clients must present; unset or blank disables the check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_key: Option<String>,
}

impl AuthConfig {
    pub fn effective_master_key(&self) -> Option<&str> {
        self.master_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Longest gap between reads from upstream, not a cap on a whole stream.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_UPSTREAM_BASE_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    180
}

fn default_connect_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CredentialsConfig {
    /// Upstream bearer tokens, one per account.
    #[serde(default)]
    pub auth_tokens: Vec<String>,
    /// Cookie header values; rotated with the same counter as the tokens.
    #[serde(default)]
    pub cookies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// When set, JSON logs are also written to a daily rolling file here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_dir: Option<PathBuf>,
    #[serde(default = "default_log_prefix")]
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_dir: None,
            file_prefix: default_log_prefix(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_prefix() -> String {
    "sense-proxy.log".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub upstream: UpstreamSettings,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    /// Client-facing model alias -> upstream model id (supports one `*`).
    /// Keeps declaration order; `/v1/models` lists aliases in this order.
    #[serde(default)]
    pub model_mapping: IndexMap<String, String>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Home directory for sense-proxy files (config, optional logs).
pub fn proxy_home_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sense-proxy")
}

pub fn default_config_path() -> PathBuf {
    proxy_home_dir().join("config.toml")
}

/// Split a comma separated list, trimming entries and dropping empty ones.
pub fn parse_csv_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Overlay environment variables onto a loaded config.
///
/// `lookup` is `std::env::var` in production; tests pass a map.
pub fn apply_env_overrides<F>(cfg: &mut ProxyConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(key) = lookup("API_MASTER_KEY") {
        cfg.auth.master_key = Some(key);
    }
    if let Some(raw) = lookup("SENSE_API_KEYS_STR") {
        let tokens = parse_csv_list(&raw);
        if !tokens.is_empty() {
            cfg.credentials.auth_tokens = tokens;
        }
    }
    if let Some(raw) = lookup("SENSE_COOKIES_STR") {
        let cookies = parse_csv_list(&raw);
        if !cookies.is_empty() {
            cfg.credentials.cookies = cookies;
        }
    }
    if let Some(raw) = lookup("MODEL_MAPPING_STR")
        && !raw.trim().is_empty()
    {
        match serde_json::from_str::<IndexMap<String, String>>(&raw) {
            Ok(mapping) => cfg.model_mapping.extend(mapping),
            Err(err) => warn!("ignoring MODEL_MAPPING_STR, not a JSON string map: {}", err),
        }
    }
    if let Some(host) = lookup("SENSE_PROXY_HOST")
        && !host.trim().is_empty()
    {
        cfg.server.host = host.trim().to_string();
    }
    if let Some(port) = lookup("SENSE_PROXY_PORT") {
        match port.trim().parse::<u16>() {
            Ok(p) => cfg.server.port = p,
            Err(_) => warn!("ignoring SENSE_PROXY_PORT={:?}, not a port number", port),
        }
    }
}

async fn load_config_file(path: &Path) -> Result<ProxyConfig> {
    if !path.exists() {
        return Ok(ProxyConfig::default());
    }
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {:?}", path))?;
    toml::from_str::<ProxyConfig>(&text).with_context(|| format!("failed to parse {:?}", path))
}

/// Load `path` (or the default location), then `.env` and process env.
pub async fn load_config(path: Option<&Path>) -> Result<ProxyConfig> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);
    let mut cfg = load_config_file(&path).await?;

    // A missing .env is the normal case.
    let _ = dotenv::dotenv();
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    Ok(cfg)
}

const CONFIG_TOML_TEMPLATE: &str = r#"# sense-proxy config.toml
#
# Every field is optional. Environment variables (and a .env file in the
# working directory) override values from this file:
#   API_MASTER_KEY, SENSE_API_KEYS_STR, SENSE_COOKIES_STR, MODEL_MAPPING_STR,
#   SENSE_PROXY_HOST, SENSE_PROXY_PORT
#
# Generate/overwrite this template: `sense-proxy config init [--force]`

[server]
host = "127.0.0.1"
port = 8000

[auth]
# When set, clients must send `Authorization: Bearer <master_key>`.
# master_key = "sk-change-me"

[upstream]
base_url = "https://chat.sensetime.com"
# Longest wait for the next bytes from upstream. A chat stream may run longer
# in total as long as data keeps arriving.
timeout_secs = 180
connect_timeout_secs = 30

[credentials]
# Tokens and cookies rotate round-robin with a shared counter; the two lists
# may have different lengths.
auth_tokens = []
cookies = []

# Client-facing model names -> upstream model ids. A single `*` wildcard is
# supported, e.g. "sense-*" = "sense-chat-*".
[model_mapping]
# "gpt-4o" = "sense-chat-pro"

[logging]
level = "info"
# file_dir = "/var/log/sense-proxy"
# file_prefix = "sense-proxy.log"
"#;

/// Write the commented template, backing up any existing file first.
pub async fn init_config_toml(path: Option<&Path>, force: bool) -> Result<PathBuf> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&dir).await?;

    if path.exists() && !force {
        anyhow::bail!(
            "config.toml already exists at {:?}; use --force to overwrite",
            path
        );
    }

    if path.exists() {
        let backup_path = path.with_extension("toml.bak");
        if let Err(err) = fs::copy(&path, &backup_path).await {
            warn!("failed to backup {:?} to {:?}: {}", path, backup_path, err);
        }
    }

    let tmp_path = dir.join("config.toml.tmp");
    fs::write(&tmp_path, CONFIG_TOML_TEMPLATE.as_bytes()).await?;
    fs::rename(&tmp_path, &path).await?;
    Ok(path)
}
