use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::adaptors::mask_api_key;
use crate::bridge::DEFAULT_MAPPING_TTL_SECS;
use crate::selector::DEFAULT_RETRY_TIMES;
use crate::store::{Channel, Provider};
use crate::usage::PricingConfig;

const ENV_PREFIX: &str = "HUB_RELAY";

fn home_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".hub-relay"))
        .unwrap_or_else(|| PathBuf::from(".hub-relay"))
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub oauth: OAuthSettings,
    #[serde(default)]
    pub pricing: PricingConfig,
    /// Seed providers imported into the state store when absent
    #[serde(default)]
    pub providers: Vec<Provider>,
    /// Seed channels imported into the state store when absent
    #[serde(default)]
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Selection iterations per call
    #[serde(default = "default_retry_times")]
    pub channel_retry_times: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Lifetime of a vendor file handle
    #[serde(default = "default_mapping_ttl")]
    pub file_mapping_ttl_secs: i64,
}

fn default_retry_times() -> u32 {
    DEFAULT_RETRY_TIMES
}

fn default_request_timeout() -> u64 {
    300
}

fn default_mapping_ttl() -> i64 {
    DEFAULT_MAPPING_TTL_SECS
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            channel_retry_times: default_retry_times(),
            request_timeout_secs: default_request_timeout(),
            file_mapping_ttl_secs: default_mapping_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON document holding channels, providers and file mappings
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    /// Root of the local file store
    #[serde(default = "default_files_dir")]
    pub files_dir: PathBuf,
    /// JSONL usage ledger; usage is only logged when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_log: Option<PathBuf>,
}

fn default_state_path() -> PathBuf {
    home_dir().join("state.json")
}

fn default_files_dir() -> PathBuf {
    home_dir().join("files")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            files_dir: default_files_dir(),
            usage_log: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthSettings {
    /// Public base URL the vendor redirects back to
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,
}

fn default_callback_base_url() -> String {
    format!("http://{}:{}", default_host(), default_port())
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            callback_base_url: default_callback_base_url(),
        }
    }
}

impl OAuthSettings {
    pub fn coze_redirect_uri(&self, tenant_id: i64) -> String {
        format!(
            "{}/api/callback/coze/auth/{}",
            self.callback_base_url.trim_end_matches('/'),
            tenant_id
        )
    }
}

impl AppConfig {
    /// Load from a TOML file, then `HUB_RELAY__SECTION__KEY` overrides.
    ///
    /// A missing file yields the built-in defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        let config: AppConfig = settings
            .try_deserialize()
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        Ok(config)
    }

    /// Default config path: ~/.hub-relay/config.toml
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not find home directory")?;
        Ok(home.join(".hub-relay").join("config.toml"))
    }

    /// Copy with every key and token masked
    pub fn redacted(&self) -> Self {
        let mask = |secret: &SecretString| SecretString::new(mask_api_key(secret.expose_secret()));
        let mut config = self.clone();
        for channel in &mut config.channels {
            channel.key = mask(&channel.key);
        }
        for provider in &mut config.providers {
            provider.access_token = mask(&provider.access_token);
            provider.refresh_token = mask(&provider.refresh_token);
            if let Some(oauth) = provider.oauth.as_mut() {
                oauth.client_secret = mask(&oauth.client_secret);
            }
        }
        config
    }

    /// Resolved configuration as TOML, secrets masked
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(&self.redacted()).context("Failed to render config as TOML")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ProviderKind, VendorType};
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = AppConfig::from_file(&temp_dir.path().join("absent.toml")).unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.relay.channel_retry_times, 3);
        assert_eq!(config.relay.file_mapping_ttl_secs, 30 * 24 * 3600);
        assert!(config.channels.is_empty());
    }

    #[test]
    fn test_load_sections_and_seeds() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 9100

[relay]
channel_retry_times = 5

[oauth]
callback_base_url = "https://hub.example.com/"

[pricing]
group_ratio = 0.5

[[pricing.models]]
name = "gpt-4o*"
model_ratio = 2.5

[[providers]]
id = 1
tenant_id = 7
kind = "coze_cn"
oauth = { client_id = "cid", client_secret = "csecret" }

[[channels]]
tenant_id = 7
name = "openai"
vendor = "open_ai"
key = "sk-abcdefgh12345678"
models = ["gpt-4o"]
"#,
        )
        .unwrap();

        let config = AppConfig::from_file(&path).unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.relay.channel_retry_times, 5);
        assert_eq!(config.pricing.group_ratio, 0.5);
        assert_eq!(config.pricing.models[0].completion_ratio, 1.0);
        assert_eq!(config.providers[0].kind, ProviderKind::CozeCn);
        assert_eq!(config.channels[0].vendor, VendorType::OpenAi);
        assert_eq!(
            config.oauth.coze_redirect_uri(7),
            "https://hub.example.com/api/callback/coze/auth/7"
        );

        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("sk-a****5678"));
        assert!(!rendered.contains("sk-abcdefgh12345678"));
        assert!(!rendered.contains("csecret"));
    }
}
