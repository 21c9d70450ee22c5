//! Persisted rows and the store seams the relay consumes.
//!
//! Schema management and admin CRUD live outside this crate; the relay only
//! needs the narrow read/update surface declared by the traits below.

pub mod files;
pub mod json;

use async_trait::async_trait;
use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use files::LocalFileStore;
pub use json::JsonStore;

/// Serialize SecretString for storage
pub(crate) fn serialize_secret<S>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(secret.expose_secret())
}

/// Deserialize SecretString from storage
pub(crate) fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
    Ok(SecretString::new(s))
}

pub(crate) fn empty_secret() -> SecretString {
    SecretString::new(String::new())
}

/// Store backend errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid file key: {0}")]
    InvalidKey(String),
}

/// Upstream vendor family a channel speaks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorType {
    OpenAi,
    Coze,
    Ai53Bot,
    Ai53Workflow,
    Tencent,
    Bailian,
}

impl VendorType {
    pub const ALL: [VendorType; 6] = [
        VendorType::OpenAi,
        VendorType::Coze,
        VendorType::Ai53Bot,
        VendorType::Ai53Workflow,
        VendorType::Tencent,
        VendorType::Bailian,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VendorType::OpenAi => "open_ai",
            VendorType::Coze => "coze",
            VendorType::Ai53Bot => "ai53_bot",
            VendorType::Ai53Workflow => "ai53_workflow",
            VendorType::Tencent => "tencent",
            VendorType::Bailian => "bailian",
        }
    }

    /// Best-effort vendor guess when the caller did not name one
    pub fn infer_from_model(model: &str) -> VendorType {
        if model.starts_with("workflow-") {
            VendorType::Ai53Workflow
        } else if model.starts_with("gte-rerank") {
            VendorType::Bailian
        } else {
            VendorType::OpenAi
        }
    }
}

impl fmt::Display for VendorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VendorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "open_ai" | "openai" => Ok(VendorType::OpenAi),
            "coze" => Ok(VendorType::Coze),
            "ai53_bot" | "53ai" | "ai53" => Ok(VendorType::Ai53Bot),
            "ai53_workflow" | "53ai_workflow" => Ok(VendorType::Ai53Workflow),
            "tencent" => Ok(VendorType::Tencent),
            "bailian" => Ok(VendorType::Bailian),
            other => Err(format!("unknown vendor type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    #[default]
    Enabled,
    Disabled,
}

/// Upstream endpoint configuration owned by one tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    #[serde(default)]
    pub id: i64,
    pub tenant_id: i64,
    #[serde(default)]
    pub name: String,
    pub vendor: VendorType,
    #[serde(serialize_with = "serialize_secret", deserialize_with = "deserialize_secret", default = "empty_secret")]
    pub key: SecretString,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub status: ChannelStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<i64>,
}

fn default_weight() -> u32 {
    1
}

impl Channel {
    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }

    pub fn serves_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    pub fn base_url_or<'a>(&'a self, default: &'a str) -> &'a str {
        match self.base_url.as_deref() {
            Some(url) if !url.trim().is_empty() => url,
            _ => default,
        }
    }

    /// Append models not already listed; returns how many were added
    pub fn merge_models<I, S>(&mut self, models: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut added = 0;
        for model in models {
            let model = model.into();
            let model = model.trim();
            if model.is_empty() || self.serves_model(model) {
                continue;
            }
            self.models.push(model.to_string());
            added += 1;
        }
        added
    }
}

/// Account flavor backing a Provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    CozeCn,
    CozeCom,
    /// Self-hosted deployment with a fixed access token
    CozeStudio,
}

impl ProviderKind {
    pub fn uses_static_token(&self) -> bool {
        matches!(self, ProviderKind::CozeStudio)
    }

    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            ProviderKind::CozeCn => Some("https://api.coze.cn"),
            ProviderKind::CozeCom => Some("https://api.coze.com"),
            ProviderKind::CozeStudio => None,
        }
    }

    /// Vendor type of channels this provider backs
    pub fn vendor(&self) -> VendorType {
        VendorType::Coze
    }
}

/// OAuth application credentials registered with the vendor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: String,
    #[serde(serialize_with = "serialize_secret", deserialize_with = "deserialize_secret")]
    pub client_secret: SecretString,
}

/// Tenant-scoped credential holder; may back many channels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: i64,
    pub tenant_id: i64,
    #[serde(default)]
    pub name: String,
    pub kind: ProviderKind,
    #[serde(serialize_with = "serialize_secret", deserialize_with = "deserialize_secret", default = "empty_secret")]
    pub access_token: SecretString,
    #[serde(serialize_with = "serialize_secret", deserialize_with = "deserialize_secret", default = "empty_secret")]
    pub refresh_token: SecretString,
    /// Access token expiry, epoch seconds
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub is_authorized: bool,
    /// Epoch milliseconds of the last authorization-code exchange
    #[serde(default)]
    pub authed_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthClientConfig>,
}

impl Provider {
    /// API base for this provider; static deployments must configure one
    pub fn api_base_url(&self) -> Option<String> {
        match self.base_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Some(url.trim_end_matches('/').to_string()),
            _ => self.kind.default_base_url().map(str::to_string),
        }
    }
}

/// Tenant-owned file artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadFile {
    pub id: i64,
    pub tenant_id: i64,
    pub file_name: String,
    /// Key in the file store
    pub key: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub extension: String,
    #[serde(default)]
    pub size: u64,
}

/// Vendor-side handle for an [`UploadFile`], scoped to a (channel, model) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFileMapping {
    #[serde(default)]
    pub id: i64,
    pub tenant_id: i64,
    pub file_id: i64,
    pub channel_id: i64,
    pub model: String,
    pub channel_file_id: String,
    /// Epoch seconds after which the remote handle must be re-uploaded
    pub expires_at: i64,
    #[serde(default)]
    pub api_response: String,
}

impl ChannelFileMapping {
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }
}

#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// Enabled channels of `vendor` owned by `tenant_id` that list `model`
    async fn find_eligible_channels(
        &self,
        tenant_id: i64,
        vendor: VendorType,
        model: &str,
    ) -> Result<Vec<Channel>, StoreError>;

    async fn get_channel(&self, id: i64) -> Result<Option<Channel>, StoreError>;

    async fn channels_for_provider(&self, tenant_id: i64, provider_id: i64) -> Result<Vec<Channel>, StoreError>;

    /// Insert when `id == 0`, otherwise replace; returns the stored row
    async fn save_channel(&self, channel: Channel) -> Result<Channel, StoreError>;

    async fn update_channel(&self, channel: &Channel) -> Result<(), StoreError>;

    async fn get_provider(&self, id: i64, tenant_id: i64) -> Result<Option<Provider>, StoreError>;

    async fn update_provider(&self, provider: &Provider) -> Result<(), StoreError>;
}

#[async_trait]
pub trait FileMappingStore: Send + Sync {
    async fn get_upload_file(&self, id: i64, tenant_id: i64) -> Result<Option<UploadFile>, StoreError>;

    async fn find_file_mapping(
        &self,
        file_id: i64,
        channel_id: i64,
        model: &str,
    ) -> Result<Option<ChannelFileMapping>, StoreError>;

    /// Upsert keyed by (file, channel, model); the last write wins
    async fn save_file_mapping(&self, mapping: ChannelFileMapping) -> Result<ChannelFileMapping, StoreError>;
}

/// Raw bytes behind [`UploadFile::key`]
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn load_file_bytes(&self, key: &str) -> Result<Bytes, StoreError>;

    async fn save_file(&self, bytes: Bytes, key: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(models: &[&str]) -> Channel {
        Channel {
            id: 1,
            tenant_id: 1,
            name: "c".to_string(),
            vendor: VendorType::Coze,
            key: SecretString::new("k".to_string()),
            base_url: None,
            models: models.iter().map(|m| m.to_string()).collect(),
            weight: 1,
            priority: 0,
            status: ChannelStatus::Enabled,
            provider_id: None,
        }
    }

    #[test]
    fn test_merge_models_keeps_order_and_skips_duplicates() {
        let mut c = channel(&["bot-1", "bot-2"]);
        let added = c.merge_models(vec!["bot-2", "bot-3", "", "bot-3", "bot-4"]);

        assert_eq!(added, 2);
        assert_eq!(c.models, vec!["bot-1", "bot-2", "bot-3", "bot-4"]);
    }

    #[test]
    fn test_vendor_type_parsing() {
        assert_eq!("53AI".parse::<VendorType>().unwrap(), VendorType::Ai53Bot);
        assert_eq!("ai53-workflow".parse::<VendorType>().unwrap(), VendorType::Ai53Workflow);
        assert_eq!("openai".parse::<VendorType>().unwrap(), VendorType::OpenAi);
        assert!("nope".parse::<VendorType>().is_err());
        assert_eq!(VendorType::infer_from_model("workflow-99"), VendorType::Ai53Workflow);
        assert_eq!(VendorType::infer_from_model("gte-rerank-v2"), VendorType::Bailian);
    }

    #[test]
    fn test_studio_provider_requires_base_url() {
        let mut provider = Provider {
            id: 1,
            tenant_id: 1,
            name: "studio".to_string(),
            kind: ProviderKind::CozeStudio,
            access_token: SecretString::new("pat".to_string()),
            refresh_token: empty_secret(),
            expires_in: 0,
            base_url: None,
            is_authorized: true,
            authed_time: 0,
            oauth: None,
        };
        assert!(provider.api_base_url().is_none());

        provider.base_url = Some("http://studio.local/".to_string());
        assert_eq!(provider.api_base_url().as_deref(), Some("http://studio.local"));

        provider.kind = ProviderKind::CozeCom;
        provider.base_url = None;
        assert_eq!(provider.api_base_url().as_deref(), Some("https://api.coze.com"));
    }

    #[test]
    fn test_mapping_expiry_boundary() {
        let mapping = ChannelFileMapping {
            id: 1,
            tenant_id: 1,
            file_id: 1,
            channel_id: 1,
            model: "bot-1".to_string(),
            channel_file_id: "f".to_string(),
            expires_at: 100,
            api_response: String::new(),
        };
        assert!(!mapping.is_expired(100));
        assert!(mapping.is_expired(101));
    }
}
