pub mod ai53;
pub mod ai53_workflow;
pub mod coze;
pub mod error;
pub mod openai;
pub mod registry;
pub mod streaming;
pub mod tencent;

#[cfg(test)]
pub(crate) mod test_support;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::bridge::FileBridge;
use crate::models::{ChatRequest, ChatResponse, Usage};
use crate::store::{Channel, VendorType};
pub use error::RelayError;
use streaming::{FrameStream, StreamAccounting};

pub use registry::AdaptorRegistry;

/// Per-call context threaded through the adaptor pipeline
#[derive(Debug, Clone)]
pub struct Meta {
    pub request_id: String,
    pub tenant_id: i64,
    pub user_id: String,
    pub channel_id: i64,
    pub vendor: VendorType,
    /// Model name the caller asked for
    pub origin_model: String,
    /// Model name sent upstream
    pub actual_model: String,
    pub api_key: SecretString,
    pub base_url: Option<String>,
    pub is_stream: bool,
    pub prompt_tokens: u32,
    /// Vendor-side conversation to continue, if any
    pub conversation_id: Option<String>,
}

impl Meta {
    pub fn for_channel(channel: &Channel, request: &ChatRequest) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().simple().to_string(),
            tenant_id: channel.tenant_id,
            user_id: request.user.clone().unwrap_or_default(),
            channel_id: channel.id,
            vendor: channel.vendor,
            origin_model: request.model.clone(),
            actual_model: request.model.clone(),
            api_key: channel.key.clone(),
            base_url: channel.base_url.clone(),
            is_stream: request.stream,
            prompt_tokens: 0,
            conversation_id: None,
        }
    }

    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }
}

/// Dependencies shared by every adaptor instance
#[derive(Clone)]
pub struct AdaptorContext {
    pub client: reqwest::Client,
    pub bridge: Arc<FileBridge>,
}

/// Fully buffered vendor answer
#[derive(Debug, Clone)]
pub struct Completion {
    pub response: ChatResponse,
    /// Usage as reported by the vendor, if it reports any
    pub vendor_usage: Option<Usage>,
    pub vendor_conversation_id: Option<String>,
}

/// Normalized frames plus the tally filled in while they flow
pub struct RelayStream {
    pub frames: FrameStream,
    pub accounting: StreamAccounting,
}

pub enum AdaptorOutput {
    Complete(Completion),
    Stream(RelayStream),
}

/// Capability contract implemented by every vendor module
#[async_trait]
pub trait Adaptor: Send + Sync {
    /// Capture per-call values before the request is built
    fn init(&mut self, _meta: &Meta) {}

    fn request_url(&self, meta: &Meta) -> Result<String, RelayError>;

    fn setup_request_header(&self, request: RequestBuilder, meta: &Meta) -> RequestBuilder;

    /// Map the canonical request to the vendor wire body
    async fn convert_request(&self, meta: &Meta, request: &ChatRequest) -> Result<Value, RelayError>;

    fn convert_image_request(&self, _meta: &Meta, _request: &Value) -> Result<Value, RelayError> {
        Err(RelayError::Config(format!(
            "image generation is not supported by {}",
            self.channel_name()
        )))
    }

    /// Send the body; non-2xx responses are returned, not raised
    async fn do_request(&self, meta: &Meta, body: Value) -> Result<Response, RelayError>;

    async fn do_response(&self, meta: &Meta, response: Response) -> Result<AdaptorOutput, RelayError>;

    fn model_list(&self) -> Vec<String>;

    fn channel_name(&self) -> &'static str;
}

/// POST `body` to the adaptor's URL with its headers.
///
/// On a non-2xx status the body is read once for diagnostics and the
/// response is rebuilt so the caller can still extract the error uniformly.
pub async fn do_request_helper<A>(adaptor: &A, client: &reqwest::Client, meta: &Meta, body: &Value) -> Result<Response, RelayError>
where
    A: Adaptor + ?Sized,
{
    let url = adaptor.request_url(meta)?;
    debug!(
        "📤 {} request to {} (key {}): {}",
        adaptor.channel_name(),
        url,
        mask_api_key(meta.api_key()),
        body
    );

    let builder = adaptor.setup_request_header(client.post(&url).json(body), meta);
    let response = builder.send().await?;

    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.bytes().await?;
    warn!(
        "❌ {} returned {}: {}",
        adaptor.channel_name(),
        status,
        String::from_utf8_lossy(&bytes)
    );

    let mut rebuilt = axum::http::Response::builder().status(status);
    for (name, value) in headers.iter() {
        rebuilt = rebuilt.header(name, value);
    }
    let rebuilt = rebuilt
        .body(bytes)
        .map_err(|e| RelayError::Parse(format!("failed to rebuild error response: {}", e)))?;
    Ok(Response::from(rebuilt))
}

/// Turn a non-2xx response into a [`RelayError::Transport`]
pub async fn error_from_response(response: Response) -> RelayError {
    let status = response.status().as_u16();
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => return RelayError::Http(e),
    };
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            let candidates = [
                v.pointer("/error/message"),
                v.get("message"),
                v.get("msg"),
                v.pointer("/error/msg"),
            ];
            candidates
                .into_iter()
                .flatten()
                .find_map(|m| m.as_str().map(str::to_string))
        })
        .unwrap_or(body);
    RelayError::Transport { status, body: message }
}

/// Validate a channel base URL, falling back to the vendor default
pub fn resolve_base_url(configured: Option<&str>, default: Option<&str>, vendor: &str) -> Result<String, RelayError> {
    let raw = match configured.map(str::trim) {
        Some(url) if !url.is_empty() => url,
        _ => default.ok_or_else(|| RelayError::Config(format!("{} channel requires a base_url", vendor)))?,
    };

    let parsed = url::Url::parse(raw).map_err(|e| RelayError::Config(format!("invalid {} base_url '{}': {}", vendor, raw, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(RelayError::Config(format!(
            "invalid {} base_url '{}': unsupported scheme",
            vendor, raw
        )));
    }
    Ok(raw.trim_end_matches('/').to_string())
}

/// Hide all but the first and last four characters of a key
pub fn mask_api_key(api_key: &str) -> String {
    let chars: Vec<char> = api_key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}****{}", head, tail)
}

/// Bot identifier carried in the model name after a vendor prefix
pub fn strip_model_prefix<'a>(model: &'a str, prefixes: &[&str]) -> &'a str {
    prefixes
        .iter()
        .find_map(|prefix| model.strip_prefix(prefix))
        .unwrap_or(model)
}
