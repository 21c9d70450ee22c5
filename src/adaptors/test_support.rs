//! Fixtures shared by adaptor tests.

use futures::StreamExt;
use secrecy::SecretString;
use serde_json::json;
use std::sync::Arc;

use super::streaming::FrameStream;
use super::{AdaptorContext, Meta};
use crate::bridge::FileBridge;
use crate::models::ChatRequest;
use crate::store::{JsonStore, LocalFileStore, VendorType};

pub(crate) fn context() -> AdaptorContext {
    context_with(JsonStore::in_memory(), LocalFileStore::new(std::env::temp_dir()))
}

pub(crate) fn context_with(store: JsonStore, files: LocalFileStore) -> AdaptorContext {
    AdaptorContext {
        client: reqwest::Client::new(),
        bridge: Arc::new(FileBridge::new(Arc::new(store), Arc::new(files), 3600)),
    }
}

pub(crate) fn meta(vendor: VendorType, base_url: &str, model: &str, is_stream: bool) -> Meta {
    Meta {
        request_id: "req-1".to_string(),
        tenant_id: 1,
        user_id: "user-1".to_string(),
        channel_id: 7,
        vendor,
        origin_model: model.to_string(),
        actual_model: model.to_string(),
        api_key: SecretString::new("sk-test-key".to_string()),
        base_url: Some(base_url.to_string()),
        is_stream,
        prompt_tokens: 3,
        conversation_id: None,
    }
}

pub(crate) fn request(model: &str, text: &str, stream: bool) -> ChatRequest {
    serde_json::from_value(json!({
        "model": model,
        "stream": stream,
        "user": "user-1",
        "messages": [{"role": "user", "content": text}]
    }))
    .unwrap()
}

/// Frames as strings; stream errors become `ERR:<message>`
pub(crate) async fn collect_frames(frames: FrameStream) -> Vec<String> {
    frames
        .map(|f| match f {
            Ok(bytes) => String::from_utf8(bytes.to_vec()).unwrap(),
            Err(e) => format!("ERR:{}", e),
        })
        .collect()
        .await
}

/// JSON payloads of the data frames, skipping the sentinel
pub(crate) fn payloads(frames: &[String]) -> Vec<serde_json::Value> {
    frames
        .iter()
        .filter_map(|f| f.strip_prefix("data: "))
        .map(str::trim)
        .filter(|d| *d != "[DONE]")
        .filter_map(|d| serde_json::from_str(d).ok())
        .collect()
}
