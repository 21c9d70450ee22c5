//! Coze v3 chat.
//!
//! Upstream always streams; non-stream callers get the run drained into a
//! single completion. Channels are usually bound to an OAuth Provider whose
//! access token is the channel key.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::ACCEPT;
use reqwest::multipart::Form;
use reqwest::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use super::error::RelayError;
use super::streaming::{
    drain, normalize_events, AllowList, EventKind, SseEvent, SseStream, StreamAccounting, VendorEvents,
};
use super::{
    do_request_helper, error_from_response, resolve_base_url, strip_model_prefix, Adaptor, AdaptorContext,
    AdaptorOutput, Completion, Meta, RelayStream,
};
use crate::bridge::{file_part, RemoteFile, Uploader};
use crate::models::{ChatCompletionChunk, ChatRequest, ChatResponse, KnownPart, Usage};
use crate::store::UploadFile;

pub const DEFAULT_BASE_URL: &str = "https://api.coze.cn";

const DEFAULT_USER: &str = "53AIHub";

static CHAT_EVENTS: AllowList = AllowList::new(&[
    ("conversation.chat.created", EventKind::Start),
    ("conversation.message.delta", EventKind::Content),
    ("conversation.chat.completed", EventKind::Finish),
    ("conversation.chat.failed", EventKind::Error),
    ("error", EventKind::Error),
]);

fn coze_base_url(meta: &Meta) -> Result<String, RelayError> {
    resolve_base_url(meta.base_url.as_deref(), Some(DEFAULT_BASE_URL), "coze")
}

/// Coze answers `{code, msg, data}`; a non-zero code is a failure
#[derive(Debug, Deserialize)]
pub(crate) struct CozeEnvelope<T> {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    pub data: Option<T>,
}

impl<T> CozeEnvelope<T> {
    pub fn into_data(self) -> Result<T, RelayError> {
        if self.code != 0 {
            return Err(RelayError::Vendor {
                code: self.code.to_string(),
                message: self.msg,
            });
        }
        self.data
            .ok_or_else(|| RelayError::Parse(format!("coze response without data: {}", self.msg)))
    }
}

#[derive(Debug, Deserialize)]
struct UploadedFile {
    id: String,
}

/// Multipart upload to `/v1/files/upload`
#[derive(Clone)]
pub(crate) struct CozeUploader {
    pub client: reqwest::Client,
}

#[async_trait]
impl Uploader for CozeUploader {
    async fn upload(&self, meta: &Meta, file: &UploadFile, bytes: Bytes) -> Result<RemoteFile, RelayError> {
        let url = format!("{}/v1/files/upload", coze_base_url(meta)?);
        let form = Form::new().part("file", file_part(file, bytes)?);
        let response = self
            .client
            .post(&url)
            .bearer_auth(meta.api_key())
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let raw = response.text().await?;
        let envelope: CozeEnvelope<UploadedFile> = serde_json::from_str(&raw)?;
        Ok(RemoteFile {
            id: envelope.into_data()?.id,
            api_response: raw,
        })
    }
}

#[derive(Debug, Serialize)]
struct AdditionalMessage {
    role: &'static str,
    content: String,
    content_type: &'static str,
}

pub struct CozeAdaptor {
    ctx: AdaptorContext,
}

impl CozeAdaptor {
    pub fn new(ctx: AdaptorContext) -> Self {
        Self { ctx }
    }

    /// Last message as Coze content; bridged files switch it to `object_string`
    async fn build_message(&self, meta: &Meta, request: &ChatRequest) -> Result<AdditionalMessage, RelayError> {
        let last = request
            .last_message()
            .ok_or_else(|| RelayError::Validation("messages must not be empty".to_string()))?;
        let refs = last.file_refs();
        if refs.is_empty() {
            return Ok(AdditionalMessage {
                role: "user",
                content: last.text(),
                content_type: "text",
            });
        }

        let uploader = CozeUploader {
            client: self.ctx.client.clone(),
        };
        let mut objects = Vec::new();
        for part in last.parts() {
            if let KnownPart::Text { text } = part {
                objects.push(json!({"type": "text", "text": text}));
            }
        }
        for file_ref in refs {
            match self
                .ctx
                .bridge
                .bridge(&uploader, meta, file_ref.file_id, &meta.actual_model)
                .await
            {
                Ok(mapping) => {
                    objects.push(json!({"type": file_ref.kind.as_str(), "file_id": mapping.channel_file_id}));
                }
                Err(e) => warn!("Skipping file {} for coze: {}", file_ref.file_id, e),
            }
        }

        Ok(AdditionalMessage {
            role: "user",
            content: Value::Array(objects).to_string(),
            content_type: "object_string",
        })
    }
}

#[async_trait]
impl Adaptor for CozeAdaptor {
    fn request_url(&self, meta: &Meta) -> Result<String, RelayError> {
        let base = coze_base_url(meta)?;
        let mut url = url::Url::parse(&format!("{}/v3/chat", base))
            .map_err(|e| RelayError::Config(format!("invalid coze url: {}", e)))?;
        if let Some(conversation) = meta.conversation_id.as_deref().filter(|c| !c.is_empty()) {
            url.query_pairs_mut().append_pair("conversation_id", conversation);
        }
        Ok(url.to_string())
    }

    fn setup_request_header(&self, request: RequestBuilder, meta: &Meta) -> RequestBuilder {
        request.bearer_auth(meta.api_key()).header(ACCEPT, "text/event-stream")
    }

    async fn convert_request(&self, meta: &Meta, request: &ChatRequest) -> Result<Value, RelayError> {
        let message = self.build_message(meta, request).await?;
        let user_id = if meta.user_id.is_empty() {
            DEFAULT_USER.to_string()
        } else {
            meta.user_id.clone()
        };
        Ok(json!({
            "bot_id": strip_model_prefix(&meta.actual_model, &["bot-"]),
            "user_id": user_id,
            "stream": true,
            "auto_save_history": true,
            "additional_messages": [message],
        }))
    }

    async fn do_request(&self, meta: &Meta, body: Value) -> Result<Response, RelayError> {
        do_request_helper(self, &self.ctx.client, meta, &body).await
    }

    async fn do_response(&self, meta: &Meta, response: Response) -> Result<AdaptorOutput, RelayError> {
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let accounting = StreamAccounting::new();
        let events = CozeEvents::new(&meta.actual_model);
        let frames = normalize_events(SseStream::new(response.bytes_stream()), events, accounting.clone());
        if meta.is_stream {
            return Ok(AdaptorOutput::Stream(RelayStream { frames, accounting }));
        }

        drain(frames).await?;
        let tally = accounting.snapshot();
        let id = format!(
            "chatcmpl-{}",
            tally.execute_id.clone().or_else(|| tally.conversation_id.clone()).unwrap_or_default()
        );
        Ok(AdaptorOutput::Complete(Completion {
            response: ChatResponse::assistant(id, meta.actual_model.clone(), tally.text),
            vendor_usage: tally.usage,
            vendor_conversation_id: tally.conversation_id,
        }))
    }

    fn model_list(&self) -> Vec<String> {
        Vec::new()
    }

    fn channel_name(&self) -> &'static str {
        "coze"
    }
}

/// Coze chat events re-framed as OpenAI chunks
struct CozeEvents {
    model: String,
    id: String,
}

impl CozeEvents {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            id: String::new(),
        }
    }
}

impl VendorEvents for CozeEvents {
    fn allow_list(&self) -> &'static AllowList {
        &CHAT_EVENTS
    }

    fn event_name(&self, sse: &SseEvent, _payload: &Value) -> Option<String> {
        sse.event.clone()
    }

    fn render(&mut self, kind: EventKind, _sse: &SseEvent, payload: &Value, tally: &StreamAccounting) -> Option<String> {
        if let Some(conversation) = payload.get("conversation_id").and_then(Value::as_str) {
            tally.set_conversation_id(conversation);
        }
        let chat_id = payload
            .get("chat_id")
            .or_else(|| (kind != EventKind::Content).then(|| payload.get("id")).flatten())
            .and_then(Value::as_str);
        if self.id.is_empty() {
            if let Some(chat_id) = chat_id {
                self.id = format!("chatcmpl-{}", chat_id);
                tally.update(|t| t.execute_id = Some(chat_id.to_string()));
            }
        }

        let chunk = match kind {
            EventKind::Start => {
                ChatCompletionChunk::delta(self.id.clone(), self.model.clone(), Some("assistant"), Some(String::new()), None)
            }
            EventKind::Content => {
                if payload.get("type").and_then(Value::as_str) != Some("answer") {
                    return None;
                }
                let content = payload.get("content").and_then(Value::as_str).unwrap_or_default();
                tally.push_text(content);
                ChatCompletionChunk::delta(self.id.clone(), self.model.clone(), None, Some(content.to_string()), None)
            }
            EventKind::Finish => {
                let usage = payload.get("usage").map(|u| {
                    let count = |name: &str| u.get(name).and_then(Value::as_u64).unwrap_or(0) as u32;
                    Usage::new(count("input_count"), count("output_count"))
                });
                if let Some(usage) = usage.filter(|u| !u.is_zero()) {
                    tally.set_usage(usage);
                }
                let mut chunk = ChatCompletionChunk::delta(self.id.clone(), self.model.clone(), None, None, Some("stop"));
                chunk.usage = usage;
                chunk
            }
            EventKind::Error => return None,
        };
        serde_json::to_string(&chunk).ok()
    }

    fn error(&self, payload: &Value) -> RelayError {
        let source = payload.get("last_error").unwrap_or(payload);
        let code = match source.get("code") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => "coze_error".to_string(),
        };
        RelayError::Vendor {
            code,
            message: source
                .get("msg")
                .or_else(|| source.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("coze chat failed")
                .to_string(),
        }
    }
}
