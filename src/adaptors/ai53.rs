//! 53AI bot chat API.
//!
//! Bots are addressed with a `Bot-Id` header derived from the model name
//! (`bot-<id>`). Image parts of the last message are uploaded once per
//! channel and model and referenced by the vendor file id.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::ACCEPT;
use reqwest::multipart::Form;
use reqwest::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::error::RelayError;
use super::streaming::{normalize_events, AllowList, EventKind, SseEvent, SseStream, StreamAccounting, VendorEvents};
use super::{
    do_request_helper, error_from_response, resolve_base_url, strip_model_prefix, Adaptor, AdaptorContext,
    AdaptorOutput, Completion, Meta, RelayStream,
};
use crate::bridge::{file_part, RemoteFile, Uploader};
use crate::models::{ChatCompletionChunk, ChatRequest, ChatResponse, FileRefKind, Usage};
use crate::store::UploadFile;

const MODEL_LIST: &[&str] = &["53ai-bot"];

pub(crate) const TRANSFER_METHOD_LOCAL_FILE: &str = "local_file";

static BOT_EVENTS: AllowList = AllowList::new(&[
    ("message", EventKind::Content),
    ("agent_message", EventKind::Content),
    ("message_end", EventKind::Finish),
    ("error", EventKind::Error),
]);

/// Base URL without a trailing `/v3`, which every path re-adds
pub(crate) fn ai53_base_url(meta: &Meta) -> Result<String, RelayError> {
    let base = resolve_base_url(meta.base_url.as_deref(), None, "53AI")?;
    Ok(base.trim_end_matches("/v3").to_string())
}

pub(crate) fn bot_id(model: &str) -> &str {
    strip_model_prefix(model, &["workflow-", "bot-"])
}

/// File reference in a 53AI request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Ai53File {
    #[serde(rename = "type")]
    pub kind: String,
    pub transfer_method: String,
    pub upload_file_id: String,
    pub url: String,
}

impl Ai53File {
    pub fn local(kind: impl Into<String>, upload_file_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            transfer_method: TRANSFER_METHOD_LOCAL_FILE.to_string(),
            upload_file_id: upload_file_id.into(),
            url: String::new(),
        }
    }
}

/// Multipart upload to `/v3/files/upload`
#[derive(Clone)]
pub(crate) struct Ai53Uploader {
    pub client: reqwest::Client,
}

#[async_trait]
impl Uploader for Ai53Uploader {
    async fn upload(&self, meta: &Meta, file: &UploadFile, bytes: Bytes) -> Result<RemoteFile, RelayError> {
        let url = format!("{}/v3/files/upload", ai53_base_url(meta)?);
        let form = Form::new()
            .text("user", meta.user_id.clone())
            .part("file", file_part(file, bytes)?);

        let response = self
            .client
            .post(&url)
            .bearer_auth(meta.api_key())
            .header("Bot-Id", bot_id(&meta.actual_model))
            .multipart(form)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 && status != 201 {
            return Err(error_from_response(response).await);
        }

        let value: Value = response.json().await?;
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RelayError::Parse(format!("53AI upload response has no id: {}", value)))?;
        Ok(RemoteFile {
            id: id.to_string(),
            api_response: value.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatMessagesRequest {
    inputs: Map<String, Value>,
    query: String,
    response_mode: &'static str,
    conversation_id: String,
    user: String,
    files: Vec<Ai53File>,
}

#[derive(Debug, Deserialize)]
struct BlockResponse {
    #[serde(default)]
    answer: String,
    #[serde(default)]
    conversation_id: String,
    #[serde(default)]
    metadata: Option<BlockMetadata>,
}

#[derive(Debug, Deserialize)]
struct BlockMetadata {
    #[serde(default)]
    usage: Option<Usage>,
}

pub struct Ai53Adaptor {
    ctx: AdaptorContext,
}

impl Ai53Adaptor {
    pub fn new(ctx: AdaptorContext) -> Self {
        Self { ctx }
    }

    fn uploader(&self) -> Ai53Uploader {
        Ai53Uploader {
            client: self.ctx.client.clone(),
        }
    }
}

#[async_trait]
impl Adaptor for Ai53Adaptor {
    fn request_url(&self, meta: &Meta) -> Result<String, RelayError> {
        Ok(format!("{}/v3/chat-messages", ai53_base_url(meta)?))
    }

    fn setup_request_header(&self, request: RequestBuilder, meta: &Meta) -> RequestBuilder {
        let accept = if meta.is_stream { "text/event-stream" } else { "application/json" };
        request
            .bearer_auth(meta.api_key())
            .header("Bot-Id", strip_model_prefix(&meta.actual_model, &["bot-"]))
            .header(ACCEPT, accept)
    }

    async fn convert_request(&self, meta: &Meta, request: &ChatRequest) -> Result<Value, RelayError> {
        let last = request
            .last_message()
            .ok_or_else(|| RelayError::Validation("messages must not be empty".to_string()))?;

        let mapping_model = format!("bot-{}", strip_model_prefix(&meta.actual_model, &["bot-"]));
        let uploader = self.uploader();
        let mut files = Vec::new();
        for file_ref in last.file_refs() {
            if file_ref.kind != FileRefKind::Image {
                warn!("53AI bots only accept images, skipping file {}", file_ref.file_id);
                continue;
            }
            match self.ctx.bridge.bridge(&uploader, meta, file_ref.file_id, &mapping_model).await {
                Ok(mapping) => files.push(Ai53File::local("image", mapping.channel_file_id)),
                Err(e) => warn!("Skipping file {}: {}", file_ref.file_id, e),
            }
        }

        let body = ChatMessagesRequest {
            inputs: Map::new(),
            query: last.first_text(),
            response_mode: if meta.is_stream { "streaming" } else { "blocking" },
            conversation_id: meta.conversation_id.clone().unwrap_or_default(),
            user: meta.user_id.clone(),
            files,
        };
        Ok(serde_json::to_value(body)?)
    }

    async fn do_request(&self, meta: &Meta, body: Value) -> Result<Response, RelayError> {
        do_request_helper(self, &self.ctx.client, meta, &body).await
    }

    async fn do_response(&self, meta: &Meta, response: Response) -> Result<AdaptorOutput, RelayError> {
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        if meta.is_stream {
            let accounting = StreamAccounting::new();
            let frames = normalize_events(
                SseStream::new(response.bytes_stream()),
                BotEvents::new(&meta.actual_model),
                accounting.clone(),
            );
            return Ok(AdaptorOutput::Stream(RelayStream { frames, accounting }));
        }

        let block: BlockResponse = serde_json::from_slice(&response.bytes().await?)?;
        debug!("53AI answered conversation {}", block.conversation_id);
        let response = ChatResponse::assistant(
            format!("chatcmpl-{}", block.conversation_id),
            meta.actual_model.clone(),
            block.answer,
        );
        Ok(AdaptorOutput::Complete(Completion {
            response,
            vendor_usage: block.metadata.and_then(|m| m.usage).filter(|u| !u.is_zero()),
            vendor_conversation_id: Some(block.conversation_id).filter(|id| !id.is_empty()),
        }))
    }

    fn model_list(&self) -> Vec<String> {
        MODEL_LIST.iter().map(|m| m.to_string()).collect()
    }

    fn channel_name(&self) -> &'static str {
        "53AI"
    }
}

/// Re-frames bot events as OpenAI chunks
struct BotEvents {
    model: String,
    id: Option<String>,
    role_sent: bool,
}

impl BotEvents {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            id: None,
            role_sent: false,
        }
    }

    fn chunk_id(&mut self, payload: &Value) -> String {
        if self.id.is_none() {
            let conversation = payload
                .get("conversation_id")
                .or_else(|| payload.get("message_id"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            self.id = Some(format!("chatcmpl-{}", conversation));
        }
        self.id.clone().unwrap_or_default()
    }
}

impl VendorEvents for BotEvents {
    fn allow_list(&self) -> &'static AllowList {
        &BOT_EVENTS
    }

    fn render(&mut self, kind: EventKind, _sse: &SseEvent, payload: &Value, tally: &StreamAccounting) -> Option<String> {
        if let Some(conversation) = payload.get("conversation_id").and_then(Value::as_str) {
            tally.set_conversation_id(conversation);
        }
        let id = self.chunk_id(payload);

        let chunk = match kind {
            EventKind::Content => {
                let answer = payload.get("answer").and_then(Value::as_str).unwrap_or_default();
                tally.push_text(answer);
                let role = if self.role_sent { None } else { Some("assistant") };
                self.role_sent = true;
                ChatCompletionChunk::delta(id, self.model.clone(), role, Some(answer.to_string()), None)
            }
            EventKind::Finish => {
                let usage = payload
                    .pointer("/metadata/usage")
                    .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok())
                    .filter(|u| !u.is_zero());
                if let Some(usage) = usage {
                    tally.set_usage(usage);
                }
                let mut chunk = ChatCompletionChunk::delta(id, self.model.clone(), None, None, Some("stop"));
                chunk.usage = usage;
                chunk
            }
            EventKind::Start | EventKind::Error => return None,
        };
        serde_json::to_string(&chunk).ok()
    }

    fn error(&self, payload: &Value) -> RelayError {
        RelayError::Vendor {
            code: payload
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("53ai_error")
                .to_string(),
            message: payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("53AI reported an error")
                .to_string(),
        }
    }
}
