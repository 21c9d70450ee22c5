use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::{RequestBuilder, Response};
use serde_json::{json, Value};
use std::pin::Pin;
use tracing::debug;

use super::error::RelayError;
use super::streaming::{data_frame, FrameStream, SseEvent, SseStream, StreamAccounting, DONE_FRAME};
use super::{
    do_request_helper, error_from_response, resolve_base_url, Adaptor, AdaptorContext, AdaptorOutput, Completion,
    Meta, RelayStream,
};
use crate::models::{ChatRequest, ChatResponse, Usage};

/// Default base URL for OpenAI-compatible API
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const MODEL_LIST: &[&str] = &["gpt-4o", "gpt-4o-mini", "gpt-4-turbo", "gpt-3.5-turbo", "o1-mini"];

/// OpenAI-compatible chat completions, relayed almost verbatim
pub struct OpenAiAdaptor {
    ctx: AdaptorContext,
}

impl OpenAiAdaptor {
    pub fn new(ctx: AdaptorContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Adaptor for OpenAiAdaptor {
    fn request_url(&self, meta: &Meta) -> Result<String, RelayError> {
        let base = resolve_base_url(meta.base_url.as_deref(), Some(DEFAULT_BASE_URL), "openai")?;
        Ok(format!("{}/chat/completions", base))
    }

    fn setup_request_header(&self, request: RequestBuilder, meta: &Meta) -> RequestBuilder {
        let accept = if meta.is_stream { "text/event-stream" } else { "application/json" };
        request.bearer_auth(meta.api_key()).header(ACCEPT, accept)
    }

    async fn convert_request(&self, meta: &Meta, request: &ChatRequest) -> Result<Value, RelayError> {
        let mut body = serde_json::to_value(request)?;
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".to_string(), json!(meta.actual_model));
            obj.insert("stream".to_string(), json!(meta.is_stream));
            obj.remove("parameters");
        }
        Ok(body)
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
            let frames = pass_through(SseStream::new(response.bytes_stream()), accounting.clone());
            return Ok(AdaptorOutput::Stream(RelayStream { frames, accounting }));
        }

        let body = response.bytes().await?;
        parse_completion(&body).map(AdaptorOutput::Complete)
    }

    fn model_list(&self) -> Vec<String> {
        MODEL_LIST.iter().map(|m| m.to_string()).collect()
    }

    fn channel_name(&self) -> &'static str {
        "openai"
    }
}

fn parse_completion(body: &[u8]) -> Result<Completion, RelayError> {
    let value: Value = serde_json::from_slice(body)?;

    if let Some(kind) = value.pointer("/error/type").and_then(Value::as_str).filter(|t| !t.is_empty()) {
        let message = value
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Err(RelayError::Vendor {
            code: kind.to_string(),
            message,
        });
    }

    let response: ChatResponse = serde_json::from_value(value)?;
    // Zero usage means the vendor did not count; the relay counts instead
    let vendor_usage = (!response.usage.is_zero()).then_some(response.usage);
    Ok(Completion {
        response,
        vendor_usage,
        vendor_conversation_id: None,
    })
}

struct PassThrough {
    events: Pin<Box<dyn Stream<Item = Result<SseEvent, RelayError>> + Send>>,
    tally: StreamAccounting,
    closed: bool,
}

/// Forward vendor chunks unchanged, dropping empty keep-alive chunks.
///
/// Frames that do not parse are forwarded as-is; text and usage are read
/// from the ones that do. A missing `[DONE]` is appended at EOF.
fn pass_through<S>(events: S, tally: StreamAccounting) -> FrameStream
where
    S: Stream<Item = Result<SseEvent, RelayError>> + Send + 'static,
{
    let state = PassThrough {
        events: Box::pin(events),
        tally,
        closed: false,
    };

    let frames = stream::unfold(state, |mut state| async move {
        if state.closed {
            return None;
        }

        loop {
            let event = match state.events.next().await {
                None => {
                    state.closed = true;
                    return Some((Ok(Bytes::from_static(DONE_FRAME.as_bytes())), state));
                }
                Some(Err(e)) => {
                    state.closed = true;
                    return Some((Err(e), state));
                }
                Some(Ok(event)) => event,
            };

            if event.is_done() {
                state.tally.update(|t| t.finished = true);
                state.closed = true;
                return Some((Ok(Bytes::from_static(DONE_FRAME.as_bytes())), state));
            }

            let chunk: Value = match serde_json::from_str(&event.data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!("Forwarding unparsable chunk: {}", e);
                    return Some((Ok(data_frame(&event.data)), state));
                }
            };

            let choices = chunk.get("choices").and_then(Value::as_array);
            let usage = chunk.get("usage").filter(|u| !u.is_null());
            if choices.map_or(true, |c| c.is_empty()) && usage.is_none() {
                continue;
            }

            for choice in choices.into_iter().flatten() {
                if let Some(text) = choice.pointer("/delta/content").and_then(Value::as_str) {
                    state.tally.push_text(text);
                }
            }
            if let Some(usage) = usage.and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok()) {
                state.tally.set_usage(usage);
            }

            return Some((Ok(data_frame(&event.data)), state));
        }
    });

    Box::pin(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptors::test_support::{collect_frames, context, meta, request};
    use crate::store::VendorType;

    #[tokio::test]
    async fn test_convert_request_overrides_model_and_drops_parameters() {
        let adaptor = OpenAiAdaptor::new(context());
        let mut m = meta(VendorType::OpenAi, "https://api.example.com/v1", "gpt-4o", true);
        m.actual_model = "gpt-4o-2024-08-06".to_string();
        let mut req = request("gpt-4o", "hi", true);
        req.parameters = Some(serde_json::Map::new());

        let body = adaptor.convert_request(&m, &req).await.unwrap();

        assert_eq!(body["model"], "gpt-4o-2024-08-06");
        assert_eq!(body["stream"], true);
        assert!(body.get("parameters").is_none());
        assert_eq!(
            adaptor.request_url(&m).unwrap(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn test_non_stream_response_with_usage() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "id": "chatcmpl-1",
                    "object": "chat.completion",
                    "created": 1,
                    "model": "gpt-4o",
                    "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}],
                    "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let adaptor = OpenAiAdaptor::new(context());
        let m = meta(VendorType::OpenAi, &server.url(), "gpt-4o", false);
        let body = adaptor.convert_request(&m, &request("gpt-4o", "hi", false)).await.unwrap();
        let response = adaptor.do_request(&m, body).await.unwrap();
        let AdaptorOutput::Complete(completion) = adaptor.do_response(&m, response).await.unwrap() else {
            panic!("expected complete output");
        };

        mock.assert_async().await;
        assert_eq!(completion.response.text(), "hello");
        assert_eq!(completion.vendor_usage, Some(Usage::new(5, 2)));
    }

    #[test]
    fn test_zero_usage_is_left_to_the_relay() {
        let body = json!({
            "id": "x",
            "choices": [{"message": {"content": "hi"}}],
            "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0}
        });
        let completion = parse_completion(body.to_string().as_bytes()).unwrap();
        assert!(completion.vendor_usage.is_none());
    }

    #[test]
    fn test_error_type_surfaces_as_vendor_error() {
        let body = json!({"error": {"type": "invalid_request_error", "message": "bad model"}});
        let err = parse_completion(body.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, RelayError::Vendor { ref code, .. } if code == "invalid_request_error"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_transport_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_body(r#"{"error":{"message":"slow down"}}"#)
            .create_async()
            .await;

        let adaptor = OpenAiAdaptor::new(context());
        let m = meta(VendorType::OpenAi, &server.url(), "gpt-4o", false);
        let response = adaptor.do_request(&m, json!({})).await.unwrap();
        let err = adaptor.do_response(&m, response).await.err().unwrap();

        assert!(matches!(err, RelayError::Transport { status: 429, ref body } if body == "slow down"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_stream_pass_through_filters_and_appends_done() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "data:{\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"id\":\"c1\",\"choices\":[]}\n\n",
            "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"id\":\"c1\",\"choices\":[],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2}}\n\n",
        );
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let adaptor = OpenAiAdaptor::new(context());
        let m = meta(VendorType::OpenAi, &server.url(), "gpt-4o", true);
        let response = adaptor.do_request(&m, json!({})).await.unwrap();
        let AdaptorOutput::Stream(stream) = adaptor.do_response(&m, response).await.unwrap() else {
            panic!("expected stream output");
        };
        let frames = collect_frames(stream.frames).await;

        assert_eq!(frames.len(), 4);
        assert!(frames[0].starts_with("data: {\"id\":\"c1\""));
        assert_eq!(frames[3], DONE_FRAME);
        let tally = stream.accounting.snapshot();
        assert_eq!(tally.text, "Hello");
        assert_eq!(tally.usage, Some(Usage::new(4, 2)));
    }

    #[tokio::test]
    async fn test_unparsable_chunk_is_forwarded() {
        let events: Vec<Result<SseEvent, RelayError>> = vec![
            Ok(SseEvent { event: None, data: "not json".to_string() }),
            Ok(SseEvent { event: None, data: "[DONE]".to_string() }),
        ];
        let frames = collect_frames(pass_through(stream::iter(events), StreamAccounting::new())).await;

        assert_eq!(frames, vec!["data: not json\n\n".to_string(), DONE_FRAME.to_string()]);
    }
}
