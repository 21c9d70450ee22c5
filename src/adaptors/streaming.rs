use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use pin_project::pin_project;
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tracing::{debug, warn};

use super::error::RelayError;
use crate::models::Usage;

/// Frame written to clients when a stream completes
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Longest line accepted from upstream before it is discarded
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Boxed stream of already-framed SSE bytes
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Bytes, RelayError>> + Send>>;

pub fn data_frame(payload: &str) -> Bytes {
    Bytes::from(format!("data: {}\n\n", payload))
}

/// SSE event from provider
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// Format as SSE output for client
    pub fn to_sse_string(&self) -> String {
        let mut output = String::new();

        if let Some(ref event_type) = self.event {
            output.push_str(&format!("event: {}\n", event_type));
        }

        output.push_str(&format!("data: {}\n\n", self.data));
        output
    }

    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Line-oriented SSE reader.
///
/// Each `data:` line is dispatched as its own event carrying the most recent
/// `event:` name; the name is cleared by a blank line. `data:` with or without
/// the trailing space is accepted.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    current_event: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.handle_line(&line[..line.len() - 1], &mut events);
        }

        if self.pending.len() > MAX_LINE_BYTES {
            warn!("⚠️ Dropping oversized SSE line ({} bytes)", self.pending.len());
            self.pending.clear();
        }
        events
    }

    /// Flush a trailing line that was not newline-terminated
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.handle_line(&line, &mut events);
        }
        events
    }

    fn handle_line(&mut self, raw: &[u8], events: &mut Vec<SseEvent>) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches('\r');

        if line.is_empty() {
            self.current_event = None;
        } else if let Some(data) = line.strip_prefix("data:") {
            let data = data.strip_prefix(' ').unwrap_or(data);
            events.push(SseEvent {
                event: self.current_event.clone(),
                data: data.to_string(),
            });
        } else if let Some(event) = line.strip_prefix("event:") {
            self.current_event = Some(event.trim().to_string());
        }
        // Ignore other fields like "id:", "retry:" and ":" comments
    }
}

/// Parse SSE events from a complete body
pub fn parse_sse_events(input: &str) -> Vec<SseEvent> {
    let mut decoder = SseDecoder::new();
    let mut events = decoder.push(input.as_bytes());
    events.extend(decoder.finish());
    events
}

/// Stream adapter that converts a response byte stream into SSE events
#[pin_project]
pub struct SseStream<S> {
    #[pin]
    inner: S,
    decoder: SseDecoder,
    queue: VecDeque<SseEvent>,
    done: bool,
}

impl<S> SseStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            inner: stream,
            decoder: SseDecoder::new(),
            queue: VecDeque::new(),
            done: false,
        }
    }
}

impl<S, E> Stream for SseStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<RelayError>,
{
    type Item = Result<SseEvent, RelayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(event) = this.queue.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if *this.done {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => this.queue.extend(this.decoder.push(&bytes)),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e.into()))),
                Poll::Ready(None) => {
                    this.queue.extend(this.decoder.finish());
                    *this.done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Vendor event classes the relay understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    Content,
    Finish,
    Error,
}

/// Declarative set of accepted vendor event names
#[derive(Debug)]
pub struct AllowList {
    entries: &'static [(&'static str, EventKind)],
}

impl AllowList {
    pub const fn new(entries: &'static [(&'static str, EventKind)]) -> Self {
        Self { entries }
    }

    pub fn classify(&self, name: &str) -> Option<EventKind> {
        self.entries.iter().find(|(n, _)| *n == name).map(|(_, kind)| *kind)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(n, _)| *n)
    }
}

/// Shared record of what a stream produced, read after it ends
#[derive(Debug, Clone, Default)]
pub struct StreamTally {
    pub text: String,
    pub usage: Option<Usage>,
    pub conversation_id: Option<String>,
    pub execute_id: Option<String>,
    pub outputs: Option<serde_json::Map<String, Value>>,
    pub finished: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StreamAccounting {
    inner: Arc<Mutex<StreamTally>>,
}

impl StreamAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StreamTally> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push_text(&self, text: &str) {
        self.lock().text.push_str(text);
    }

    pub fn set_usage(&self, usage: Usage) {
        self.lock().usage = Some(usage);
    }

    pub fn set_conversation_id(&self, id: impl Into<String>) {
        let id = id.into();
        if !id.is_empty() {
            self.lock().conversation_id = Some(id);
        }
    }

    pub fn update<F: FnOnce(&mut StreamTally)>(&self, f: F) {
        f(&mut self.lock());
    }

    pub fn snapshot(&self) -> StreamTally {
        self.lock().clone()
    }
}

/// Per-vendor knowledge plugged into [`normalize_events`]
pub trait VendorEvents: Send + 'static {
    fn allow_list(&self) -> &'static AllowList;

    /// SSE `event:` field, else the payload's `event` or `type` member
    fn event_name(&self, sse: &SseEvent, payload: &Value) -> Option<String> {
        sse.event
            .clone()
            .or_else(|| payload.get("event").and_then(Value::as_str).map(str::to_string))
            .or_else(|| payload.get("type").and_then(Value::as_str).map(str::to_string))
    }

    /// Frame payload for an accepted non-error event; `None` drops the event
    fn render(&mut self, kind: EventKind, sse: &SseEvent, payload: &Value, tally: &StreamAccounting) -> Option<String>;

    /// Typed error for an accepted error event
    fn error(&self, payload: &Value) -> RelayError;

    /// Whether this accepted event ends the stream
    fn is_terminal(&self, kind: EventKind, _payload: &Value) -> bool {
        kind == EventKind::Finish
    }
}

struct NormalizeState<V> {
    events: Pin<Box<dyn Stream<Item = Result<SseEvent, RelayError>> + Send>>,
    vendor: V,
    tally: StreamAccounting,
    sentinel_pending: bool,
    closed: bool,
}

/// Filter and re-frame a vendor event stream.
///
/// One frame per accepted event; events outside the allow-list and frames
/// that are not JSON are dropped. A terminal event, `[DONE]` or EOF ends the
/// stream with [`DONE_FRAME`]; an accepted error event ends it with `Err`.
pub fn normalize_events<S, V>(events: S, vendor: V, tally: StreamAccounting) -> FrameStream
where
    S: Stream<Item = Result<SseEvent, RelayError>> + Send + 'static,
    V: VendorEvents,
{
    let state = NormalizeState {
        events: Box::pin(events),
        vendor,
        tally,
        sentinel_pending: false,
        closed: false,
    };

    let frames = stream::unfold(state, |mut state| async move {
        if state.closed {
            return None;
        }
        if state.sentinel_pending {
            state.closed = true;
            return Some((Ok(Bytes::from_static(DONE_FRAME.as_bytes())), state));
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

            let payload: Value = match serde_json::from_str(&event.data) {
                Ok(payload) => payload,
                Err(e) => {
                    debug!("Skipping malformed frame: {} ({})", e, event.data);
                    continue;
                }
            };

            let Some(name) = state.vendor.event_name(&event, &payload) else {
                continue;
            };
            let Some(kind) = state.vendor.allow_list().classify(&name) else {
                debug!("Dropping unlisted event '{}'", name);
                continue;
            };

            if kind == EventKind::Error {
                let err = state.vendor.error(&payload);
                warn!("❌ Vendor error event '{}': {}", name, err);
                state.closed = true;
                return Some((Err(err), state));
            }

            let frame = state.vendor.render(kind, &event, &payload, &state.tally);
            let terminal = state.vendor.is_terminal(kind, &payload);
            if terminal {
                state.tally.update(|t| t.finished = true);
            }

            match (frame, terminal) {
                (Some(frame), true) => {
                    state.sentinel_pending = true;
                    return Some((Ok(data_frame(&frame)), state));
                }
                (Some(frame), false) => return Some((Ok(data_frame(&frame)), state)),
                (None, true) => {
                    state.closed = true;
                    return Some((Ok(Bytes::from_static(DONE_FRAME.as_bytes())), state));
                }
                (None, false) => continue,
            }
        }
    });

    Box::pin(frames)
}

/// Drive a frame stream to completion, discarding frames.
///
/// Used by adaptors that always stream upstream but must answer a
/// non-streaming caller; the tally carries the aggregate.
pub async fn drain(mut frames: FrameStream) -> Result<(), RelayError> {
    while let Some(frame) = frames.next().await {
        frame?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_sse_single_event() {
        let input = "event: message\ndata: {\"test\":\"value\"}\n\n";
        let events = parse_sse_events(input);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[0].data, "{\"test\":\"value\"}");
    }

    #[test]
    fn test_parse_sse_multiple_events() {
        let input = "event: start\ndata: {\"a\":1}\n\nevent: delta\ndata: {\"b\":2}\n\n";
        let events = parse_sse_events(input);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("start"));
        assert_eq!(events[1].event.as_deref(), Some("delta"));
    }

    #[test]
    fn test_parse_sse_no_event_type() {
        let input = "data: plain data\n\n";
        let events = parse_sse_events(input);

        assert_eq!(events.len(), 1);
        assert!(events[0].event.is_none());
        assert_eq!(events[0].data, "plain data");
    }

    #[test]
    fn test_parse_sse_without_space_and_crlf() {
        let input = "event:reply\r\ndata:{\"x\":1}\r\n\r\ndata: [DONE]";
        let events = parse_sse_events(input);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("reply"));
        assert_eq!(events[0].data, "{\"x\":1}");
        assert!(events[1].event.is_none());
        assert!(events[1].is_done());
    }

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"te").is_empty());
        let events = decoder.push(b"xt\":\"\xe4\xbd\xa0\"}\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"text\":\"你\"}");
    }

    #[tokio::test]
    async fn test_sse_stream_yields_every_event_in_chunk() {
        let chunks: Vec<Result<Bytes, RelayError>> = vec![
            Ok(Bytes::from_static(b"data: 1\n\ndata: 2\n\n")),
            Ok(Bytes::from_static(b"data: 3")),
        ];
        let events: Vec<_> = SseStream::new(stream::iter(chunks)).collect().await;
        let data: Vec<String> = events.into_iter().map(|e| e.unwrap().data).collect();

        assert_eq!(data, vec!["1", "2", "3"]);
    }

    static TEST_EVENTS: AllowList = AllowList::new(&[
        ("started", EventKind::Start),
        ("chunk", EventKind::Content),
        ("finished", EventKind::Finish),
        ("failed", EventKind::Error),
    ]);

    struct Echo;

    impl VendorEvents for Echo {
        fn allow_list(&self) -> &'static AllowList {
            &TEST_EVENTS
        }

        fn render(&mut self, _kind: EventKind, sse: &SseEvent, payload: &Value, tally: &StreamAccounting) -> Option<String> {
            if let Some(text) = payload.get("text").and_then(Value::as_str) {
                tally.push_text(text);
            }
            Some(sse.data.clone())
        }

        fn error(&self, payload: &Value) -> RelayError {
            RelayError::Vendor {
                code: "failed".to_string(),
                message: payload.to_string(),
            }
        }
    }

    fn events(lines: &[Value]) -> impl Stream<Item = Result<SseEvent, RelayError>> + Send + 'static {
        let events: Vec<Result<SseEvent, RelayError>> = lines
            .iter()
            .map(|v| Ok(SseEvent { event: None, data: v.to_string() }))
            .collect();
        stream::iter(events)
    }

    async fn collect(frames: FrameStream) -> Vec<Result<String, String>> {
        frames
            .map(|f| f.map(|b| String::from_utf8(b.to_vec()).unwrap()).map_err(|e| e.to_string()))
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_unlisted_events_produce_no_frames() {
        let tally = StreamAccounting::new();
        let frames = normalize_events(
            events(&[
                json!({"event": "started"}),
                json!({"event": "ping"}),
                json!({"event": "chunk", "text": "a"}),
                json!({"event": "node_started"}),
                json!({"event": "chunk", "text": "b"}),
                json!({"event": "finished"}),
            ]),
            Echo,
            tally.clone(),
        );
        let out = collect(frames).await;

        assert_eq!(out.len(), 5);
        assert!(out[..4].iter().all(|f| f.as_ref().unwrap().starts_with("data: {")));
        assert_eq!(out[4].as_deref(), Ok(DONE_FRAME));
        let tally = tally.snapshot();
        assert_eq!(tally.text, "ab");
        assert!(tally.finished);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_skipped() {
        let raw: Vec<Result<SseEvent, RelayError>> = vec![
            Ok(SseEvent { event: None, data: "{not json".to_string() }),
            Ok(SseEvent { event: None, data: json!({"event": "chunk", "text": "x"}).to_string() }),
            Ok(SseEvent { event: None, data: "[DONE]".to_string() }),
            Ok(SseEvent { event: None, data: json!({"event": "chunk", "text": "late"}).to_string() }),
        ];
        let out = collect(normalize_events(stream::iter(raw), Echo, StreamAccounting::new())).await;

        assert_eq!(out.len(), 2);
        assert_eq!(out[1].as_deref(), Ok(DONE_FRAME));
    }

    #[tokio::test]
    async fn test_error_event_aborts_after_flushed_frames() {
        let frames = normalize_events(
            events(&[
                json!({"event": "chunk", "text": "partial"}),
                json!({"event": "failed", "message": "boom"}),
                json!({"event": "chunk", "text": "never"}),
            ]),
            Echo,
            StreamAccounting::new(),
        );
        let out = collect(frames).await;

        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        assert!(out[1].as_ref().unwrap_err().contains("boom"));
    }

    #[tokio::test]
    async fn test_eof_without_terminal_still_sends_sentinel() {
        let out = collect(normalize_events(
            events(&[json!({"event": "chunk", "text": "a"})]),
            Echo,
            StreamAccounting::new(),
        ))
        .await;

        assert_eq!(out.len(), 2);
        assert_eq!(out[1].as_deref(), Ok(DONE_FRAME));
    }

    #[tokio::test]
    async fn test_drain_surfaces_error() {
        let frames = normalize_events(
            events(&[json!({"event": "failed"})]),
            Echo,
            StreamAccounting::new(),
        );
        assert!(matches!(drain(frames).await, Err(RelayError::Vendor { .. })));
    }
}
