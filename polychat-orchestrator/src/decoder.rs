//! # Stream protocol decoder
//!
//! Turns the chunked `chat/completions` SSE body into normalized
//! [`StreamEvent`]s. Providers behind the same nominal API disagree on where
//! they put reasoning text, images and usage, so every frame is inspected in a
//! fixed order:
//!
//! 1. delta text
//! 2. reasoning / thinking (delta fields latch off the cumulative fields)
//! 3. images and attachments (delta, choice, message, content arrays)
//! 4. usage and request id
//!
//! The decoder is synchronous and keeps no state beyond the current partial
//! line and the per-stream latches.

use serde_json::Value;
use shared::models::Attachment;
use std::collections::HashSet;
use tracing::{debug, trace};

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// Usage as reported by the provider. Every field is optional because
/// providers omit different parts.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageReport {
    /// Input tokens.
    pub prompt_tokens: Option<u64>,
    /// Output tokens.
    pub completion_tokens: Option<u64>,
    /// Inline cost in USD, when the provider reports one.
    pub cost: Option<f64>,
}

impl UsageReport {
    fn is_empty(&self) -> bool {
        self.prompt_tokens.is_none() && self.completion_tokens.is_none() && self.cost.is_none()
    }
}

/// A normalized decoder event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Answer text.
    Token(String),
    /// Reasoning text.
    ReasoningToken(String),
    /// Thinking text.
    ThinkingToken(String),
    /// Aggregated images and attachments, plus the full text for
    /// non-streaming responses.
    Message {
        /// Full answer text, empty while streaming.
        text: String,
        /// Image URLs and data URIs, deduplicated per stream.
        image_urls: Vec<String>,
        /// File attachments.
        attachments: Vec<Attachment>,
    },
    /// Token counts and inline cost.
    Usage(UsageReport),
    /// Provider generation id, emitted once.
    RequestId(String),
    /// End of the stream.
    Done,
    /// A provider error or an undecodable frame.
    Error {
        /// Human-readable description.
        message: String,
        /// Whether the stream must stop.
        fatal: bool,
    },
}

/// Incremental decoder for one completion stream.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already searched for a newline.
    scanned: usize,
    reasoning_from_delta: bool,
    thinking_from_delta: bool,
    cumulative_reasoning_len: usize,
    cumulative_thinking_len: usize,
    seen_images: HashSet<String>,
    pending_images: Vec<String>,
    pending_attachments: Vec<Attachment>,
    request_id_sent: bool,
    done: bool,
}

impl StreamDecoder {
    /// A decoder for a fresh stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the `[DONE]` sentinel or end of input has been processed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feeds one chunk of the body and returns the events of every line it
    /// completed. A trailing partial line, including a split UTF-8 sequence,
    /// stays buffered until the next chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut line_start = 0;
        let mut search_from = self.scanned;

        while let Some(offset) = self.buffer[search_from..].iter().position(|b| *b == b'\n') {
            let line_end = search_from + offset;
            let line = String::from_utf8_lossy(&self.buffer[line_start..line_end]).into_owned();
            self.decode_line(&line, &mut events);
            line_start = line_end + 1;
            search_from = line_start;
        }

        self.buffer.drain(..line_start);
        self.scanned = self.buffer.len();
        events
    }

    /// Signals end of input: decodes any unterminated last line, then flushes
    /// pending images and emits `Done` if the sentinel never arrived.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.scanned = 0;
            let line = String::from_utf8_lossy(&rest);
            self.decode_line(&line, &mut events);
        }

        if !self.done {
            self.flush_images(String::new(), &mut events);
            self.done = true;
            events.push(StreamEvent::Done);
        }

        events
    }

    fn decode_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') || self.done {
            return;
        }

        let data = if let Some(rest) = line.strip_prefix(DATA_PREFIX) {
            rest.trim_start()
        } else if line.starts_with('{') {
            line
        } else {
            // `event:`, `id:` and `retry:` fields carry nothing we use.
            trace!(line, "ignoring non-data SSE field");
            return;
        };

        if data == DONE_SENTINEL {
            self.flush_images(String::new(), events);
            self.done = true;
            events.push(StreamEvent::Done);
            return;
        }

        match serde_json::from_str::<Value>(data) {
            Ok(frame) => self.decode_frame(&frame, events),
            Err(err) => {
                debug!(error = %err, "skipping malformed stream frame");
                events.push(StreamEvent::Error {
                    message: format!("malformed stream frame: {err}"),
                    fatal: false,
                });
            }
        }
    }

    fn decode_frame(&mut self, frame: &Value, events: &mut Vec<StreamEvent>) {
        if let Some(error) = frame.get("error").filter(|e| !e.is_null()) {
            events.push(StreamEvent::Error {
                message: provider_error_message(error),
                fatal: true,
            });
            return;
        }

        for choice in choices(frame) {
            let delta = choice.get("delta");
            let message = choice.get("message");

            if let Some(delta) = delta {
                self.decode_delta_content(delta, events);
            }
            self.decode_reasoning(choice, delta, message, events);
            self.collect_images(choice, delta, message);

            if choice
                .get("finish_reason")
                .is_some_and(|reason| !reason.is_null())
            {
                self.flush_images(String::new(), events);
            }
        }

        self.decode_usage(frame, events);
    }

    fn decode_delta_content(&mut self, delta: &Value, events: &mut Vec<StreamEvent>) {
        match delta.get("content") {
            Some(Value::String(text)) if !text.is_empty() => {
                events.push(StreamEvent::Token(text.clone()));
            }
            Some(Value::Array(parts)) => {
                for part in parts {
                    if let Some(text) = text_part(part).filter(|t| !t.is_empty()) {
                        events.push(StreamEvent::Token(text.to_string()));
                    }
                }
            }
            _ => {}
        }
    }

    fn decode_reasoning(
        &mut self,
        choice: &Value,
        delta: Option<&Value>,
        message: Option<&Value>,
        events: &mut Vec<StreamEvent>,
    ) {
        let delta_reasoning = delta.and_then(|d| str_field(d, &["reasoning", "reasoning_content"]));
        if let Some(text) = delta_reasoning {
            self.reasoning_from_delta = true;
            if !text.is_empty() {
                events.push(StreamEvent::ReasoningToken(text.to_string()));
            }
        } else if !self.reasoning_from_delta {
            let cumulative = str_field(choice, &["reasoning"])
                .or_else(|| message.and_then(|m| str_field(m, &["reasoning", "reasoning_content"])));
            if let Some(suffix) = cumulative_suffix(cumulative, &mut self.cumulative_reasoning_len) {
                events.push(StreamEvent::ReasoningToken(suffix));
            }
        }

        let delta_thinking = delta.and_then(|d| str_field(d, &["thinking"]));
        if let Some(text) = delta_thinking {
            self.thinking_from_delta = true;
            if !text.is_empty() {
                events.push(StreamEvent::ThinkingToken(text.to_string()));
            }
        } else if !self.thinking_from_delta {
            let cumulative = str_field(choice, &["thinking"])
                .or_else(|| message.and_then(|m| str_field(m, &["thinking"])));
            if let Some(suffix) = cumulative_suffix(cumulative, &mut self.cumulative_thinking_len) {
                events.push(StreamEvent::ThinkingToken(suffix));
            }
        }
    }

    fn collect_images(&mut self, choice: &Value, delta: Option<&Value>, message: Option<&Value>) {
        let mut urls = Vec::new();
        let mut attachments = Vec::new();

        for source in [delta, Some(choice), message].into_iter().flatten() {
            if let Some(Value::Array(images)) = source.get("images") {
                urls.extend(images.iter().filter_map(image_url_of));
            }
            if let Some(Value::Array(parts)) = source.get("content") {
                urls.extend(
                    parts
                        .iter()
                        .filter(|part| text_part(part).is_none())
                        .filter_map(image_url_of),
                );
            }
            if let Some(Value::Array(items)) = source.get("attachments") {
                attachments.extend(items.iter().filter_map(attachment_from));
            }
        }

        for url in urls {
            if self.seen_images.insert(url.clone()) {
                self.pending_images.push(url);
            }
        }
        for attachment in attachments {
            let key = attachment
                .url
                .clone()
                .or_else(|| attachment.base64.clone())
                .unwrap_or_default();
            if self.seen_images.insert(key) {
                self.pending_attachments.push(attachment);
            }
        }
    }

    fn flush_images(&mut self, text: String, events: &mut Vec<StreamEvent>) {
        if self.pending_images.is_empty() && self.pending_attachments.is_empty() && text.is_empty() {
            return;
        }
        events.push(StreamEvent::Message {
            text,
            image_urls: std::mem::take(&mut self.pending_images),
            attachments: std::mem::take(&mut self.pending_attachments),
        });
    }

    fn decode_usage(&mut self, frame: &Value, events: &mut Vec<StreamEvent>) {
        if let Some(usage) = frame.get("usage").and_then(usage_report) {
            events.push(StreamEvent::Usage(usage));
        }

        if !self.request_id_sent && let Some(id) = frame.get("id").and_then(Value::as_str).filter(|id| !id.is_empty()) {
            self.request_id_sent = true;
            events.push(StreamEvent::RequestId(id.to_string()));
        }
    }

    /// Decodes a complete non-streaming response body.
    ///
    /// Emits `Token`, an optional `Message` with images, `Usage`,
    /// `RequestId`, reasoning and thinking, then `Done`.
    #[must_use]
    pub fn decode_response(body: &Value) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            events.push(StreamEvent::Error {
                message: provider_error_message(error),
                fatal: true,
            });
            return events;
        }

        let mut decoder = Self::new();
        let choice = choices(body).next();
        let message = choice.and_then(|c| c.get("message"));

        let text = match message.and_then(|m| m.get("content")) {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Array(parts)) => parts.iter().filter_map(text_part).collect(),
            _ => String::new(),
        };
        if !text.is_empty() {
            events.push(StreamEvent::Token(text.clone()));
        }

        if let Some(choice) = choice {
            decoder.collect_images(choice, None, message);
        }
        if !decoder.pending_images.is_empty() || !decoder.pending_attachments.is_empty() {
            decoder.flush_images(text, &mut events);
        }

        decoder.decode_usage(body, &mut events);

        let reasoning = message.and_then(|m| str_field(m, &["reasoning", "reasoning_content"]));
        if let Some(reasoning) = reasoning.filter(|r| !r.is_empty()) {
            events.push(StreamEvent::ReasoningToken(reasoning.to_string()));
        }
        if let Some(thinking) = message
            .and_then(|m| str_field(m, &["thinking"]))
            .filter(|t| !t.is_empty())
        {
            events.push(StreamEvent::ThinkingToken(thinking.to_string()));
        }

        events.push(StreamEvent::Done);
        events
    }
}

fn choices(frame: &Value) -> impl Iterator<Item = &Value> {
    frame
        .get("choices")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| value.get(*key).and_then(Value::as_str))
}

/// Returns the part of a cumulative field not emitted yet. A cumulative value
/// that does not extend what was already emitted is ignored.
fn cumulative_suffix(cumulative: Option<&str>, emitted: &mut usize) -> Option<String> {
    let cumulative = cumulative?;
    let suffix = cumulative.get(*emitted..).filter(|s| !s.is_empty())?;
    let suffix = suffix.to_string();
    *emitted = cumulative.len();
    Some(suffix)
}

fn text_part(part: &Value) -> Option<&str> {
    match part.get("type").and_then(Value::as_str) {
        Some("text" | "output_text") => part.get("text").and_then(Value::as_str),
        _ => None,
    }
}

fn image_url_of(value: &Value) -> Option<String> {
    match value {
        Value::String(url) if !url.is_empty() => Some(url.clone()),
        Value::Object(obj) => {
            let nested = obj.get("image_url").and_then(|inner| {
                inner
                    .as_str()
                    .or_else(|| inner.get("url").and_then(Value::as_str))
            });
            if let Some(url) = nested.or_else(|| obj.get("url").and_then(Value::as_str)) {
                return Some(url.to_string()).filter(|u| !u.is_empty());
            }
            obj.get("b64_json")
                .and_then(Value::as_str)
                .map(|b64| format!("data:image/png;base64,{b64}"))
        }
        _ => None,
    }
}

fn attachment_from(value: &Value) -> Option<Attachment> {
    let field = |keys: &[&str]| str_field(value, keys).map(str::to_string);
    let attachment = Attachment {
        name: field(&["name", "filename"]),
        url: field(&["url"]),
        mime_type: field(&["mime_type", "mimeType", "content_type"]),
        base64: field(&["base64", "data"]),
    };
    (attachment.url.is_some() || attachment.base64.is_some()).then_some(attachment)
}

fn usage_report(usage: &Value) -> Option<UsageReport> {
    let report = UsageReport {
        prompt_tokens: usage.get("prompt_tokens").and_then(Value::as_u64),
        completion_tokens: usage.get("completion_tokens").and_then(Value::as_u64),
        cost: usage
            .get("cost")
            .or_else(|| usage.get("total_cost"))
            .and_then(Value::as_f64),
    };
    (!report.is_empty()).then_some(report)
}

fn provider_error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .map_or_else(|| error.to_string(), str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: &Value) -> String {
        format!("data: {value}\n\n")
    }

    fn tokens(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Token(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_tokens_and_done() {
        let mut decoder = StreamDecoder::new();
        let mut body = String::new();
        body.push_str(": OPENROUTER PROCESSING\n\n");
        body.push_str(&frame(&json!({"id": "gen-1", "choices": [{"delta": {"content": "Hel"}}]})));
        body.push_str(&frame(&json!({"id": "gen-1", "choices": [{"delta": {"content": "lo"}}]})));
        body.push_str("data: [DONE]\n\n");

        let events = decoder.feed(body.as_bytes());

        assert_eq!(tokens(&events), "Hello");
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, StreamEvent::RequestId(_)))
                .count(),
            1
        );
        assert_eq!(events.last(), Some(&StreamEvent::Done));
        assert!(decoder.is_done());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_partial_lines_and_split_utf8() {
        let mut decoder = StreamDecoder::new();
        let line = frame(&json!({"choices": [{"delta": {"content": "héllo"}}]}));
        let bytes = line.as_bytes();
        let split = line.find('é').unwrap() + 1;

        assert!(decoder.feed(&bytes[..split]).is_empty());
        let events = decoder.feed(&bytes[split..]);

        assert_eq!(events, vec![StreamEvent::Token("héllo".into())]);
    }

    #[test]
    fn test_long_line_in_small_chunks_scans_each_byte_once() {
        let mut decoder = StreamDecoder::new();
        let content = "x".repeat(200_000);
        let line = frame(&json!({"choices": [{"delta": {"content": &content}}]}));
        let bytes = line.as_bytes();
        let (head, tail) = bytes.split_at(bytes.len() - 2);

        for chunk in head.chunks(7) {
            assert!(decoder.feed(chunk).is_empty());
            assert_eq!(decoder.scanned, decoder.buffer.len());
        }
        let events = decoder.feed(tail);

        assert_eq!(events, vec![StreamEvent::Token(content)]);
        assert!(decoder.buffer.is_empty());
        assert_eq!(decoder.scanned, 0);
    }

    #[test]
    fn test_malformed_frame_is_not_fatal() {
        let mut decoder = StreamDecoder::new();
        let mut body = String::from("data: {not json\n");
        body.push_str(&frame(&json!({"choices": [{"delta": {"content": "ok"}}]})));

        let events = decoder.feed(body.as_bytes());

        assert!(matches!(events[0], StreamEvent::Error { fatal: false, .. }));
        assert_eq!(events[1], StreamEvent::Token("ok".into()));
    }

    #[test]
    fn test_provider_error_is_fatal() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed(frame(&json!({"error": {"message": "overloaded", "code": 529}})).as_bytes());

        assert_eq!(
            events,
            vec![StreamEvent::Error {
                message: "overloaded".into(),
                fatal: true
            }]
        );
    }

    #[test]
    fn test_delta_reasoning_latches_off_cumulative() {
        let mut decoder = StreamDecoder::new();
        let mut body = frame(&json!({"choices": [{"delta": {"reasoning": "Think"}, "reasoning": "Think"}]}));
        body.push_str(&frame(&json!({"choices": [{"delta": {}, "reasoning": "Think more"}]})));

        let events = decoder.feed(body.as_bytes());

        assert_eq!(events, vec![StreamEvent::ReasoningToken("Think".into())]);
    }

    #[test]
    fn test_cumulative_reasoning_emits_suffixes() {
        let mut decoder = StreamDecoder::new();
        let mut body = frame(&json!({"choices": [{"delta": {}, "message": {"thinking": "a"}}]}));
        body.push_str(&frame(&json!({"choices": [{"delta": {}, "message": {"thinking": "abc"}}]})));

        let events = decoder.feed(body.as_bytes());

        assert_eq!(
            events,
            vec![
                StreamEvent::ThinkingToken("a".into()),
                StreamEvent::ThinkingToken("bc".into())
            ]
        );
    }

    #[test]
    fn test_images_deduped_and_flushed_on_finish_reason() {
        let mut decoder = StreamDecoder::new();
        let image = json!({"type": "image_url", "image_url": {"url": "https://img/1.png"}});
        let mut body = frame(&json!({"choices": [{"delta": {"images": [image.clone()]}}]}));
        body.push_str(&frame(&json!({"choices": [{"delta": {"images": [image]}, "message": {"images": ["https://img/2.png"]}}]})));
        body.push_str(&frame(&json!({"choices": [{"delta": {}, "finish_reason": "stop"}]})));

        let events = decoder.feed(body.as_bytes());

        assert_eq!(
            events,
            vec![StreamEvent::Message {
                text: String::new(),
                image_urls: vec!["https://img/1.png".into(), "https://img/2.png".into()],
                attachments: vec![],
            }]
        );
    }

    #[test]
    fn test_pending_images_flush_at_end_of_input() {
        let mut decoder = StreamDecoder::new();
        let body = frame(&json!({"choices": [{"delta": {"content": [
            {"type": "text", "text": "here"},
            {"type": "image_url", "image_url": "data:image/png;base64,AAAA"}
        ]}}]}));

        let mut events = decoder.feed(body.as_bytes());
        events.extend(decoder.finish());

        assert_eq!(events[0], StreamEvent::Token("here".into()));
        assert!(matches!(
            &events[1],
            StreamEvent::Message { image_urls, .. } if image_urls == &vec!["data:image/png;base64,AAAA".to_string()]
        ));
        assert_eq!(events[2], StreamEvent::Done);
    }

    #[test]
    fn test_usage_and_attachments() {
        let mut decoder = StreamDecoder::new();
        let body = frame(&json!({
            "id": "gen-9",
            "choices": [{"delta": {"attachments": [{"name": "a.png", "mimeType": "image/png", "data": "QUJD"}]}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "cost": 0.0012}
        }));

        let events = decoder.feed(body.as_bytes());

        assert!(matches!(&events[0], StreamEvent::Message { attachments, .. } if attachments[0].mime_type.as_deref() == Some("image/png")));
        assert_eq!(
            events[1],
            StreamEvent::Usage(UsageReport {
                prompt_tokens: Some(10),
                completion_tokens: Some(5),
                cost: Some(0.0012)
            })
        );
        assert_eq!(events[2], StreamEvent::RequestId("gen-9".into()));
    }

    #[test]
    fn test_decode_response_order() {
        let body = json!({
            "id": "gen-2",
            "choices": [{"message": {
                "content": "answer",
                "reasoning": "because",
                "images": [{"image_url": {"url": "https://img/a.png"}}]
            }}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 4}
        });

        let events = StreamDecoder::decode_response(&body);

        assert_eq!(events[0], StreamEvent::Token("answer".into()));
        assert!(matches!(&events[1], StreamEvent::Message { text, image_urls, .. } if text == "answer" && image_urls.len() == 1));
        assert!(matches!(events[2], StreamEvent::Usage(_)));
        assert_eq!(events[3], StreamEvent::RequestId("gen-2".into()));
        assert_eq!(events[4], StreamEvent::ReasoningToken("because".into()));
        assert_eq!(events[5], StreamEvent::Done);
    }
}
