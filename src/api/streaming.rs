// SSE streaming support - 上游字节流重新分帧并转发给客户端

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;

use super::gate::GatePermit;
use crate::proxy::thinking::{Filtered, StreamFilter};

/// One event assembled from upstream SSE lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub data: String,
    pub event: Option<String>,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

/// Incremental SSE parser. Bytes after the last newline stay buffered until
/// the next chunk completes the line.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
    event: Option<String>,
    id: Option<String>,
    retry: Option<u64>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every event completed by them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Upstream finished: treat any trailing partial line and unterminated
    /// event as complete.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches('\r');
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        if let Some(event) = self.dispatch() {
            events.push(event);
        }
        events
    }

    /// Upstream failed mid-stream: the trailing partial line is discarded and
    /// only data lines that were already complete are dispatched.
    pub fn abort(&mut self) -> Vec<SseEvent> {
        self.buffer.clear();
        self.dispatch().into_iter().collect()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data_lines.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.trim().parse() {
                    self.retry = Some(ms);
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let id = self.id.take();
        let retry = self.retry.take();
        if self.data_lines.is_empty() {
            return None;
        }
        Some(SseEvent {
            data: std::mem::take(&mut self.data_lines).join("\n"),
            event,
            id,
            retry,
        })
    }
}

/// Serialize a payload as one downstream frame.
pub fn encode_event(event_name: Option<&str>, data: &str) -> Bytes {
    let mut frame = String::with_capacity(data.len() + 16);
    if let Some(name) = event_name {
        frame.push_str("event: ");
        frame.push_str(name);
        frame.push('\n');
    }
    for line in data.split('\n') {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    Bytes::from(frame)
}

/// Synthesized events only carry a name when upstream names its events.
fn frame_name<'a>(upstream: Option<&'a str>, filtered: &Filtered) -> Option<&'a str> {
    upstream.map(|name| filtered.event.unwrap_or(name))
}

fn emit(filter: &mut Option<StreamFilter>, event: &SseEvent) -> Vec<Bytes> {
    let name = event.event.as_deref();
    let Some(filter) = filter.as_mut() else {
        return vec![encode_event(name, &event.data)];
    };

    let mut out = Vec::new();
    if event.data.trim() == "[DONE]" {
        out.extend(filter.flush());
    }
    out.extend(filter.filter(&event.data));
    out.iter()
        .map(|filtered| encode_event(frame_name(name, filtered), &filtered.data))
        .collect()
}

/// Re-frame an upstream SSE byte stream for the downstream client.
///
/// The gate permit travels with the stream and is released when it ends or
/// the client goes away. A read error after the first byte cannot be retried:
/// events already complete are emitted, a half-received line is discarded and
/// the stream closes.
pub fn relay<S, E>(
    upstream: S,
    mut filter: Option<StreamFilter>,
    permit: GatePermit,
    label: String,
) -> impl Stream<Item = Result<Bytes, Infallible>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display,
{
    async_stream::stream! {
        let _permit = permit;
        let mut parser = SseParser::new();
        let mut upstream = Box::pin(upstream);
        let mut forwarded = 0usize;
        let mut truncated = false;

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in parser.feed(&bytes) {
                        for frame in emit(&mut filter, &event) {
                            forwarded += 1;
                            yield Ok(frame);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(
                        "[{}] phase=stream-read upstream stream failed after {} events: {}",
                        label, forwarded, e
                    );
                    truncated = true;
                    break;
                }
            }
        }

        let tail = if truncated { parser.abort() } else { parser.finish() };
        for event in tail {
            for frame in emit(&mut filter, &event) {
                yield Ok(frame);
            }
        }
        if let Some(filter) = filter.as_mut() {
            for rest in filter.flush() {
                yield Ok(encode_event(rest.event, &rest.data));
            }
        }
        tracing::debug!("[{}] stream relay finished ({} events)", label, forwarded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::gate::ConnectionGate;
    use serde_json::{json, Value};

    const SAMPLE: &str = "event: message\nid: 7\ndata: {\"a\":1}\n\n: keep-alive\n\ndata: line one\ndata: line two\n\nretry: 1500\ndata: 多字节\r\n\r\ndata: [DONE]\n\n";

    fn parse_all(chunks: &[&[u8]]) -> Vec<SseEvent> {
        let mut parser = SseParser::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(parser.feed(chunk));
        }
        events.extend(parser.finish());
        events
    }

    #[test]
    fn test_parse_fields() {
        let events = parse_all(&[SAMPLE.as_bytes()]);
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[1].data, "line one\nline two");
        assert_eq!(events[2].retry, Some(1500));
        assert_eq!(events[2].data, "多字节");
        assert_eq!(events[3].data, "[DONE]");
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let bytes = SAMPLE.as_bytes();
        let whole = parse_all(&[bytes]);
        for split in 0..=bytes.len() {
            let (a, b) = bytes.split_at(split);
            assert_eq!(parse_all(&[a, b]), whole, "split at {}", split);
        }
        let singles: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(parse_all(&singles), whole);
    }

    #[test]
    fn test_unterminated_event_flushed_on_finish() {
        let events = parse_all(&[b"data: tail"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn test_value_without_space_kept() {
        let events = parse_all(&[b"data:x\ndata:  two\n\n"]);
        assert_eq!(events[0].data, "x\n two");
    }

    #[test]
    fn test_encode_event_multiline() {
        assert_eq!(&encode_event(None, "a\nb")[..], b"data: a\ndata: b\n\n");
        assert_eq!(&encode_event(Some("ping"), "{}")[..], b"event: ping\ndata: {}\n\n");
    }

    async fn collect(stream: impl Stream<Item = Result<Bytes, Infallible>>) -> String {
        let frames: Vec<_> = stream.collect().await;
        frames
            .into_iter()
            .map(|f| String::from_utf8(f.unwrap().to_vec()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_relay_filters_and_releases_permit() {
        let gate = ConnectionGate::new(1);
        let permit = gate.acquire().await.unwrap();

        let reasoning = json!({"choices": [{"index": 0, "delta": {"reasoning_content": "hmm"}}]});
        let content = json!({"choices": [{"index": 0, "delta": {"content": "Hi"}}]});
        let body = format!("data: {}\n\ndata: {}\n\ndata: [DONE]\n\n", reasoning, content);
        let (first, second) = body.split_at(body.len() / 2);
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from(first.to_string())),
            Ok(Bytes::from(second.to_string())),
        ];

        let out = collect(relay(
            futures::stream::iter(chunks),
            Some(StreamFilter::new()),
            permit,
            "test".into(),
        ))
        .await;

        assert!(!out.contains("reasoning_content"));
        assert!(out.ends_with("data: [DONE]\n\n"));
        let first_payload = out.lines().next().unwrap().trim_start_matches("data: ");
        let parsed: Value = serde_json::from_str(first_payload).unwrap();
        assert_eq!(parsed["choices"][0]["delta"]["content"], "Hi");
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_relay_stops_on_read_error() {
        let gate = ConnectionGate::new(1);
        let permit = gate.acquire().await.unwrap();
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"data: one\n\ndata: par")),
            Err("connection reset".into()),
            Ok(Bytes::from_static(b"data: never\n\n")),
        ];

        let out = collect(relay(
            futures::stream::iter(chunks),
            None,
            permit,
            "test".into(),
        ))
        .await;
        assert_eq!(out, "data: one\n\n");
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_read_error_keeps_complete_data_lines() {
        let gate = ConnectionGate::new(1);
        let permit = gate.acquire().await.unwrap();
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(
                b"data: {\"a\":1}\n\ndata: {\"b\":2}\ndata: {\"choices\":[{\"del",
            )),
            Err("connection reset".into()),
        ];

        let out = collect(relay(
            futures::stream::iter(chunks),
            Some(StreamFilter::new()),
            permit,
            "test".into(),
        ))
        .await;
        assert_eq!(out, "data: {\"a\":1}\n\ndata: {\"b\":2}\n\n");
    }

    #[tokio::test]
    async fn test_anthropic_held_text_keeps_event_names() {
        let gate = ConnectionGate::new(1);
        let permit = gate.acquire().await.unwrap();
        let delta = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": "a <"}
        });
        let body = format!(
            "event: content_block_delta\ndata: {}\n\nevent: content_block_stop\ndata: {}\n\nevent: message_stop\ndata: {}\n\n",
            delta,
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "message_stop"})
        );
        let chunks: Vec<Result<Bytes, String>> = vec![Ok(Bytes::from(body))];

        let out = collect(relay(
            futures::stream::iter(chunks),
            Some(StreamFilter::new()),
            permit,
            "test".into(),
        ))
        .await;
        let names: Vec<&str> = out
            .lines()
            .filter_map(|line| line.strip_prefix("event: "))
            .collect();
        assert_eq!(
            names,
            [
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_stop"
            ]
        );
        assert!(out.ends_with("data: {\"type\":\"message_stop\"}\n\n"));
        assert!(!out.contains("chat.completion.chunk"));
    }
}
