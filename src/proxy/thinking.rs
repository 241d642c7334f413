// Thinking filter - 移除未请求的推理内容
// Strips reasoning fields and inline <think> spans from buffered bodies and SSE events

use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};

/// (open, close) tag pairs treated as inline reasoning.
const THINK_TAGS: [(&str, &str); 2] = [("<thinking>", "</thinking>"), ("<think>", "</think>")];

/// Reasoning side channels used by OpenAI-compatible vendors.
const REASONING_FIELDS: [&str; 3] = ["reasoning_content", "reasoning_details", "reasoning"];

const ANTHROPIC_THINKING_BLOCKS: [&str; 2] = ["thinking", "redacted_thinking"];
const ANTHROPIC_THINKING_DELTAS: [&str; 2] = ["thinking_delta", "signature_delta"];

/// True when the caller explicitly asked the model to reason.
pub fn is_thinking_requested(payload: &Value) -> bool {
    fn effort_requested(effort: Option<&Value>) -> bool {
        match effort {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty() && !s.eq_ignore_ascii_case("none"),
            Some(_) => true,
        }
    }

    if effort_requested(payload.get("reasoning_effort"))
        || effort_requested(payload.pointer("/reasoning/effort"))
    {
        return true;
    }
    if payload.pointer("/reasoning/enabled").and_then(Value::as_bool) == Some(true)
        || payload.get("enable_thinking").and_then(Value::as_bool) == Some(true)
    {
        return true;
    }
    if payload.get("reasoning_split").and_then(Value::as_bool) == Some(true)
        || payload.pointer("/extra_body/reasoning_split").and_then(Value::as_bool) == Some(true)
    {
        return true;
    }
    if payload.pointer("/generationConfig/thinkingConfig/includeThoughts").and_then(Value::as_bool)
        == Some(true)
    {
        return true;
    }
    payload.pointer("/thinking/type").and_then(Value::as_str) == Some("enabled")
}

/// Incremental scanner removing `<think>…</think>` spans from text that may
/// arrive in arbitrary pieces. A partial `<thi` at the end of one piece is
/// held back until the next piece decides what it is.
#[derive(Debug, Default)]
pub struct TagScanner {
    close_tag: Option<&'static str>,
    pending: String,
}

enum OpenTag {
    Full {
        start: usize,
        open: &'static str,
        close: &'static str,
    },
    Partial {
        start: usize,
    },
    None,
}

fn find_open_tag(text: &str) -> OpenTag {
    for (start, _) in text.match_indices('<') {
        let candidate = &text[start..];
        for (open, close) in THINK_TAGS {
            if candidate.starts_with(open) {
                return OpenTag::Full { start, open, close };
            }
        }
        // Only the tail of the text can be an unfinished tag
        if THINK_TAGS
            .iter()
            .any(|(open, _)| candidate.len() < open.len() && open.starts_with(candidate))
        {
            return OpenTag::Partial { start };
        }
    }
    OpenTag::None
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`.
fn partial_suffix_len(text: &str, tag: &str) -> usize {
    let max = (tag.len() - 1).min(text.len());
    (1..=max)
        .rev()
        .find(|&k| {
            let at = text.len() - k;
            text.is_char_boundary(at) && tag.starts_with(&text[at..])
        })
        .unwrap_or(0)
}

impl TagScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next piece of text, returning what can be emitted now.
    pub fn feed(&mut self, content: &str) -> String {
        let mut buffer = std::mem::take(&mut self.pending);
        buffer.push_str(content);

        let mut out = String::new();
        let mut rest = buffer.as_str();
        loop {
            if let Some(close) = self.close_tag {
                if let Some(idx) = rest.find(close) {
                    rest = &rest[idx + close.len()..];
                    self.close_tag = None;
                    continue;
                }
                let keep = partial_suffix_len(rest, close);
                self.pending = rest[rest.len() - keep..].to_string();
                return out;
            }

            match find_open_tag(rest) {
                OpenTag::Full { start, open, close } => {
                    out.push_str(&rest[..start]);
                    rest = &rest[start + open.len()..];
                    self.close_tag = Some(close);
                }
                OpenTag::Partial { start } => {
                    out.push_str(&rest[..start]);
                    self.pending = rest[start..].to_string();
                    return out;
                }
                OpenTag::None => {
                    out.push_str(rest);
                    return out;
                }
            }
        }
    }

    /// End of input: held-back text outside a think span is released, an
    /// unterminated think span is dropped.
    pub fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        if self.close_tag.take().is_some() {
            String::new()
        } else {
            pending
        }
    }
}

/// One-shot strip of a complete string.
pub fn strip_think_tags(text: &str) -> String {
    let mut scanner = TagScanner::new();
    let mut out = scanner.feed(text);
    out.push_str(&scanner.finish());
    out
}

fn remove_reasoning_fields(obj: &mut Map<String, Value>) -> bool {
    let mut removed = false;
    for field in REASONING_FIELDS {
        removed |= obj.remove(field).is_some();
    }
    removed
}

/// Remove reasoning from a complete (non-streaming) response body.
pub fn strip_buffered(response: &mut Value) {
    if let Some(choices) = response.get_mut("choices").and_then(Value::as_array_mut) {
        for choice in choices {
            for field in ["message", "delta"] {
                if let Some(obj) = choice.get_mut(field).and_then(Value::as_object_mut) {
                    remove_reasoning_fields(obj);
                    if let Some(Value::String(content)) = obj.get_mut("content") {
                        *content = strip_think_tags(content);
                    }
                }
            }
        }
    }

    // Anthropic messages
    if let Some(blocks) = response.get_mut("content").and_then(Value::as_array_mut) {
        blocks.retain(|block| {
            let kind = block.get("type").and_then(Value::as_str).unwrap_or("");
            !ANTHROPIC_THINKING_BLOCKS.contains(&kind)
        });
        for block in blocks {
            if let Some(Value::String(text)) = block.get_mut("text") {
                *text = strip_think_tags(text);
            }
        }
    }

    // Gemini candidates
    if let Some(candidates) = response.get_mut("candidates").and_then(Value::as_array_mut) {
        for candidate in candidates {
            if let Some(parts) = candidate
                .pointer_mut("/content/parts")
                .and_then(Value::as_array_mut)
            {
                parts.retain(|part| part.get("thought").and_then(Value::as_bool) != Some(true));
                for part in parts {
                    if let Some(Value::String(text)) = part.get_mut("text") {
                        *text = strip_think_tags(text);
                    }
                }
            }
        }
    }
}

/// Vendor event shape seen on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Chat,
    Anthropic,
    Gemini,
}

/// One payload produced by [`StreamFilter`]. `event` is set on synthesized
/// events whose SSE event name differs from the upstream event they came with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filtered {
    pub data: String,
    pub event: Option<&'static str>,
}

impl Filtered {
    fn payload(data: String) -> Self {
        Self { data, event: None }
    }
}

/// Per-connection filter for SSE payloads. Scanner state is kept per choice
/// (or content block) so a tag split across two events is still removed.
/// Held-back text is released inside the event that closes its choice or
/// block, in the vendor's own shape.
#[derive(Debug, Default)]
pub struct StreamFilter {
    scanners: HashMap<u64, TagScanner>,
    thinking_blocks: HashSet<u64>,
    last_chunk: Option<Value>,
    shape: Option<Shape>,
}

/// What filtering did to one event.
struct Outcome {
    keep: bool,
    changed: bool,
}

fn anthropic_text_delta(index: u64, text: String) -> Filtered {
    Filtered {
        data: json!({
            "type": "content_block_delta",
            "index": index,
            "delta": {"type": "text_delta", "text": text}
        })
        .to_string(),
        event: Some("content_block_delta"),
    }
}

fn append_delta_content(choice: &mut Value, held: String) {
    let Some(choice) = choice.as_object_mut() else {
        return;
    };
    let Some(delta) = choice
        .entry("delta")
        .or_insert_with(|| json!({}))
        .as_object_mut()
    else {
        return;
    };
    match delta
        .entry("content")
        .or_insert_with(|| Value::String(String::new()))
    {
        Value::String(content) => content.push_str(&held),
        other => *other = Value::String(held),
    }
}

fn append_text_part(candidate: &mut Value, held: String) {
    let Some(candidate) = candidate.as_object_mut() else {
        return;
    };
    let Some(content) = candidate
        .entry("content")
        .or_insert_with(|| json!({"role": "model"}))
        .as_object_mut()
    else {
        return;
    };
    if let Some(parts) = content
        .entry("parts")
        .or_insert_with(|| json!([]))
        .as_array_mut()
    {
        parts.push(json!({ "text": held }));
    }
}

impl StreamFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite one upstream payload. Returns the payloads to forward in
    /// order; empty when the event should be dropped.
    pub fn filter(&mut self, data: &str) -> Vec<Filtered> {
        let trimmed = data.trim();
        if trimmed == "[DONE]" {
            return vec![Filtered::payload(data.to_string())];
        }
        let mut value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => return vec![Filtered::payload(data.to_string())],
        };

        let mut out = Vec::new();
        let outcome = if value.get("choices").is_some() {
            self.shape = Some(Shape::Chat);
            self.filter_chat_chunk(&mut value)
        } else if value.get("candidates").is_some() {
            self.shape = Some(Shape::Gemini);
            self.filter_gemini_chunk(&mut value)
        } else if value.get("type").and_then(Value::as_str).is_some() {
            self.shape = Some(Shape::Anthropic);
            self.filter_anthropic_event(&mut value, &mut out)
        } else {
            Outcome {
                keep: true,
                changed: false,
            }
        };

        match outcome {
            Outcome { keep: false, .. } => {}
            Outcome { changed: false, .. } => out.push(Filtered::payload(data.to_string())),
            Outcome { changed: true, .. } => out.push(Filtered::payload(value.to_string())),
        }
        out
    }

    /// End of stream: release text any scanner is still holding back, shaped
    /// like the events the stream has been carrying.
    pub fn flush(&mut self) -> Vec<Filtered> {
        let mut indexes: Vec<u64> = self.scanners.keys().copied().collect();
        indexes.sort_unstable();
        let held: Vec<(u64, String)> = indexes
            .into_iter()
            .map(|index| (index, self.finish_scanner(index)))
            .filter(|(_, text)| !text.is_empty())
            .collect();
        if held.is_empty() {
            return Vec::new();
        }

        match self.shape {
            Some(Shape::Anthropic) => held
                .into_iter()
                .map(|(index, text)| anthropic_text_delta(index, text))
                .collect(),
            Some(Shape::Gemini) => {
                let candidates: Vec<Value> = held
                    .into_iter()
                    .map(|(index, text)| {
                        json!({
                            "index": index,
                            "content": {"role": "model", "parts": [{"text": text}]}
                        })
                    })
                    .collect();
                vec![Filtered::payload(
                    json!({ "candidates": candidates }).to_string(),
                )]
            }
            Some(Shape::Chat) | None => {
                let choices: Vec<Value> = held
                    .into_iter()
                    .map(|(index, text)| {
                        json!({
                            "index": index,
                            "delta": {"content": text},
                            "finish_reason": Value::Null
                        })
                    })
                    .collect();
                let template = self.last_chunk.as_ref();
                let field = |name: &str| {
                    template
                        .and_then(|t| t.get(name))
                        .cloned()
                        .unwrap_or(Value::Null)
                };
                let chunk = json!({
                    "id": field("id"),
                    "object": "chat.completion.chunk",
                    "created": field("created"),
                    "model": field("model"),
                    "choices": choices
                });
                vec![Filtered::payload(chunk.to_string())]
            }
        }
    }

    fn scanner(&mut self, index: u64) -> &mut TagScanner {
        self.scanners.entry(index).or_default()
    }

    fn finish_scanner(&mut self, index: u64) -> String {
        self.scanners
            .remove(&index)
            .map(|mut scanner| scanner.finish())
            .unwrap_or_default()
    }

    fn filter_chat_chunk(&mut self, value: &mut Value) -> Outcome {
        self.last_chunk = Some(json!({
            "id": value.get("id").cloned().unwrap_or(Value::Null),
            "created": value.get("created").cloned().unwrap_or(Value::Null),
            "model": value.get("model").cloned().unwrap_or(Value::Null),
        }));

        let mut changed = false;
        let mut has_payload = value.get("usage").map(|u| !u.is_null()).unwrap_or(false);

        if let Some(choices) = value.get_mut("choices").and_then(Value::as_array_mut) {
            for (position, choice) in choices.iter_mut().enumerate() {
                let index = choice
                    .get("index")
                    .and_then(Value::as_u64)
                    .unwrap_or(position as u64);
                let finished = choice
                    .get("finish_reason")
                    .map(|f| !f.is_null())
                    .unwrap_or(false);
                has_payload |= finished;

                for field in ["delta", "message"] {
                    let Some(obj) = choice.get_mut(field).and_then(Value::as_object_mut) else {
                        continue;
                    };
                    changed |= remove_reasoning_fields(obj);

                    if let Some(Value::String(content)) = obj.get_mut("content") {
                        let filtered = self.scanner(index).feed(content);
                        if filtered != *content {
                            changed = true;
                            *content = filtered;
                        }
                        if !content.is_empty() {
                            has_payload = true;
                        }
                    }
                    for key in ["role", "tool_calls"] {
                        if obj.get(key).map(|v| !v.is_null()).unwrap_or(false) {
                            has_payload = true;
                        }
                    }
                }

                if finished {
                    let held = self.finish_scanner(index);
                    if !held.is_empty() {
                        append_delta_content(choice, held);
                        changed = true;
                    }
                }
            }
        }

        Outcome {
            keep: !changed || has_payload,
            changed,
        }
    }

    fn filter_anthropic_event(&mut self, value: &mut Value, before: &mut Vec<Filtered>) -> Outcome {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let index = value.get("index").and_then(Value::as_u64).unwrap_or(0);
        let unchanged = Outcome {
            keep: true,
            changed: false,
        };
        let dropped = Outcome {
            keep: false,
            changed: true,
        };

        match kind.as_str() {
            "content_block_start" => {
                let block_type = value
                    .pointer("/content_block/type")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if ANTHROPIC_THINKING_BLOCKS.contains(&block_type) {
                    self.thinking_blocks.insert(index);
                    return dropped;
                }
                unchanged
            }
            "content_block_delta" => {
                let delta_type = value
                    .pointer("/delta/type")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if self.thinking_blocks.contains(&index)
                    || ANTHROPIC_THINKING_DELTAS.contains(&delta_type)
                {
                    return dropped;
                }
                let Some(Value::String(text)) = value.pointer_mut("/delta/text") else {
                    return unchanged;
                };
                let filtered = self.scanner(index).feed(text);
                if filtered == *text {
                    return unchanged;
                }
                let keep = !filtered.is_empty();
                *text = filtered;
                Outcome {
                    keep,
                    changed: true,
                }
            }
            "content_block_stop" => {
                if self.thinking_blocks.remove(&index) {
                    return dropped;
                }
                let held = self.finish_scanner(index);
                if !held.is_empty() {
                    before.push(anthropic_text_delta(index, held));
                }
                unchanged
            }
            "message_stop" => {
                before.extend(self.flush());
                unchanged
            }
            _ => unchanged,
        }
    }

    fn filter_gemini_chunk(&mut self, value: &mut Value) -> Outcome {
        let mut changed = false;
        let mut has_payload = value.get("usageMetadata").is_some();

        if let Some(candidates) = value.get_mut("candidates").and_then(Value::as_array_mut) {
            for (position, candidate) in candidates.iter_mut().enumerate() {
                let index = candidate
                    .get("index")
                    .and_then(Value::as_u64)
                    .unwrap_or(position as u64);
                let finished = candidate.get("finishReason").is_some();
                has_payload |= finished;

                if let Some(parts) = candidate
                    .pointer_mut("/content/parts")
                    .and_then(Value::as_array_mut)
                {
                    let before = parts.len();
                    parts.retain(|part| part.get("thought").and_then(Value::as_bool) != Some(true));
                    changed |= parts.len() != before;

                    for part in parts.iter_mut() {
                        match part.get_mut("text") {
                            Some(Value::String(text)) => {
                                let filtered = self.scanners.entry(index).or_default().feed(text);
                                if filtered != *text {
                                    changed = true;
                                    *text = filtered;
                                }
                                if !text.is_empty() {
                                    has_payload = true;
                                }
                            }
                            _ => has_payload = true,
                        }
                    }
                }

                if finished {
                    let held = self.finish_scanner(index);
                    if !held.is_empty() {
                        append_text_part(candidate, held);
                        changed = true;
                    }
                }
            }
        }

        Outcome {
            keep: !changed || has_payload,
            changed,
        }
    }
}
