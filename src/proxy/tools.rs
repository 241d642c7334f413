// Time tool orchestration - 为询问时间的请求注入 get_current_time 工具
//
// probe (auto | required) -> forced probe (required) -> tool result -> final call

use chrono::Local;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashSet;
use uuid::Uuid;

use super::translator::UpstreamTarget;
use super::Provider;
use crate::api::upstream::UpstreamDispatcher;
use crate::config::TimeToolConfig;
use crate::error::Result;

pub const TIME_TOOL_NAME: &str = "get_current_time";

/// User messages injected by the client as context, not typed by the user.
const CONTEXT_MARKERS: [&str; 4] = ["[Context]", "<context", "[附件]", "[Attachment]"];

const TIME_KEYWORDS: &[&str] = &[
    // English
    "what time",
    "the time",
    "current time",
    "time is it",
    "time now",
    "what date",
    "the date",
    "today's date",
    "today",
    "tomorrow",
    "yesterday",
    "what day",
    "day of the week",
    "weekday",
    "right now",
    "this week",
    "next week",
    "last week",
    "this month",
    "this year",
    "how many days",
    "how long until",
    "clock",
    // 中文
    "几点",
    "时间",
    "日期",
    "今天",
    "明天",
    "昨天",
    "星期几",
    "周几",
    "礼拜几",
    "几号",
    "现在",
    "今年",
    "本周",
    "这周",
    "下周",
    "上周",
    "本月",
    "这个月",
    "多少天",
    "还有几天",
];

const EXCLUDED_KEYWORDS: &[&str] = &[
    "time complexity",
    "space complexity",
    "big-o",
    "big o",
    "timeout",
    "time out",
    "time series",
    "runtime",
    "run time",
    "compile time",
    "compile-time",
    "时间复杂度",
    "空间复杂度",
    "超时",
    "时间序列",
    "运行时",
    "编译时",
];

/// Decides whether a user message asks about the current date or time.
pub trait IntentClassifier: Send + Sync {
    fn is_time_query(&self, text: &str) -> bool;
}

/// Keyword lexicon matcher. Exclusions win over matches.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    include: Regex,
    exclude: Regex,
}

fn lexicon_regex(phrases: &[&str]) -> std::result::Result<Regex, regex::Error> {
    let alternatives: Vec<String> = phrases
        .iter()
        .map(|p| {
            // ASCII phrases match on word boundaries, CJK ones anywhere
            if p.is_ascii() {
                format!(r"\b{}\b", regex::escape(p))
            } else {
                regex::escape(p)
            }
        })
        .collect();
    Regex::new(&format!("(?i)(?:{})", alternatives.join("|")))
}

static DEFAULT_CLASSIFIER: Lazy<KeywordClassifier> = Lazy::new(|| {
    KeywordClassifier::new(TIME_KEYWORDS, EXCLUDED_KEYWORDS)
        .expect("built-in time lexicon is a valid regex")
});

impl KeywordClassifier {
    pub fn new(include: &[&str], exclude: &[&str]) -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            include: lexicon_regex(include)?,
            exclude: lexicon_regex(exclude)?,
        })
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        DEFAULT_CLASSIFIER.clone()
    }
}

impl IntentClassifier for KeywordClassifier {
    fn is_time_query(&self, text: &str) -> bool {
        !self.exclude.is_match(text) && self.include.is_match(text)
    }
}

fn message_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter_map(|p| match p {
                    Value::String(s) => Some(s.as_str()),
                    _ => p.get("text").and_then(Value::as_str),
                })
                .collect();
            (!texts.is_empty()).then(|| texts.join(" "))
        }
        _ => None,
    }
}

/// Text of the last user message that is not injected context.
pub fn last_user_text(payload: &Value) -> Option<String> {
    payload
        .get("messages")?
        .as_array()?
        .iter()
        .rev()
        .filter(|m| m.get("role").and_then(Value::as_str) == Some("user"))
        .filter_map(|m| message_text(m.get("content")?))
        .find(|text| {
            let trimmed = text.trim_start();
            !CONTEXT_MARKERS.iter().any(|marker| trimmed.starts_with(marker))
        })
}

pub fn time_tool_definition() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": TIME_TOOL_NAME,
            "description": "Get the current local date, time, weekday and timezone of the user's machine. Call this whenever the answer depends on the current date or time.",
            "parameters": {"type": "object", "properties": {}, "required": []}
        }
    })
}

/// Result handed back to the model for a `get_current_time` call.
pub fn current_time_result() -> Value {
    let now = Local::now();
    let offset = now.format("%:z").to_string();
    let timezone = match std::env::var("TZ") {
        Ok(name) if !name.trim().is_empty() => format!("{} (UTC{})", name.trim(), offset),
        _ => format!("UTC{}", offset),
    };
    json!({
        "datetime": now.to_rfc3339(),
        "date": now.format("%Y-%m-%d").to_string(),
        "time": now.format("%H:%M:%S").to_string(),
        "weekday": now.format("%A").to_string(),
        "timezone": timezone,
        "unix": now.timestamp()
    })
}

fn generate_tool_call_id() -> String {
    format!(
        "call_{}",
        Uuid::new_v4().simple().to_string().chars().take(8).collect::<String>()
    )
}

fn tool_name(tool: &Value) -> Option<&str> {
    tool.pointer("/function/name")
        .or_else(|| tool.get("name"))
        .and_then(Value::as_str)
}

/// First `get_current_time` call in a buffered response, if any.
fn find_time_call(response: &Value) -> Option<Value> {
    response
        .pointer("/choices/0/message/tool_calls")?
        .as_array()?
        .iter()
        .find(|call| tool_name(call) == Some(TIME_TOOL_NAME))
        .cloned()
}

/// Outcome of running the orchestrator for one request.
#[derive(Debug)]
pub enum ToolOutcome {
    /// Buffered result ready for the caller
    Completed(Value),
    /// Stream this payload (original request plus tool exchange) to the caller
    Stream(Value),
    /// Not handled; continue with the unmodified payload
    Skipped,
}

pub struct ToolOrchestrator {
    classifier: Box<dyn IntentClassifier>,
    providers: HashSet<Provider>,
    enabled: bool,
}

impl ToolOrchestrator {
    pub fn new(classifier: Box<dyn IntentClassifier>) -> Self {
        Self {
            classifier,
            providers: Provider::ALL
                .into_iter()
                .filter(|p| p.descriptor().supports_time_tool)
                .collect(),
            enabled: true,
        }
    }

    pub fn from_config(config: &TimeToolConfig) -> Self {
        let mut orchestrator = Self::new(Box::new(KeywordClassifier::default()));
        orchestrator.enabled = config.enabled;
        if !config.providers.is_empty() {
            orchestrator.providers = config
                .providers
                .iter()
                .filter_map(|id| {
                    let provider = Provider::resolve(id);
                    if provider.is_none() {
                        tracing::warn!(
                            "[TimeTool] Ignoring unknown provider in allow-list: {}",
                            id
                        );
                    }
                    provider
                })
                .collect();
        }
        orchestrator
    }

    pub fn applies_to(&self, provider: Provider) -> bool {
        self.enabled && self.providers.contains(&provider)
    }

    pub fn should_trigger(&self, payload: &Value) -> bool {
        match payload.get("tool_choice") {
            Some(Value::String(choice)) if choice == "none" => return false,
            Some(choice @ Value::Object(_)) => {
                if let Some(name) = choice.pointer("/function/name").and_then(Value::as_str) {
                    if name != TIME_TOOL_NAME {
                        return false;
                    }
                }
                if let Some(allowed) = choice
                    .pointer("/allowed_tools/tools")
                    .and_then(Value::as_array)
                {
                    if !allowed.iter().any(|t| tool_name(t) == Some(TIME_TOOL_NAME)) {
                        return false;
                    }
                }
            }
            _ => {}
        }

        last_user_text(payload)
            .map(|text| self.classifier.is_time_query(&text))
            .unwrap_or(false)
    }

    fn caller_requires_tools(payload: &Value) -> bool {
        match payload.get("tool_choice") {
            Some(Value::String(choice)) => choice == "required",
            Some(Value::Object(_)) => true,
            _ => false,
        }
    }

    fn probe_payload(payload: &Value, tool_choice: &str) -> Value {
        let mut probe = payload.clone();
        if let Some(obj) = probe.as_object_mut() {
            let mut tools = obj
                .get("tools")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if !tools.iter().any(|t| tool_name(t) == Some(TIME_TOOL_NAME)) {
                tools.push(time_tool_definition());
            }
            obj.insert("tools".into(), Value::Array(tools));
            obj.insert("tool_choice".into(), Value::String(tool_choice.to_string()));
            obj.remove("stream_options");
        }
        probe
    }

    /// Original payload with the assistant tool call and its result appended.
    fn final_payload(payload: &Value, probe_response: &Value, call: &Value) -> Value {
        let mut call = call.clone();
        let call_id = match call.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let id = generate_tool_call_id();
                call["id"] = Value::String(id.clone());
                id
            }
        };

        let assistant = json!({
            "role": "assistant",
            "content": probe_response
                .pointer("/choices/0/message/content")
                .cloned()
                .unwrap_or(Value::Null),
            "tool_calls": [call]
        });
        let tool_result = json!({
            "role": "tool",
            "tool_call_id": call_id,
            "name": TIME_TOOL_NAME,
            "content": current_time_result().to_string()
        });

        let mut extended = payload.clone();
        if let Some(messages) = extended.get_mut("messages").and_then(Value::as_array_mut) {
            messages.push(assistant);
            messages.push(tool_result);
        }
        extended
    }

    /// Run the probe sequence. Upstream failures in any phase are returned
    /// to the caller as-is.
    pub async fn run(
        &self,
        upstream: &UpstreamDispatcher,
        target: &UpstreamTarget,
        payload: &Value,
        stream: bool,
    ) -> Result<ToolOutcome> {
        if !self.applies_to(target.provider) || !self.should_trigger(payload) {
            return Ok(ToolOutcome::Skipped);
        }

        let first_choice = if Self::caller_requires_tools(payload) {
            "required"
        } else {
            "auto"
        };
        tracing::info!(
            "[TimeTool] Time intent detected for {}, probing with tool_choice={}",
            target.provider,
            first_choice
        );

        let probe = target.request(Self::probe_payload(payload, first_choice), false)?;
        let first = upstream.fetch_json(&target.label("probe"), &probe).await?;

        let mut answered = find_time_call(&first).map(|call| (first.clone(), call));
        if answered.is_none() && first_choice == "auto" {
            tracing::debug!("[TimeTool] No tool call on auto probe, forcing required");
            let forced = target.request(Self::probe_payload(payload, "required"), false)?;
            let second = upstream
                .fetch_json(&target.label("forced-probe"), &forced)
                .await?;
            answered = find_time_call(&second).map(|call| (second, call));
        }

        let Some((probe_response, call)) = answered else {
            tracing::info!("[TimeTool] Model did not call {}, falling back", TIME_TOOL_NAME);
            return Ok(if stream {
                ToolOutcome::Skipped
            } else {
                ToolOutcome::Completed(first)
            });
        };

        let extended = Self::final_payload(payload, &probe_response, &call);
        if stream {
            return Ok(ToolOutcome::Stream(extended));
        }
        let request = target.request(extended, false)?;
        let response = upstream.fetch_json(&target.label("final"), &request).await?;
        Ok(ToolOutcome::Completed(response))
    }
}

impl Default for ToolOrchestrator {
    fn default() -> Self {
        Self::new(Box::new(KeywordClassifier::default()))
    }
}
