//! Usage extraction from upstream payloads and the fallback estimator used
//! when the upstream omits usage.

use serde::Serialize;
use serde_json::Value;
use tiktoken_rs::CoreBPE;

const TOKENS_PER_MESSAGE: u64 = 3;
const TOKENS_PER_ROLE: u64 = 1;
const REPLY_PRIMING_TOKENS: u64 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "prompt_tokens": self.prompt_tokens,
            "completion_tokens": self.completion_tokens,
            "total_tokens": self.total(),
        })
    }
}

/// Reads the `usage` block of a chat completion object or stream chunk.
/// Accepts `input_tokens`/`output_tokens` naming as well.
pub fn parse_usage(obj: &Value) -> Option<Usage> {
    let usage = obj.get("usage")?.as_object()?;
    let prompt = usage
        .get("prompt_tokens")
        .or_else(|| usage.get("input_tokens"))
        .and_then(Value::as_u64);
    let completion = usage
        .get("completion_tokens")
        .or_else(|| usage.get("output_tokens"))
        .and_then(Value::as_u64);
    if prompt.is_none() && completion.is_none() {
        return None;
    }
    Some(Usage {
        prompt_tokens: prompt.unwrap_or(0),
        completion_tokens: completion.unwrap_or(0),
    })
}

/// Concatenated assistant text of a non-streaming chat completion.
pub fn completion_text(obj: &Value) -> String {
    let mut out = String::new();
    let Some(choices) = obj.get("choices").and_then(Value::as_array) else {
        return out;
    };
    for choice in choices {
        if let Some(message) = choice.get("message") {
            push_content(&mut out, message.get("content"));
            push_tool_call_text(&mut out, message.get("tool_calls"));
        }
    }
    out
}

/// Assistant text carried by one streamed chat chunk.
pub fn delta_text(chunk: &Value) -> String {
    let mut out = String::new();
    let Some(choices) = chunk.get("choices").and_then(Value::as_array) else {
        return out;
    };
    for choice in choices {
        if let Some(delta) = choice.get("delta") {
            push_content(&mut out, delta.get("content"));
            push_tool_call_text(&mut out, delta.get("tool_calls"));
        }
    }
    out
}

fn push_content(out: &mut String, content: Option<&Value>) {
    match content {
        Some(Value::String(s)) => out.push_str(s),
        Some(Value::Array(parts)) => {
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    out.push_str(text);
                }
            }
        }
        _ => {}
    }
}

fn push_tool_call_text(out: &mut String, tool_calls: Option<&Value>) {
    let Some(calls) = tool_calls.and_then(Value::as_array) else {
        return;
    };
    for call in calls {
        if let Some(function) = call.get("function") {
            if let Some(name) = function.get("name").and_then(Value::as_str) {
                out.push_str(name);
            }
            if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                out.push_str(args);
            }
        }
    }
}

fn bpe() -> &'static CoreBPE {
    tiktoken_rs::cl100k_base_singleton()
}

/// Loads the tokenizer outside the request path.
pub fn preload_tokenizer() {
    let _ = bpe();
}

pub fn estimate_text_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    bpe().encode_with_special_tokens(text).len() as u64
}

/// Prompt-side estimate for a chat request body: message text plus the
/// fixed per-message framing overhead.
pub fn estimate_prompt_tokens(body: &Value) -> u64 {
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return 0;
    };
    let mut total = 0u64;
    for message in messages {
        total += TOKENS_PER_MESSAGE + TOKENS_PER_ROLE;
        let mut text = String::new();
        push_content(&mut text, message.get("content"));
        push_tool_call_text(&mut text, message.get("tool_calls"));
        total += estimate_text_tokens(&text);
    }
    if let Some(tools) = body.get("tools") {
        total += estimate_text_tokens(&tools.to_string());
    }
    total + REPLY_PRIMING_TOKENS
}

/// Pre-check cost: prompt estimate plus the client's completion cap, if any,
/// bounded by `max_completion_allowance` (0 adds nothing).
pub fn estimate_request_cost(body: &Value, max_completion_allowance: u64) -> u64 {
    let prompt = estimate_prompt_tokens(body);
    if max_completion_allowance == 0 {
        return prompt;
    }
    let requested = body
        .get("max_completion_tokens")
        .or_else(|| body.get("max_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(max_completion_allowance);
    prompt.saturating_add(requested.min(max_completion_allowance))
}
