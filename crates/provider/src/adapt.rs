//! Cross-provider shape adaptation.
//!
//! Clients speaking the unified (OpenAI-style) chat request can be routed
//! to any provider; this module converts the request to the provider's
//! native JSON and the non-streaming response back. Native-shape
//! passthrough is the common case and never goes through here.

use serde_json::{Value, json};

use veil_core::error::VeilError;

pub const ANTHROPIC_DEFAULT_MAX_TOKENS: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    Ollama,
}

impl ProviderKind {
    /// Guess the wire shape from the provider name or base URL.
    /// Unknown providers default to the OpenAI shape.
    pub fn detect(name: &str, base_url: &str) -> Self {
        let haystack = format!("{} {}", name.to_lowercase(), base_url.to_lowercase());
        if haystack.contains("anthropic") || haystack.contains("claude") {
            Self::Anthropic
        } else if haystack.contains("gemini") || haystack.contains("googleapis") {
            Self::Gemini
        } else if haystack.contains("ollama") || haystack.contains(":11434") {
            Self::Ollama
        } else {
            Self::OpenAi
        }
    }

    /// Chat endpoint path for an adapted request.
    pub fn chat_path(&self, model: &str) -> String {
        match self {
            Self::OpenAi => "/v1/chat/completions".to_string(),
            Self::Anthropic => "/v1/messages".to_string(),
            Self::Gemini => format!("/v1beta/models/{model}:generateContent"),
            Self::Ollama => "/api/chat".to_string(),
        }
    }
}

/// Convert a unified chat request to the provider's native JSON.
pub fn adapt_request(unified: &Value, kind: ProviderKind, model_override: Option<&str>) -> Result<Value, VeilError> {
    let messages = unified
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| VeilError::BadRequest("missing messages field".into()))?;
    let model = model_override
        .map(str::to_string)
        .or_else(|| unified.get("model").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default();
    let max_tokens = unified.get("max_tokens").and_then(Value::as_u64);
    let temperature = unified.get("temperature").cloned();
    let stream = unified.get("stream").and_then(Value::as_bool).unwrap_or(false);

    match kind {
        ProviderKind::OpenAi => {
            let mut out = unified.clone();
            if !model.is_empty() {
                out["model"] = json!(model);
            }
            Ok(out)
        }
        ProviderKind::Anthropic => {
            // System turns move out of the array into a top-level field.
            let system_text = messages
                .iter()
                .filter(|m| m.get("role").and_then(Value::as_str) == Some("system"))
                .filter_map(message_text)
                .collect::<Vec<_>>()
                .join("\n\n");
            let rest: Vec<Value> = messages
                .iter()
                .filter(|m| m.get("role").and_then(Value::as_str) != Some("system"))
                .cloned()
                .collect();

            let mut out = json!({
                "model": model,
                "messages": rest,
                "max_tokens": max_tokens.unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS),
            });
            if !system_text.is_empty() {
                out["system"] = json!(system_text);
            }
            if let Some(temperature) = temperature {
                out["temperature"] = temperature;
            }
            if stream {
                out["stream"] = json!(true);
            }
            Ok(out)
        }
        ProviderKind::Gemini => {
            let contents: Vec<Value> = messages
                .iter()
                .filter_map(|m| {
                    let role = match m.get("role").and_then(Value::as_str) {
                        Some("assistant") => "model",
                        // Gemini has no system role on the wire.
                        Some("system") => "user",
                        Some(role) => role,
                        None => return None,
                    };
                    let text = message_text(m)?;
                    Some(json!({"role": role, "parts": [{"text": text}]}))
                })
                .collect();

            let mut generation = json!({});
            if let Some(max_tokens) = max_tokens {
                generation["maxOutputTokens"] = json!(max_tokens);
            }
            if let Some(temperature) = temperature {
                generation["temperature"] = temperature;
            }

            Ok(json!({"contents": contents, "generationConfig": generation}))
        }
        ProviderKind::Ollama => {
            let mut options = json!({});
            if let Some(max_tokens) = max_tokens {
                options["num_predict"] = json!(max_tokens);
            }
            if let Some(temperature) = temperature {
                options["temperature"] = temperature;
            }
            Ok(json!({
                "model": model,
                "messages": messages,
                "stream": stream,
                "options": options,
            }))
        }
    }
}

/// Pull the assistant text out of a native non-streaming response.
pub fn extract_text(response: &Value, kind: ProviderKind) -> Option<String> {
    match kind {
        ProviderKind::OpenAi => response
            .get("choices")?
            .get(0)?
            .get("message")?
            .get("content")?
            .as_str()
            .map(str::to_string),
        ProviderKind::Anthropic => {
            let blocks = response.get("content")?.as_array()?;
            let text: Vec<&str> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            (!text.is_empty()).then(|| text.join(""))
        }
        ProviderKind::Gemini => {
            let parts = response
                .get("candidates")?
                .get(0)?
                .get("content")?
                .get("parts")?
                .as_array()?;
            let text: Vec<&str> = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            (!text.is_empty()).then(|| text.join(""))
        }
        ProviderKind::Ollama => response
            .get("message")
            .and_then(|m| m.get("content"))
            .or_else(|| response.get("response"))
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Re-shape an adapted provider response into the unified (OpenAI) reply
/// the client expects.
pub fn adapt_response(response: &Value, kind: ProviderKind, model: &str) -> Result<Value, VeilError> {
    if kind == ProviderKind::OpenAi {
        return Ok(response.clone());
    }
    let text = extract_text(response, kind)
        .ok_or_else(|| VeilError::Upstream {
            status: 502,
            body: "upstream response has no assistant text".into(),
        })?;
    Ok(json!({
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop",
        }],
    }))
}

fn message_text(message: &Value) -> Option<String> {
    match message.get("content")? {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => {
            let text: Vec<&str> = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            (!text.is_empty()).then(|| text.join("\n"))
        }
        _ => None,
    }
}
