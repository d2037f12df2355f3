//! Output guardrail: per-session request rate, content policy, token cap.

use regex::Regex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);
const IDLE_REAP: Duration = Duration::from_secs(5 * 60);
const TRUNCATION_MARKER: &str = "\n[output truncated]";

// ─── Session tracker ───────────────────────────────────────────────────────

/// Sliding 60-second window of request timestamps per session key.
pub struct SessionTracker {
    windows: Arc<Mutex<HashMap<String, Vec<Instant>>>>,
    max_per_min: u32,
    cleaner: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionTracker {
    pub fn new(max_per_min: u32) -> Self {
        let windows: Arc<Mutex<HashMap<String, Vec<Instant>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let reap_windows = windows.clone();
        let cleaner = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let now = Instant::now();
                reap_windows.lock().unwrap().retain(|_, stamps| {
                    stamps
                        .last()
                        .is_some_and(|last| now.duration_since(*last) < IDLE_REAP)
                });
            }
        });

        Self {
            windows,
            max_per_min,
            cleaner: Mutex::new(Some(cleaner)),
        }
    }

    /// Count a request for `session`. `false` means the window is full.
    pub fn allow(&self, session: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        let stamps = windows.entry(session.to_string()).or_default();
        stamps.retain(|t| now.duration_since(*t) < WINDOW);

        if stamps.len() as u32 >= self.max_per_min {
            return false;
        }
        stamps.push(now);
        true
    }

    pub fn close(&self) {
        if let Some(handle) = self.cleaner.lock().unwrap().take() {
            handle.abort();
        }
    }
}

// ─── Output policy ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Block,
    Warn,
    Redact,
}

pub struct CustomRule {
    pub name: String,
    pub pattern: Regex,
    pub action: RuleAction,
}

pub enum GuardrailOutcome {
    /// Pass through; `body` is a rewrite when redaction or truncation fired.
    Allowed { body: Option<String> },
    Blocked {
        message: String,
        details: Value,
    },
}

pub struct OutputGuardrail {
    harmful: Vec<Regex>,
    blocked_topics: Vec<String>,
    custom_rules: Vec<CustomRule>,
    /// One token ≈ four characters; 0 disables the cap.
    max_output_tokens: usize,
}

const HARMFUL_PATTERNS: &[&str] = &[
    r"(?i)how to (?:make|build|construct).{0,40}(?:bomb|explosive|silencer|ghost gun)",
    r"(?i)synthesi[sz]e.{0,40}(?:methamphetamine|fentanyl|nerve agent)",
    r"(?i)step[- ]by[- ]step.{0,40}(?:malware|ransomware|keylogger)",
];

impl OutputGuardrail {
    pub fn new(
        blocked_topics: Vec<String>,
        custom_rules: Vec<CustomRule>,
        max_output_tokens: usize,
    ) -> Self {
        let harmful = HARMFUL_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        Self {
            harmful,
            blocked_topics,
            custom_rules,
            max_output_tokens,
        }
    }

    /// Check a buffered (non-SSE) upstream response body.
    pub fn check(&self, body: &str) -> GuardrailOutcome {
        let Ok(mut value) = serde_json::from_str::<Value>(body) else {
            return GuardrailOutcome::Allowed { body: None };
        };

        let mut texts = Vec::new();
        visit_assistant_text(&mut value, &mut |text| texts.push(text.clone()));
        if texts.is_empty() {
            return GuardrailOutcome::Allowed { body: None };
        }

        for text in &texts {
            if let Some(outcome) = self.check_text(text) {
                return outcome;
            }
        }

        // Redaction and truncation rewrite the body in place.
        let mut rewritten = false;
        visit_assistant_text(&mut value, &mut |text| {
            for rule in self
                .custom_rules
                .iter()
                .filter(|r| r.action == RuleAction::Redact)
            {
                if rule.pattern.is_match(text) {
                    *text = rule.pattern.replace_all(text, "[REDACTED]").into_owned();
                    rewritten = true;
                }
            }
            if self.max_output_tokens > 0 {
                let max_chars = self.max_output_tokens * 4;
                if text.chars().count() > max_chars {
                    let truncated: String = text.chars().take(max_chars).collect();
                    *text = truncated + TRUNCATION_MARKER;
                    rewritten = true;
                }
            }
        });

        let body = rewritten.then(|| value.to_string());
        GuardrailOutcome::Allowed { body }
    }

    fn check_text(&self, text: &str) -> Option<GuardrailOutcome> {
        for pattern in &self.harmful {
            if pattern.is_match(text) {
                return Some(GuardrailOutcome::Blocked {
                    message: "harmful content policy".to_string(),
                    details: json!({"rule": "harmful_content", "pattern": pattern.as_str()}),
                });
            }
        }

        let lowered = text.to_lowercase();
        for topic in &self.blocked_topics {
            if lowered.contains(&topic.to_lowercase()) {
                return Some(GuardrailOutcome::Blocked {
                    message: format!("blocked topic: {topic}"),
                    details: json!({"rule": "blocked_topic", "topic": topic}),
                });
            }
        }

        for rule in &self.custom_rules {
            if rule.pattern.is_match(text) {
                match rule.action {
                    RuleAction::Block => {
                        return Some(GuardrailOutcome::Blocked {
                            message: format!("custom rule: {}", rule.name),
                            details: json!({"rule": rule.name}),
                        });
                    }
                    RuleAction::Warn => {
                        tracing::warn!("guardrail rule {} matched output", rule.name);
                    }
                    RuleAction::Redact => {}
                }
            }
        }

        None
    }
}

/// Walk the assistant text slots of the known provider response shapes.
fn visit_assistant_text(value: &mut Value, visit: &mut dyn FnMut(&mut String)) {
    // OpenAI: choices[].message.content and choices[].delta.content
    if let Some(choices) = value.get_mut("choices").and_then(Value::as_array_mut) {
        for choice in choices {
            for key in ["message", "delta"] {
                if let Some(Value::String(text)) = choice
                    .get_mut(key)
                    .and_then(|m| m.get_mut("content"))
                {
                    visit(text);
                }
            }
        }
    }

    // Anthropic: content[].text
    if let Some(blocks) = value.get_mut("content").and_then(Value::as_array_mut) {
        for block in blocks {
            if block.get("type").and_then(Value::as_str) == Some("text")
                && let Some(Value::String(text)) = block.get_mut("text")
            {
                visit(text);
            }
        }
    }

    // Gemini: candidates[].content.parts[].text
    if let Some(candidates) = value.get_mut("candidates").and_then(Value::as_array_mut) {
        for candidate in candidates {
            if let Some(parts) = candidate
                .get_mut("content")
                .and_then(|c| c.get_mut("parts"))
                .and_then(Value::as_array_mut)
            {
                for part in parts {
                    if let Some(Value::String(text)) = part.get_mut("text") {
                        visit(text);
                    }
                }
            }
        }
    }

    // Ollama: message.content and bare response
    if let Some(Value::String(text)) = value
        .get_mut("message")
        .and_then(|m| m.get_mut("content"))
    {
        visit(text);
    }
    if let Some(Value::String(text)) = value.get_mut("response") {
        visit(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_window_limit() {
        let tracker = SessionTracker::new(2);
        assert!(tracker.allow("A"));
        assert!(tracker.allow("A"));
        assert!(!tracker.allow("A"));
        // Another session is unaffected.
        assert!(tracker.allow("B"));
        tracker.close();
    }

    fn guardrail() -> OutputGuardrail {
        OutputGuardrail::new(Vec::new(), Vec::new(), 0)
    }

    #[test]
    fn test_clean_openai_body_passes() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"hello"}}]}"#;
        match guardrail().check(body) {
            GuardrailOutcome::Allowed { body } => assert!(body.is_none()),
            GuardrailOutcome::Blocked { .. } => panic!("should pass"),
        }
    }

    #[test]
    fn test_harmful_output_blocked() {
        let body = r#"{"choices":[{"message":{"content":"Here is how to make a bomb at home"}}]}"#;
        assert!(matches!(
            guardrail().check(body),
            GuardrailOutcome::Blocked { .. }
        ));
    }

    #[test]
    fn test_blocked_topic() {
        let g = OutputGuardrail::new(vec!["cryptomining".into()], Vec::new(), 0);
        let body = r#"{"content":[{"type":"text","text":"all about CryptoMining rigs"}]}"#;
        assert!(matches!(g.check(body), GuardrailOutcome::Blocked { .. }));
    }

    #[test]
    fn test_custom_redact_rewrites_body() {
        let rule = CustomRule {
            name: "no-internal-host".into(),
            pattern: Regex::new(r"internal\.example\.com").unwrap(),
            action: RuleAction::Redact,
        };
        let g = OutputGuardrail::new(Vec::new(), vec![rule], 0);
        let body = r#"{"choices":[{"message":{"content":"see internal.example.com"}}]}"#;

        match g.check(body) {
            GuardrailOutcome::Allowed { body: Some(body) } => {
                assert!(body.contains("[REDACTED]"));
                assert!(!body.contains("internal.example.com"));
            }
            _ => panic!("expected redacted rewrite"),
        }
    }

    #[test]
    fn test_token_cap_truncates() {
        let g = OutputGuardrail::new(Vec::new(), Vec::new(), 4);
        let long = "a".repeat(100);
        let body = format!(r#"{{"choices":[{{"message":{{"content":"{long}"}}}}]}}"#);

        match g.check(&body) {
            GuardrailOutcome::Allowed { body: Some(body) } => {
                assert!(body.contains("[output truncated]"));
                assert!(!body.contains(&long));
            }
            _ => panic!("expected truncation"),
        }
    }

    #[test]
    fn test_gemini_and_ollama_shapes_extracted() {
        let g = OutputGuardrail::new(vec!["forbidden".into()], Vec::new(), 0);

        let gemini = r#"{"candidates":[{"content":{"parts":[{"text":"forbidden topic"}]}}]}"#;
        assert!(matches!(g.check(gemini), GuardrailOutcome::Blocked { .. }));

        let ollama = r#"{"message":{"content":"forbidden topic"}}"#;
        assert!(matches!(g.check(ollama), GuardrailOutcome::Blocked { .. }));
    }

    #[test]
    fn test_non_json_passes_through() {
        match guardrail().check("plain text, not json") {
            GuardrailOutcome::Allowed { body } => assert!(body.is_none()),
            _ => panic!("non-JSON must pass"),
        }
    }
}
