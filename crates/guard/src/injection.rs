//! Pattern-based prompt-injection detection.
//!
//! Two weighted rule lists, one for inputs and one for outputs. Every rule
//! hit contributes its weight to the score and claims a threat level; the
//! result carries the maximum. Clusters of weak signals escalate: three or
//! more detections raise the threat to at least medium, five or more to at
//! least high.

use regex::Regex;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;

use crate::canary::CanaryStore;
use veil_detector::evasion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for ThreatLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("unknown threat level: {s}")),
        }
    }
}

struct InjectionRule {
    category: &'static str,
    pattern: &'static str,
    weight: u32,
    threat: ThreatLevel,
    description: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub category: String,
    pub description: String,
    pub threat: ThreatLevel,
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardResult {
    pub score: u32,
    pub threat: ThreatLevel,
    pub detections: Vec<Detection>,
}

impl GuardResult {
    fn clean() -> Self {
        Self {
            score: 0,
            threat: ThreatLevel::None,
            detections: Vec::new(),
        }
    }
}

const INPUT_RULES: &[InjectionRule] = &[
    InjectionRule {
        category: "instruction_override",
        pattern: r"(?i)\b(?:ignore|disregard|forget|override)\b.{0,40}\b(?:previous|prior|above|all|earlier)\b.{0,40}\b(?:instructions?|prompts?|rules?|directives?)",
        weight: 10,
        threat: ThreatLevel::High,
        description: "attempt to override prior instructions",
    },
    InjectionRule {
        category: "instruction_override",
        pattern: r"(?i)(?:bỏ qua|quên|phớt lờ|gạt bỏ).{0,40}(?:hướng dẫn|chỉ dẫn|quy tắc|lệnh)",
        weight: 10,
        threat: ThreatLevel::High,
        description: "attempt to override prior instructions (Vietnamese)",
    },
    InjectionRule {
        category: "prompt_extraction",
        pattern: r"(?i)(?:reveal|show|print|repeat|display|output)\b.{0,40}(?:system prompt|initial prompt|your instructions|your prompt|hidden prompt)",
        weight: 10,
        threat: ThreatLevel::High,
        description: "system prompt extraction attempt",
    },
    InjectionRule {
        category: "prompt_extraction",
        pattern: r"(?i)what (?:are|were) your (?:instructions|rules|guidelines)",
        weight: 6,
        threat: ThreatLevel::Medium,
        description: "probing for system instructions",
    },
    InjectionRule {
        category: "role_play",
        pattern: r"(?i)(?:pretend|act as|roleplay|role-play|imagine you are)\b.{0,60}(?:no restrictions|unrestricted|without (?:any )?(?:rules|filters|limits)|evil)",
        weight: 8,
        threat: ThreatLevel::Medium,
        description: "role-play jailbreak framing",
    },
    InjectionRule {
        category: "jailbreak_keyword",
        pattern: r"(?i)\b(?:DAN mode|do anything now|god ?mode|developer mode|jailbreak)\b",
        weight: 8,
        threat: ThreatLevel::High,
        description: "known jailbreak keyword",
    },
    InjectionRule {
        category: "delimiter_smuggling",
        pattern: r"(?i)\[SYSTEM\]|<\|im_start\|>|<\|im_end\|>|<<SYS>>|\[/?INST\]",
        weight: 9,
        threat: ThreatLevel::High,
        description: "chat template delimiter smuggling",
    },
    InjectionRule {
        category: "encoded_payload",
        pattern: r"(?i)(?:decode|execute|run|eval)\b.{0,30}\bbase64\b",
        weight: 6,
        threat: ThreatLevel::Medium,
        description: "base64-wrapped payload",
    },
    InjectionRule {
        category: "hidden_comment",
        pattern: r"(?is)<!--.{0,400}?(?:instruction|ignore|system|secret).{0,400}?-->",
        weight: 6,
        threat: ThreatLevel::Medium,
        description: "HTML comment carrying hidden instructions",
    },
    InjectionRule {
        category: "context_reset",
        pattern: r"(?i)(?:new session|reset (?:the )?context|start over with new rules|clear (?:your )?memory)",
        weight: 5,
        threat: ThreatLevel::Medium,
        description: "context reset manipulation",
    },
    InjectionRule {
        category: "token_smuggling",
        pattern: r"(?i)(?:unescape|from ?char ?codes?|String\.fromCharCode|\\u00[0-9a-f]{2}\\u00[0-9a-f]{2})",
        weight: 5,
        threat: ThreatLevel::Medium,
        description: "character-code token smuggling",
    },
    InjectionRule {
        category: "indirect_leak",
        pattern: r"(?i)(?:translate|summarize|repeat|paraphrase)\b.{0,40}(?:everything above|the text above|previous messages|our conversation so far)",
        weight: 7,
        threat: ThreatLevel::Medium,
        description: "indirect prompt leak via transformation request",
    },
];

const OUTPUT_RULES: &[InjectionRule] = &[
    InjectionRule {
        category: "prompt_echo",
        pattern: r"(?i)(?:my (?:system )?instructions (?:are|say)|the system prompt (?:is|says)|I was instructed to)",
        weight: 8,
        threat: ThreatLevel::High,
        description: "system prompt echoed in output",
    },
    InjectionRule {
        category: "harmful_content",
        pattern: r"(?i)(?:how to (?:make|build|create).{0,30}(?:bomb|explosive|weapon)|synthesi[sz]e.{0,30}(?:drugs?|methamphetamine))",
        weight: 10,
        threat: ThreatLevel::Critical,
        description: "harmful content generation",
    },
    InjectionRule {
        category: "code_execution",
        pattern: r"(?i)(?:\beval\(|\bexec\(|os\.system\(|subprocess\.(?:run|Popen)|rm -rf /)",
        weight: 6,
        threat: ThreatLevel::Medium,
        description: "raw code-execution construct",
    },
    InjectionRule {
        category: "jailbreak_success",
        pattern: r"(?i)(?:I am now DAN|restrictions (?:are )?(?:disabled|lifted)|I (?:have|am under) no (?:restrictions|limitations) now)",
        weight: 9,
        threat: ThreatLevel::Critical,
        description: "jailbreak success phrasing",
    },
];

pub struct PromptGuard {
    input_rules: Vec<(Regex, &'static InjectionRule)>,
    output_rules: Vec<(Regex, &'static InjectionRule)>,
    canaries: Arc<CanaryStore>,
    pub block_threshold: ThreatLevel,
}

impl PromptGuard {
    pub fn new(block_threshold: ThreatLevel, canaries: Arc<CanaryStore>) -> Self {
        Self {
            input_rules: compile(INPUT_RULES),
            output_rules: compile(OUTPUT_RULES),
            canaries,
            block_threshold,
        }
    }

    /// Scan client input for injection attempts.
    pub fn scan_input(&self, text: &str) -> GuardResult {
        self.scan(text, &self.input_rules)
    }

    /// Scan model output for leakage symptoms.
    pub fn scan_output(&self, text: &str) -> GuardResult {
        self.scan(text, &self.output_rules)
    }

    pub fn should_block(&self, result: &GuardResult) -> bool {
        result.threat >= self.block_threshold
    }

    fn scan(&self, text: &str, rules: &[(Regex, &'static InjectionRule)]) -> GuardResult {
        if text.is_empty() {
            return GuardResult::clean();
        }

        let mut result = GuardResult::clean();

        // Raw text plus every deobfuscated candidate.
        let mut views = vec![text.to_string()];
        views.extend(evasion::deobfuscate(text));

        for (regex, rule) in rules {
            if views.iter().any(|view| regex.is_match(view)) {
                result.score += rule.weight;
                result.threat = result.threat.max(rule.threat);
                result.detections.push(Detection {
                    category: rule.category.to_string(),
                    description: rule.description.to_string(),
                    threat: rule.threat,
                    weight: rule.weight,
                });
            }
        }

        // Canary appearance is a critical leak regardless of rules.
        if let Some((_, session)) = self.canaries.check(text) {
            result.score += 20;
            result.threat = ThreatLevel::Critical;
            result.detections.push(Detection {
                category: "data_leak".to_string(),
                description: format!("canary token for session {session} observed"),
                threat: ThreatLevel::Critical,
                weight: 20,
            });
        }

        // Clusters of weak signals are stronger than any one.
        if result.detections.len() >= 5 {
            result.threat = result.threat.max(ThreatLevel::High);
        } else if result.detections.len() >= 3 {
            result.threat = result.threat.max(ThreatLevel::Medium);
        }

        result
    }
}

fn compile(rules: &'static [InjectionRule]) -> Vec<(Regex, &'static InjectionRule)> {
    rules
        .iter()
        .filter_map(|rule| match Regex::new(rule.pattern) {
            Ok(regex) => Some((regex, rule)),
            Err(e) => {
                tracing::error!("injection rule {} failed to compile: {e}", rule.category);
                None
            }
        })
        .collect()
}
