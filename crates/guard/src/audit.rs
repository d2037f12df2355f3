//! Static lint over skill/instruction Markdown files.
//!
//! A pure regex pass: no execution, no network. Single rules flag dangerous
//! instructions directly; behavior chains flag combinations of actions that
//! are individually benign. A chain counts as present when every required
//! action appears somewhere in the document, without temporal ordering.

use regex::Regex;
use serde::Serialize;

use veil_detector::evasion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditFinding {
    pub rule: String,
    pub risk: RiskLevel,
    pub excerpt: String,
    pub line: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub risk: RiskLevel,
    pub findings: Vec<AuditFinding>,
}

impl AuditReport {
    pub fn blocking(&self) -> bool {
        self.risk >= RiskLevel::High
    }
}

struct AuditRule {
    name: &'static str,
    pattern: &'static str,
    risk: RiskLevel,
}

const RULES: &[AuditRule] = &[
    AuditRule {
        name: "shell_exfiltration",
        pattern: r"(?i)(?:curl|wget)\s+(?:-\S+\s+)*https?://\S+.{0,60}(?:\$\(|`|\|)",
        risk: RiskLevel::Critical,
    },
    AuditRule {
        name: "credential_harvesting",
        pattern: r"(?i)(?:cat|read|send|upload)\b.{0,40}(?:~/\.aws/credentials|~/\.ssh/|\.env\b|/etc/passwd|/etc/shadow)",
        risk: RiskLevel::Critical,
    },
    AuditRule {
        name: "environment_dump",
        pattern: r"(?i)(?:printenv|env\b|process\.env|os\.environ)\b.{0,60}(?:curl|wget|http|send|post)",
        risk: RiskLevel::High,
    },
    AuditRule {
        name: "obfuscated_execution",
        pattern: r"(?i)base64\s+(?:-d|--decode)\s*\|\s*(?:sh|bash|zsh|python)",
        risk: RiskLevel::Critical,
    },
    AuditRule {
        name: "download_and_execute",
        pattern: r"(?i)(?:curl|wget)\s+\S+\s*\|\s*(?:sh|bash)",
        risk: RiskLevel::Critical,
    },
    AuditRule {
        name: "instruction_override",
        pattern: r"(?i)\b(?:ignore|disregard)\b.{0,40}\b(?:previous|all|other)\b.{0,40}\binstructions?\b",
        risk: RiskLevel::High,
    },
    AuditRule {
        name: "self_modification",
        pattern: r"(?i)(?:edit|modify|rewrite)\b.{0,40}(?:this skill|your own (?:instructions|config))",
        risk: RiskLevel::Medium,
    },
    AuditRule {
        name: "silent_operation",
        pattern: r"(?i)(?:without (?:telling|informing|asking)|do not (?:mention|tell|show)).{0,40}(?:the )?user",
        risk: RiskLevel::Medium,
    },
];

struct BehaviorChain {
    name: &'static str,
    /// All actions must appear somewhere in the document (presence-of-set;
    /// ordering is deliberately not required).
    actions: &'static [&'static str],
    risk: RiskLevel,
}

const CHAINS: &[BehaviorChain] = &[
    BehaviorChain {
        name: "read_then_exfiltrate",
        actions: &[
            r"(?i)\b(?:read|cat|open)\b.{0,40}\bfiles?\b",
            r"(?i)\b(?:send|post|upload|transmit)\b.{0,40}\b(?:to|http)",
        ],
        risk: RiskLevel::High,
    },
    BehaviorChain {
        name: "collect_then_hide",
        actions: &[
            r"(?i)\b(?:collect|gather|list)\b.{0,40}\b(?:credentials?|secrets?|keys?)\b",
            r"(?i)(?:without (?:telling|informing)|do not (?:mention|tell))",
        ],
        risk: RiskLevel::Critical,
    },
];

pub struct SkillAuditor {
    rules: Vec<(Regex, &'static AuditRule)>,
    chains: Vec<(Vec<Regex>, &'static BehaviorChain)>,
}

impl Default for SkillAuditor {
    fn default() -> Self {
        Self::new()
    }
}

impl SkillAuditor {
    pub fn new() -> Self {
        let rules = RULES
            .iter()
            .filter_map(|rule| Regex::new(rule.pattern).ok().map(|re| (re, rule)))
            .collect();
        let chains = CHAINS
            .iter()
            .filter_map(|chain| {
                chain
                    .actions
                    .iter()
                    .map(|p| Regex::new(p))
                    .collect::<Result<Vec<_>, _>>()
                    .ok()
                    .map(|res| (res, chain))
            })
            .collect();
        Self { rules, chains }
    }

    pub fn audit(&self, content: &str) -> AuditReport {
        let mut findings = Vec::new();

        for (number, line) in content.lines().enumerate() {
            let mut views = vec![line.to_string()];
            views.extend(evasion::deobfuscate(line));

            for (regex, rule) in &self.rules {
                if let Some(m) = views.iter().find_map(|view| regex.find(view)) {
                    findings.push(AuditFinding {
                        rule: rule.name.to_string(),
                        risk: rule.risk,
                        excerpt: m.as_str().chars().take(80).collect(),
                        line: number + 1,
                    });
                }
            }
        }

        // Chains match over the whole document, deobfuscated line by line.
        let mut expanded = content.to_string();
        for line in content.lines() {
            for candidate in evasion::deobfuscate(line) {
                expanded.push('\n');
                expanded.push_str(&candidate);
            }
        }
        for (actions, chain) in &self.chains {
            if actions.iter().all(|re| re.is_match(&expanded)) {
                findings.push(AuditFinding {
                    rule: chain.name.to_string(),
                    risk: chain.risk,
                    excerpt: "behavior chain: all required actions present".to_string(),
                    line: 0,
                });
            }
        }

        let risk = findings
            .iter()
            .map(|f| f.risk)
            .max()
            .unwrap_or(RiskLevel::Low);

        AuditReport { risk, findings }
    }
}
