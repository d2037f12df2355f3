//! Events emitted by the pipeline for the webhook dispatcher.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "pii.detected")]
    PiiDetected,
    #[serde(rename = "injection.blocked")]
    InjectionBlocked,
    #[serde(rename = "guardrail.violation")]
    GuardrailViolation,
    #[serde(rename = "canary.leaked")]
    CanaryLeaked,
    #[serde(rename = "provider.unhealthy")]
    ProviderUnhealthy,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PiiDetected => "pii.detected",
            Self::InjectionBlocked => "injection.blocked",
            Self::GuardrailViolation => "guardrail.violation",
            Self::CanaryLeaked => "canary.leaked",
            Self::ProviderUnhealthy => "provider.unhealthy",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "event")]
    pub kind: EventKind,
    pub session: String,
    pub detail: serde_json::Value,
    pub at: chrono::DateTime<chrono::Utc>,
}

impl Event {
    pub fn new(kind: EventKind, session: impl Into<String>, detail: serde_json::Value) -> Self {
        Self {
            kind,
            session: session.into(),
            detail,
            at: chrono::Utc::now(),
        }
    }
}
