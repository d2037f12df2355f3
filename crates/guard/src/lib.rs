pub mod audit;
pub mod canary;
pub mod guardrail;
pub mod injection;

pub use canary::CanaryStore;
pub use guardrail::{GuardrailOutcome, OutputGuardrail, SessionTracker};
pub use injection::{GuardResult, PromptGuard, ThreatLevel};
