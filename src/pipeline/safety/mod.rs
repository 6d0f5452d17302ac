pub mod types;
pub mod policy;
pub mod sanitize;
pub mod keywords;
pub mod escalation;
pub mod orchestrator;
pub mod output_sanitize;
pub mod audit;

pub use audit::{AuditEntry, AuditSink, TracingAuditSink};
pub use escalation::{crisis_response, CrisisResponse, EscalationSeverity};
pub use keywords::CrisisDetector;
pub use orchestrator::{CrisisGate, NoSecondary};
pub use output_sanitize::sanitize_llm_output;
pub use policy::{CompiledPolicy, PolicyError, PolicySource, SafetyPolicy};
pub use types::{
    CrisisClassification, DetectionLayer, DetectionPass, SafetyError, SecondaryClassifier,
    SecondaryVerdict,
};
