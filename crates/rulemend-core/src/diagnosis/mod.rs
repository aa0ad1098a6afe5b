//! Bounded diagnosis sessions: assemble context, ask the reasoning service for
//! repairs, apply them, and report what happened.

pub mod prompt;
pub mod session;
pub mod types;

pub use prompt::PromptBuilder;
pub use session::{DIAGNOSIS_FEATURE, DiagnosisOrchestrator};
pub use types::{
    AppliedAction, DiagnosisContext, DiagnosisError, DiagnosisOutcome, DiagnosisRequest,
    RejectedAction, RoundEntry, SessionState, Termination,
};
