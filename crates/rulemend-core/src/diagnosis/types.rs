use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::categories::{Category, CategoryError};
use crate::email::EmailSnapshot;
use crate::groups::{Group, GroupError};
use crate::owner::Owner;
use crate::repair::{ActionOutcome, RepairAction};
use crate::rules::{MatchResult, Rule, RuleError};

/// Lifecycle of one diagnosis session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    Reasoning,
    ActionsProposed,
    Validating,
    Applied,
    Terminated,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Init, Reasoning)
                | (Reasoning, ActionsProposed)
                | (Reasoning, Terminated)
                | (ActionsProposed, Validating)
                | (Validating, Applied)
                | (Applied, Reasoning)
                | (Applied, Terminated)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Init => "init",
            SessionState::Reasoning => "reasoning",
            SessionState::ActionsProposed => "actions_proposed",
            SessionState::Validating => "validating",
            SessionState::Applied => "applied",
            SessionState::Terminated => "terminated",
        }
    }
}

/// Why a session stopped. None of these are errors from the caller's view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Termination {
    Completed,
    StepLimitExceeded,
    ReasoningServiceFailed { kind: String, message: String },
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Completed => "completed",
            Termination::StepLimitExceeded => "step_limit_exceeded",
            Termination::ReasoningServiceFailed { .. } => "reasoning_service_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedAction {
    pub call_id: String,
    pub action: RepairAction,
    pub outcome: ActionOutcome,
}

/// A tool call that was not applied, kept verbatim for the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedAction {
    pub call_id: String,
    pub tool: String,
    pub arguments: Value,
    pub reason: String,
}

/// Result of a single proposed action within one round, in proposal order.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundEntry {
    Applied(AppliedAction),
    Rejected(RejectedAction),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisOutcome {
    pub session_id: String,
    pub termination: Termination,
    pub applied: Vec<AppliedAction>,
    pub rejected: Vec<RejectedAction>,
    pub rounds: u32,
    pub transcript_len: usize,
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisRequest {
    #[serde(flatten)]
    pub owner: Owner,
    pub report: String,
    pub email: EmailSnapshot,
    #[serde(default)]
    pub matched_rule_id: Option<String>,
}

/// Everything the reasoning service is shown before the first round.
#[derive(Debug, Clone)]
pub struct DiagnosisContext {
    pub report: String,
    pub email: EmailSnapshot,
    pub rule: Option<Rule>,
    pub evaluation: Option<MatchResult>,
    pub categories: Vec<Category>,
    pub sender_category: Option<Category>,
    pub groups: Vec<Group>,
}

/// A session that could not start.
#[derive(Debug, Error)]
pub enum DiagnosisError {
    #[error("report cannot be empty")]
    EmptyReport,
    #[error("rule not found: {0}")]
    RuleNotFound(String),
    #[error("failed to load rule: {0}")]
    Rules(RuleError),
    #[error("failed to load groups: {0}")]
    Groups(#[from] GroupError),
    #[error("failed to load categories: {0}")]
    Categories(#[from] CategoryError),
    #[error("illegal session transition from {} to {}", from.as_str(), to.as_str())]
    IllegalTransition {
        from: SessionState,
        to: SessionState,
    },
}

impl From<RuleError> for DiagnosisError {
    fn from(err: RuleError) -> Self {
        match err {
            RuleError::NotFound(id) => DiagnosisError::RuleNotFound(id),
            other => DiagnosisError::Rules(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_follows_the_round_loop() {
        use SessionState::*;
        let path = [
            Init,
            Reasoning,
            ActionsProposed,
            Validating,
            Applied,
            Reasoning,
            Terminated,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn illegal_transitions_are_refused() {
        use SessionState::*;
        assert!(!Init.can_transition_to(Applied));
        assert!(!Reasoning.can_transition_to(Applied));
        assert!(!Validating.can_transition_to(Reasoning));
        assert!(!Terminated.can_transition_to(Reasoning));
        assert!(!Terminated.can_transition_to(Terminated));
    }

    #[test]
    fn termination_serializes_with_reason_tag() {
        assert_eq!(
            serde_json::to_value(Termination::StepLimitExceeded).expect("serialize"),
            json!({"reason": "step_limit_exceeded"})
        );
        assert_eq!(
            serde_json::to_value(Termination::ReasoningServiceFailed {
                kind: "timeout".into(),
                message: "timeout".into(),
            })
            .expect("serialize"),
            json!({"reason": "reasoning_service_failed", "kind": "timeout", "message": "timeout"})
        );
    }

    #[test]
    fn request_reads_owner_from_top_level_fields() {
        let request: DiagnosisRequest = serde_json::from_value(json!({
            "org_id": 3,
            "user_id": 9,
            "report": "this is a newsletter",
            "email": {
                "id": "m1",
                "thread_id": null,
                "message_id": null,
                "references": null,
                "from": {"email": "mattsnews@convertkit.com", "name": null},
                "subject": "Weekly",
                "date": null,
                "body_plain": "hi",
                "body_html": null
            }
        }))
        .expect("deserialize");
        assert_eq!(request.owner, Owner::new(3, 9));
        assert!(request.matched_rule_id.is_none());
        assert_eq!(request.email.sender_email(), "mattsnews@convertkit.com");
    }

    #[test]
    fn missing_rule_maps_to_rule_not_found() {
        let err = DiagnosisError::from(RuleError::NotFound("r1".into()));
        assert!(matches!(err, DiagnosisError::RuleNotFound(ref id) if id == "r1"));
    }
}
