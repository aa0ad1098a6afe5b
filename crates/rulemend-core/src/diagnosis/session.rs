use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::categories::CategoryRepository;
use crate::config::DiagnosisConfig;
use crate::db::Database;
use crate::groups::GroupRepository;
use crate::llm::{
    CompletionRequest, CompletionResponse, LLMClient, LLMError, LlmCallContext, ToolCallResult,
};
use crate::owner::Owner;
use crate::repair::{RepairAction, RepairActionRegistry, repair_tools};
use crate::rules::{EvaluationContext, RuleRepository, evaluate};

use super::prompt::{PromptBuilder, assistant_turn, results_turn};
use super::types::{
    AppliedAction, DiagnosisContext, DiagnosisError, DiagnosisOutcome, DiagnosisRequest,
    RejectedAction, RoundEntry, SessionState, Termination,
};

pub const DIAGNOSIS_FEATURE: &str = "rule_diagnosis";
const DEFAULT_TEMPERATURE: f32 = 0.2;
const DEFAULT_MAX_TOKENS: u32 = 2048;

/// Drives bounded diagnosis sessions against the reasoning service.
#[derive(Clone)]
pub struct DiagnosisOrchestrator {
    llm: Arc<dyn LLMClient>,
    registry: RepairActionRegistry,
    rules: RuleRepository,
    groups: GroupRepository,
    categories: CategoryRepository,
    prompt: PromptBuilder,
    config: DiagnosisConfig,
    temperature: f32,
    max_tokens: u32,
}

struct StateTracker {
    state: SessionState,
}

impl StateTracker {
    fn advance(&mut self, next: SessionState) -> Result<(), DiagnosisError> {
        if !self.state.can_transition_to(next) {
            return Err(DiagnosisError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(from = self.state.as_str(), to = next.as_str(), "diagnosis state");
        self.state = next;
        Ok(())
    }
}

impl DiagnosisOrchestrator {
    pub fn new(db: Database, llm: Arc<dyn LLMClient>, config: DiagnosisConfig) -> Self {
        Self {
            llm,
            registry: RepairActionRegistry::new(db.clone()),
            rules: RuleRepository::new(db.clone()),
            groups: GroupRepository::new(db.clone()),
            categories: CategoryRepository::new(db),
            prompt: PromptBuilder::new(config.max_body_length),
            config,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub async fn diagnose(
        &self,
        request: DiagnosisRequest,
    ) -> Result<DiagnosisOutcome, DiagnosisError> {
        if request.report.trim().is_empty() {
            return Err(DiagnosisError::EmptyReport);
        }

        let session_id = Uuid::new_v4().to_string();
        let span = info_span!(
            "diagnosis",
            session_id = %session_id,
            owner = %request.owner,
            rule_id = request.matched_rule_id.as_deref().unwrap_or(""),
            message_id = %request.email.id,
        );
        self.run(session_id, request).instrument(span).await
    }

    async fn run(
        &self,
        session_id: String,
        request: DiagnosisRequest,
    ) -> Result<DiagnosisOutcome, DiagnosisError> {
        let owner = request.owner;
        let context = self.assemble(request).await?;
        let mut tracker = StateTracker {
            state: SessionState::Init,
        };

        let tools = repair_tools();
        let mut messages = self.prompt.build(&context);
        let mut applied: Vec<AppliedAction> = Vec::new();
        let mut rejected: Vec<RejectedAction> = Vec::new();
        let mut explanation: Option<String> = None;
        let mut rounds = 0;
        let mut termination = Termination::StepLimitExceeded;
        let max_rounds = self.config.max_rounds.max(1);

        info!(max_rounds, "diagnosis started");

        while rounds < max_rounds {
            rounds += 1;
            tracker.advance(SessionState::Reasoning)?;

            let request = CompletionRequest {
                messages: messages.clone(),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                tools: tools.clone(),
            };
            let call_context = LlmCallContext {
                session_id: Some(session_id.clone()),
                message_id: Some(context.email.id.clone()),
                rule_id: context.rule.as_ref().map(|rule| rule.id.clone()),
                rule_name: context.rule.as_ref().map(|rule| rule.name.clone()),
                round: Some(rounds),
                ..LlmCallContext::new(DIAGNOSIS_FEATURE, owner)
            };

            let response = match self.reason(request, call_context).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(round = rounds, error = %err, "reasoning service failed");
                    tracker.advance(SessionState::Terminated)?;
                    termination = Termination::ReasoningServiceFailed {
                        kind: err.kind().to_string(),
                        message: err.to_string(),
                    };
                    break;
                }
            };

            if !response.content.trim().is_empty() {
                explanation = Some(response.content.trim().to_string());
            }
            messages.push(assistant_turn(&response.content, &response.tool_calls));

            if response.tool_calls.is_empty() {
                tracker.advance(SessionState::Terminated)?;
                termination = Termination::Completed;
                break;
            }

            tracker.advance(SessionState::ActionsProposed)?;
            debug!(
                round = rounds,
                proposed = response.tool_calls.len(),
                "actions proposed"
            );
            tracker.advance(SessionState::Validating)?;

            let mut entries = Vec::with_capacity(response.tool_calls.len());
            for call in &response.tool_calls {
                let entry = self.handle_call(owner, call, &applied).await;
                match &entry {
                    RoundEntry::Applied(action) => applied.push(action.clone()),
                    RoundEntry::Rejected(action) => rejected.push(action.clone()),
                }
                entries.push(entry);
            }
            tracker.advance(SessionState::Applied)?;
            messages.push(results_turn(&entries));
        }

        if tracker.state != SessionState::Terminated {
            tracker.advance(SessionState::Terminated)?;
            warn!(rounds, "diagnosis stopped at the round limit");
        }

        info!(
            termination = termination.as_str(),
            rounds,
            applied = applied.len(),
            rejected = rejected.len(),
            "diagnosis finished"
        );

        Ok(DiagnosisOutcome {
            session_id,
            termination,
            applied,
            rejected,
            rounds,
            transcript_len: messages.len(),
            explanation,
        })
    }

    async fn assemble(&self, request: DiagnosisRequest) -> Result<DiagnosisContext, DiagnosisError> {
        let owner = request.owner;
        let rule = match request.matched_rule_id.as_deref() {
            Some(rule_id) => Some(self.rules.get_by_id(owner, rule_id).await?),
            None => None,
        };
        let categories = self.categories.list(owner).await?;
        let sender_category = self
            .categories
            .get_sender_category(owner, request.email.sender_email())
            .await?;
        let groups = self.groups.list(owner).await?;

        let evaluation = rule.as_ref().map(|rule| {
            let context = EvaluationContext::new(sender_category.clone(), groups.iter().cloned());
            evaluate(&rule.conditions, &request.email, &context)
        });

        Ok(DiagnosisContext {
            report: request.report,
            email: request.email,
            rule,
            evaluation,
            categories,
            sender_category,
            groups,
        })
    }

    async fn reason(
        &self,
        request: CompletionRequest,
        context: LlmCallContext,
    ) -> Result<CompletionResponse, LLMError> {
        let limit = Duration::from_secs(self.config.reasoning_timeout_secs);
        match tokio::time::timeout(limit, self.llm.complete(request, context)).await {
            Ok(result) => result,
            Err(_) => Err(LLMError::Timeout),
        }
    }

    async fn handle_call(
        &self,
        owner: Owner,
        call: &ToolCallResult,
        applied: &[AppliedAction],
    ) -> RoundEntry {
        let action = match RepairAction::from_tool_call(call) {
            Ok(action) => action,
            Err(err) => {
                warn!(tool = %call.fn_name, error = %err, "tool call rejected");
                return reject(call, err.to_string());
            }
        };

        if applied.iter().any(|prior| prior.action.same_as(&action)) {
            warn!(tool = %call.fn_name, target = %action.target(), "duplicate action rejected");
            return reject(call, "duplicate of an action already applied in this session".into());
        }

        match self.registry.apply(owner, &action).await {
            Ok(outcome) => RoundEntry::Applied(AppliedAction {
                call_id: call.call_id.clone(),
                action,
                outcome,
            }),
            Err(err) => reject(call, err.to_string()),
        }
    }
}

fn reject(call: &ToolCallResult, reason: String) -> RoundEntry {
    RoundEntry::Rejected(RejectedAction {
        call_id: call.call_id.clone(),
        tool: call.fn_name.clone(),
        arguments: call.fn_arguments.clone(),
        reason,
    })
}
