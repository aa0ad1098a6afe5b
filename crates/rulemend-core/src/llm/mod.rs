pub mod error;
pub mod mock;
pub mod repository;
pub mod types;

pub use error::{LLMError, RateLimitInfo};
pub use mock::MockLLMClient;
pub use repository::{LlmCall, LlmCallContext, LlmCallError, LlmCallRepository, NewLlmCall};
pub use types::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, Tool, ToolCallResult,
};

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use genai::{
    Client as GenaiClient, Error as GenaiError,
    chat::{
        ChatMessage as GenaiChatMessage, ChatOptions, ChatRequest, ChatResponse, MessageContent,
    },
    webc,
};
use reqwest::{
    StatusCode,
    header::{HeaderMap, HeaderValue, RETRY_AFTER},
};
use tracing::{debug, warn};

use crate::config::ModelConfig;
use crate::db::Database;
use crate::telemetry::current_trace_id;

/// Interface to the external reasoning service.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn complete(
        &self,
        request: CompletionRequest,
        context: LlmCallContext,
    ) -> Result<CompletionResponse, LLMError>;
}

#[async_trait]
pub trait ChatExecutor: Send + Sync {
    async fn exec_chat(
        &self,
        model: &str,
        request: ChatRequest,
        options: Option<&ChatOptions>,
    ) -> Result<ChatResponse, GenaiError>;
}

#[async_trait]
impl ChatExecutor for GenaiClient {
    async fn exec_chat(
        &self,
        model: &str,
        request: ChatRequest,
        options: Option<&ChatOptions>,
    ) -> Result<ChatResponse, GenaiError> {
        GenaiClient::exec_chat(self, model, request, options).await
    }
}

/// Production client: genai for transport, `llm_calls` for the audit trail.
pub struct GenaiLLMClient {
    chat: Arc<dyn ChatExecutor>,
    model: String,
    repo: LlmCallRepository,
}

struct CallRecord {
    model: String,
    request_json: serde_json::Value,
    response_json: Option<serde_json::Value>,
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
    latency_ms: u64,
    error: Option<String>,
}

impl GenaiLLMClient {
    pub fn new(db: Database, model_config: &ModelConfig) -> Self {
        let chat: Arc<dyn ChatExecutor> = Arc::new(GenaiClient::default());
        Self::with_executor(db, model_config, chat)
    }

    pub fn with_executor(
        db: Database,
        model_config: &ModelConfig,
        chat: Arc<dyn ChatExecutor>,
    ) -> Self {
        Self {
            chat,
            model: namespaced_model(model_config),
            repo: LlmCallRepository::new(db),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_chat_request(&self, request: &CompletionRequest) -> ChatRequest {
        let messages = request
            .messages
            .iter()
            .map(to_genai_message)
            .collect::<Vec<_>>();
        let chat_request = ChatRequest::from_messages(messages);

        if request.tools.is_empty() {
            chat_request
        } else {
            chat_request.with_tools(request.tools.clone())
        }
    }

    fn build_chat_options(&self, request: &CompletionRequest) -> ChatOptions {
        ChatOptions::default()
            .with_temperature(request.temperature as f64)
            .with_max_tokens(request.max_tokens)
    }

    async fn log_call(&self, context: &LlmCallContext, record: CallRecord) {
        let new_call = NewLlmCall {
            context: context.clone(),
            model: record.model,
            request_json: record.request_json,
            response_json: record.response_json,
            input_tokens: record.input_tokens,
            output_tokens: record.output_tokens,
            latency_ms: Some(record.latency_ms),
            error: record.error,
            trace_id: current_trace_id(),
        };

        if let Err(log_err) = self.repo.create(new_call).await {
            warn!(error = ?log_err, feature = %context.feature, "failed to record llm call");
        }
    }
}

#[async_trait]
impl LLMClient for GenaiLLMClient {
    async fn complete(
        &self,
        request: CompletionRequest,
        context: LlmCallContext,
    ) -> Result<CompletionResponse, LLMError> {
        let chat_request = self.build_chat_request(&request);
        let options = self.build_chat_options(&request);
        let request_json = serde_json::to_value(&request)
            .unwrap_or_else(|err| serde_json::json!({"error": err.to_string()}));

        let start = Instant::now();
        let result = self
            .chat
            .exec_chat(&self.model, chat_request, Some(&options))
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                let content = response.first_text().unwrap_or("").to_string();
                let provider_model = response.provider_model_iden.to_string();
                let (input_tokens, output_tokens) = usage_tokens(&response.usage);
                let tool_calls: Vec<ToolCallResult> = response
                    .tool_calls()
                    .iter()
                    .map(|call| ToolCallResult {
                        call_id: call.call_id.clone(),
                        fn_name: call.fn_name.clone(),
                        fn_arguments: call.fn_arguments.clone(),
                    })
                    .collect();
                debug!(
                    model = %provider_model,
                    latency_ms,
                    tool_calls = tool_calls.len(),
                    "reasoning call completed"
                );

                self.log_call(
                    &context,
                    CallRecord {
                        model: provider_model.clone(),
                        request_json,
                        response_json: serde_json::to_value(&response).ok(),
                        input_tokens: Some(input_tokens),
                        output_tokens: Some(output_tokens),
                        latency_ms,
                        error: None,
                    },
                )
                .await;

                Ok(CompletionResponse {
                    content,
                    model: provider_model,
                    input_tokens,
                    output_tokens,
                    latency_ms,
                    tool_calls,
                })
            }
            Err(err) => {
                let mapped = map_genai_error(err);
                self.log_call(
                    &context,
                    CallRecord {
                        model: self.model.clone(),
                        request_json,
                        response_json: None,
                        input_tokens: None,
                        output_tokens: None,
                        latency_ms,
                        error: Some(mapped.to_string()),
                    },
                )
                .await;
                Err(mapped)
            }
        }
    }
}

fn to_genai_message(message: &ChatMessage) -> GenaiChatMessage {
    let content = MessageContent::from_text(message.content.clone());
    match message.role {
        ChatRole::System => GenaiChatMessage::system(content),
        ChatRole::User => GenaiChatMessage::user(content),
        ChatRole::Assistant => GenaiChatMessage::assistant(content),
    }
}

/// genai resolves the adapter from a `provider::model` name.
fn namespaced_model(cfg: &ModelConfig) -> String {
    if cfg.provider.is_empty() || cfg.model.contains("::") {
        cfg.model.clone()
    } else {
        format!("{}::{}", cfg.provider.to_lowercase(), cfg.model)
    }
}

fn usage_tokens(usage: &genai::chat::Usage) -> (u32, u32) {
    let input = usage.prompt_tokens.unwrap_or_default().max(0) as u32;
    let output = usage.completion_tokens.unwrap_or_default().max(0) as u32;
    (input, output)
}

fn map_genai_error(err: GenaiError) -> LLMError {
    match err {
        GenaiError::RequiresApiKey { .. }
        | GenaiError::NoAuthResolver { .. }
        | GenaiError::NoAuthData { .. } => LLMError::AuthenticationFailed,
        GenaiError::ChatReqHasNoMessages { .. }
        | GenaiError::LastChatMessageIsNotUser { .. }
        | GenaiError::MessageRoleNotSupported { .. }
        | GenaiError::MessageContentTypeNotSupported { .. }
        | GenaiError::JsonModeWithoutInstruction
        | GenaiError::VerbosityParsing { .. }
        | GenaiError::ReasoningParsingError { .. }
        | GenaiError::ServiceTierParsing { .. }
        | GenaiError::ModelMapperFailed { .. }
        | GenaiError::AdapterNotSupported { .. }
        | GenaiError::Resolver { .. } => LLMError::InvalidRequest(err.to_string()),
        GenaiError::InvalidJsonResponseElement { .. } | GenaiError::StreamParse { .. } => {
            LLMError::ParseError(err.to_string())
        }
        GenaiError::NoChatResponse { .. } => LLMError::ServerError(err.to_string()),
        GenaiError::WebAdapterCall { webc_error, .. }
        | GenaiError::WebModelCall { webc_error, .. } => map_webc_error(webc_error),
        GenaiError::ChatResponse { .. } | GenaiError::WebStream { .. } => {
            LLMError::ProviderError(err.to_string())
        }
        GenaiError::Internal(msg) => LLMError::ProviderError(msg),
        GenaiError::EventSourceClone(e) => LLMError::ProviderError(e.to_string()),
        GenaiError::JsonValueExt(e) => LLMError::ParseError(e.to_string()),
        GenaiError::ReqwestEventSource(e) => LLMError::ProviderError(e.to_string()),
        GenaiError::SerdeJson(e) => LLMError::ParseError(e.to_string()),
    }
}

fn map_webc_error(err: webc::Error) -> LLMError {
    match &err {
        webc::Error::ResponseFailedStatus {
            status, headers, ..
        } => match *status {
            StatusCode::TOO_MANY_REQUESTS => {
                LLMError::RateLimited(RateLimitInfo::new(retry_after_ms_from_headers(headers)))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LLMError::AuthenticationFailed,
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => LLMError::Timeout,
            status if status.is_client_error() => LLMError::InvalidRequest(status.to_string()),
            status if status.is_server_error() => LLMError::ServerError(status.to_string()),
            status => LLMError::ProviderError(status.to_string()),
        },
        webc::Error::Reqwest(req_err) if req_err.is_timeout() => LLMError::Timeout,
        webc::Error::Reqwest(req_err) => LLMError::ProviderError(req_err.to_string()),
        webc::Error::ResponseFailedNotJson { .. } => LLMError::ParseError(err.to_string()),
        webc::Error::JsonValueExt(parse_err) => LLMError::ParseError(parse_err.to_string()),
        webc::Error::EventSourceClone(clone_err) => LLMError::ProviderError(clone_err.to_string()),
    }
}

fn retry_after_ms_from_headers(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(parse_retry_after)
        .or_else(|| headers.get("x-ratelimit-reset").and_then(parse_epoch_reset))
}

/// Accepts delta-seconds or an HTTP-date.
fn parse_retry_after(value: &HeaderValue) -> Option<u64> {
    let raw = value.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(secs.saturating_mul(1000));
    }

    let at = DateTime::parse_from_rfc2822(raw).ok()?;
    let delta_ms = (at.with_timezone(&Utc) - Utc::now()).num_milliseconds();
    (delta_ms > 0).then_some(delta_ms as u64)
}

fn parse_epoch_reset(value: &HeaderValue) -> Option<u64> {
    let reset_epoch = value.to_str().ok()?.trim().parse::<i64>().ok()?;
    let delta_ms = (reset_epoch - Utc::now().timestamp()).saturating_mul(1000);
    (delta_ms > 0).then_some(delta_ms as u64)
}
