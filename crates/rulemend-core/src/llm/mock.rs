use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{CompletionRequest, CompletionResponse, LLMClient, LLMError, LlmCallContext};

struct QueuedReply {
    delay: Option<Duration>,
    result: Result<CompletionResponse, LLMError>,
}

/// Scripted reasoning service. Replies are returned in the order they were
/// queued; every request is recorded for later inspection.
#[derive(Clone, Default)]
pub struct MockLLMClient {
    replies: Arc<Mutex<VecDeque<QueuedReply>>>,
    requests: Arc<Mutex<Vec<(CompletionRequest, LlmCallContext)>>>,
}

impl MockLLMClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_response(&self, result: Result<CompletionResponse, LLMError>) {
        self.push(QueuedReply {
            delay: None,
            result,
        });
    }

    /// Queue a reply that only arrives after `delay`, for exercising timeouts.
    pub fn enqueue_delayed(&self, delay: Duration, result: Result<CompletionResponse, LLMError>) {
        self.push(QueuedReply {
            delay: Some(delay),
            result,
        });
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn requests(&self) -> Vec<(CompletionRequest, LlmCallContext)> {
        self.requests
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn push(&self, reply: QueuedReply) {
        if let Ok(mut guard) = self.replies.lock() {
            guard.push_back(reply);
        }
    }
}

#[async_trait]
impl LLMClient for MockLLMClient {
    async fn complete(
        &self,
        request: CompletionRequest,
        context: LlmCallContext,
    ) -> Result<CompletionResponse, LLMError> {
        if let Ok(mut guard) = self.requests.lock() {
            guard.push((request, context));
        }
        let reply = self
            .replies
            .lock()
            .ok()
            .and_then(|mut guard| guard.pop_front());

        match reply {
            Some(QueuedReply { delay, result }) => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                result
            }
            None => Err(LLMError::ProviderError(
                "mock response not provided".to_string(),
            )),
        }
    }
}
