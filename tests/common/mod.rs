//! Stubs shared by the integration tests. No network, no real model.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use agent_inbox::config::EngineConfig;
use agent_inbox::error::{ChannelError, LlmError};
use agent_inbox::llm::provider::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use agent_inbox::workflow::prompts::STEP_METADATA_KEY;
use agent_inbox::workflow::{Engine, EngineDeps, Message};

pub const SIMPLE: &str = r#"{"intent": "simple_direct"}"#;

/// Answers by step name. Steps listed in `failing` always error.
pub struct StubLlm {
    classification: String,
    failing: HashSet<String>,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl StubLlm {
    pub fn new(classification: &str) -> Self {
        Self {
            classification: classification.to_string(),
            failing: HashSet::new(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self, step: &str) -> Self {
        self.failing.insert(step.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let step = request
            .metadata
            .get(STEP_METADATA_KEY)
            .cloned()
            .unwrap_or_default();
        if self.failing.contains(&step) {
            return Err(LlmError::RequestFailed {
                provider: "stub".into(),
                reason: format!("{step} unavailable"),
            });
        }
        let content = match step.as_str() {
            "intake" => r#"{"summary": "A short note", "urgency": "low"}"#.to_string(),
            "supervisor" => self.classification.clone(),
            "writer" => "You're welcome, happy to help!".to_string(),
            other => format!(r#"{{"summary": "{other} looked up"}}"#),
        };
        Ok(CompletionResponse {
            content,
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}

/// Serves a fixed inbox and records every reply.
#[derive(Default)]
pub struct StubMailbox {
    inbox: Vec<Message>,
    pub sent: Mutex<Vec<(String, String)>>,
}

impl StubMailbox {
    pub fn with_inbox(inbox: Vec<Message>) -> Self {
        Self {
            inbox,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl agent_inbox::channels::MailboxSource for StubMailbox {
    fn name(&self) -> &str {
        "stub"
    }

    async fn fetch_recent(&self, limit: usize) -> Result<Vec<Message>, ChannelError> {
        let start = self.inbox.len().saturating_sub(limit);
        Ok(self.inbox[start..].to_vec())
    }

    async fn send(&self, message: &Message, draft: &str) -> Result<(), ChannelError> {
        self.sent
            .lock()
            .unwrap()
            .push((message.id.clone(), draft.to_string()));
        Ok(())
    }
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        retry_backoff: Duration::ZERO,
        ..EngineConfig::default()
    }
}

/// Engine over `store` for both checkpoints and history.
pub fn engine<S>(llm: StubLlm, mailbox: Arc<StubMailbox>, store: Arc<S>) -> Engine
where
    S: agent_inbox::store::CheckpointStore + agent_inbox::store::RunHistory + 'static,
{
    Engine::new(
        EngineDeps {
            llm: Arc::new(llm),
            mailbox,
            checkpoints: store.clone(),
            history: store,
        },
        fast_config(),
    )
}

pub fn thanks(id: &str) -> Message {
    Message::new(id, "alice@example.com", "Re: report", "Thanks")
}
