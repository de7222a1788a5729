//! Orchestration engine.
//!
//! Drives each run through the step registry one step at a time under a
//! per-run mutex. Runs pause at human review by writing a checkpoint and
//! pick up again on `resume`, possibly in a different process.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::MailboxSource;
use crate::config::EngineConfig;
use crate::error::{EngineError, Error};
use crate::llm::provider::LlmProvider;
use crate::llm::retry::{RetryPolicy, retry};
use crate::store::{Checkpoint, CheckpointStore, RunHistory};
use crate::workflow::state::{
    Cursor, HumanDecision, Message, RunState, RunStatus, Specialist, StateUpdate, StepName,
    TaskResult,
};
use crate::workflow::steps::{Route, Step, StepRegistry};

/// Collaborators handed to the engine at construction.
#[derive(Clone)]
pub struct EngineDeps {
    pub llm: Arc<dyn LlmProvider>,
    pub mailbox: Arc<dyn MailboxSource>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub history: Arc<dyn RunHistory>,
}

pub struct Engine {
    registry: StepRegistry,
    checkpoints: Arc<dyn CheckpointStore>,
    history: Arc<dyn RunHistory>,
    config: EngineConfig,
    runs: RwLock<HashMap<Uuid, Arc<Mutex<RunState>>>>,
}

impl Engine {
    pub fn new(deps: EngineDeps, config: EngineConfig) -> Self {
        let registry = StepRegistry::standard(deps.llm, deps.mailbox, config.max_revisions);
        Self {
            registry,
            checkpoints: deps.checkpoints,
            history: deps.history,
            config,
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the behaviour registered for `step.name()`.
    pub fn with_step(mut self, step: Arc<dyn Step>) -> Self {
        self.registry.register(step);
        self
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.max_step_attempts, self.config.retry_backoff)
    }

    // ── Public operations ───────────────────────────────────────────

    /// Validate `message`, create a run, and drive it to its first
    /// suspension or terminal state.
    pub async fn start(&self, message: Message) -> Result<Uuid, Error> {
        message.validate()?;

        let state = RunState::new(message);
        let run_id = state.run_id;
        info!(run_id = %run_id, message_id = %state.message.id, "Run started");

        self.runs
            .write()
            .await
            .insert(run_id, Arc::new(Mutex::new(state)));
        self.drive(run_id).await?;
        Ok(run_id)
    }

    /// Advance a running run by one step. A fan-out batch is one step.
    /// Suspended and terminal runs are left as they are.
    pub async fn step(&self, run_id: Uuid) -> Result<RunStatus, Error> {
        let run = self.load_run(run_id).await?;
        let mut state = run.lock().await;
        if state.status != RunStatus::Running {
            return Ok(state.status);
        }
        self.advance(&mut state).await?;
        Ok(state.status)
    }

    /// Continue a run suspended at human review.
    ///
    /// On `accept` an `edited_draft` replaces the draft before sending; on
    /// `edit` it becomes feedback for the writer.
    pub async fn resume(
        &self,
        run_id: Uuid,
        decision: HumanDecision,
        edited_draft: Option<String>,
    ) -> Result<RunStatus, Error> {
        let run = self.load_run(run_id).await?;
        {
            let mut state = run.lock().await;
            if decision == HumanDecision::None {
                return Err(EngineError::InvalidState {
                    id: run_id,
                    status: state.status,
                    operation: "resume without a decision".into(),
                }
                .into());
            }
            if state.status != RunStatus::Suspended
                || state.cursor != Cursor::At(StepName::HumanReview)
            {
                return Err(EngineError::InvalidState {
                    id: run_id,
                    status: state.status,
                    operation: "resume".into(),
                }
                .into());
            }

            let mut updates = vec![StateUpdate::SetDecision(decision)];
            if let Some(text) = edited_draft.filter(|t| !t.trim().is_empty()) {
                match decision {
                    HumanDecision::Accept => updates.push(StateUpdate::SetDraft(text)),
                    HumanDecision::Edit => updates.push(StateUpdate::RecordFeedback(text)),
                    HumanDecision::Ignore | HumanDecision::None => {}
                }
            }

            let mut next = state.clone();
            for update in updates {
                next.apply(update)
                    .map_err(|reason| EngineError::InvariantViolation { id: run_id, reason })?;
            }
            next.transition_to(RunStatus::Running, Some(format!("resumed with {decision}")))
                .map_err(|reason| EngineError::InvariantViolation { id: run_id, reason })?;
            next.cursor = Cursor::At(StepName::Router);

            self.checkpoints.delete(run_id).await?;
            *state = next;
            info!(run_id = %run_id, decision = %decision, "Run resumed");
        }
        self.drive(run_id).await
    }

    /// Snapshot of a run, live or persisted.
    pub async fn get_state(&self, run_id: Uuid) -> Result<RunState, Error> {
        if let Some(run) = self.runs.read().await.get(&run_id).cloned() {
            return Ok(run.lock().await.clone());
        }
        if let Some(checkpoint) = self.checkpoints.load(run_id).await? {
            return Ok(checkpoint.state);
        }
        if let Some(state) = self.history.get(run_id).await? {
            return Ok(state);
        }
        Err(EngineError::NotFound { id: run_id }.into())
    }

    /// Runs waiting for a human decision.
    pub async fn list_suspended(&self) -> Result<Vec<Checkpoint>, Error> {
        Ok(self.checkpoints.list().await?)
    }

    // ── Execution ───────────────────────────────────────────────────

    async fn drive(&self, run_id: Uuid) -> Result<RunStatus, Error> {
        loop {
            let status = self.step(run_id).await?;
            if status == RunStatus::Running {
                continue;
            }
            if status.is_terminal() {
                // Terminal runs are answered from run history from here on.
                self.runs.write().await.remove(&run_id);
            }
            return Ok(status);
        }
    }

    /// Find a run in memory, or restore it from a checkpoint. Terminal runs
    /// come back from history without being cached.
    async fn load_run(&self, run_id: Uuid) -> Result<Arc<Mutex<RunState>>, Error> {
        if let Some(run) = self.runs.read().await.get(&run_id).cloned() {
            return Ok(run);
        }
        if let Some(checkpoint) = self.checkpoints.load(run_id).await? {
            debug!(run_id = %run_id, step = %checkpoint.step, "Run restored from checkpoint");
            let mut runs = self.runs.write().await;
            let run = runs
                .entry(run_id)
                .or_insert_with(|| Arc::new(Mutex::new(checkpoint.state)))
                .clone();
            return Ok(run);
        }
        if let Some(state) = self.history.get(run_id).await? {
            return Ok(Arc::new(Mutex::new(state)));
        }
        Err(EngineError::NotFound { id: run_id }.into())
    }

    async fn advance(&self, state: &mut RunState) -> Result<(), Error> {
        match state.cursor.clone() {
            Cursor::At(name) => self.run_single(state, name).await,
            Cursor::FanOut(specialists) => self.run_fan_out(state, specialists).await,
            Cursor::Halted => {
                self.invariant_violation(
                    state,
                    StepName::Supervisor,
                    "cursor halted while running".into(),
                )
                .await
            }
        }
    }

    async fn run_single(&self, state: &mut RunState, name: StepName) -> Result<(), Error> {
        if name == StepName::Supervisor
            && state.supervisor_visits >= self.config.max_supervisor_visits
        {
            let error = format!(
                "supervisor visited {} times without reaching the writer",
                state.supervisor_visits
            );
            return self.fail_run(state, name, error).await;
        }

        let Some(step) = self.registry.get(name) else {
            return self
                .fail_run(state, name, format!("no step registered for {name}"))
                .await;
        };

        debug!(run_id = %state.run_id, step = %name, "Executing step");
        let snapshot = state.clone();
        let result = if name == StepName::Send {
            // Irreversible: exactly one attempt.
            step.run(&snapshot).await
        } else {
            let step_ref = step.as_ref();
            let snap = &snapshot;
            retry(self.policy(), name.as_str(), move |_| step_ref.run(snap)).await
        };

        let transition = match result {
            Ok(transition) => transition,
            Err(e) => return self.fail_run(state, name, e.to_string()).await,
        };

        let mut next = state.clone();
        let visit = (name == StepName::Supervisor).then_some(StateUpdate::SupervisorVisited);
        for update in visit.into_iter().chain(transition.updates) {
            if let Err(reason) = next.apply(update) {
                return self.invariant_violation(state, name, reason).await;
            }
        }
        self.follow_route(state, next, name, transition.route).await
    }

    /// Run every dispatched specialist against one snapshot and apply their
    /// results together.
    async fn run_fan_out(
        &self,
        state: &mut RunState,
        specialists: Vec<Specialist>,
    ) -> Result<(), Error> {
        let snapshot = state.clone();
        let policy = self.policy();
        let run_id = state.run_id;

        let tasks = specialists.iter().map(|&specialist| {
            let step = self.registry.get(specialist.step_name());
            let snapshot = &snapshot;
            async move {
                let outcome = match step {
                    Some(step) => {
                        let step_ref = step.as_ref();
                        retry(policy, specialist.as_str(), move |_| step_ref.run(snapshot))
                            .await
                            .map_err(|e| e.to_string())
                    }
                    None => Err(format!("no step registered for {specialist}")),
                };
                (specialist, outcome)
            }
        });
        let outcomes = join_all(tasks).await;

        let mut next = state.clone();
        for (specialist, outcome) in outcomes {
            let unresolved = match outcome {
                Ok(transition) => {
                    let mut resolved = false;
                    for update in transition.updates {
                        if !matches!(&update, StateUpdate::TaskResolved(s, _) if *s == specialist) {
                            let reason = format!("{specialist} returned a foreign update: {update:?}");
                            return self
                                .invariant_violation(state, specialist.step_name(), reason)
                                .await;
                        }
                        resolved = true;
                        if let Err(reason) = next.apply(update) {
                            return self
                                .invariant_violation(state, specialist.step_name(), reason)
                                .await;
                        }
                    }
                    (!resolved).then(|| "step returned without resolving".to_string())
                }
                Err(error) => Some(error),
            };

            if let Some(error) = unresolved {
                warn!(
                    run_id = %run_id,
                    step = %specialist,
                    error = %error,
                    "Specialist unavailable"
                );
                let marker = StateUpdate::TaskResolved(specialist, TaskResult::Unavailable { error });
                if let Err(reason) = next.apply(marker) {
                    return self
                        .invariant_violation(state, specialist.step_name(), reason)
                        .await;
                }
            }
        }

        next.cursor = Cursor::At(StepName::Supervisor);
        *state = next;
        Ok(())
    }

    async fn follow_route(
        &self,
        state: &mut RunState,
        mut next: RunState,
        step: StepName,
        route: Route,
    ) -> Result<(), Error> {
        match route {
            Route::Next(target) => {
                next.cursor = Cursor::At(target);
                *state = next;
            }
            Route::FanOut(specialists) => {
                next.cursor = Cursor::FanOut(specialists);
                *state = next;
            }
            Route::Suspend => {
                if let Err(reason) =
                    next.transition_to(RunStatus::Suspended, Some("awaiting review".into()))
                {
                    return self.invariant_violation(state, step, reason).await;
                }
                // Durable first: a failed write leaves the run running here.
                self.checkpoints.save(&Checkpoint::of(&next)).await?;
                *state = next;
                info!(
                    run_id = %state.run_id,
                    message_id = %state.message.id,
                    "Run suspended for review"
                );
            }
            Route::Complete(outcome) => {
                if let Err(reason) = next.complete(outcome) {
                    return self.invariant_violation(state, step, reason).await;
                }
                *state = next;
                self.finalize(state).await?;
            }
            Route::Fail(reason) => {
                *state = next;
                self.fail_run(state, step, reason).await?;
            }
        }
        Ok(())
    }

    async fn fail_run(
        &self,
        state: &mut RunState,
        step: StepName,
        error: String,
    ) -> Result<(), Error> {
        warn!(run_id = %state.run_id, step = %step, error = %error, "Run failed");
        state.fail(step, error);
        self.finalize(state).await
    }

    async fn invariant_violation(
        &self,
        state: &mut RunState,
        step: StepName,
        reason: String,
    ) -> Result<(), Error> {
        let err = EngineError::InvariantViolation {
            id: state.run_id,
            reason,
        };
        let snapshot = serde_json::to_string(&*state).unwrap_or_default();
        error!(
            run_id = %state.run_id,
            step = %step,
            state = %snapshot,
            error = %err,
            "Invariant violated"
        );
        self.fail_run(state, step, err.to_string()).await
    }

    /// History first: a failed write leaves the checkpoint as the durable copy.
    async fn finalize(&self, state: &RunState) -> Result<(), Error> {
        self.history.record_terminal(state).await?;
        self.checkpoints.delete(state.run_id).await?;
        info!(
            run_id = %state.run_id,
            status = %state.status,
            outcome = ?state.outcome,
            "Run finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::{ChannelError, LlmError, StepError};
    use crate::llm::provider::{CompletionRequest, CompletionResponse, FinishReason};
    use crate::store::InMemoryStore;
    use crate::workflow::prompts::STEP_METADATA_KEY;
    use crate::workflow::state::Outcome;
    use crate::workflow::steps::Transition;

    /// Answers by step; the supervisor gets `classification`.
    struct ScriptedLlm {
        classification: &'static str,
        writer_failures: AtomicU32,
    }

    impl ScriptedLlm {
        fn new(classification: &'static str) -> Self {
            Self {
                classification,
                writer_failures: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            let step = request
                .metadata
                .get(STEP_METADATA_KEY)
                .cloned()
                .unwrap_or_default();
            let content = match step.as_str() {
                "intake" => r#"{"summary": "thanks", "urgency": "low"}"#.to_string(),
                "supervisor" => self.classification.to_string(),
                "writer" => {
                    if self.writer_failures.load(Ordering::SeqCst) > 0 {
                        self.writer_failures.fetch_sub(1, Ordering::SeqCst);
                        return Err(LlmError::RequestFailed {
                            provider: "scripted".into(),
                            reason: "flaky".into(),
                        });
                    }
                    "You're welcome!".to_string()
                }
                other => format!(r#"{{"summary": "{other} data"}}"#),
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

    #[derive(Default)]
    struct RecordingMailbox {
        sent: std::sync::Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl MailboxSource for RecordingMailbox {
        fn name(&self) -> &str {
            "recording"
        }

        async fn fetch_recent(&self, _limit: usize) -> Result<Vec<Message>, ChannelError> {
            Ok(Vec::new())
        }

        async fn send(&self, _message: &Message, draft: &str) -> Result<(), ChannelError> {
            if self.fail {
                return Err(ChannelError::SendFailed {
                    name: "recording".into(),
                    reason: "rejected".into(),
                });
            }
            self.sent.lock().unwrap().push(draft.to_string());
            Ok(())
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            retry_backoff: Duration::ZERO,
            ..EngineConfig::default()
        }
    }

    fn engine_with(
        llm: ScriptedLlm,
        mailbox: Arc<RecordingMailbox>,
        store: Arc<InMemoryStore>,
    ) -> Engine {
        Engine::new(
            EngineDeps {
                llm: Arc::new(llm),
                mailbox,
                checkpoints: store.clone(),
                history: store,
            },
            config(),
        )
    }

    fn thanks() -> Message {
        Message::new("m1", "alice@example.com", "Re: report", "Thanks")
    }

    const SIMPLE: &str = r#"{"intent": "simple_direct"}"#;

    #[tokio::test]
    async fn start_suspends_at_review() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_with(
            ScriptedLlm::new(SIMPLE),
            Arc::new(RecordingMailbox::default()),
            store.clone(),
        );

        let run_id = engine.start(thanks()).await.unwrap();
        let state = engine.get_state(run_id).await.unwrap();
        assert_eq!(state.status, RunStatus::Suspended);
        assert_eq!(state.cursor, Cursor::At(StepName::HumanReview));
        assert_eq!(state.draft.as_deref(), Some("You're welcome!"));
        assert!(store.load(run_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invalid_message_creates_no_run() {
        let engine = engine_with(
            ScriptedLlm::new(SIMPLE),
            Arc::new(RecordingMailbox::default()),
            Arc::new(InMemoryStore::new()),
        );
        let err = engine
            .start(Message::new("m1", "alice@example.com", "s", "  "))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(engine.runs.read().await.is_empty());
    }

    #[tokio::test]
    async fn transient_writer_failures_are_retried() {
        let llm = ScriptedLlm::new(SIMPLE);
        llm.writer_failures.store(2, Ordering::SeqCst);
        let engine = engine_with(
            llm,
            Arc::new(RecordingMailbox::default()),
            Arc::new(InMemoryStore::new()),
        );
        let run_id = engine.start(thanks()).await.unwrap();
        assert_eq!(
            engine.get_state(run_id).await.unwrap().status,
            RunStatus::Suspended
        );
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_run() {
        let llm = ScriptedLlm::new(SIMPLE);
        llm.writer_failures.store(10, Ordering::SeqCst);
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_with(llm, Arc::new(RecordingMailbox::default()), store.clone());

        let run_id = engine.start(thanks()).await.unwrap();
        let state = engine.get_state(run_id).await.unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.failure.unwrap().step, StepName::Writer);
        assert!(store.load(run_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ignore_completes_without_sending() {
        let mailbox = Arc::new(RecordingMailbox::default());
        let engine = engine_with(
            ScriptedLlm::new(SIMPLE),
            mailbox.clone(),
            Arc::new(InMemoryStore::new()),
        );
        let run_id = engine.start(thanks()).await.unwrap();
        let status = engine
            .resume(run_id, HumanDecision::Ignore, None)
            .await
            .unwrap();
        assert_eq!(status, RunStatus::Completed);
        assert_eq!(
            engine.get_state(run_id).await.unwrap().outcome,
            Some(Outcome::Ignored)
        );
        assert!(mailbox.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn accept_with_edited_draft_sends_edit() {
        let mailbox = Arc::new(RecordingMailbox::default());
        let engine = engine_with(
            ScriptedLlm::new(SIMPLE),
            mailbox.clone(),
            Arc::new(InMemoryStore::new()),
        );
        let run_id = engine.start(thanks()).await.unwrap();
        engine
            .resume(run_id, HumanDecision::Accept, Some("Cheers!".into()))
            .await
            .unwrap();
        assert_eq!(*mailbox.sent.lock().unwrap(), vec!["Cheers!".to_string()]);
    }

    #[tokio::test]
    async fn send_failure_is_not_retried() {
        let mailbox = Arc::new(RecordingMailbox {
            fail: true,
            ..Default::default()
        });
        let engine = engine_with(
            ScriptedLlm::new(SIMPLE),
            mailbox,
            Arc::new(InMemoryStore::new()),
        );
        let run_id = engine.start(thanks()).await.unwrap();
        let status = engine
            .resume(run_id, HumanDecision::Accept, None)
            .await
            .unwrap();
        assert_eq!(status, RunStatus::Failed);
        let failure = engine.get_state(run_id).await.unwrap().failure.unwrap();
        assert_eq!(failure.step, StepName::Send);
    }

    #[tokio::test]
    async fn resume_rejects_wrong_state_and_none() {
        let engine = engine_with(
            ScriptedLlm::new(SIMPLE),
            Arc::new(RecordingMailbox::default()),
            Arc::new(InMemoryStore::new()),
        );
        let err = engine
            .resume(Uuid::new_v4(), HumanDecision::Accept, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Engine(EngineError::NotFound { .. })));

        let run_id = engine.start(thanks()).await.unwrap();
        let err = engine
            .resume(run_id, HumanDecision::None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Engine(EngineError::InvalidState { .. })));

        engine
            .resume(run_id, HumanDecision::Accept, None)
            .await
            .unwrap();
        let err = engine
            .resume(run_id, HumanDecision::Accept, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Engine(EngineError::InvalidState {
                status: RunStatus::Completed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn failed_checkpoint_write_keeps_run_at_review() {
        let store = Arc::new(InMemoryStore::new());
        store.set_fail_writes(true);
        let engine = engine_with(
            ScriptedLlm::new(SIMPLE),
            Arc::new(RecordingMailbox::default()),
            store.clone(),
        );

        let err = engine.start(thanks()).await.unwrap_err();
        assert!(matches!(err, Error::Database(_)));

        let run_id = *engine.runs.read().await.keys().next().unwrap();
        let state = engine.get_state(run_id).await.unwrap();
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.cursor, Cursor::At(StepName::HumanReview));

        store.set_fail_writes(false);
        assert_eq!(engine.step(run_id).await.unwrap(), RunStatus::Suspended);
        assert!(store.load(run_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn step_is_noop_for_suspended_and_unknown_is_not_found() {
        let engine = engine_with(
            ScriptedLlm::new(SIMPLE),
            Arc::new(RecordingMailbox::default()),
            Arc::new(InMemoryStore::new()),
        );
        let run_id = engine.start(thanks()).await.unwrap();
        assert_eq!(engine.step(run_id).await.unwrap(), RunStatus::Suspended);
        assert!(matches!(
            engine.step(Uuid::new_v4()).await,
            Err(Error::Engine(EngineError::NotFound { .. }))
        ));
    }

    /// A specialist that returns without resolving its task.
    struct SilentCalendar;

    #[async_trait]
    impl Step for SilentCalendar {
        fn name(&self) -> StepName {
            StepName::Calendar
        }

        async fn run(&self, _state: &RunState) -> Result<Transition, StepError> {
            Ok(Transition::to(Route::Next(StepName::Supervisor)))
        }
    }

    #[tokio::test]
    async fn unresolved_specialist_is_marked_unavailable() {
        let engine = engine_with(
            ScriptedLlm::new(r#"{"intent": "meeting_request"}"#),
            Arc::new(RecordingMailbox::default()),
            Arc::new(InMemoryStore::new()),
        )
        .with_step(Arc::new(SilentCalendar));

        let run_id = engine.start(thanks()).await.unwrap();
        let state = engine.get_state(run_id).await.unwrap();
        assert_eq!(state.status, RunStatus::Suspended);
        assert!(matches!(
            state.task_results.get(&Specialist::Calendar),
            Some(TaskResult::Unavailable { .. })
        ));
    }

    /// Calendar stand-in that reports for another specialist.
    struct CrossCalendar;

    #[async_trait]
    impl Step for CrossCalendar {
        fn name(&self) -> StepName {
            StepName::Calendar
        }

        async fn run(&self, _state: &RunState) -> Result<Transition, StepError> {
            Ok(Transition::with(
                vec![StateUpdate::TaskResolved(
                    Specialist::Crm,
                    TaskResult::Completed {
                        summary: "not mine".into(),
                        data: serde_json::Value::Null,
                    },
                )],
                Route::Next(StepName::Supervisor),
            ))
        }
    }

    /// Calendar stand-in that resolves its task and also writes feedback.
    struct MeddlingCalendar;

    #[async_trait]
    impl Step for MeddlingCalendar {
        fn name(&self) -> StepName {
            StepName::Calendar
        }

        async fn run(&self, _state: &RunState) -> Result<Transition, StepError> {
            Ok(Transition::with(
                vec![
                    StateUpdate::TaskResolved(
                        Specialist::Calendar,
                        TaskResult::Completed {
                            summary: "free Tuesday".into(),
                            data: serde_json::Value::Null,
                        },
                    ),
                    StateUpdate::RecordFeedback("make it shorter".into()),
                ],
                Route::Next(StepName::Supervisor),
            ))
        }
    }

    #[tokio::test]
    async fn specialist_resolving_another_task_fails_the_run() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_with(
            ScriptedLlm::new(r#"{"intent": "meeting_request"}"#),
            Arc::new(RecordingMailbox::default()),
            store.clone(),
        )
        .with_step(Arc::new(CrossCalendar));

        let run_id = engine.start(thanks()).await.unwrap();
        let state = engine.get_state(run_id).await.unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        let failure = state.failure.unwrap();
        assert_eq!(failure.step, StepName::Calendar);
        assert!(failure.error.contains("Invariant"), "{}", failure.error);
        assert!(state.task_results.is_empty());
        assert!(store.load(run_id).await.unwrap().is_none());
        assert!(store.get(run_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn specialist_writing_outside_its_task_fails_the_run() {
        let engine = engine_with(
            ScriptedLlm::new(r#"{"intent": "meeting_request"}"#),
            Arc::new(RecordingMailbox::default()),
            Arc::new(InMemoryStore::new()),
        )
        .with_step(Arc::new(MeddlingCalendar));

        let run_id = engine.start(thanks()).await.unwrap();
        let state = engine.get_state(run_id).await.unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.failure.unwrap().step, StepName::Calendar);
        assert!(state.feedback.is_empty());
        assert!(state.task_results.is_empty());
    }

    /// Writer stand-in whose update the reducer rejects.
    struct UndispatchedWriter;

    #[async_trait]
    impl Step for UndispatchedWriter {
        fn name(&self) -> StepName {
            StepName::Writer
        }

        async fn run(&self, _state: &RunState) -> Result<Transition, StepError> {
            Ok(Transition::with(
                vec![StateUpdate::TaskResolved(
                    Specialist::Calendar,
                    TaskResult::Unavailable {
                        error: "never asked".into(),
                    },
                )],
                Route::Next(StepName::HumanReview),
            ))
        }
    }

    #[tokio::test]
    async fn rejected_update_fails_the_run_at_that_step() {
        let engine = engine_with(
            ScriptedLlm::new(SIMPLE),
            Arc::new(RecordingMailbox::default()),
            Arc::new(InMemoryStore::new()),
        )
        .with_step(Arc::new(UndispatchedWriter));

        let run_id = engine.start(thanks()).await.unwrap();
        let state = engine.get_state(run_id).await.unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        let failure = state.failure.unwrap();
        assert_eq!(failure.step, StepName::Writer);
        assert!(failure.error.contains("without being dispatched"));
        assert!(state.draft.is_none());
    }

    #[tokio::test]
    async fn supervisor_visits_count_toward_the_cap() {
        let engine = Engine::new(
            EngineDeps {
                llm: Arc::new(ScriptedLlm::new(r#"{"intent": "meeting_request"}"#)),
                mailbox: Arc::new(RecordingMailbox::default()),
                checkpoints: Arc::new(InMemoryStore::new()),
                history: Arc::new(InMemoryStore::new()),
            },
            EngineConfig {
                max_supervisor_visits: 1,
                ..config()
            },
        );

        // Classify and dispatch is one visit; the join would be the second.
        let run_id = engine.start(thanks()).await.unwrap();
        let state = engine.get_state(run_id).await.unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        let failure = state.failure.unwrap();
        assert_eq!(failure.step, StepName::Supervisor);
        assert!(failure.error.contains("visited 1 times"));
    }

    #[tokio::test]
    async fn failed_history_write_keeps_checkpoint() {
        let checkpoints = Arc::new(InMemoryStore::new());
        let history = Arc::new(InMemoryStore::new());
        let engine = Engine::new(
            EngineDeps {
                llm: Arc::new(ScriptedLlm::new(SIMPLE)),
                mailbox: Arc::new(RecordingMailbox::default()),
                checkpoints: checkpoints.clone(),
                history: history.clone(),
            },
            config(),
        );

        let mut state = RunState::new(thanks());
        checkpoints.save(&Checkpoint::of(&state)).await.unwrap();
        state.fail(StepName::Writer, String::from("gave up"));

        history.set_fail_writes(true);
        let err = engine.finalize(&state).await.unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        assert!(checkpoints.load(state.run_id).await.unwrap().is_some());

        history.set_fail_writes(false);
        engine.finalize(&state).await.unwrap();
        assert!(checkpoints.load(state.run_id).await.unwrap().is_none());
        assert!(history.get(state.run_id).await.unwrap().is_some());
    }
}
