//! Step behaviours and the registry that maps step names to them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::channels::MailboxSource;
use crate::error::StepError;
use crate::llm::provider::LlmProvider;
use crate::workflow::prompts;
use crate::workflow::state::{
    HumanDecision, Outcome, RunState, Specialist, StateUpdate, StepName,
};
use crate::workflow::supervisor::SupervisorStep;

/// Where the run goes after a step.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Next(StepName),
    FanOut(Vec<Specialist>),
    /// Pause for a human decision.
    Suspend,
    Complete(Outcome),
    /// Terminate as failed at the current step.
    Fail(String),
}

/// A step's output: updates for the reducer plus a routing decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub updates: Vec<StateUpdate>,
    pub route: Route,
}

impl Transition {
    pub fn to(route: Route) -> Self {
        Self {
            updates: Vec::new(),
            route,
        }
    }

    pub fn with(updates: Vec<StateUpdate>, route: Route) -> Self {
        Self { updates, route }
    }
}

/// One node of the routing graph.
///
/// Steps read a snapshot and never mutate it; the engine applies the
/// returned updates.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> StepName;

    async fn run(&self, state: &RunState) -> Result<Transition, StepError>;
}

/// Step name to behaviour.
#[derive(Clone)]
pub struct StepRegistry {
    steps: HashMap<StepName, Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn empty() -> Self {
        Self {
            steps: HashMap::new(),
        }
    }

    /// The full routing graph backed by `llm` and `mailbox`.
    pub fn standard(
        llm: Arc<dyn LlmProvider>,
        mailbox: Arc<dyn MailboxSource>,
        max_revisions: u32,
    ) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(IntakeStep::new(llm.clone())));
        registry.register(Arc::new(SupervisorStep::new(llm.clone())));
        for specialist in Specialist::ALL {
            registry.register(Arc::new(SpecialistStep::new(specialist, llm.clone())));
        }
        registry.register(Arc::new(WriterStep::new(llm)));
        registry.register(Arc::new(HumanReviewStep));
        registry.register(Arc::new(RouterStep::new(max_revisions)));
        registry.register(Arc::new(SendStep::new(mailbox)));
        registry
    }

    /// Register (or replace) the behaviour for `step.name()`.
    pub fn register(&mut self, step: Arc<dyn Step>) {
        self.steps.insert(step.name(), step);
    }

    pub fn get(&self, name: StepName) -> Option<Arc<dyn Step>> {
        self.steps.get(&name).cloned()
    }
}

// ── Intake ──────────────────────────────────────────────────────────

/// Extracts structured context from the message.
pub struct IntakeStep {
    llm: Arc<dyn LlmProvider>,
}

impl IntakeStep {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Step for IntakeStep {
    fn name(&self) -> StepName {
        StepName::Intake
    }

    async fn run(&self, state: &RunState) -> Result<Transition, StepError> {
        let response = self
            .llm
            .complete(prompts::intake_request(&state.message))
            .await
            .map_err(|e| StepError::transient(StepName::Intake, e.to_string()))?;
        let context = prompts::parse_context(&response.content)
            .map_err(|e| StepError::malformed(StepName::Intake, e))?;

        debug!(
            run_id = %state.run_id,
            entities = context.key_entities.len(),
            urgency = ?context.urgency,
            "Context extracted"
        );
        Ok(Transition::with(
            vec![StateUpdate::SetContext(context)],
            Route::Next(StepName::Supervisor),
        ))
    }
}

// ── Specialists ─────────────────────────────────────────────────────

/// Calendar, document, or CRM data gathering.
pub struct SpecialistStep {
    specialist: Specialist,
    llm: Arc<dyn LlmProvider>,
}

impl SpecialistStep {
    pub fn new(specialist: Specialist, llm: Arc<dyn LlmProvider>) -> Self {
        Self { specialist, llm }
    }
}

#[async_trait]
impl Step for SpecialistStep {
    fn name(&self) -> StepName {
        self.specialist.step_name()
    }

    async fn run(&self, state: &RunState) -> Result<Transition, StepError> {
        let step = self.name();
        let response = self
            .llm
            .complete(prompts::specialist_request(self.specialist, state))
            .await
            .map_err(|e| StepError::transient(step, e.to_string()))?;
        let result =
            prompts::parse_task_result(&response.content).map_err(|e| StepError::malformed(step, e))?;

        Ok(Transition::with(
            vec![StateUpdate::TaskResolved(self.specialist, result)],
            Route::Next(StepName::Supervisor),
        ))
    }
}

// ── Writer ──────────────────────────────────────────────────────────

/// Drafts the reply from context, gathered results, and feedback.
pub struct WriterStep {
    llm: Arc<dyn LlmProvider>,
}

impl WriterStep {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Step for WriterStep {
    fn name(&self) -> StepName {
        StepName::Writer
    }

    async fn run(&self, state: &RunState) -> Result<Transition, StepError> {
        let response = self
            .llm
            .complete(prompts::writer_request(state))
            .await
            .map_err(|e| StepError::transient(StepName::Writer, e.to_string()))?;
        let draft = prompts::parse_draft(&response.content)
            .map_err(|e| StepError::malformed(StepName::Writer, e))?;

        Ok(Transition::with(
            vec![StateUpdate::SetDraft(draft)],
            Route::Next(StepName::HumanReview),
        ))
    }
}

// ── Human review ────────────────────────────────────────────────────

/// Suspends the run until a decision arrives.
pub struct HumanReviewStep;

#[async_trait]
impl Step for HumanReviewStep {
    fn name(&self) -> StepName {
        StepName::HumanReview
    }

    async fn run(&self, state: &RunState) -> Result<Transition, StepError> {
        if state.draft.is_none() {
            return Ok(Transition::to(Route::Fail(
                "human review reached without a draft".into(),
            )));
        }
        Ok(Transition::to(Route::Suspend))
    }
}

// ── Router ──────────────────────────────────────────────────────────

/// Consumes the human decision.
pub struct RouterStep {
    max_revisions: u32,
}

impl RouterStep {
    pub fn new(max_revisions: u32) -> Self {
        Self { max_revisions }
    }
}

#[async_trait]
impl Step for RouterStep {
    fn name(&self) -> StepName {
        StepName::Router
    }

    async fn run(&self, state: &RunState) -> Result<Transition, StepError> {
        let transition = match state.human_decision {
            HumanDecision::Accept => Transition::with(
                vec![StateUpdate::ConsumeDecision],
                Route::Next(StepName::Send),
            ),
            HumanDecision::Ignore => Transition::with(
                vec![StateUpdate::ConsumeDecision],
                Route::Complete(Outcome::Ignored),
            ),
            HumanDecision::Edit if state.revision >= self.max_revisions => {
                Transition::to(Route::Fail(format!(
                    "revision limit reached after {} edits",
                    state.revision
                )))
            }
            HumanDecision::Edit => Transition::with(
                vec![StateUpdate::ConsumeDecision, StateUpdate::ResetForEdit],
                Route::Next(StepName::Supervisor),
            ),
            HumanDecision::None => {
                Transition::to(Route::Fail("router reached without a decision".into()))
            }
        };
        Ok(transition)
    }
}

// ── Send ────────────────────────────────────────────────────────────

/// Delivers the approved draft. The only irreversible step.
pub struct SendStep {
    mailbox: Arc<dyn MailboxSource>,
}

impl SendStep {
    pub fn new(mailbox: Arc<dyn MailboxSource>) -> Self {
        Self { mailbox }
    }
}

#[async_trait]
impl Step for SendStep {
    fn name(&self) -> StepName {
        StepName::Send
    }

    async fn run(&self, state: &RunState) -> Result<Transition, StepError> {
        let draft = state.draft.as_deref().ok_or_else(|| StepError::SideEffect {
            step: StepName::Send,
            reason: "no draft to send".into(),
        })?;

        self.mailbox
            .send(&state.message, draft)
            .await
            .map_err(|e| StepError::SideEffect {
                step: StepName::Send,
                reason: e.to_string(),
            })?;

        info!(
            run_id = %state.run_id,
            message_id = %state.message.id,
            to = %state.message.sender,
            "Reply sent"
        );
        Ok(Transition::to(Route::Complete(Outcome::Sent)))
    }
}
