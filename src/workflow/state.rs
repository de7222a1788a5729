//! Run state, status machine, and the reducer that applies step output.
//!
//! Steps never mutate a run directly. They return a list of [`StateUpdate`]s
//! which the engine folds into the run through [`RunState::apply`]; that is
//! the single place the run invariants are checked.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Maximum number of status transitions kept per run.
const MAX_TRANSITIONS: usize = 200;

// ── Message ─────────────────────────────────────────────────────────

/// An ingested email. Never mutated after ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Source-assigned identifier, stable across fetches.
    pub id: String,
    pub sender: String,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    /// Provider thread identifier, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// RFC 5322 `Message-ID` header, used for reply threading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
}

impl Message {
    /// Build a message with the required fields; the rest default to empty.
    pub fn new(
        id: impl Into<String>,
        sender: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            sender: sender.into(),
            recipients: Vec::new(),
            subject: subject.into(),
            body: body.into(),
            received_at: Utc::now(),
            thread_id: None,
            reply_to_message_id: None,
        }
    }

    /// Identifier, sender and body must be non-blank.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::MissingField("id"));
        }
        if self.sender.trim().is_empty() {
            return Err(ValidationError::MissingField("sender"));
        }
        if self.body.trim().is_empty() {
            return Err(ValidationError::MissingField("body"));
        }
        Ok(())
    }
}

// ── Extracted context ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    #[default]
    Medium,
    High,
}

/// Facts extracted by intake. Written once, read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_entities: Vec<String>,
    #[serde(default)]
    pub requested_actions: Vec<String>,
    #[serde(default)]
    pub urgency: Urgency,
}

// ── Enumerations ────────────────────────────────────────────────────

/// What the sender wants, as classified by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    SimpleDirect,
    MeetingRequest,
    DocumentRequest,
    TaskDelegation,
}

impl Intent {
    /// The specialized step this intent always needs, if any.
    pub fn base_requirement(&self) -> Option<Specialist> {
        match self {
            Self::SimpleDirect => None,
            Self::MeetingRequest => Some(Specialist::Calendar),
            Self::DocumentRequest => Some(Specialist::Document),
            Self::TaskDelegation => Some(Specialist::Crm),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "simple_direct" => Some(Self::SimpleDirect),
            "meeting_request" => Some(Self::MeetingRequest),
            "document_request" => Some(Self::DocumentRequest),
            "task_delegation" => Some(Self::TaskDelegation),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SimpleDirect => "simple_direct",
            Self::MeetingRequest => "meeting_request",
            Self::DocumentRequest => "document_request",
            Self::TaskDelegation => "task_delegation",
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dynamically dispatched data-gathering steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Specialist {
    Calendar,
    Document,
    Crm,
}

impl Specialist {
    pub const ALL: [Specialist; 3] = [Self::Calendar, Self::Document, Self::Crm];

    pub fn step_name(&self) -> StepName {
        match self {
            Self::Calendar => StepName::Calendar,
            Self::Document => StepName::Document,
            Self::Crm => StepName::Crm,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "calendar" => Some(Self::Calendar),
            "document" | "documents" | "rag" => Some(Self::Document),
            "crm" | "contacts" => Some(Self::Crm),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.step_name().as_str()
    }
}

impl std::fmt::Display for Specialist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every step in the routing graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Intake,
    Supervisor,
    Calendar,
    Document,
    Crm,
    Writer,
    HumanReview,
    Router,
    Send,
}

impl StepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Supervisor => "supervisor",
            Self::Calendar => "calendar",
            Self::Document => "document",
            Self::Crm => "crm",
            Self::Writer => "writer",
            Self::HumanReview => "human_review",
            Self::Router => "router",
            Self::Send => "send",
        }
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Suspended,
    Completed,
    Failed,
}

impl RunStatus {
    /// Monotone except `suspended -> running` on resume.
    pub fn can_transition_to(&self, target: RunStatus) -> bool {
        use RunStatus::*;

        matches!(
            (self, target),
            (Running, Suspended) | (Running, Completed) | (Running, Failed) |
            (Suspended, Running)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision supplied by a human on resume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanDecision {
    #[default]
    None,
    Accept,
    Edit,
    Ignore,
}

impl std::fmt::Display for HumanDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Accept => "accept",
            Self::Edit => "edit",
            Self::Ignore => "ignore",
        };
        f.write_str(s)
    }
}

/// Output of a specialized step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskResult {
    Completed {
        summary: String,
        #[serde(default)]
        data: serde_json::Value,
    },
    /// The step did not resolve; the writer drafts without its data.
    Unavailable { error: String },
}

impl TaskResult {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Where a running run continues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum Cursor {
    At(StepName),
    FanOut(Vec<Specialist>),
    Halted,
}

impl Cursor {
    /// The step name reported for diagnostics and checkpoints.
    pub fn step(&self) -> Option<StepName> {
        match self {
            Self::At(step) => Some(*step),
            Self::FanOut(_) => Some(StepName::Supervisor),
            Self::Halted => None,
        }
    }
}

/// How a successfully terminated run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Sent,
    Ignored,
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub step: StepName,
    pub error: String,
}

/// A status transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: RunStatus,
    pub to: RunStatus,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

// ── State updates ───────────────────────────────────────────────────

/// A single change a step asks the engine to make.
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    /// Intake output. Write-once.
    SetContext(Context),
    /// Supervisor classification. Only when no intent is set.
    SetIntent {
        intent: Intent,
        requirements: BTreeSet<Specialist>,
    },
    /// Mark specialists as dispatched.
    Dispatch(Vec<Specialist>),
    /// A dispatched specialist reported.
    TaskResolved(Specialist, TaskResult),
    /// Writer output. Requires an empty pending set and a classified intent.
    SetDraft(String),
    /// Set by resume only.
    SetDecision(HumanDecision),
    /// Router consumed the decision.
    ConsumeDecision,
    /// Human feedback for the next writer cycle.
    RecordFeedback(String),
    /// Edit loop: discard gathered data, keep intent and requirements.
    ResetForEdit,
    /// Counts supervisor visits within the current writer cycle.
    SupervisorVisited,
}

// ── Run state ───────────────────────────────────────────────────────

/// Everything a run carries through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub message: Message,
    pub context: Option<Context>,
    pub intent: Option<Intent>,
    #[serde(default)]
    pub requirements: BTreeSet<Specialist>,
    #[serde(default)]
    pub pending_tasks: BTreeSet<Specialist>,
    #[serde(default)]
    pub task_results: BTreeMap<Specialist, TaskResult>,
    pub draft: Option<String>,
    #[serde(default)]
    pub human_decision: HumanDecision,
    pub status: RunStatus,
    pub cursor: Cursor,
    #[serde(default)]
    pub feedback: Vec<String>,
    #[serde(default)]
    pub revision: u32,
    #[serde(default)]
    pub supervisor_visits: u32,
    pub outcome: Option<Outcome>,
    pub failure: Option<Failure>,
    #[serde(default)]
    pub history: Vec<StateTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    /// A fresh run positioned at intake.
    pub fn new(message: Message) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            message,
            context: None,
            intent: None,
            requirements: BTreeSet::new(),
            pending_tasks: BTreeSet::new(),
            task_results: BTreeMap::new(),
            draft: None,
            human_decision: HumanDecision::None,
            status: RunStatus::Running,
            cursor: Cursor::At(StepName::Intake),
            feedback: Vec::new(),
            revision: 0,
            supervisor_visits: 0,
            outcome: None,
            failure: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Drafting may begin: intent classified, nothing in flight, every
    /// requirement reported.
    pub fn is_ready_to_draft(&self) -> bool {
        self.intent.is_some()
            && self.pending_tasks.is_empty()
            && self
                .requirements
                .iter()
                .all(|s| self.task_results.contains_key(s))
    }

    /// Apply one update, checking the invariants it touches.
    pub fn apply(&mut self, update: StateUpdate) -> Result<(), String> {
        match update {
            StateUpdate::SetContext(context) => {
                if self.context.is_some() {
                    return Err("context is write-once".into());
                }
                self.context = Some(context);
            }
            StateUpdate::SetIntent {
                intent,
                requirements,
            } => {
                if let Some(existing) = self.intent {
                    return Err(format!("intent already classified as {existing}"));
                }
                self.intent = Some(intent);
                self.requirements = requirements;
            }
            StateUpdate::Dispatch(specialists) => {
                for specialist in specialists {
                    if self.pending_tasks.contains(&specialist) {
                        return Err(format!("{specialist} is already pending"));
                    }
                    if self.task_results.contains_key(&specialist) {
                        return Err(format!("{specialist} already reported this cycle"));
                    }
                    self.pending_tasks.insert(specialist);
                }
            }
            StateUpdate::TaskResolved(specialist, result) => {
                if self.task_results.contains_key(&specialist) {
                    return Err(format!("{specialist} already reported this cycle"));
                }
                if !self.pending_tasks.remove(&specialist) {
                    return Err(format!("{specialist} reported without being dispatched"));
                }
                self.task_results.insert(specialist, result);
            }
            StateUpdate::SetDraft(draft) => {
                if self.intent.is_none() {
                    return Err("draft before intent was classified".into());
                }
                if !self.pending_tasks.is_empty() {
                    return Err(format!(
                        "draft while tasks are pending: {:?}",
                        self.pending_tasks
                    ));
                }
                self.draft = Some(draft);
                self.supervisor_visits = 0;
            }
            StateUpdate::SetDecision(decision) => {
                if decision == HumanDecision::None {
                    return Err("decision must not be none".into());
                }
                if self.human_decision != HumanDecision::None {
                    return Err(format!(
                        "unconsumed decision {} already present",
                        self.human_decision
                    ));
                }
                self.human_decision = decision;
            }
            StateUpdate::ConsumeDecision => {
                self.human_decision = HumanDecision::None;
            }
            StateUpdate::RecordFeedback(note) => {
                self.feedback.push(note);
            }
            StateUpdate::ResetForEdit => {
                self.pending_tasks.clear();
                self.task_results.clear();
                self.supervisor_visits = 0;
                self.revision += 1;
            }
            StateUpdate::SupervisorVisited => {
                self.supervisor_visits += 1;
            }
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move to a new status, recording the transition.
    pub fn transition_to(&mut self, to: RunStatus, reason: Option<String>) -> Result<(), String> {
        if !self.status.can_transition_to(to) {
            return Err(format!("Cannot transition from {} to {}", self.status, to));
        }

        let now = Utc::now();
        self.history.push(StateTransition {
            from: self.status,
            to,
            at: now,
            reason,
        });
        if self.history.len() > MAX_TRANSITIONS {
            let drain_count = self.history.len() - MAX_TRANSITIONS;
            self.history.drain(..drain_count);
        }

        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.cursor = Cursor::Halted;
        }
        Ok(())
    }

    /// Terminate as failed at `step`.
    pub fn fail(&mut self, step: StepName, error: impl Into<String>) {
        let error = error.into();
        if self.status.is_terminal() {
            return;
        }
        if self.status == RunStatus::Suspended {
            let _ = self.transition_to(RunStatus::Running, Some("failing".into()));
        }
        self.failure = Some(Failure {
            step,
            error: error.clone(),
        });
        let _ = self.transition_to(RunStatus::Failed, Some(error));
    }

    /// Terminate as completed.
    pub fn complete(&mut self, outcome: Outcome) -> Result<(), String> {
        self.transition_to(RunStatus::Completed, Some(format!("{outcome:?}")))?;
        self.outcome = Some(outcome);
        Ok(())
    }
}
