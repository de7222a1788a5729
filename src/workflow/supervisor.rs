//! Supervisor: classifies intent, fans out to specialists, decides readiness.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::StepError;
use crate::llm::provider::LlmProvider;
use crate::workflow::prompts;
use crate::workflow::state::{Intent, RunState, Specialist, StateUpdate, StepName};
use crate::workflow::steps::{Route, Step, Transition};

pub struct SupervisorStep {
    llm: Arc<dyn LlmProvider>,
}

impl SupervisorStep {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    /// Classify the message. Any failure falls back to `simple_direct`.
    async fn classify(&self, state: &RunState) -> (Intent, BTreeSet<Specialist>) {
        let request = prompts::classify_request(&state.message, state.context.as_ref());
        let (intent, extras) = match self.llm.complete(request).await {
            Ok(response) => match prompts::parse_classification(&response.content) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(
                        run_id = %state.run_id,
                        raw_response = %response.content,
                        error = %e,
                        "Failed to parse classification, falling back to simple_direct"
                    );
                    (Intent::SimpleDirect, Vec::new())
                }
            },
            Err(e) => {
                warn!(
                    run_id = %state.run_id,
                    error = %e,
                    "Classification call failed, falling back to simple_direct"
                );
                (Intent::SimpleDirect, Vec::new())
            }
        };
        (intent, requirements_for(intent, extras))
    }
}

/// The intent's base requirement plus any extras the classifier named.
pub fn requirements_for(intent: Intent, extras: Vec<Specialist>) -> BTreeSet<Specialist> {
    intent.base_requirement().into_iter().chain(extras).collect()
}

#[async_trait]
impl Step for SupervisorStep {
    fn name(&self) -> StepName {
        StepName::Supervisor
    }

    async fn run(&self, state: &RunState) -> Result<Transition, StepError> {
        let mut updates = Vec::new();

        let requirements = match state.intent {
            Some(_) => state.requirements.clone(),
            None => {
                let (intent, requirements) = self.classify(state).await;
                info!(
                    run_id = %state.run_id,
                    intent = %intent,
                    requirements = ?requirements,
                    "Message classified"
                );
                updates.push(StateUpdate::SetIntent {
                    intent,
                    requirements: requirements.clone(),
                });
                requirements
            }
        };

        // Fan-out joins before the supervisor runs again, so anything still
        // pending here was never resolved.
        if !state.pending_tasks.is_empty() {
            return Ok(Transition::to(Route::Fail(format!(
                "supervisor re-entered with unresolved tasks: {:?}",
                state.pending_tasks
            ))));
        }

        let missing: Vec<Specialist> = requirements
            .iter()
            .copied()
            .filter(|s| !state.task_results.contains_key(s))
            .collect();

        // A fresh classification has no results yet.
        let ready = match state.intent {
            Some(_) => state.is_ready_to_draft(),
            None => requirements.is_empty(),
        };
        if ready {
            debug!(run_id = %state.run_id, "All requirements reported, drafting");
            return Ok(Transition::with(updates, Route::Next(StepName::Writer)));
        }

        debug!(run_id = %state.run_id, dispatch = ?missing, "Dispatching specialists");
        updates.push(StateUpdate::Dispatch(missing.clone()));
        Ok(Transition::with(updates, Route::FanOut(missing)))
    }
}
