//! Workflow orchestration: run state, steps, supervisor, and the engine.
//!
//! ```text
//! intake -> supervisor -> {calendar, document, crm}* -> supervisor -> writer
//!        -> human_review (suspend) -> router -> send | supervisor | ignore
//! ```

pub mod engine;
pub mod prompts;
pub mod state;
pub mod steps;
pub mod supervisor;

pub use engine::{Engine, EngineDeps};
pub use state::{HumanDecision, Message, RunState, RunStatus, StepName};
pub use steps::{Route, Step, StepRegistry, Transition};
