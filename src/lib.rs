//! Agent Inbox: email workflow orchestration with human review.

pub mod channels;
pub mod config;
pub mod decisions;
pub mod error;
pub mod llm;
pub mod store;
pub mod workflow;
