//! Human decision channel: HTTP endpoints for reviewing suspended runs.

mod routes;

pub use routes::{DecisionState, PendingReview, decision_routes};
