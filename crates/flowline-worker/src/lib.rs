//! Task-Sequence Executor (H): runs tool calls on behalf of the
//! coordinator, reporting outcomes back through the HTTP façade.
//!
//! Tool backends are a pluggable boundary (`tool::Tool`); only the HTTP
//! adapter is wired up end-to-end, matching the Non-goals in §1.

pub mod client;
pub mod outcome;
pub mod sequence;
pub mod tool;
pub mod worker;

pub use client::{ClientError, ClientResult, CoordinatorClient};
pub use outcome::{Outcome, OutcomeStatus};
pub use worker::Worker;
