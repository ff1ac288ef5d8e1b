//! Control-Flow Engine (G): event-driven execution of workflow playbooks.
//!
//! The engine holds no durable state of its own — `ExecutionState` is
//! always derived from the event log (E) — and every side effect it
//! performs is either an event append (A) or a command publish (B/D).

pub mod cache;
pub mod engine;
pub mod error;
pub mod playbook_source;
pub mod reconstruct;
pub mod routing;

pub use engine::{Engine, EventStatus2, IncomingEvent, IssuedCommand, PlaybookRef};
pub use error::{EngineError, EngineResult};
pub use playbook_source::{InMemoryPlaybookSource, PlaybookSource};
