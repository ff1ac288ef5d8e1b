//! Shared domain types for the workflow execution engine.
//!
//! This crate contains:
//! - Monotone identifiers and the error/error-taxonomy types
//! - The playbook/step/tool data model (§3)
//! - The event and command wire shapes (§3, §6)
//! - `ExecutionState`, derived and never persisted (§3)
//! - The keychain boundary trait (credential retrieval is an external
//!   collaborator; only its contract lives here)

pub mod command;
pub mod error;
pub mod event;
pub mod id;
pub mod playbook;
pub mod secret;
pub mod state;

pub use error::{Error, Result};
pub use id::Id;
