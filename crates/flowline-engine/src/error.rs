//! Control-flow engine errors: the seam wraps every collaborator's own
//! error type rather than inventing a parallel taxonomy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] flowline_store::StoreError),

    #[error(transparent)]
    Bus(#[from] flowline_bus::BusError),

    #[error(transparent)]
    Render(#[from] flowline_render::RenderError),

    #[error(transparent)]
    Core(#[from] flowline_core::Error),

    #[error("execution {0} has no reconstructable state")]
    UnknownExecution(flowline_core::Id),

    #[error("playbook has no resolvable entry step")]
    NoEntryStep,

    #[error("step '{0}' is not defined in the playbook")]
    UnknownStep(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
