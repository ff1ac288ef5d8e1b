//! Rendering and configuration errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("undefined reference: {0}")]
    Undefined(String),

    #[error("template syntax error: {0}")]
    Syntax(String),

    #[error("render error: {0}")]
    Render(String),
}

pub type RenderResult<T> = std::result::Result<T, RenderError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
