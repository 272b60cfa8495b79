//! Error types for the pipeline engine.

use thiserror::Error;

/// Errors produced by the engine and its collaborators.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("unknown input '{name}'")]
    UnknownInput { name: String },

    #[error("unknown pipeline output '{name}'")]
    UnknownPipelineOutput { name: String },

    #[error("activity '{name}' not registered")]
    UnsupportedActivity { name: String },

    #[error("multiple {kind}s not supported, {kind} already exists for this activity")]
    DuplicateTimer { kind: &'static str },

    #[error("mapper error: {0}")]
    Mapper(String),

    #[error("cannot coerce value '{value}' to {to}")]
    Coercion { to: &'static str, value: String },

    #[error("scope is read-only")]
    ReadOnlyScope,

    #[error("unsupported uri scheme '{uri}'")]
    UnsupportedScheme { uri: String },

    #[error("invalid pipeline configuration: {message}")]
    InvalidConfig { message: String },

    #[error("activity error: {0}")]
    Activity(#[from] ActivityError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("generic error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Errors raised by activity construction and evaluation.
#[derive(Error, Debug)]
pub enum ActivityError {
    #[error("missing required setting '{name}'")]
    MissingSetting { name: String },

    #[error("invalid setting '{name}': {message}")]
    InvalidSetting { name: String, message: String },

    #[error("unsupported window type '{window_type}'")]
    UnsupportedWindowType { window_type: String },

    #[error("unsupported function '{function}'")]
    UnsupportedFunction { function: String },

    #[error("unsupported filter '{filter_type}'")]
    UnsupportedFilter { filter_type: String },

    #[error("{0}")]
    Other(String),
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
