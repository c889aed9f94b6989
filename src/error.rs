//! # Error Types
//!
//! Error taxonomy for the orchestration engine.
//!
//! ## Design
//!
//! Errors are split along the boundaries of the engine rather than piled into
//! one flat enum:
//!
//! - **`WeirError`** - top-level error for engine operations, with a
//!   [`WeirResult`] alias used throughout
//! - **`QueueError`** - message transport failures (emit/receive)
//! - **`StorageError`** - persistence collaborator failures
//! - **`RenderError`** - expression rendering and typed-output failures
//! - **`ConfigError`** - configuration loading and validation failures
//!
//! Two variants carry deliberate semantics: `NotFound` is an *expected*
//! lookup miss handled locally by callers (a missing task run, an unknown
//! flow revision), while `Internal` is an unexpected condition that surfaces
//! as a FAILED execution with a synthetic log entry instead of crashing the
//! coordinator.

use thiserror::Error;

/// Result alias used by all engine operations.
pub type WeirResult<T> = Result<T, WeirError>;

/// Top-level error type for the orchestration engine.
#[derive(Debug, Error)]
pub enum WeirError {
    /// Persistence collaborator failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Message transport failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Expression rendering or typed-output resolution failed.
    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    /// Configuration could not be loaded or validated.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Message payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Expected lookup miss, handled locally by the caller.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unexpected condition; converts the affected execution to FAILED.
    #[error("Internal orchestration error: {0}")]
    Internal(String),
}

impl WeirError {
    /// Build a `NotFound` error from anything displayable.
    pub fn not_found(what: impl Into<String>) -> Self {
        WeirError::NotFound(what.into())
    }

    /// Build an `Internal` error from anything displayable.
    pub fn internal(message: impl Into<String>) -> Self {
        WeirError::Internal(message.into())
    }

    /// True for expected lookup misses that callers handle locally.
    pub fn is_not_found(&self) -> bool {
        matches!(self, WeirError::NotFound(_))
    }
}

/// Message transport failures.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue was closed, typically during shutdown.
    #[error("Queue '{queue}' is closed")]
    Closed { queue: String },

    /// A message payload could not be serialized for the wire.
    #[error("Failed to serialize message for queue '{queue}': {source}")]
    Serialization {
        queue: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Persistence collaborator failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing store rejected or lost the operation.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// A row that must exist after insert-then-refetch was still missing.
    #[error("Row missing after insert for key '{0}'")]
    MissingAfterInsert(String),
}

/// Expression rendering and typed-output failures.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The template engine rejected the expression.
    #[error("Template render failed: {0}")]
    Template(#[from] Box<minijinja::Error>),

    /// A declared flow output rendered to a value of the wrong type.
    #[error("Output '{output}' expects {expected}, got '{value}'")]
    OutputType {
        output: String,
        expected: &'static str,
        value: String,
    },
}

impl From<minijinja::Error> for RenderError {
    fn from(err: minijinja::Error) -> Self {
        RenderError::Template(Box::new(err))
    }
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration content is not valid YAML for the schema.
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The configuration parsed but holds an unusable value.
    #[error("Invalid configuration: {0}")]
    Validation(String),
}
