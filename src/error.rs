/// dazzle error types and handling utilities
use thiserror::Error;

/// Main error type for dazzle operations
#[derive(Debug, Error)]
pub enum DazzleError {
    /// Invalid build definition: cycle, unknown dependency, duplicate name
    #[error("configuration error in {subject}: {reason}")]
    Configuration { subject: String, reason: String },

    /// A layer (or the base image) failed to build
    #[error("build of {layer} failed: {reason}")]
    Build { layer: String, reason: String },

    /// Reading from or writing to the working repository failed
    #[error("repository error in {operation} for {reference}: {reason}")]
    Repository {
        operation: String,
        reference: String,
        reason: String,
    },

    /// Assembly of the final image failed
    #[error("composition of {reference} failed: {reason}")]
    Composition { reference: String, reason: String },

    /// Test infrastructure failure, distinct from a failing test
    #[error("test runner error for {layer}: {reason}")]
    Runner { layer: String, reason: String },

    /// One or more layers did not build; carries the failed layer names
    #[error("{} layer(s) failed to build: {}", failed.len(), failed.join(", "))]
    LayersFailed { failed: Vec<String> },

    /// A test report could not be serialized
    #[error("report serialization failed: {0}")]
    Report(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = DazzleError> = std::result::Result<T, E>;

impl DazzleError {
    pub fn configuration(subject: impl Into<String>, reason: impl ToString) -> Self {
        Self::Configuration {
            subject: subject.into(),
            reason: reason.to_string(),
        }
    }

    pub fn build(layer: impl Into<String>, reason: impl ToString) -> Self {
        Self::Build {
            layer: layer.into(),
            reason: reason.to_string(),
        }
    }

    pub fn repository(
        operation: impl Into<String>,
        reference: impl ToString,
        reason: impl ToString,
    ) -> Self {
        Self::Repository {
            operation: operation.into(),
            reference: reference.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn composition(reference: impl ToString, reason: impl ToString) -> Self {
        Self::Composition {
            reference: reference.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn runner(layer: impl Into<String>, reason: impl ToString) -> Self {
        Self::Runner {
            layer: layer.into(),
            reason: reason.to_string(),
        }
    }

    /// Configuration errors abort the whole build; everything else is layer scoped
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}
