//! Error types for Keel

use thiserror::Error;

/// Result type for Keel operations
pub type Result<T> = std::result::Result<T, KeelError>;

/// Keel error types
#[derive(Error, Debug)]
pub enum KeelError {
    #[error("Descriptor parse error: {0}")]
    Parse(String),

    #[error("Service '{service}' has invalid '{field}': {message}")]
    InvalidField {
        service: String,
        field: String,
        message: String,
    },

    #[error("Service '{service}' depends on undeclared service '{dependency}'")]
    DanglingDependency { service: String, dependency: String },

    #[error("Service '{service}' mounts undeclared volume '{volume}'")]
    DanglingVolume { service: String, volume: String },

    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error("Host port {binding} is published by both '{first}' and '{second}'")]
    PortConflict {
        binding: String,
        first: String,
        second: String,
    },

    #[error("Service '{service}' mounts both '{first}' and '{second}' at '{target}'")]
    VolumeConflict {
        service: String,
        target: String,
        first: String,
        second: String,
    },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Service '{service}' not ready after {attempts} attempts")]
    ReadinessTimeout { service: String, attempts: u32 },

    #[error("Startup aborted after {completed} of {total} waves")]
    Aborted { completed: usize, total: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeelError {
    /// Whether this error was raised while reading or checking the descriptor,
    /// before any service was touched.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            KeelError::Parse(_)
                | KeelError::InvalidField { .. }
                | KeelError::DanglingDependency { .. }
                | KeelError::DanglingVolume { .. }
                | KeelError::DependencyCycle { .. }
                | KeelError::PortConflict { .. }
                | KeelError::VolumeConflict { .. }
                | KeelError::ServiceNotFound(_)
        )
    }

    pub(crate) fn invalid_field(service: &str, field: &str, message: impl Into<String>) -> Self {
        KeelError::InvalidField {
            service: service.to_string(),
            field: field.to_string(),
            message: message.into(),
        }
    }
}
