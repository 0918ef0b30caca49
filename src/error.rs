//! Error taxonomy shared across the engine.

use thiserror::Error;

/// Configuration error with field path and constraint description.
///
/// Fatal: an engine is never constructed from a configuration that
/// produced one of these.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("config error: {field}: {message}")]
pub struct ConfigError {
    /// Dotted field path (e.g., `"clusters[0].comparison_matrix"`).
    pub field: String,
    /// Human-readable constraint description.
    pub message: String,
}

impl ConfigError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Prefixes the field path with an enclosing scope.
    pub fn within(self, scope: &str) -> Self {
        let field = if self.field.is_empty() {
            scope.to_string()
        } else {
            format!("{scope}.{}", self.field)
        };
        Self { field, ..self }
    }
}

/// Failures while compiling or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("parse error at {position}: {message}")]
    Parse { position: usize, message: String },
    #[error("no value bound for `{0}`")]
    MissingBinding(String),
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("function `{name}` expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
}

/// Failures reported by the external actuation service.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActuationError {
    #[error("{operation} on {device} timed out")]
    Timeout { device: String, operation: &'static str },
    #[error("{device} rejected {operation}: {reason}")]
    Rejected {
        device: String,
        operation: &'static str,
        reason: String,
    },
    #[error("device {0} is unavailable")]
    Unavailable(String),
}

/// Why a single candidate could not be curtailed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CurtailmentError {
    #[error(transparent)]
    Actuation(#[from] ActuationError),
    #[error("cannot compute curtailment: {0}")]
    Expression(#[from] ExprError),
}

/// Failures of the background engine worker.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("engine worker has stopped")]
    Stopped,
    #[error("failed to start engine worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine worker panicked")]
    Panicked,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display_includes_field() {
        let e = ConfigError::new("engine.demand_limit", "must be > 0");
        assert_eq!(e.to_string(), "config error: engine.demand_limit: must be > 0");
    }

    #[test]
    fn within_prefixes_path() {
        let e = ConfigError::new("maximum", "missing").within("clusters[1]");
        assert_eq!(e.field, "clusters[1].maximum");
        let e = ConfigError::new("", "bad").within("mappers");
        assert_eq!(e.field, "mappers");
    }
}
