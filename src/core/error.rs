use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PhasegateError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Schema violation in card '{card}': {blocking} blocking finding(s)")]
    SchemaViolation { card: String, blocking: usize },
    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },
    #[error("Unknown dependency: '{from}' references '{missing}'")]
    UnknownDependency { from: String, missing: String },
    #[error("Guard '{guard}' could not be executed: {reason}")]
    GuardExecutionError { guard: String, reason: String },
    #[error("Card '{card}' failed: {reason}")]
    CardExecutionFailure { card: String, reason: String },
    #[error("Illegal status transition for card '{card}': {from} -> {to}")]
    IllegalTransition {
        card: String,
        from: String,
        to: String,
    },
    #[error("Checkpoint corrupted at {path}: {reason}. Run `phasegate reset` to start over.")]
    CheckpointCorruption { path: String, reason: String },
}

impl PhasegateError {
    /// Phase-fatal errors halt the whole run and need operator action.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PhasegateError::CycleDetected { .. } | PhasegateError::CheckpointCorruption { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_names_every_participant() {
        let err = PhasegateError::CycleDetected {
            cycle: vec!["card:A".into(), "card:B".into(), "card:A".into()],
        };
        assert_eq!(
            err.to_string(),
            "Dependency cycle detected: card:A -> card:B -> card:A"
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn contained_errors_are_not_fatal() {
        let err = PhasegateError::UnknownDependency {
            from: "C1".into(),
            missing: "C9".into(),
        };
        assert!(!err.is_fatal());
        let err = PhasegateError::CardExecutionFailure {
            card: "C1".into(),
            reason: "exit 1".into(),
        };
        assert!(!err.is_fatal());
    }
}
