use crate::CoreError;
use serde::Serialize;
use std::fmt;

/// Per-step execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Applying,
    Applied,
    Failed,
    /// Not attempted because a step it requires failed or was skipped.
    Skipped,
    /// NoOp step, no adapter call made.
    Unchanged,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepState::Applied | StepState::Failed | StepState::Skipped | StepState::Unchanged
        )
    }

    /// Whether steps that require this one may proceed.
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, StepState::Applied | StepState::Unchanged)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepState::Pending => "pending",
            StepState::Applying => "applying",
            StepState::Applied => "applied",
            StepState::Failed => "failed",
            StepState::Skipped => "skipped",
            StepState::Unchanged => "unchanged",
        };
        f.write_str(s)
    }
}

pub fn validate_transition(step: &str, from: StepState, to: StepState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (
            StepState::Pending,
            StepState::Applying | StepState::Skipped | StepState::Unchanged
        ) | (StepState::Applying, StepState::Applied | StepState::Failed)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            step: step.to_owned(),
            from,
            to,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        assert!(validate_transition("a", StepState::Pending, StepState::Applying).is_ok());
        assert!(validate_transition("a", StepState::Pending, StepState::Skipped).is_ok());
        assert!(validate_transition("a", StepState::Pending, StepState::Unchanged).is_ok());
        assert!(validate_transition("a", StepState::Applying, StepState::Applied).is_ok());
        assert!(validate_transition("a", StepState::Applying, StepState::Failed).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        assert!(validate_transition("a", StepState::Pending, StepState::Applied).is_err());
        assert!(validate_transition("a", StepState::Applied, StepState::Applying).is_err());
        assert!(validate_transition("a", StepState::Failed, StepState::Applying).is_err());
        assert!(validate_transition("a", StepState::Skipped, StepState::Pending).is_err());
        assert!(validate_transition("a", StepState::Applying, StepState::Skipped).is_err());
        assert!(validate_transition("a", StepState::Unchanged, StepState::Applying).is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!StepState::Pending.is_terminal());
        assert!(!StepState::Applying.is_terminal());
        assert!(StepState::Skipped.is_terminal());
        assert!(StepState::Unchanged.satisfies_dependents());
        assert!(!StepState::Failed.satisfies_dependents());
    }

    #[test]
    fn transition_error_names_step() {
        let err = validate_transition("fn", StepState::Failed, StepState::Applied).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid step transition for 'fn': failed -> applied"
        );
    }
}
