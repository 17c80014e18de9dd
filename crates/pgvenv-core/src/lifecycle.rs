use crate::CoreError;
use pgvenv_store::EnvState;

/// Check that moving an environment from `from` to `to` is a legal step.
///
/// Forward steps go one rung at a time (created → built → installed →
/// initialized → running). The server toggles between running and stopped.
/// Removing the data directory regresses to installed; removing the whole
/// environment is allowed from anything but running.
pub fn validate_transition(from: EnvState, to: EnvState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (EnvState::Absent, EnvState::Created)
            | (EnvState::Created, EnvState::Built)
            | (EnvState::Built, EnvState::Installed)
            | (EnvState::Installed, EnvState::Initialized)
            | (
                EnvState::Initialized | EnvState::Stopped,
                EnvState::Running | EnvState::Installed
            )
            | (EnvState::Running, EnvState::Stopped)
            | (
                EnvState::Created
                    | EnvState::Built
                    | EnvState::Installed
                    | EnvState::Initialized
                    | EnvState::Stopped,
                EnvState::Absent
            )
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition { from, to })
    }
}
