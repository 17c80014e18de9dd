//! Core orchestration for pgvenv environments.
//!
//! This crate ties the registry (`pgvenv-store`) and the toolchain backends
//! (`pgvenv-runtime`) together into the `Engine`: one operation per lifecycle
//! transition, each validated against the state machine in `lifecycle` before
//! any external program runs. It also owns configuration loading, per-
//! environment advisory locking, and the shell bridge that turns identity
//! switches into fragments for the calling shell to evaluate.

pub mod concurrency;
pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod shell;

pub use concurrency::{install_signal_handler, shutdown_requested, VenvLock};
pub use config::{FileConfig, Settings};
pub use engine::{Engine, PipelineEvent, PipelineStep, VenvInfo};
pub use lifecycle::validate_transition;
pub use pgvenv_store::EnvState;
pub use shell::{resolve_name, OutputIntent, ShellContext};

use pgvenv_runtime::RuntimeError;
use pgvenv_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("pg_venv '{0}' already exists")]
    NameConflict(String),
    #[error("pg_venv '{0}' does not exist. Use `pg create_virtualenv {0}` to create it")]
    NotFound(String),
    #[error("invalid environment name: {0}")]
    InvalidName(String),
    #[error("cannot {action} '{name}': {reason} (state: {state})")]
    InvalidState {
        name: String,
        action: &'static str,
        state: EnvState,
        reason: &'static str,
    },
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: EnvState, to: EnvState },
    #[error("{step} failed ({})", pgvenv_runtime::process::describe_code(.code))]
    ExternalFailure {
        step: String,
        code: Option<i32>,
        output: String,
    },
    #[error("confirmation '{got}' does not match '{expected}'; nothing was deleted")]
    ConfirmationMismatch { expected: String, got: String },
    #[error("{action} of '{name}' did not complete within {secs}s")]
    Timeout {
        action: &'static str,
        name: String,
        secs: u64,
    },
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("log unavailable: {0}")]
    LogUnavailable(String),
    #[error("PG_VENV not set. Please run `pg workon <pg_venv>` first")]
    NoActiveEnvironment,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("interrupted; '{0}' left at its last completed step")]
    Interrupted(String),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("runtime error: {0}")]
    Runtime(RuntimeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Exit code of the external program behind this error, if any.
    pub fn external_code(&self) -> Option<i32> {
        match self {
            CoreError::ExternalFailure { code, .. } => *code,
            _ => None,
        }
    }

    /// Output captured from the external program behind this error.
    pub fn external_output(&self) -> Option<&str> {
        match self {
            CoreError::ExternalFailure { output, .. } if !output.is_empty() => Some(output),
            _ => None,
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(name) => CoreError::NotFound(name),
            StoreError::InvalidName(msg) => CoreError::InvalidName(msg),
            other => CoreError::Store(other),
        }
    }
}

impl From<RuntimeError> for CoreError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::ToolFailed { step, code, output } => {
                CoreError::ExternalFailure { step, code, output }
            }
            RuntimeError::SourceUnavailable(msg) => CoreError::SourceUnavailable(msg),
            other => CoreError::Runtime(other),
        }
    }
}
