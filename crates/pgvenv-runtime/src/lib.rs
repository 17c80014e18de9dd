//! Toolchain backends for pgvenv environments.
//!
//! Everything that touches an external program lives here: provisioning a
//! source tree out of a git checkout, running `configure` and `make`,
//! initializing a cluster and driving `pg_ctl`. The `ToolchainBackend` trait has
//! a real `PostgresBackend` and a filesystem-only `MockBackend` used by tests.
//! External programs are never interpreted beyond their exit status.

pub mod backend;
pub mod logfile;
pub mod mock;
pub mod postgres;
pub mod prereq;
pub mod process;

pub use backend::{select_backend, MakeTarget, ToolchainBackend, VenvSpec};
pub use logfile::read_tail;
pub use prereq::{check_toolchain_prereqs, format_missing, MissingPrereq};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{step} failed ({})", process::describe_code(.code))]
    ToolFailed {
        step: String,
        code: Option<i32>,
        /// Captured stdout and stderr, verbatim. Empty when the program's
        /// output went straight to the terminal.
        output: String,
    },
}
