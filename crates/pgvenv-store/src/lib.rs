//! Registry storage for pgvenv environments.
//!
//! This crate owns everything that can be answered from the filesystem alone:
//! environment name validation and port derivation (`naming`), the directory
//! layout of the registry root and of each environment (`RegistryLayout`),
//! checksummed per-environment metadata (`MetadataStore`), and the `Registry`
//! that enumerates environments and reports their liveness.

pub mod layout;
pub mod metadata;
pub mod naming;
pub mod registry;

pub use layout::{RegistryLayout, LOG_SUFFIX, METADATA_FILE};
pub use metadata::{EnvState, MetadataStore, VenvMetadata};
pub use naming::{derive_port, validate_env_name, BinaryConcatPorts, PortScheme, PORT_BASE};
pub use registry::{pid_alive, read_postmaster_pid, reconcile_state, PostmasterPid, Registry};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` into it is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid environment name: {0}")]
    InvalidName(String),
    #[error("pg_venv '{0}' does not exist")]
    NotFound(String),
    #[error("metadata checksum mismatch for '{name}': expected {expected}, got {actual}")]
    IntegrityFailure {
        name: String,
        expected: String,
        actual: String,
    },
}
