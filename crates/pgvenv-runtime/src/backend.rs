use crate::RuntimeError;
use pgvenv_store::RegistryLayout;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything a backend needs to act on one environment. Built from the
/// registry layout, so every path here is derived from the name alone.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VenvSpec {
    pub name: String,
    pub port: u16,
    pub registry_root: PathBuf,
    /// Install prefix passed to `configure`.
    pub prefix: PathBuf,
    pub src_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub lib_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_file: PathBuf,
}

impl VenvSpec {
    pub fn new(layout: &RegistryLayout, name: &str, port: u16) -> Self {
        Self {
            name: name.to_owned(),
            port,
            registry_root: layout.root().to_path_buf(),
            prefix: layout.venv_path(name),
            src_dir: layout.src_dir(name),
            bin_dir: layout.bin_dir(name),
            lib_dir: layout.lib_dir(name),
            data_dir: layout.data_dir(name),
            log_file: layout.log_file(name),
        }
    }

    pub fn bin(&self, program: &str) -> PathBuf {
        self.bin_dir.join(program)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MakeTarget {
    Build,
    Check,
    Clean,
    Install,
}

impl MakeTarget {
    /// The make goal, if any. `Build` runs the default goal.
    pub fn goal(self) -> Option<&'static str> {
        match self {
            MakeTarget::Build => None,
            MakeTarget::Check => Some("check"),
            MakeTarget::Clean => Some("clean"),
            MakeTarget::Install => Some("install"),
        }
    }

    /// Build and install also descend into `contrib/`.
    pub fn includes_contrib(self) -> bool {
        matches!(self, MakeTarget::Build | MakeTarget::Install)
    }

    pub fn step_name(self) -> &'static str {
        match self {
            MakeTarget::Build => "make",
            MakeTarget::Check => "make check",
            MakeTarget::Clean => "make clean",
            MakeTarget::Install => "make install",
        }
    }
}

pub trait ToolchainBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Export `git_ref` of the checkout at `source_dir` into `spec.src_dir`,
    /// replacing any previous tree. Returns a human description of the
    /// exported revision when one can be obtained.
    fn provision_source(
        &self,
        spec: &VenvSpec,
        source_dir: &Path,
        git_ref: &str,
    ) -> Result<Option<String>, RuntimeError>;

    fn configure(&self, spec: &VenvSpec, options: &[String]) -> Result<(), RuntimeError>;

    fn make(&self, spec: &VenvSpec, target: MakeTarget, args: &[String])
        -> Result<(), RuntimeError>;

    fn initdb(&self, spec: &VenvSpec) -> Result<(), RuntimeError>;

    /// Launch the server in the background and return once it accepts
    /// connections, or fail if it exits or is not ready within `timeout`.
    fn start(&self, spec: &VenvSpec, timeout: Duration) -> Result<(), RuntimeError>;

    /// Ask the server to shut down, allowing it `timeout` to comply.
    fn stop(&self, spec: &VenvSpec, timeout: Duration) -> Result<(), RuntimeError>;

    fn createdb(&self, spec: &VenvSpec) -> Result<(), RuntimeError>;

    /// Installed server version, e.g. `16.2`.
    fn version(&self, spec: &VenvSpec) -> Option<String>;
}

pub fn select_backend(name: &str) -> Result<Box<dyn ToolchainBackend>, RuntimeError> {
    match name {
        "postgres" => Ok(Box::new(crate::postgres::PostgresBackend::new())),
        "mock" => Ok(Box::new(crate::mock::MockBackend::detached())),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}
