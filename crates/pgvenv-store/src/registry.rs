use crate::layout::RegistryLayout;
use crate::metadata::{EnvState, MetadataStore};
use crate::naming::{validate_env_name, PortScheme};
use crate::StoreError;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Parsed head of a `postmaster.pid` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostmasterPid {
    pub pid: i32,
    pub port: Option<u16>,
}

/// Read `postmaster.pid`: line 1 is the PID, line 4 the port. Returns `None` when the file is missing or unparsable.
pub fn read_postmaster_pid(path: &Path) -> Option<PostmasterPid> {
    let content = fs::read_to_string(path).ok()?;
    let mut lines = content.lines();
    let pid = lines.next()?.trim().parse().ok()?;
    let port = lines.nth(2).and_then(|l| l.trim().parse().ok());
    Some(PostmasterPid { pid, port })
}

#[allow(unsafe_code)]
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only performs the existence and permission checks.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Combine the recorded state with what is observable on disk right now.
pub fn reconcile_state(recorded: EnvState, live: bool, data_initialized: bool) -> EnvState {
    if live {
        return EnvState::Running;
    }
    match recorded {
        EnvState::Running | EnvState::Initialized | EnvState::Stopped if !data_initialized => {
            EnvState::Installed
        }
        EnvState::Running => EnvState::Stopped,
        other => other,
    }
}

/// Enumerates environments under the registry root.
pub struct Registry {
    layout: RegistryLayout,
    meta_store: MetadataStore,
}

impl Registry {
    pub fn new(layout: RegistryLayout) -> Self {
        let meta_store = MetadataStore::new(layout.clone());
        Self { layout, meta_store }
    }

    pub fn layout(&self) -> &RegistryLayout {
        &self.layout
    }

    /// Sorted names of every environment directory. A registry root that
    /// does not exist yet holds no environments.
    pub fn list_environments(&self) -> Result<Vec<String>, StoreError> {
        let root = self.layout.root();
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if validate_env_name(&name).is_ok() {
                names.push(name);
            } else {
                debug!("ignoring foreign entry in registry root: {name}");
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn exists(&self, name: &str) -> bool {
        validate_env_name(name).is_ok() && self.layout.venv_path(name).is_dir()
    }

    pub fn postmaster(&self, name: &str) -> Option<PostmasterPid> {
        read_postmaster_pid(&self.layout.pid_file(name))
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.postmaster(name).is_some_and(|p| pid_alive(p.pid))
    }

    /// State recorded by the last explicit action, or inferred from the
    /// filesystem for environments that carry no metadata file.
    pub fn recorded_state(&self, name: &str) -> Result<EnvState, StoreError> {
        if !self.exists(name) {
            return Err(StoreError::NotFound(name.to_owned()));
        }
        if self.meta_store.exists(name) {
            match self.meta_store.get(name) {
                Ok(meta) => return Ok(meta.state),
                Err(e) => warn!("unreadable metadata for '{name}', inferring state: {e}"),
            }
        }
        Ok(self.infer_state(name))
    }

    fn infer_state(&self, name: &str) -> EnvState {
        if self.layout.pg_version_file(name).is_file() {
            EnvState::Initialized
        } else if self.layout.pg_ctl(name).is_file() {
            EnvState::Installed
        } else {
            EnvState::Created
        }
    }

    /// Effective state: the recorded state reconciled with server liveness
    /// and the presence of an initialized data directory.
    pub fn state(&self, name: &str) -> Result<EnvState, StoreError> {
        let recorded = self.recorded_state(name)?;
        Ok(reconcile_state(
            recorded,
            self.is_running(name),
            self.layout.pg_version_file(name).is_file(),
        ))
    }

    /// Other registered environments whose derived port equals `name`'s.
    pub fn port_collisions(
        &self,
        name: &str,
        scheme: &dyn PortScheme,
    ) -> Result<Vec<String>, StoreError> {
        let port = scheme.port_for(name);
        Ok(self
            .list_environments()?
            .into_iter()
            .filter(|other| other != name && scheme.port_for(other) == port)
            .collect())
    }
}
