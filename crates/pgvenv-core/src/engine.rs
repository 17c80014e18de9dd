use crate::concurrency::{shutdown_requested, VenvLock};
use crate::config::Settings;
use crate::lifecycle::validate_transition;
use crate::shell::{deactivate_fragment, workon_fragment, OutputIntent, ShellContext};
use crate::CoreError;
use pgvenv_runtime::{read_tail, select_backend, MakeTarget, ToolchainBackend, VenvSpec};
use pgvenv_store::{
    validate_env_name, BinaryConcatPorts, EnvState, MetadataStore, PortScheme, Registry,
    RegistryLayout, VenvMetadata,
};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_SOURCE_REF: &str = "HEAD";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Central orchestration engine for pgvenv environments.
///
/// Every operation resolves the environment's paths and port from its name,
/// checks the lifecycle precondition against the reconciled state, takes the
/// environment's lock and only then runs the external step through the
/// toolchain backend. State is recorded after the step succeeds.
pub struct Engine {
    settings: Settings,
    layout: RegistryLayout,
    registry: Registry,
    meta_store: MetadataStore,
    backend: Box<dyn ToolchainBackend>,
    ports: Box<dyn PortScheme>,
}

/// One row of `list`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VenvInfo {
    pub name: String,
    pub port: u16,
    pub state: EnvState,
    pub version: Option<String>,
    pub root: PathBuf,
    /// Port the running server reports in its pid file.
    pub listening_port: Option<u16>,
    pub source_ref: Option<String>,
    pub source_revision: Option<String>,
}

/// Steps of `create_virtualenv`, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Provision,
    Configure,
    Make,
    Install,
    Initdb,
    Start,
    Createdb,
}

impl PipelineStep {
    pub const ALL: [PipelineStep; 7] = [
        PipelineStep::Provision,
        PipelineStep::Configure,
        PipelineStep::Make,
        PipelineStep::Install,
        PipelineStep::Initdb,
        PipelineStep::Start,
        PipelineStep::Createdb,
    ];

    /// Whether a step already happened for an environment in `state`.
    fn done_at(self, state: EnvState) -> bool {
        let reached = match self {
            PipelineStep::Provision => EnvState::Created,
            PipelineStep::Configure | PipelineStep::Make => EnvState::Built,
            PipelineStep::Install => EnvState::Installed,
            PipelineStep::Initdb => EnvState::Initialized,
            PipelineStep::Start | PipelineStep::Createdb => return state == EnvState::Running,
        };
        state.at_least(reached)
    }

    /// `configure` writes straight to the terminal.
    pub fn streams_output(self) -> bool {
        matches!(self, PipelineStep::Configure)
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStep::Provision => "copying source tree",
            PipelineStep::Configure => "configuring",
            PipelineStep::Make => "compiling",
            PipelineStep::Install => "installing",
            PipelineStep::Initdb => "initializing cluster",
            PipelineStep::Start => "starting server",
            PipelineStep::Createdb => "creating database",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    Started(PipelineStep),
    Finished(PipelineStep),
    Skipped(PipelineStep),
    Failed(PipelineStep),
}

type Precondition = fn(EnvState) -> Option<&'static str>;

fn any_state(_: EnvState) -> Option<&'static str> {
    None
}

fn built(state: EnvState) -> Option<&'static str> {
    (!state.at_least(EnvState::Built)).then_some("source tree is not built yet")
}

fn installed_without_data(state: EnvState) -> Option<&'static str> {
    if state.at_least(EnvState::Initialized) {
        Some("data directory is already initialized")
    } else if !state.at_least(EnvState::Installed) {
        Some("binaries are not installed yet")
    } else {
        None
    }
}

fn startable(state: EnvState) -> Option<&'static str> {
    match state {
        EnvState::Running => Some("server is already running"),
        s if !s.at_least(EnvState::Initialized) => Some("data directory is not initialized"),
        _ => None,
    }
}

fn running(state: EnvState) -> Option<&'static str> {
    (state != EnvState::Running).then_some("server is not running")
}

fn initialized(state: EnvState) -> Option<&'static str> {
    (!state.at_least(EnvState::Initialized)).then_some("data directory is not initialized")
}

fn data_removable(state: EnvState) -> Option<&'static str> {
    match state {
        EnvState::Running => Some("server is running, stop it first"),
        s if !s.at_least(EnvState::Initialized) => Some("data directory is not initialized"),
        _ => None,
    }
}

fn not_running(state: EnvState) -> Option<&'static str> {
    (state == EnvState::Running).then_some("server is running, stop it first")
}

/// Only environments that never reached a running server can be resumed.
fn resumable(name: &str, state: EnvState) -> Result<(), CoreError> {
    if matches!(state, EnvState::Running | EnvState::Stopped) {
        return Err(CoreError::NameConflict(name.to_owned()));
    }
    Ok(())
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

impl Engine {
    /// Create an engine with the backend named in `settings`.
    pub fn new(settings: Settings) -> Result<Self, CoreError> {
        let backend = select_backend(&settings.backend)?;
        Ok(Self::with_backend(settings, backend))
    }

    pub fn with_backend(settings: Settings, backend: Box<dyn ToolchainBackend>) -> Self {
        let layout = RegistryLayout::new(&settings.home);
        let registry = Registry::new(layout.clone());
        let meta_store = MetadataStore::new(layout.clone());
        Self {
            settings,
            layout,
            registry,
            meta_store,
            backend,
            ports: Box::new(BinaryConcatPorts),
        }
    }

    #[must_use]
    pub fn with_port_scheme(mut self, ports: Box<dyn PortScheme>) -> Self {
        self.ports = ports;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn layout(&self) -> &RegistryLayout {
        &self.layout
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn port(&self, name: &str) -> Result<u16, CoreError> {
        validate_env_name(name)?;
        Ok(self.ports.port_for(name))
    }

    fn spec(&self, name: &str) -> VenvSpec {
        VenvSpec::new(&self.layout, name, self.ports.port_for(name))
    }

    pub fn list(&self) -> Result<Vec<String>, CoreError> {
        Ok(self.registry.list_environments()?)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.registry.exists(name)
    }

    /// Reconciled state of an existing environment.
    pub fn state(&self, name: &str) -> Result<EnvState, CoreError> {
        validate_env_name(name)?;
        Ok(self.registry.state(name)?)
    }

    pub fn info(&self, name: &str) -> Result<VenvInfo, CoreError> {
        let state = self.state(name)?;
        let meta = self.meta_store.get(name).ok();
        let listening_port = if state == EnvState::Running {
            self.registry.postmaster(name).and_then(|p| p.port)
        } else {
            None
        };
        Ok(VenvInfo {
            name: name.to_owned(),
            port: self.ports.port_for(name),
            state,
            version: self.backend.version(&self.spec(name)),
            root: self.layout.venv_path(name),
            listening_port,
            source_ref: meta.as_ref().map(|m| m.source_ref.clone()),
            source_revision: meta.and_then(|m| m.source_revision),
        })
    }

    pub fn list_info(&self) -> Result<Vec<VenvInfo>, CoreError> {
        self.list()?.iter().map(|name| self.info(name)).collect()
    }

    /// Registered environments whose port is the same as `name`'s.
    pub fn port_collisions(&self, name: &str) -> Result<Vec<String>, CoreError> {
        validate_env_name(name)?;
        Ok(self.registry.port_collisions(name, self.ports.as_ref())?)
    }

    fn warn_port_collisions(&self, name: &str) {
        match self.port_collisions(name) {
            Ok(others) if !others.is_empty() => warn!(
                "port {} of '{name}' is shared with {}; only one of them can run at a time",
                self.ports.port_for(name),
                others.join(", ")
            ),
            Ok(_) => {}
            Err(e) => debug!("port collision check skipped: {e}"),
        }
    }

    /// Check `check` against the current state, take the lock, then check
    /// again in case another invocation moved the environment meanwhile.
    fn guard(
        &self,
        name: &str,
        action: &'static str,
        check: Precondition,
    ) -> Result<(EnvState, VenvLock), CoreError> {
        let verify = |state: EnvState| match check(state) {
            Some(reason) => Err(CoreError::InvalidState {
                name: name.to_owned(),
                action,
                state,
                reason,
            }),
            None => Ok(()),
        };
        verify(self.state(name)?)?;
        let lock = VenvLock::acquire(&self.layout.lock_file(name))?;
        let state = self.state(name)?;
        verify(state)?;
        Ok((state, lock))
    }

    fn new_metadata(&self, name: &str, state: EnvState, source_ref: &str) -> VenvMetadata {
        let now = chrono::Utc::now().to_rfc3339();
        VenvMetadata {
            name: name.to_owned(),
            state,
            port: self.ports.port_for(name),
            source_ref: source_ref.to_owned(),
            source_revision: None,
            source_dir: self
                .settings
                .source_dir
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            configure_options: self.settings.configure_options.clone(),
            created_at: now.clone(),
            updated_at: now,
            checksum: None,
        }
    }

    /// Metadata for `name`, synthesized from its inferred state when the
    /// environment predates metadata files or its file is unreadable.
    fn metadata_or_inferred(&self, name: &str) -> Result<VenvMetadata, CoreError> {
        if self.meta_store.exists(name) {
            match self.meta_store.get(name) {
                Ok(meta) => return Ok(meta),
                Err(e) => warn!("rewriting unreadable metadata for '{name}': {e}"),
            }
        }
        let state = self.registry.recorded_state(name)?;
        Ok(self.new_metadata(name, state, DEFAULT_SOURCE_REF))
    }

    fn record_state(&self, name: &str, state: EnvState) -> Result<(), CoreError> {
        let mut meta = self.metadata_or_inferred(name)?;
        meta.state = state;
        meta.updated_at = chrono::Utc::now().to_rfc3339();
        self.meta_store.put(&meta)?;
        debug!("'{name}' is now {state}");
        Ok(())
    }

    /// A root holding nothing but its lock file, as left behind by a
    /// creation that stopped before copying any source.
    fn is_placeholder(&self, name: &str) -> bool {
        let lock = self.layout.lock_file(name);
        match std::fs::read_dir(self.layout.venv_path(name)) {
            Ok(entries) => entries.filter_map(Result::ok).all(|e| e.path() == lock),
            Err(_) => false,
        }
    }

    fn discard_placeholder(&self, name: &str) {
        if self.is_placeholder(name) {
            let root = self.layout.venv_path(name);
            debug!("removing empty {}", root.display());
            if let Err(e) = std::fs::remove_dir_all(&root) {
                warn!("could not remove {}: {e}", root.display());
            }
        }
    }

    /// State of `name`, or `Absent` when it has no root or only a placeholder.
    fn current_state(&self, name: &str) -> Result<EnvState, CoreError> {
        if !self.registry.exists(name) || self.is_placeholder(name) {
            return Ok(EnvState::Absent);
        }
        self.state(name)
    }

    /// Provision a new environment's source tree from the configured
    /// checkout. Returns the description of the exported revision.
    pub fn create(&self, name: &str, git_ref: Option<&str>) -> Result<Option<String>, CoreError> {
        validate_env_name(name)?;
        if self.current_state(name)? != EnvState::Absent {
            return Err(CoreError::NameConflict(name.to_owned()));
        }
        let source_dir = self.settings.source_dir()?.to_path_buf();
        info!("creating pg_venv {name}");
        self.layout.initialize()?;
        let _lock = VenvLock::acquire(&self.layout.lock_file(name))?;
        let result = match self.current_state(name) {
            Ok(EnvState::Absent) => self.run_create(name, &source_dir, git_ref),
            Ok(_) => Err(CoreError::NameConflict(name.to_owned())),
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.discard_placeholder(name);
        }
        result
    }

    fn run_create(
        &self,
        name: &str,
        source_dir: &Path,
        git_ref: Option<&str>,
    ) -> Result<Option<String>, CoreError> {
        validate_transition(EnvState::Absent, EnvState::Created)?;
        self.provision(name, source_dir, git_ref, true)
    }

    fn provision(
        &self,
        name: &str,
        source_dir: &Path,
        git_ref: Option<&str>,
        fresh: bool,
    ) -> Result<Option<String>, CoreError> {
        self.warn_port_collisions(name);
        let previous = if fresh {
            None
        } else {
            Some(self.metadata_or_inferred(name)?)
        };
        let git_ref = git_ref
            .map(str::to_owned)
            .or_else(|| previous.as_ref().map(|m| m.source_ref.clone()))
            .unwrap_or_else(|| DEFAULT_SOURCE_REF.to_owned());

        let revision = match self
            .backend
            .provision_source(&self.spec(name), source_dir, &git_ref)
        {
            Ok(revision) => revision,
            Err(e) => {
                if fresh {
                    let root = self.layout.venv_path(name);
                    debug!("removing {} after failed provisioning", root.display());
                    if let Err(rm) = std::fs::remove_dir_all(&root) {
                        warn!("could not remove {}: {rm}", root.display());
                    }
                }
                return Err(e.into());
            }
        };

        let mut meta = match previous {
            Some(mut meta) => {
                meta.source_ref.clone_from(&git_ref);
                meta.updated_at = chrono::Utc::now().to_rfc3339();
                meta
            }
            None => self.new_metadata(name, EnvState::Created, &git_ref),
        };
        meta.source_dir = source_dir.display().to_string();
        meta.source_revision = revision;
        self.meta_store.put(&meta)?;
        info!(
            "copied {} at {} into '{name}'",
            source_dir.display(),
            meta.source_revision.as_deref().unwrap_or(&git_ref)
        );
        Ok(meta.source_revision)
    }

    /// Replace the source tree of `name`, creating the environment first if
    /// it does not exist. Returns the description of the exported revision.
    pub fn fetch_source(&self, name: &str, git_ref: Option<&str>) -> Result<Option<String>, CoreError> {
        validate_env_name(name)?;
        if self.current_state(name)? == EnvState::Absent {
            return self.create(name, git_ref);
        }
        info!("fetching source for pg_venv {name}");
        let (_, _lock) = self.guard(name, "fetch source for", any_state)?;
        let source_dir = match self.settings.source_dir() {
            Ok(dir) => dir.to_path_buf(),
            Err(e) => match self.meta_store.get(name) {
                Ok(meta) if !meta.source_dir.is_empty() => PathBuf::from(meta.source_dir),
                _ => return Err(e),
            },
        };
        self.provision(name, &source_dir, git_ref, false)
    }

    pub fn configure(&self, name: &str, args: &[String]) -> Result<(), CoreError> {
        info!("configuring pg_venv {name}");
        let (_, _lock) = self.guard(name, "configure", any_state)?;
        self.run_configure(name, args)
    }

    fn run_configure(&self, name: &str, args: &[String]) -> Result<(), CoreError> {
        let mut options = self.metadata_or_inferred(name)?.configure_options;
        options.extend_from_slice(args);
        debug!("configure options for '{name}': {options:?}");
        self.backend.configure(&self.spec(name), &options)?;
        Ok(())
    }

    pub fn make(&self, name: &str, args: &[String]) -> Result<(), CoreError> {
        info!("compiling pg_venv {name}");
        let (from, _lock) = self.guard(name, "make", any_state)?;
        self.run_make(name, from, MakeTarget::Build, args)
    }

    pub fn make_check(&self, name: &str) -> Result<(), CoreError> {
        info!("running make check for pg_venv {name}");
        let (from, _lock) = self.guard(name, "run make check for", built)?;
        self.run_make(name, from, MakeTarget::Check, &[])
    }

    pub fn make_clean(&self, name: &str) -> Result<(), CoreError> {
        info!("running make clean for pg_venv {name}");
        let (from, _lock) = self.guard(name, "run make clean for", any_state)?;
        self.run_make(name, from, MakeTarget::Clean, &[])
    }

    pub fn install(&self, name: &str) -> Result<(), CoreError> {
        info!("installing pg_venv {name}");
        let (from, _lock) = self.guard(name, "install", built)?;
        self.run_make(name, from, MakeTarget::Install, &[])
    }

    fn run_make(
        &self,
        name: &str,
        from: EnvState,
        target: MakeTarget,
        args: &[String],
    ) -> Result<(), CoreError> {
        let raise = match target {
            MakeTarget::Build => Some(EnvState::Built),
            MakeTarget::Install => Some(EnvState::Installed),
            MakeTarget::Check | MakeTarget::Clean => None,
        }
        .filter(|to| from.rank() < to.rank());
        if let Some(to) = raise {
            validate_transition(from, to)?;
        }
        self.backend.make(&self.spec(name), target, args)?;
        if let Some(to) = raise {
            self.record_state(name, to)?;
        }
        Ok(())
    }

    /// Initialize the data directory with `initdb`.
    pub fn init(&self, name: &str) -> Result<(), CoreError> {
        info!("initializing cluster for pg_venv {name}");
        let (from, _lock) = self.guard(name, "initialize", installed_without_data)?;
        self.run_init(name, from)
    }

    fn run_init(&self, name: &str, from: EnvState) -> Result<(), CoreError> {
        validate_transition(from, EnvState::Initialized)?;
        self.backend.initdb(&self.spec(name))?;
        self.record_state(name, EnvState::Initialized)
    }

    pub fn start(&self, name: &str) -> Result<(), CoreError> {
        info!("starting pg_venv {name}");
        let (from, _lock) = self.guard(name, "start", startable)?;
        self.run_start(name, from)
    }

    fn run_start(&self, name: &str, from: EnvState) -> Result<(), CoreError> {
        validate_transition(from, EnvState::Running)?;
        self.warn_port_collisions(name);
        self.backend.start(&self.spec(name), self.settings.start_timeout)?;
        let timeout = self.settings.start_timeout;
        if !wait_until(timeout, || self.registry.is_running(name)) {
            return Err(CoreError::Timeout {
                action: "start",
                name: name.to_owned(),
                secs: timeout.as_secs(),
            });
        }
        self.record_state(name, EnvState::Running)
    }

    pub fn stop(&self, name: &str) -> Result<(), CoreError> {
        info!("stopping pg_venv {name}");
        let (from, _lock) = self.guard(name, "stop", running)?;
        self.run_stop(name, from)
    }

    fn run_stop(&self, name: &str, from: EnvState) -> Result<(), CoreError> {
        validate_transition(from, EnvState::Stopped)?;
        let timeout = self.settings.stop_timeout;
        self.backend.stop(&self.spec(name), timeout)?;
        if !wait_until(timeout, || !self.registry.is_running(name)) {
            return Err(CoreError::Timeout {
                action: "stop",
                name: name.to_owned(),
                secs: timeout.as_secs(),
            });
        }
        self.record_state(name, EnvState::Stopped)
    }

    /// Stop the server if it runs, then start it.
    pub fn restart(&self, name: &str) -> Result<(), CoreError> {
        info!("restarting pg_venv {name}");
        let (mut from, _lock) = self.guard(name, "restart", initialized)?;
        if from == EnvState::Running {
            self.run_stop(name, from)?;
            from = EnvState::Stopped;
        }
        self.run_start(name, from)
    }

    /// Validate that the data directory may be removed; returns its path for
    /// the confirmation prompt.
    pub fn check_rm_data(&self, name: &str) -> Result<PathBuf, CoreError> {
        let state = self.state(name)?;
        if let Some(reason) = data_removable(state) {
            return Err(CoreError::InvalidState {
                name: name.to_owned(),
                action: "remove data of",
                state,
                reason,
            });
        }
        Ok(self.layout.data_dir(name))
    }

    /// Delete the data directory. `confirmation` must repeat the name.
    pub fn rm_data(&self, name: &str, confirmation: &str) -> Result<(), CoreError> {
        self.check_rm_data(name)?;
        if confirmation != name {
            return Err(CoreError::ConfirmationMismatch {
                expected: name.to_owned(),
                got: confirmation.to_owned(),
            });
        }
        info!("removing data directory of pg_venv {name}");
        let (from, _lock) = self.guard(name, "remove data of", data_removable)?;
        validate_transition(from, EnvState::Installed)?;
        let data_dir = self.layout.data_dir(name);
        if data_dir.exists() {
            std::fs::remove_dir_all(&data_dir)?;
        }
        self.record_state(name, EnvState::Installed)
    }

    /// Validate that the environment may be removed; returns its root for
    /// the confirmation prompt.
    pub fn check_rm_virtualenv(&self, name: &str) -> Result<PathBuf, CoreError> {
        let state = self.state(name)?;
        if let Some(reason) = not_running(state) {
            return Err(CoreError::InvalidState {
                name: name.to_owned(),
                action: "remove",
                state,
                reason,
            });
        }
        Ok(self.layout.venv_path(name))
    }

    /// Delete everything the environment owns. `confirmation` must repeat
    /// the name.
    pub fn rm_virtualenv(&self, name: &str, confirmation: &str) -> Result<(), CoreError> {
        self.check_rm_virtualenv(name)?;
        if confirmation != name {
            return Err(CoreError::ConfirmationMismatch {
                expected: name.to_owned(),
                got: confirmation.to_owned(),
            });
        }
        info!("removing pg_venv {name}");
        let (from, _lock) = self.guard(name, "remove", not_running)?;
        validate_transition(from, EnvState::Absent)?;
        std::fs::remove_dir_all(self.layout.venv_path(name))?;
        Ok(())
    }

    /// Path of the server log of an initialized environment.
    pub fn log_file(&self, name: &str) -> Result<PathBuf, CoreError> {
        let state = self.state(name)?;
        if !state.at_least(EnvState::Initialized) {
            return Err(CoreError::LogUnavailable(format!(
                "'{name}' has no server log yet (state: {state})"
            )));
        }
        let path = self.layout.log_file(name);
        if !path.is_file() {
            return Err(CoreError::LogUnavailable(format!(
                "no server log at {}",
                path.display()
            )));
        }
        Ok(path)
    }

    /// The last `lines` lines of the server log.
    pub fn tail_log(&self, name: &str, lines: usize) -> Result<String, CoreError> {
        let path = self.log_file(name)?;
        read_tail(&path, lines)
            .map_err(|e| CoreError::LogUnavailable(format!("{}: {e}", path.display())))
    }

    /// Provision, build, install, initialize and start `name`, then create
    /// its default database. An environment left part-way by an earlier run
    /// resumes after its last completed step.
    pub fn create_virtualenv(
        &self,
        name: &str,
        git_ref: Option<&str>,
        on_event: &mut dyn FnMut(PipelineEvent),
    ) -> Result<(), CoreError> {
        validate_env_name(name)?;
        let initial = self.current_state(name)?;
        resumable(name, initial)?;
        if !initial.at_least(EnvState::Created) {
            self.settings.source_dir()?;
        }

        self.layout.initialize()?;
        let _lock = VenvLock::acquire(&self.layout.lock_file(name))?;
        let result = self.run_pipeline(name, git_ref, on_event);
        if result.is_err() {
            self.discard_placeholder(name);
        }
        result
    }

    fn run_pipeline(
        &self,
        name: &str,
        git_ref: Option<&str>,
        on_event: &mut dyn FnMut(PipelineEvent),
    ) -> Result<(), CoreError> {
        let initial = self.current_state(name)?;
        resumable(name, initial)?;
        if initial == EnvState::Absent {
            info!("creating pg_venv {name}");
        } else {
            info!("resuming pg_venv {name} from state {initial}");
        }
        let jobs = vec![format!("-j{}", self.settings.make_jobs)];

        for step in PipelineStep::ALL {
            if shutdown_requested() {
                return Err(CoreError::Interrupted(name.to_owned()));
            }
            let from = if step == PipelineStep::Provision {
                initial
            } else {
                self.state(name)?
            };
            if step.done_at(from) {
                debug!("'{name}': skipping {step}");
                on_event(PipelineEvent::Skipped(step));
                continue;
            }
            on_event(PipelineEvent::Started(step));
            let result = match step {
                PipelineStep::Provision => self
                    .settings
                    .source_dir()
                    .and_then(|dir| self.run_create(name, dir, git_ref))
                    .map(drop),
                PipelineStep::Configure => self.run_configure(name, &[]),
                PipelineStep::Make => self.run_make(name, from, MakeTarget::Build, &jobs),
                PipelineStep::Install => self.run_make(name, from, MakeTarget::Install, &[]),
                PipelineStep::Initdb => self.run_init(name, from),
                PipelineStep::Start => self.run_start(name, from),
                PipelineStep::Createdb => self
                    .backend
                    .createdb(&self.spec(name))
                    .map_err(CoreError::from),
            };
            if let Err(e) = result {
                on_event(PipelineEvent::Failed(step));
                return Err(e);
            }
            on_event(PipelineEvent::Finished(step));
        }
        info!("pg_venv {name} created");
        Ok(())
    }

    /// Shell code switching the calling shell to `name`.
    pub fn workon(&self, name: &str, ctx: &ShellContext) -> Result<OutputIntent, CoreError> {
        validate_env_name(name)?;
        if !self.registry.exists(name) {
            return Err(CoreError::NotFound(name.to_owned()));
        }
        let port = self.ports.port_for(name);
        debug!("switching to '{name}' on port {port}");
        Ok(OutputIntent::Evaluate(workon_fragment(
            &self.layout,
            name,
            port,
            ctx,
        )))
    }

    /// Shell code leaving the active environment.
    pub fn deactivate(&self, ctx: &ShellContext) -> Result<OutputIntent, CoreError> {
        Ok(OutputIntent::Evaluate(deactivate_fragment(
            &self.layout,
            ctx,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgvenv_runtime::mock::MockBackend;

    fn test_engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("postgresql");
        std::fs::create_dir_all(&source).unwrap();
        let mut settings = Settings::new(dir.path().join("venvs"));
        settings.source_dir = Some(source);
        settings.start_timeout = Duration::from_secs(5);
        settings.stop_timeout = Duration::from_secs(5);
        let engine = Engine::with_backend(settings, Box::new(MockBackend::new()));
        (dir, engine)
    }

    #[test]
    fn create_records_created_state() {
        let (_dir, engine) = test_engine();
        engine.create("alpha", None).unwrap();
        assert_eq!(engine.state("alpha").unwrap(), EnvState::Created);
        assert!(engine.layout().src_dir("alpha").join("configure").exists());
        assert_eq!(engine.list().unwrap(), vec!["alpha"]);
    }

    #[test]
    fn create_existing_name_conflicts() {
        let (_dir, engine) = test_engine();
        engine.create("alpha", None).unwrap();
        assert!(matches!(
            engine.create("alpha", None),
            Err(CoreError::NameConflict(_))
        ));
        engine.fetch_source("alpha", Some("REL_16_STABLE")).unwrap();
        let meta = engine.meta_store.get("alpha").unwrap();
        assert_eq!(meta.source_ref, "REL_16_STABLE");
    }

    #[test]
    fn fetch_source_creates_missing_environment() {
        let (_dir, engine) = test_engine();
        engine.fetch_source("alpha", None).unwrap();
        assert_eq!(engine.state("alpha").unwrap(), EnvState::Created);
        assert!(engine.layout().src_dir("alpha").join("configure").exists());
    }

    #[test]
    fn placeholder_root_counts_as_absent() {
        let (_dir, engine) = test_engine();
        let lock = VenvLock::acquire(&engine.layout().lock_file("alpha")).unwrap();
        assert!(engine.is_placeholder("alpha"));
        assert_eq!(engine.current_state("alpha").unwrap(), EnvState::Absent);
        drop(lock);

        engine.create("alpha", None).unwrap();
        assert!(!engine.is_placeholder("alpha"));
        assert_eq!(engine.current_state("alpha").unwrap(), EnvState::Created);
    }

    #[test]
    fn creation_after_waiting_on_lock_sees_new_environment() {
        let (_dir, engine) = test_engine();
        assert_eq!(engine.current_state("alpha").unwrap(), EnvState::Absent);
        engine
            .create_virtualenv("alpha", None, &mut |_| {})
            .unwrap();
        let lock = VenvLock::acquire(&engine.layout().lock_file("alpha")).unwrap();
        assert!(matches!(
            engine.run_pipeline("alpha", None, &mut |_| {}),
            Err(CoreError::NameConflict(_))
        ));
        assert_eq!(engine.state("alpha").unwrap(), EnvState::Running);
        assert_eq!(
            engine.meta_store.get("alpha").unwrap().state,
            EnvState::Running
        );
        drop(lock);
        engine.stop("alpha").unwrap();
    }

    #[test]
    fn early_pipeline_failure_removes_placeholder() {
        let (_dir, engine) = test_engine();
        engine.layout().initialize().unwrap();
        let lock = VenvLock::acquire(&engine.layout().lock_file("alpha")).unwrap();
        engine.discard_placeholder("alpha");
        drop(lock);
        assert!(!engine.layout().venv_path("alpha").exists());
        assert!(engine.list().unwrap().is_empty());

        engine.create("alpha", None).unwrap();
        engine.discard_placeholder("alpha");
        assert!(engine.exists("alpha"), "a provisioned root is never discarded");
    }

    #[test]
    fn failed_first_provisioning_leaves_nothing() {
        let (dir, engine) = test_engine();
        let mut settings = engine.settings().clone();
        settings.source_dir = Some(dir.path().join("missing"));
        let engine = Engine::with_backend(settings, Box::new(MockBackend::new()));
        assert!(matches!(
            engine.create("alpha", None),
            Err(CoreError::SourceUnavailable(_))
        ));
        assert!(!engine.exists("alpha"));
        assert!(engine.list().unwrap().is_empty());
    }

    #[test]
    fn create_without_source_dir_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::with_backend(
            Settings::new(dir.path().join("venvs")),
            Box::new(MockBackend::new()),
        );
        assert!(matches!(
            engine.create("alpha", None),
            Err(CoreError::Config(_))
        ));
        assert!(!engine.exists("alpha"));
    }

    #[test]
    fn operations_on_unknown_name() {
        let (_dir, engine) = test_engine();
        assert!(matches!(engine.start("ghost"), Err(CoreError::NotFound(_))));
        assert!(matches!(engine.make("ghost", &[]), Err(CoreError::NotFound(_))));
        assert!(matches!(
            engine.workon("ghost", &ShellContext::default()),
            Err(CoreError::NotFound(_))
        ));
        assert!(!engine.layout().venv_path("ghost").exists());
    }

    #[test]
    fn invalid_names_rejected() {
        let (_dir, engine) = test_engine();
        assert!(matches!(
            engine.create("../evil", None),
            Err(CoreError::InvalidName(_))
        ));
        assert!(matches!(engine.port("a b"), Err(CoreError::InvalidName(_))));
    }

    #[test]
    fn install_before_make_is_invalid_state() {
        let (_dir, engine) = test_engine();
        engine.create("alpha", None).unwrap();
        assert!(matches!(
            engine.install("alpha"),
            Err(CoreError::InvalidState { action: "install", .. })
        ));
        engine.make("alpha", &[]).unwrap();
        assert_eq!(engine.state("alpha").unwrap(), EnvState::Built);
        engine.install("alpha").unwrap();
        assert_eq!(engine.state("alpha").unwrap(), EnvState::Installed);
    }

    #[test]
    fn make_after_install_keeps_state() {
        let (_dir, engine) = test_engine();
        engine.create("alpha", None).unwrap();
        engine.make("alpha", &[]).unwrap();
        engine.install("alpha").unwrap();
        engine.make("alpha", &[]).unwrap();
        engine.make_clean("alpha").unwrap();
        assert_eq!(engine.state("alpha").unwrap(), EnvState::Installed);
    }

    #[test]
    fn init_twice_is_invalid_state() {
        let (_dir, engine) = test_engine();
        engine.create("alpha", None).unwrap();
        engine.make("alpha", &[]).unwrap();
        engine.install("alpha").unwrap();
        engine.init("alpha").unwrap();
        assert!(matches!(
            engine.init("alpha"),
            Err(CoreError::InvalidState { .. })
        ));
    }

    #[test]
    fn log_requires_initialized_environment() {
        let (_dir, engine) = test_engine();
        engine.create("alpha", None).unwrap();
        assert!(matches!(
            engine.log_file("alpha"),
            Err(CoreError::LogUnavailable(_))
        ));
    }

    #[test]
    fn restart_cycles_server() {
        let (_dir, engine) = test_engine();
        engine
            .create_virtualenv("alpha", None, &mut |_| {})
            .unwrap();
        engine.restart("alpha").unwrap();
        assert_eq!(engine.state("alpha").unwrap(), EnvState::Running);
        engine.stop("alpha").unwrap();
        engine.restart("alpha").unwrap();
        assert_eq!(engine.state("alpha").unwrap(), EnvState::Running);
        engine.stop("alpha").unwrap();
    }

    #[test]
    fn tail_log_returns_last_lines() {
        let (_dir, engine) = test_engine();
        engine
            .create_virtualenv("alpha", None, &mut |_| {})
            .unwrap();
        engine.stop("alpha").unwrap();
        let tail = engine.tail_log("alpha", 1).unwrap();
        assert_eq!(tail, "LOG:  database system is shut down\n");
        let all = engine.tail_log("alpha", 100).unwrap();
        assert!(all.contains("listening on port"));
    }

    #[test]
    fn tail_log_tolerates_non_utf8_bytes() {
        use std::io::Write;
        let (_dir, engine) = test_engine();
        engine
            .create_virtualenv("alpha", None, &mut |_| {})
            .unwrap();
        engine.stop("alpha").unwrap();
        let mut log = std::fs::OpenOptions::new()
            .append(true)
            .open(engine.layout().log_file("alpha"))
            .unwrap();
        log.write_all(b"STATEMENT:  SELECT '\xe9t\xe9'\n").unwrap();

        let tail = engine.tail_log("alpha", 2).unwrap();
        assert!(tail.starts_with("LOG:  database system is shut down\n"));
        assert!(tail.contains("STATEMENT:  SELECT '"));
    }

    #[test]
    fn info_reports_version_and_source() {
        let (_dir, engine) = test_engine();
        engine
            .create_virtualenv("alpha", Some("REL_16_STABLE"), &mut |_| {})
            .unwrap();
        let info = engine.info("alpha").unwrap();
        assert_eq!(info.port, 24285);
        assert_eq!(info.state, EnvState::Running);
        assert_eq!(info.listening_port, Some(24285));
        assert_eq!(info.source_ref.as_deref(), Some("REL_16_STABLE"));
        assert!(info.version.is_some());
        engine.stop("alpha").unwrap();
        assert_eq!(engine.info("alpha").unwrap().listening_port, None);
    }

    #[test]
    fn legacy_environment_state_is_inferred() {
        let (_dir, engine) = test_engine();
        let layout = engine.layout().clone();
        std::fs::create_dir_all(layout.bin_dir("old")).unwrap();
        std::fs::write(layout.pg_ctl("old"), "#!/bin/sh\n").unwrap();
        assert_eq!(engine.state("old").unwrap(), EnvState::Installed);
    }

    #[test]
    fn pipeline_steps_skip_by_state() {
        assert!(PipelineStep::Provision.done_at(EnvState::Created));
        assert!(!PipelineStep::Configure.done_at(EnvState::Created));
        assert!(PipelineStep::Make.done_at(EnvState::Installed));
        assert!(!PipelineStep::Initdb.done_at(EnvState::Installed));
        assert!(!PipelineStep::Start.done_at(EnvState::Initialized));
        assert!(PipelineStep::Createdb.done_at(EnvState::Running));
    }
}
