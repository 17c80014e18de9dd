use crate::CoreError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const ENV_HOME: &str = "PG_VIRTUALENV_HOME";
pub const ENV_SOURCE: &str = "PG_DIR";
pub const ENV_CONFIGURE: &str = "PG_CONFIGURE_OPTIONS";
pub const ENV_ACTIVE: &str = "PG_VENV";
pub const ENV_BACKEND: &str = "PGVENV_BACKEND";
pub const ENV_CONFIG: &str = "PGVENV_CONFIG";

const DEFAULT_HOME_DIR: &str = "pg_virtualenvs";
const DEFAULT_BACKEND: &str = "postgres";
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Optional settings file, `~/.config/pgvenv/config.json`. Every field may be
/// omitted; environment variables take precedence over it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub home: Option<PathBuf>,
    pub source_dir: Option<PathBuf>,
    pub configure_options: Option<String>,
    pub backend: Option<String>,
    pub start_timeout_secs: Option<u64>,
    pub stop_timeout_secs: Option<u64>,
    pub make_jobs: Option<usize>,
}

impl FileConfig {
    /// Load from `$PGVENV_CONFIG`, falling back to the default location.
    /// A missing file is an empty configuration.
    pub fn load_default() -> Result<Self, CoreError> {
        let path = match std::env::var_os(ENV_CONFIG) {
            Some(p) => PathBuf::from(p),
            None => match default_config_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            debug!("no config file at {}", path.display());
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| CoreError::Config(format!("invalid config {}: {e}", path.display())))
    }
}

fn default_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config/pgvenv/config.json"))
}

/// Effective settings for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Registry root holding one directory per environment.
    pub home: PathBuf,
    /// Git checkout new environments are provisioned from.
    pub source_dir: Option<PathBuf>,
    pub configure_options: Vec<String>,
    pub backend: String,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub make_jobs: usize,
}

impl Settings {
    /// Settings for a registry at `home` with every other value defaulted.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            source_dir: None,
            configure_options: Vec::new(),
            backend: DEFAULT_BACKEND.to_owned(),
            start_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            stop_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            make_jobs: default_jobs(),
        }
    }

    /// Merge the file configuration with variables obtained through `lookup`.
    /// Variables win over the file.
    pub fn resolve(
        file: FileConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, CoreError> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let home = match non_empty(ENV_HOME).map(PathBuf::from).or(file.home) {
            Some(home) => home,
            None => {
                let user_home = non_empty("HOME").ok_or_else(|| {
                    CoreError::Config(format!("neither {ENV_HOME} nor HOME is set"))
                })?;
                PathBuf::from(user_home).join(DEFAULT_HOME_DIR)
            }
        };

        let mut settings = Self::new(home);
        settings.source_dir = non_empty(ENV_SOURCE).map(PathBuf::from).or(file.source_dir);
        let raw_options = non_empty(ENV_CONFIGURE)
            .or(file.configure_options)
            .unwrap_or_default();
        let options = shlex::split(&raw_options).ok_or_else(|| {
            CoreError::Config(format!("unbalanced quoting in {ENV_CONFIGURE}: {raw_options}"))
        })?;
        settings.configure_options = strip_prefix_option(options);
        if let Some(backend) = non_empty(ENV_BACKEND).or(file.backend) {
            settings.backend = backend;
        }
        if let Some(secs) = file.start_timeout_secs {
            settings.start_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.stop_timeout_secs {
            settings.stop_timeout = Duration::from_secs(secs);
        }
        if let Some(jobs) = file.make_jobs {
            if jobs == 0 {
                return Err(CoreError::Config("make_jobs must be at least 1".to_owned()));
            }
            settings.make_jobs = jobs;
        }
        Ok(settings)
    }

    /// Settings from the process environment and the default config file.
    /// `home_override` (the `--home` flag) beats both.
    pub fn from_environment(home_override: Option<PathBuf>) -> Result<Self, CoreError> {
        let file = FileConfig::load_default()?;
        let mut settings = Self::resolve(file, |key| std::env::var(key).ok())?;
        if let Some(home) = home_override {
            settings.home = home;
        }
        Ok(settings)
    }

    pub fn source_dir(&self) -> Result<&Path, CoreError> {
        self.source_dir
            .as_deref()
            .ok_or_else(|| CoreError::Config(format!("{ENV_SOURCE} is not set")))
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// The install prefix is always the environment root; a user-supplied one
/// is dropped.
fn strip_prefix_option(options: Vec<String>) -> Vec<String> {
    let mut kept = Vec::with_capacity(options.len());
    let mut iter = options.into_iter();
    while let Some(opt) = iter.next() {
        if opt == "--prefix" {
            warn!("ignoring --prefix in {ENV_CONFIGURE}");
            iter.next();
        } else if opt.starts_with("--prefix=") {
            warn!("ignoring {opt} in {ENV_CONFIGURE}");
        } else {
            kept.push(opt);
        }
    }
    kept
}
