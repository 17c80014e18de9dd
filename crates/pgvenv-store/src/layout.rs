use crate::StoreError;
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the per-environment metadata file inside its root directory.
pub const METADATA_FILE: &str = "pgvenv.json";
/// The server log lives at `<root>/<name>.log`.
pub const LOG_SUFFIX: &str = ".log";
const LOCK_FILE: &str = ".lock";

/// Directory layout of the registry root and of every environment under it.
///
/// Each environment owns exactly one directory, `<root>/<name>`, which doubles
/// as the install prefix handed to `configure`:
///
/// ```text
/// <root>/<name>/
///     src/            source tree provisioned from PG_DIR
///     bin/ lib/ ...   install prefix
///     data/           PGDATA
///     <name>.log      server log
///     pgvenv.json     metadata
///     .lock           advisory lock
/// ```
#[derive(Debug, Clone)]
pub struct RegistryLayout {
    root: PathBuf,
}

impl RegistryLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn venv_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    #[inline]
    pub fn src_dir(&self, name: &str) -> PathBuf {
        self.venv_path(name).join("src")
    }

    #[inline]
    pub fn bin_dir(&self, name: &str) -> PathBuf {
        self.venv_path(name).join("bin")
    }

    #[inline]
    pub fn lib_dir(&self, name: &str) -> PathBuf {
        self.venv_path(name).join("lib")
    }

    #[inline]
    pub fn data_dir(&self, name: &str) -> PathBuf {
        self.venv_path(name).join("data")
    }

    #[inline]
    pub fn log_file(&self, name: &str) -> PathBuf {
        self.venv_path(name).join(format!("{name}{LOG_SUFFIX}"))
    }

    #[inline]
    pub fn metadata_file(&self, name: &str) -> PathBuf {
        self.venv_path(name).join(METADATA_FILE)
    }

    #[inline]
    pub fn lock_file(&self, name: &str) -> PathBuf {
        self.venv_path(name).join(LOCK_FILE)
    }

    /// Written by the postmaster while it runs; removed on clean shutdown.
    #[inline]
    pub fn pid_file(&self, name: &str) -> PathBuf {
        self.data_dir(name).join("postmaster.pid")
    }

    /// Present once `initdb` has populated the data directory.
    #[inline]
    pub fn pg_version_file(&self, name: &str) -> PathBuf {
        self.data_dir(name).join("PG_VERSION")
    }

    #[inline]
    pub fn pg_ctl(&self, name: &str) -> PathBuf {
        self.bin_dir(name).join("pg_ctl")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_correct() {
        let layout = RegistryLayout::new("/tmp/pgvenv-test");
        assert_eq!(
            layout.venv_path("alpha"),
            PathBuf::from("/tmp/pgvenv-test/alpha")
        );
        assert_eq!(
            layout.src_dir("alpha"),
            PathBuf::from("/tmp/pgvenv-test/alpha/src")
        );
        assert_eq!(
            layout.bin_dir("alpha"),
            PathBuf::from("/tmp/pgvenv-test/alpha/bin")
        );
        assert_eq!(
            layout.lib_dir("alpha"),
            PathBuf::from("/tmp/pgvenv-test/alpha/lib")
        );
        assert_eq!(
            layout.data_dir("alpha"),
            PathBuf::from("/tmp/pgvenv-test/alpha/data")
        );
        assert_eq!(
            layout.log_file("alpha"),
            PathBuf::from("/tmp/pgvenv-test/alpha/alpha.log")
        );
        assert_eq!(
            layout.pid_file("alpha"),
            PathBuf::from("/tmp/pgvenv-test/alpha/data/postmaster.pid")
        );
        assert_eq!(
            layout.pg_ctl("alpha"),
            PathBuf::from("/tmp/pgvenv-test/alpha/bin/pg_ctl")
        );
    }

    #[test]
    fn distinct_names_get_distinct_roots() {
        let layout = RegistryLayout::new("/tmp/pgvenv-test");
        let names = ["alpha", "beta", "alpha_", "Alpha", "alpha-1"];
        for (i, a) in names.iter().enumerate() {
            for b in &names[i + 1..] {
                assert_ne!(layout.venv_path(a), layout.venv_path(b));
            }
        }
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RegistryLayout::new(dir.path().join("venvs"));
        layout.initialize().unwrap();
        layout.initialize().unwrap();
        assert!(layout.root().is_dir());
    }
}
