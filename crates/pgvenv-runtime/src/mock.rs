use crate::backend::{MakeTarget, ToolchainBackend, VenvSpec};
use crate::RuntimeError;
use pgvenv_store::{pid_alive, read_postmaster_pid};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

const MOCK_VERSION: &str = "16.0-mock";
const SERVER_PROGRAMS: &[&str] = &["pg_ctl", "initdb", "createdb", "pg_config", "postgres"];

/// Filesystem-only stand-in for the PostgreSQL toolchain.
///
/// Each step leaves the artifacts the real one would (a source tree, binaries
/// in the prefix, `PG_VERSION`, `postmaster.pid`) so the engine's state
/// reconciliation sees a faithful picture. The "server" is a detached `sleep`
/// process whose PID is recorded in `postmaster.pid`. Servers started by a
/// backend are killed when it is dropped, unless it was built `detached`.
pub struct MockBackend {
    servers: Mutex<HashMap<String, Child>>,
    fail_step: Option<String>,
    detached: bool,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
            fail_step: None,
            detached: false,
        }
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose servers outlive it, as a real postmaster outlives
    /// `pg_ctl`.
    pub fn detached() -> Self {
        let mut backend = Self::default();
        backend.detached = true;
        backend
    }

    /// A backend whose step named `step` (e.g. `"make"`, `"initdb"`) exits 2.
    pub fn failing(step: &str) -> Self {
        let mut backend = Self::default();
        backend.fail_step = Some(step.to_owned());
        backend
    }

    fn check_injected(&self, step: &str) -> Result<(), RuntimeError> {
        if self.fail_step.as_deref() == Some(step) {
            return Err(RuntimeError::ToolFailed {
                step: step.to_owned(),
                code: Some(2),
                output: format!("mock: {step} failed\n"),
            });
        }
        Ok(())
    }

    fn require(path: &Path, step: &str, what: &str) -> Result<(), RuntimeError> {
        if path.exists() {
            Ok(())
        } else {
            Err(RuntimeError::ToolFailed {
                step: step.to_owned(),
                code: Some(1),
                output: format!("mock: {what} missing: {}\n", path.display()),
            })
        }
    }

    fn append_log(spec: &VenvSpec, line: &str) -> Result<(), RuntimeError> {
        let mut log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_file)?;
        writeln!(log, "{line}")?;
        Ok(())
    }

    /// Name of another live mock server already bound to `spec.port`.
    fn port_holder(spec: &VenvSpec) -> Option<String> {
        let entries = fs::read_dir(&spec.registry_root).ok()?;
        entries.flatten().find_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == spec.name {
                return None;
            }
            let pid = read_postmaster_pid(&entry.path().join("data").join("postmaster.pid"))?;
            (pid.port == Some(spec.port) && pid_alive(pid.pid)).then_some(name)
        })
    }

    #[allow(unsafe_code)]
    fn terminate(pid: i32) {
        // SAFETY: sending SIGTERM to a PID read from our own pid file.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
}

impl ToolchainBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn provision_source(
        &self,
        spec: &VenvSpec,
        source_dir: &Path,
        git_ref: &str,
    ) -> Result<Option<String>, RuntimeError> {
        if !source_dir.is_dir() {
            return Err(RuntimeError::SourceUnavailable(format!(
                "{} is not a directory",
                source_dir.display()
            )));
        }
        self.check_injected("git archive")?;
        if spec.src_dir.exists() {
            fs::remove_dir_all(&spec.src_dir)?;
        }
        fs::create_dir_all(spec.src_dir.join("contrib"))?;
        fs::write(spec.src_dir.join("README"), format!("mock source at {git_ref}\n"))?;
        fs::write(spec.src_dir.join("configure"), "#!/bin/sh\n")?;
        Ok(Some(format!("mock-{git_ref}")))
    }

    fn configure(&self, spec: &VenvSpec, options: &[String]) -> Result<(), RuntimeError> {
        Self::require(&spec.src_dir.join("configure"), "configure", "configure script")?;
        self.check_injected("configure")?;
        let mut status = format!("--prefix={}\n", spec.prefix.display());
        for opt in options {
            status.push_str(opt);
            status.push('\n');
        }
        fs::write(spec.src_dir.join("config.status"), status)?;
        Ok(())
    }

    fn make(
        &self,
        spec: &VenvSpec,
        target: MakeTarget,
        args: &[String],
    ) -> Result<(), RuntimeError> {
        let step = target.step_name();
        Self::require(&spec.src_dir, step, "source tree")?;
        self.check_injected(step)?;
        let built = spec.src_dir.join(".built");
        match target {
            MakeTarget::Build => fs::write(&built, args.join(" "))?,
            MakeTarget::Check => Self::require(&built, step, "build output")?,
            MakeTarget::Clean => {
                if built.exists() {
                    fs::remove_file(&built)?;
                }
            }
            MakeTarget::Install => {
                Self::require(&built, step, "build output")?;
                fs::create_dir_all(&spec.bin_dir)?;
                fs::create_dir_all(&spec.lib_dir)?;
                for program in SERVER_PROGRAMS {
                    fs::write(spec.bin(program), "#!/bin/sh\n")?;
                }
            }
        }
        Ok(())
    }

    fn initdb(&self, spec: &VenvSpec) -> Result<(), RuntimeError> {
        Self::require(&spec.bin("initdb"), "initdb", "initdb binary")?;
        self.check_injected("initdb")?;
        let version_file = spec.data_dir.join("PG_VERSION");
        if version_file.exists() {
            return Err(RuntimeError::ToolFailed {
                step: "initdb".to_owned(),
                code: Some(1),
                output: format!(
                    "initdb: error: directory \"{}\" exists but is not empty\n",
                    spec.data_dir.display()
                ),
            });
        }
        fs::create_dir_all(&spec.data_dir)?;
        fs::write(version_file, "16\n")?;
        fs::write(spec.data_dir.join("postgresql.conf"), "# mock\n")?;
        Ok(())
    }

    fn start(&self, spec: &VenvSpec, _timeout: Duration) -> Result<(), RuntimeError> {
        Self::require(&spec.data_dir.join("PG_VERSION"), "pg_ctl start", "data directory")?;
        self.check_injected("pg_ctl start")?;
        if let Some(holder) = Self::port_holder(spec) {
            Self::append_log(
                spec,
                &format!(
                    "LOG:  could not bind IPv4 address \"127.0.0.1\": Address already in use (port {} held by {holder})",
                    spec.port
                ),
            )?;
            return Err(RuntimeError::ToolFailed {
                step: "pg_ctl start".to_owned(),
                code: Some(1),
                output: format!(
                    "FATAL:  could not create any TCP/IP sockets on port {}: Address already in use\n",
                    spec.port
                ),
            });
        }

        let child = Command::new("sleep")
            .arg("600")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                program: "sleep".to_owned(),
                source,
            })?;
        fs::write(
            spec.data_dir.join("postmaster.pid"),
            format!(
                "{}\n{}\n0\n{}\n/tmp\nlocalhost\n",
                child.id(),
                spec.data_dir.display(),
                spec.port
            ),
        )?;
        Self::append_log(
            spec,
            &format!("LOG:  listening on port {} (mock pid {})", spec.port, child.id()),
        )?;
        let mut servers = self
            .servers
            .lock()
            .map_err(|e| RuntimeError::Io(std::io::Error::other(format!("mutex poisoned: {e}"))))?;
        servers.insert(spec.name.clone(), child);
        Ok(())
    }

    fn stop(&self, spec: &VenvSpec, _timeout: Duration) -> Result<(), RuntimeError> {
        self.check_injected("pg_ctl stop")?;
        let pid_file = spec.data_dir.join("postmaster.pid");
        let Some(pid) = read_postmaster_pid(&pid_file) else {
            return Err(RuntimeError::ToolFailed {
                step: "pg_ctl stop".to_owned(),
                code: Some(1),
                output: "pg_ctl: PID file does not exist\nIs server running?\n".to_owned(),
            });
        };

        let mut servers = self
            .servers
            .lock()
            .map_err(|e| RuntimeError::Io(std::io::Error::other(format!("mutex poisoned: {e}"))))?;
        if let Some(mut child) = servers.remove(&spec.name) {
            let _ = child.kill();
            let _ = child.wait();
        } else {
            Self::terminate(pid.pid);
        }
        fs::remove_file(&pid_file)?;
        Self::append_log(spec, "LOG:  database system is shut down")?;
        Ok(())
    }

    fn createdb(&self, spec: &VenvSpec) -> Result<(), RuntimeError> {
        Self::require(
            &spec.data_dir.join("postmaster.pid"),
            "createdb",
            "running server",
        )?;
        self.check_injected("createdb")
    }

    fn version(&self, spec: &VenvSpec) -> Option<String> {
        spec.bin("pg_config")
            .is_file()
            .then(|| MOCK_VERSION.to_owned())
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Ok(mut servers) = self.servers.lock() {
            for (_, mut child) in servers.drain() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}
