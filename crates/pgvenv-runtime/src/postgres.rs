use crate::backend::{MakeTarget, ToolchainBackend, VenvSpec};
use crate::logfile::read_tail;
use crate::process::{capture, run_step, OutputMode};
use crate::RuntimeError;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info};

const LOG_TAIL_LINES: usize = 10;

/// Drives a real PostgreSQL source tree and its installed binaries.
#[derive(Debug, Default)]
pub struct PostgresBackend;

impl PostgresBackend {
    pub fn new() -> Self {
        Self
    }
}

fn git(source_dir: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(source_dir);
    cmd
}

fn describe_revision(source_dir: &Path, git_ref: &str) -> Option<String> {
    let output = capture(git(source_dir).args(["describe", "--tags", "--always", git_ref])).ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    (!text.is_empty()).then_some(text)
}

fn ensure_checkout(source_dir: &Path, git_ref: &str) -> Result<(), RuntimeError> {
    if !source_dir.is_dir() {
        return Err(RuntimeError::SourceUnavailable(format!(
            "{} is not a directory (set PG_DIR to a postgresql checkout)",
            source_dir.display()
        )));
    }
    let output = capture(git(source_dir).args(["rev-parse", "--verify", "--quiet"]).arg(
        format!("{git_ref}^{{commit}}"),
    ))?;
    if !output.status.success() {
        return Err(RuntimeError::SourceUnavailable(format!(
            "'{git_ref}' is not a revision of {}",
            source_dir.display()
        )));
    }
    Ok(())
}

fn unpack_archive(source_dir: &Path, git_ref: &str, dest: &Path) -> Result<(), RuntimeError> {
    let mut cmd = git(source_dir);
    cmd.args(["archive", "--format=tar", git_ref])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    debug!("git archive: {cmd:?}");
    let mut child = cmd.spawn().map_err(|source| RuntimeError::Spawn {
        program: "git".to_owned(),
        source,
    })?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RuntimeError::SourceUnavailable("git archive produced no output".to_owned()))?;
    let unpacked = tar::Archive::new(stdout).unpack(dest);
    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(RuntimeError::ToolFailed {
            step: "git archive".to_owned(),
            code: output.status.code(),
            output: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    unpacked?;
    Ok(())
}

/// `pg_ctl` only says the server did not start; the reason (a port already
/// in use, a bad setting) is in the server log.
fn with_log_tail(err: RuntimeError, log_file: &Path) -> RuntimeError {
    match err {
        RuntimeError::ToolFailed {
            step,
            code,
            mut output,
        } => {
            if let Ok(tail) = read_tail(log_file, LOG_TAIL_LINES) {
                if !tail.is_empty() {
                    output.push_str(&format!("--- {} ---\n", log_file.display()));
                    output.push_str(&tail);
                }
            }
            RuntimeError::ToolFailed { step, code, output }
        }
        other => other,
    }
}

impl ToolchainBackend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn provision_source(
        &self,
        spec: &VenvSpec,
        source_dir: &Path,
        git_ref: &str,
    ) -> Result<Option<String>, RuntimeError> {
        ensure_checkout(source_dir, git_ref)?;
        let revision = describe_revision(source_dir, git_ref);

        if spec.src_dir.exists() {
            info!("removing previous source tree {}", spec.src_dir.display());
            fs::remove_dir_all(&spec.src_dir)?;
        }
        fs::create_dir_all(&spec.src_dir)?;

        info!(
            "copying {} at {} into {}",
            source_dir.display(),
            revision.as_deref().unwrap_or(git_ref),
            spec.src_dir.display()
        );
        unpack_archive(source_dir, git_ref, &spec.src_dir)?;
        Ok(revision)
    }

    fn configure(&self, spec: &VenvSpec, options: &[String]) -> Result<(), RuntimeError> {
        let mut cmd = Command::new(spec.src_dir.join("configure"));
        cmd.current_dir(&spec.src_dir)
            .arg("--quiet")
            .arg(format!("--prefix={}", spec.prefix.display()))
            .args(options);
        run_step("configure", &mut cmd, OutputMode::Inherit)
    }

    fn make(
        &self,
        spec: &VenvSpec,
        target: MakeTarget,
        args: &[String],
    ) -> Result<(), RuntimeError> {
        let mut dirs = vec![spec.src_dir.clone()];
        if target.includes_contrib() {
            dirs.push(spec.src_dir.join("contrib"));
        }
        for dir in dirs {
            let mut cmd = Command::new("make");
            cmd.current_dir(&dir).arg("-s").args(args);
            if let Some(goal) = target.goal() {
                cmd.arg(goal);
            }
            run_step(target.step_name(), &mut cmd, OutputMode::Capture)?;
        }
        Ok(())
    }

    fn initdb(&self, spec: &VenvSpec) -> Result<(), RuntimeError> {
        let mut cmd = Command::new(spec.bin("initdb"));
        cmd.arg("-D").arg(&spec.data_dir);
        run_step("initdb", &mut cmd, OutputMode::Capture)
    }

    fn start(&self, spec: &VenvSpec, timeout: Duration) -> Result<(), RuntimeError> {
        let mut cmd = Command::new(spec.bin("pg_ctl"));
        cmd.arg("start")
            .arg("--wait")
            .arg("-t")
            .arg(timeout.as_secs().max(1).to_string())
            .arg("--core-files")
            .arg("-D")
            .arg(&spec.data_dir)
            .arg("-l")
            .arg(&spec.log_file)
            .arg("-o")
            .arg(format!("-p {}", spec.port));
        run_step("pg_ctl start", &mut cmd, OutputMode::Capture)
            .map_err(|e| with_log_tail(e, &spec.log_file))
    }

    fn stop(&self, spec: &VenvSpec, timeout: Duration) -> Result<(), RuntimeError> {
        let mut cmd = Command::new(spec.bin("pg_ctl"));
        cmd.arg("stop")
            .arg("-D")
            .arg(&spec.data_dir)
            .args(["-m", "fast", "-t"])
            .arg(timeout.as_secs().max(1).to_string());
        run_step("pg_ctl stop", &mut cmd, OutputMode::Capture)
    }

    fn createdb(&self, spec: &VenvSpec) -> Result<(), RuntimeError> {
        let mut cmd = Command::new(spec.bin("createdb"));
        cmd.arg("-p").arg(spec.port.to_string());
        run_step("createdb", &mut cmd, OutputMode::Capture)
    }

    fn version(&self, spec: &VenvSpec) -> Option<String> {
        let pg_config = spec.bin("pg_config");
        if !pg_config.is_file() {
            return None;
        }
        let output = capture(Command::new(pg_config).arg("--version")).ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .nth(1)
            .map(str::to_owned)
    }
}
