//! Running external programs and turning their exit status into errors.

use crate::RuntimeError;
use std::process::{Command, ExitStatus, Output, Stdio};
use tracing::debug;

/// Where a step's stdout/stderr go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Straight to the terminal, as the program writes it.
    Inherit,
    /// Collected and handed back verbatim only if the program fails.
    Capture,
}

#[allow(clippy::ref_option)]
pub fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "killed by signal".to_owned(),
    }
}

fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

fn failure(step: &str, status: ExitStatus, output: String) -> RuntimeError {
    RuntimeError::ToolFailed {
        step: step.to_owned(),
        code: status.code(),
        output,
    }
}

pub fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}

/// Run `cmd` to completion as the step named `step`.
pub fn run_step(step: &str, cmd: &mut Command, mode: OutputMode) -> Result<(), RuntimeError> {
    debug!("{step}: {cmd:?}");
    match mode {
        OutputMode::Inherit => {
            let status = cmd
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .map_err(|source| RuntimeError::Spawn {
                    program: program_name(cmd),
                    source,
                })?;
            if status.success() {
                Ok(())
            } else {
                Err(failure(step, status, String::new()))
            }
        }
        OutputMode::Capture => {
            let output = capture(cmd)?;
            if output.status.success() {
                Ok(())
            } else {
                Err(failure(step, output.status, combined_output(&output)))
            }
        }
    }
}

/// Run `cmd` with stdin closed and both output streams collected.
pub fn capture(cmd: &mut Command) -> Result<Output, RuntimeError> {
    cmd.stdin(Stdio::null())
        .output()
        .map_err(|source| RuntimeError::Spawn {
            program: program_name(cmd),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_step() {
        assert!(run_step("true", &mut Command::new("true"), OutputMode::Capture).is_ok());
    }

    #[test]
    fn failing_step_carries_code_and_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        match run_step("script", &mut cmd, OutputMode::Capture) {
            Err(RuntimeError::ToolFailed { step, code, output }) => {
                assert_eq!(step, "script");
                assert_eq!(code, Some(3));
                assert!(output.contains("out"));
                assert!(output.contains("err"));
            }
            other => panic!("expected ToolFailed, got {other:?}"),
        }
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let mut cmd = Command::new("/nonexistent/pgvenv-test-binary");
        assert!(matches!(
            run_step("x", &mut cmd, OutputMode::Capture),
            Err(RuntimeError::Spawn { .. })
        ));
    }

    #[test]
    fn code_descriptions() {
        assert_eq!(describe_code(&Some(1)), "exit code 1");
        assert_eq!(describe_code(&None), "killed by signal");
    }
}
