use super::{target_name, CommandError, EXIT_FAILURE, EXIT_SUCCESS};
use pgvenv_core::{Engine, ShellContext};
use std::process::Command;

pub fn run(
    engine: &Engine,
    ctx: &ShellContext,
    name: Option<&str>,
    lines: usize,
    follow: bool,
) -> Result<u8, CommandError> {
    let name = target_name(name, ctx)?;
    if !follow {
        print!("{}", engine.tail_log(&name, lines)?);
        return Ok(EXIT_SUCCESS);
    }

    let path = engine.log_file(&name)?;
    let status = Command::new("tail")
        .arg("-n")
        .arg(lines.to_string())
        .arg("-f")
        .arg(&path)
        .status()
        .map_err(|e| CommandError::failure(format!("failed to launch tail: {e}")))?;
    Ok(status
        .code()
        .and_then(|c| u8::try_from(c).ok())
        .unwrap_or(EXIT_FAILURE))
}
