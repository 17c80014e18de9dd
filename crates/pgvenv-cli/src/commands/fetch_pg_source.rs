use super::{report, target_name, with_spinner, CommandError};
use pgvenv_core::{Engine, ShellContext};

pub fn run(
    engine: &Engine,
    ctx: &ShellContext,
    name: Option<&str>,
    git_ref: Option<&str>,
    json: bool,
) -> Result<u8, CommandError> {
    let name = target_name(name, ctx)?;
    let revision = with_spinner(&format!("copying source tree into {name}"), || {
        engine.fetch_source(&name, git_ref)
    })?;
    let message = match revision {
        Some(rev) => format!("source of {name} is now at {rev}"),
        None => format!("source of {name} replaced"),
    };
    report(engine, &name, json, &message)
}
