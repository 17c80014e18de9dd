use super::{report, target_name, with_spinner, CommandError};
use pgvenv_core::{Engine, ShellContext};

pub fn run(
    engine: &Engine,
    ctx: &ShellContext,
    name: Option<&str>,
    json: bool,
) -> Result<u8, CommandError> {
    let name = target_name(name, ctx)?;
    with_spinner(&format!("installing {name}"), || engine.install(&name))?;
    report(engine, &name, json, &format!("installed {name}"))
}
