use super::{report, target_name, with_spinner, CommandError};
use pgvenv_core::{Engine, ShellContext};

pub fn run(
    engine: &Engine,
    ctx: &ShellContext,
    args: &[String],
    json: bool,
) -> Result<u8, CommandError> {
    let name = target_name(None, ctx)?;
    with_spinner(&format!("compiling {name}"), || engine.make(&name, args))?;
    report(engine, &name, json, &format!("compiled {name}"))
}
