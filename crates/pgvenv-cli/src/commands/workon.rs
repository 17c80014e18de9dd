use super::{CommandError, EXIT_SUCCESS};
use pgvenv_core::{Engine, ShellContext};

pub fn run(engine: &Engine, ctx: &ShellContext, name: &str) -> Result<u8, CommandError> {
    let intent = engine.workon(name, ctx)?;
    print!("{}", intent.render());
    Ok(EXIT_SUCCESS)
}
