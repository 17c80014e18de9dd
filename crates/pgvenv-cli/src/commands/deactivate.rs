use super::{CommandError, EXIT_SUCCESS};
use pgvenv_core::{Engine, ShellContext};

pub fn run(engine: &Engine, ctx: &ShellContext) -> Result<u8, CommandError> {
    print!("{}", engine.deactivate(ctx)?.render());
    Ok(EXIT_SUCCESS)
}
