use super::{target_name, CommandError, EXIT_SUCCESS};
use pgvenv_core::{Engine, ShellContext};

pub fn run(engine: &Engine, ctx: &ShellContext, args: &[String]) -> Result<u8, CommandError> {
    let name = target_name(None, ctx)?;
    eprintln!("configuring {name}...");
    engine.configure(&name, args)?;
    println!("configured {name}");
    Ok(EXIT_SUCCESS)
}
