use super::{prompt_confirmation, target_name, CommandError, EXIT_SUCCESS};
use pgvenv_core::{Engine, ShellContext};

pub fn run(engine: &Engine, ctx: &ShellContext, name: Option<&str>) -> Result<u8, CommandError> {
    let which = if name.is_some() { "specified" } else { "current" };
    let name = target_name(name, ctx)?;
    let root = engine.check_rm_virtualenv(&name)?;
    let typed = prompt_confirmation(&format!(
        "You are about to delete everything in the {which} pg_venv {name}, located in {}. \
         Please type its name to confirm",
        root.display()
    ))?;
    engine.rm_virtualenv(&name, &typed)?;
    println!("removed pg_venv {name}");
    Ok(EXIT_SUCCESS)
}
