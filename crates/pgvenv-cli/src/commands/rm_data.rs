use super::{prompt_confirmation, target_name, CommandError, EXIT_SUCCESS};
use pgvenv_core::{Engine, ShellContext};

pub fn run(engine: &Engine, ctx: &ShellContext, name: Option<&str>) -> Result<u8, CommandError> {
    let name = target_name(name, ctx)?;
    let data_dir = engine.check_rm_data(&name)?;
    let typed = prompt_confirmation(&format!(
        "You are about to delete all the data in your database, located in {}. \
         Please type its name to confirm",
        data_dir.display()
    ))?;
    engine.rm_data(&name, &typed)?;
    println!("removed the data directory of {name}");
    Ok(EXIT_SUCCESS)
}
