use super::{CommandError, ACTIONS, EXIT_SUCCESS};
use pgvenv_core::shell::shell_function;

pub fn run(fn_name: &str) -> Result<u8, CommandError> {
    let exe = std::env::current_exe()
        .and_then(std::fs::canonicalize)
        .map_err(|e| CommandError::failure(format!("cannot locate the pgvenv binary: {e}")))?;

    let words: Vec<&str> = ACTIONS
        .iter()
        .flat_map(|a| std::iter::once(a.name).chain(a.aliases.iter().copied()))
        .collect();
    let eval_words: Vec<&str> = ACTIONS
        .iter()
        .filter(|a| a.evaluate)
        .flat_map(|a| std::iter::once(a.name).chain(a.aliases.iter().copied()))
        .collect();
    let name_words: Vec<&str> = ACTIONS
        .iter()
        .filter(|a| a.takes_name)
        .flat_map(|a| std::iter::once(a.name).chain(a.aliases.iter().copied()))
        .collect();

    print!("{}", shell_function(&exe, fn_name, &words, &eval_words, &name_words)?);
    Ok(EXIT_SUCCESS)
}
