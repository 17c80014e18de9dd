use super::{find_action, CommandError, ACTIONS, EXIT_SUCCESS};
use clap::CommandFactory;
use std::fmt::Write as _;

fn usage() -> String {
    let mut out = String::from("Usage:\n    pg <action> [args]\n\nActions:\n");
    for action in ACTIONS {
        let mut names = action.name.to_owned();
        for alias in action.aliases {
            names.push_str(", ");
            names.push_str(alias);
        }
        let _ = writeln!(out, "    {names:<28} {}", action.summary);
    }
    out.push_str("\nRun `pg help <action>` for the options of one action.\n");
    out
}

pub fn run<C: CommandFactory>(action: Option<&str>) -> Result<u8, CommandError> {
    let Some(word) = action else {
        print!("{}", usage());
        return Ok(EXIT_SUCCESS);
    };
    let known = find_action(word)
        .ok_or_else(|| CommandError::failure(format!("unrecognized action '{word}'")))?;
    let mut cmd = C::command();
    let sub = cmd
        .find_subcommand_mut(known.name)
        .ok_or_else(|| CommandError::failure(format!("unrecognized action '{word}'")))?;
    println!("{}", sub.render_long_help());
    Ok(EXIT_SUCCESS)
}
