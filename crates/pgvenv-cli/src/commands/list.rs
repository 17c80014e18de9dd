use super::{colorize_state, json_pretty, CommandError, EXIT_SUCCESS};
use pgvenv_core::{Engine, ShellContext, VenvInfo};
use serde::Serialize;

#[derive(Serialize)]
struct ListEntry<'a> {
    #[serde(flatten)]
    info: &'a VenvInfo,
    current: bool,
}

pub fn run(engine: &Engine, ctx: &ShellContext, names: bool, json: bool) -> Result<u8, CommandError> {
    if names {
        for name in engine.list()? {
            println!("{name}");
        }
        return Ok(EXIT_SUCCESS);
    }

    let envs = engine.list_info()?;
    let is_current = |info: &VenvInfo| ctx.active.as_deref() == Some(info.name.as_str());
    if json {
        let entries: Vec<ListEntry<'_>> = envs
            .iter()
            .map(|info| ListEntry {
                info,
                current: is_current(info),
            })
            .collect();
        println!("{}", json_pretty(&entries)?);
    } else if envs.is_empty() {
        println!("no pg_venv found");
    } else {
        println!("{:<28} {:<6} {:<12} STATE", "NAME", "PORT", "VERSION");
        for info in &envs {
            let name = if is_current(info) {
                format!("{} [current]", info.name)
            } else {
                info.name.clone()
            };
            println!(
                "{:<28} {:<6} {:<12} {}",
                name,
                info.port,
                info.version.as_deref().unwrap_or("-"),
                colorize_state(info.state)
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
