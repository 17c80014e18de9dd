pub mod completions;
pub mod configure;
pub mod create_virtualenv;
pub mod deactivate;
pub mod fetch_pg_source;
pub mod get_shell_function;
pub mod help;
pub mod initdb;
pub mod install;
pub mod list;
pub mod log;
pub mod make;
pub mod make_check;
pub mod make_clean;
pub mod restart;
pub mod rm_data;
pub mod rm_virtualenv;
pub mod start;
pub mod stop;
pub mod workon;

use indicatif::{ProgressBar, ProgressStyle};
use pgvenv_core::{resolve_name, CoreError, Engine, EnvState, ShellContext};
use pgvenv_runtime::RuntimeError;
use std::io::{stderr, stdin, BufRead, IsTerminal};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;

/// A failed command: what to print and which code to exit with.
#[derive(Debug)]
pub struct CommandError {
    pub code: u8,
    pub message: String,
    /// Output of a failed external program, printed verbatim.
    pub detail: Option<String>,
}

impl CommandError {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            code: EXIT_FAILURE,
            message: message.into(),
            detail: None,
        }
    }
}

impl From<CoreError> for CommandError {
    fn from(e: CoreError) -> Self {
        let code = match &e {
            CoreError::Config(_)
            | CoreError::Runtime(RuntimeError::BackendUnavailable(_)) => EXIT_CONFIG_ERROR,
            other => other
                .external_code()
                .and_then(|c| u8::try_from(c).ok())
                .filter(|c| *c != 0)
                .unwrap_or(EXIT_FAILURE),
        };
        Self {
            code,
            detail: e.external_output().map(str::to_owned),
            message: e.to_string(),
        }
    }
}

/// One user-facing action, with everything the help text and the generated
/// shell function need to know about it.
#[derive(Debug)]
pub struct Action {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub summary: &'static str,
    /// Output is shell code for the caller to evaluate.
    pub evaluate: bool,
    /// The first argument is an existing pg_venv name.
    pub takes_name: bool,
}

const fn action(
    name: &'static str,
    aliases: &'static [&'static str],
    summary: &'static str,
    evaluate: bool,
    takes_name: bool,
) -> Action {
    Action {
        name,
        aliases,
        summary,
        evaluate,
        takes_name,
    }
}

pub const ACTIONS: &[Action] = &[
    action("create_virtualenv", &[], "Create a new pg_venv", false, false),
    action("fetch_pg_source", &[], "Fetch a new copy of PostgreSQL's source code", false, true),
    action("workon", &["w"], "Activate a pg_venv", true, true),
    action("deactivate", &[], "Leave the active pg_venv", true, false),
    action("list", &["ls"], "List active and inactive pg_venvs", false, false),
    action("configure", &[], "Run configure on PostgreSQL's source", false, false),
    action("make", &["m"], "Compile PostgreSQL", false, false),
    action("make_check", &["ck", "check"], "Run make check on PostgreSQL's source", false, true),
    action("make_clean", &["mc"], "Run make clean on PostgreSQL's source", false, true),
    action("install", &["i"], "Install PostgreSQL's binaries", false, true),
    action("initdb", &[], "Initialize the data directory", false, true),
    action("start", &[], "Start PostgreSQL", false, true),
    action("stop", &[], "Stop PostgreSQL", false, true),
    action("restart", &[], "Restart PostgreSQL", false, true),
    action("log", &["l"], "Display the server log", false, true),
    action("rm_data", &[], "Remove PostgreSQL's data directory", false, true),
    action("rm_virtualenv", &[], "Remove a pg_venv", false, true),
    action("get_shell_function", &[], "Get the shell function to source", false, false),
    action("completions", &[], "Generate shell completions", false, false),
    action("help", &["h"], "Display this help text", false, false),
];

pub fn find_action(word: &str) -> Option<&'static Action> {
    ACTIONS
        .iter()
        .find(|a| a.name == word || a.aliases.contains(&word))
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, CommandError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| CommandError::failure(format!("JSON serialization failed: {e}")))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_state(state: EnvState) -> String {
    use console::Style;
    let text = state.to_string();
    match state {
        EnvState::Running => Style::new().green().bold().apply_to(text).to_string(),
        EnvState::Stopped => Style::new().yellow().apply_to(text).to_string(),
        EnvState::Initialized | EnvState::Installed => {
            Style::new().cyan().apply_to(text).to_string()
        }
        EnvState::Created | EnvState::Built => Style::new().dim().apply_to(text).to_string(),
        EnvState::Absent => text,
    }
}

/// Run one engine step under a spinner.
pub fn with_spinner<T>(
    msg: &str,
    f: impl FnOnce() -> Result<T, CoreError>,
) -> Result<T, CommandError> {
    let pb = spinner(msg);
    match f() {
        Ok(value) => {
            spin_ok(&pb, msg);
            Ok(value)
        }
        Err(e) => {
            spin_fail(&pb, msg);
            Err(e.into())
        }
    }
}

/// Print the environment's details as JSON, or `message` otherwise.
pub fn report(engine: &Engine, name: &str, json: bool, message: &str) -> Result<u8, CommandError> {
    if json {
        println!("{}", json_pretty(&engine.info(name)?)?);
    } else {
        println!("{message}");
    }
    Ok(EXIT_SUCCESS)
}

pub fn target_name(explicit: Option<&str>, ctx: &ShellContext) -> Result<String, CommandError> {
    Ok(resolve_name(explicit, ctx)?)
}

/// Ask the user to type `name` again. Reads a plain line when not attached
/// to a terminal.
pub fn prompt_confirmation(prompt: &str) -> Result<String, CommandError> {
    if stdin().is_terminal() && stderr().is_terminal() {
        return dialoguer::Input::<String>::new()
            .with_prompt(prompt)
            .allow_empty(true)
            .interact_text()
            .map_err(|e| CommandError::failure(format!("prompt failed: {e}")));
    }
    eprintln!("{prompt}:");
    let mut line = String::new();
    stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| CommandError::failure(format!("failed to read confirmation: {e}")))?;
    Ok(line.trim_end_matches(['\n', '\r']).to_owned())
}
