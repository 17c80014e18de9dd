mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{CommandError, EXIT_FAILURE};
use pgvenv_core::shell::error_fragment;
use pgvenv_core::{install_signal_handler, Engine, OutputIntent, Settings, ShellContext};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "pgvenv",
    version,
    about = "Side-by-side PostgreSQL development environments",
    disable_help_subcommand = true
)]
struct Cli {
    /// Registry root holding the pg_venvs (overrides PG_VIRTUALENV_HOME).
    #[arg(long, global = true, value_name = "DIR")]
    home: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
#[command(rename_all = "snake_case")]
enum Commands {
    /// Create a pg_venv: copy the source, build, install, initialize and start it.
    CreateVirtualenv {
        name: String,
        /// Git revision of PG_DIR to build (default: HEAD).
        source_ref: Option<String>,
    },
    /// Fetch a new copy of the PostgreSQL source into a pg_venv.
    FetchPgSource {
        name: Option<String>,
        /// Git revision to export (default: the one recorded at creation).
        #[arg(long = "ref", value_name = "REF")]
        git_ref: Option<String>,
    },
    /// Activate a pg_venv in the calling shell.
    #[command(visible_alias = "w")]
    Workon { name: String },
    /// Leave the active pg_venv.
    Deactivate,
    /// List pg_venvs.
    #[command(visible_alias = "ls")]
    List {
        /// Print bare names only.
        #[arg(long, default_value_t = false)]
        names: bool,
    },
    /// Run configure on the active pg_venv's source.
    Configure {
        /// Extra arguments passed to configure.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Compile the active pg_venv.
    #[command(visible_alias = "m")]
    Make {
        /// Extra arguments passed to make.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run the regression tests.
    #[command(visible_aliases = ["ck", "check"])]
    MakeCheck { name: Option<String> },
    /// Run make clean on the source tree.
    #[command(visible_alias = "mc")]
    MakeClean { name: Option<String> },
    /// Install the compiled binaries into the pg_venv.
    #[command(visible_alias = "i")]
    Install { name: Option<String> },
    /// Initialize the data directory.
    Initdb { name: Option<String> },
    /// Start the server.
    Start { name: Option<String> },
    /// Stop the server.
    Stop { name: Option<String> },
    /// Restart the server.
    Restart { name: Option<String> },
    /// Display the server log.
    #[command(visible_alias = "l")]
    Log {
        name: Option<String>,
        /// Number of lines to show.
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
        /// Keep following the log.
        #[arg(short, long, default_value_t = false)]
        follow: bool,
    },
    /// Remove the data directory (asks for the name as confirmation).
    RmData { name: Option<String> },
    /// Remove a pg_venv entirely (asks for the name as confirmation).
    RmVirtualenv { name: Option<String> },
    /// Print the bash function wrapping this tool.
    GetShellFunction {
        /// Name of the generated function.
        #[arg(long, default_value = pgvenv_core::shell::DEFAULT_FUNCTION_NAME)]
        name: String,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Display this help text.
    #[command(visible_alias = "h")]
    Help {
        /// Show the detailed help of one action.
        action: Option<String>,
    },
}

impl Commands {
    /// Actions that run the compiler toolchain.
    fn builds(&self) -> bool {
        matches!(
            self,
            Commands::CreateVirtualenv { .. }
                | Commands::FetchPgSource { .. }
                | Commands::Configure { .. }
                | Commands::Make { .. }
                | Commands::MakeCheck { .. }
                | Commands::MakeClean { .. }
                | Commands::Install { .. }
        )
    }
}

/// The action word of a raw command line, skipping global flags.
fn action_word(args: &[OsString]) -> Option<String> {
    let mut iter = args.iter().skip(1).map(|a| a.to_string_lossy());
    while let Some(arg) = iter.next() {
        if arg == "--home" {
            iter.next();
        } else if !arg.starts_with('-') {
            return Some(arg.into_owned());
        }
    }
    None
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let args: Vec<OsString> = std::env::args_os().collect();
    let evaluate = action_word(&args)
        .and_then(|word| commands::find_action(&word))
        .is_some_and(|action| action.evaluate);

    let cli = match Cli::try_parse_from(&args) {
        Ok(cli) => cli,
        Err(e) if evaluate && e.use_stderr() => {
            let rendered = e.to_string();
            let message = rendered
                .lines()
                .next()
                .unwrap_or_default()
                .trim_start_matches("error: ");
            print!("{}", OutputIntent::Evaluate(error_fragment(message)).render());
            return ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(EXIT_FAILURE));
        }
        Err(e) => e.exit(),
    };

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("PGVENV_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    install_signal_handler();

    match dispatch(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            if evaluate {
                print!(
                    "{}",
                    OutputIntent::Evaluate(error_fragment(&err.message)).render()
                );
            } else {
                eprintln!("error: {}", err.message);
                if let Some(detail) = &err.detail {
                    eprint!("{detail}");
                }
            }
            ExitCode::from(err.code)
        }
    }
}

/// Engine for the configured registry, after checking the build toolchain
/// for actions that compile.
fn build_engine(home: Option<&Path>, builds: bool) -> Result<Engine, CommandError> {
    let settings = Settings::from_environment(home.map(Path::to_path_buf))?;
    let engine = Engine::new(settings)?;

    if builds
        && engine.backend_name() == "postgres"
        && std::env::var("PGVENV_SKIP_PREREQS").as_deref() != Ok("1")
    {
        let missing = pgvenv_runtime::check_toolchain_prereqs();
        if !missing.is_empty() {
            return Err(CommandError::failure(pgvenv_runtime::format_missing(
                &missing,
            )));
        }
    }
    Ok(engine)
}

fn dispatch(cli: Cli) -> Result<u8, CommandError> {
    let Cli {
        home,
        json,
        command,
        ..
    } = cli;
    let ctx = ShellContext::from_env();
    let builds = command.builds();
    let engine = || build_engine(home.as_deref(), builds);

    match command {
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::Help { action } => commands::help::run::<Cli>(action.as_deref()),
        Commands::GetShellFunction { name } => commands::get_shell_function::run(&name),
        Commands::CreateVirtualenv { name, source_ref } => {
            commands::create_virtualenv::run(&engine()?, &name, source_ref.as_deref(), json)
        }
        Commands::FetchPgSource { name, git_ref } => commands::fetch_pg_source::run(
            &engine()?,
            &ctx,
            name.as_deref(),
            git_ref.as_deref(),
            json,
        ),
        Commands::Workon { name } => commands::workon::run(&engine()?, &ctx, &name),
        Commands::Deactivate => commands::deactivate::run(&engine()?, &ctx),
        Commands::List { names } => commands::list::run(&engine()?, &ctx, names, json),
        Commands::Configure { args } => commands::configure::run(&engine()?, &ctx, &args),
        Commands::Make { args } => commands::make::run(&engine()?, &ctx, &args, json),
        Commands::MakeCheck { name } => {
            commands::make_check::run(&engine()?, &ctx, name.as_deref(), json)
        }
        Commands::MakeClean { name } => {
            commands::make_clean::run(&engine()?, &ctx, name.as_deref(), json)
        }
        Commands::Install { name } => {
            commands::install::run(&engine()?, &ctx, name.as_deref(), json)
        }
        Commands::Initdb { name } => commands::initdb::run(&engine()?, &ctx, name.as_deref(), json),
        Commands::Start { name } => commands::start::run(&engine()?, &ctx, name.as_deref(), json),
        Commands::Stop { name } => commands::stop::run(&engine()?, &ctx, name.as_deref(), json),
        Commands::Restart { name } => {
            commands::restart::run(&engine()?, &ctx, name.as_deref(), json)
        }
        Commands::Log {
            name,
            lines,
            follow,
        } => commands::log::run(&engine()?, &ctx, name.as_deref(), lines, follow),
        Commands::RmData { name } => commands::rm_data::run(&engine()?, &ctx, name.as_deref()),
        Commands::RmVirtualenv { name } => {
            commands::rm_virtualenv::run(&engine()?, &ctx, name.as_deref())
        }
    }
}
