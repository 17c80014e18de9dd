//! The bridge between the tool and the interactive shell that calls it.
//!
//! A child process cannot change its parent's environment, so actions that
//! switch identity return shell code instead. Every line of that code is
//! tagged with [`EVAL_PREFIX`]. The `pg` function emitted by
//! [`shell_function`] looks at the action word first: for evaluating actions
//! it prints untagged lines as they arrive and evaluates the tagged ones once
//! the tool has exited; every other action runs untouched, so no output of a
//! build or a server log is ever evaluated.

use crate::config::ENV_ACTIVE;
use crate::CoreError;
use pgvenv_store::RegistryLayout;
use std::fmt::Write as _;
use std::path::Path;

pub const EVAL_PREFIX: &str = "__PGVENV_EVAL__ ";
pub const STATUS_PREFIX: &str = "__PGVENV_STATUS__ ";
pub const DEFAULT_FUNCTION_NAME: &str = "pg";

/// What the caller should do with an action's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputIntent {
    /// Show to the user as-is.
    Display(String),
    /// Evaluate in the calling shell.
    Evaluate(String),
}

impl OutputIntent {
    pub fn render(&self) -> String {
        match self {
            OutputIntent::Display(text) => text.clone(),
            OutputIntent::Evaluate(code) => {
                let mut out = String::with_capacity(code.len() + 16);
                for line in code.lines() {
                    out.push_str(EVAL_PREFIX);
                    out.push_str(line);
                    out.push('\n');
                }
                out
            }
        }
    }
}

/// Snapshot of the calling shell's variables relevant to environment
/// switching. Taken once per invocation and passed down explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellContext {
    pub active: Option<String>,
    pub path: String,
    pub ld_library_path: String,
}

impl ShellContext {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            active: lookup(ENV_ACTIVE).filter(|v| !v.is_empty()),
            path: lookup("PATH").unwrap_or_default(),
            ld_library_path: lookup("LD_LIBRARY_PATH").unwrap_or_default(),
        }
    }
}

/// The explicit name if given, otherwise the shell's active environment.
pub fn resolve_name(explicit: Option<&str>, ctx: &ShellContext) -> Result<String, CoreError> {
    explicit
        .map(str::to_owned)
        .or_else(|| ctx.active.clone())
        .ok_or(CoreError::NoActiveEnvironment)
}

/// Single-quote `value` for bash.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn path_list(current: &str, remove: Option<&Path>, prepend: Option<&Path>) -> String {
    let remove = remove.map(|p| p.to_string_lossy().into_owned());
    let prepend = prepend.map(|p| p.to_string_lossy().into_owned());
    let mut entries: Vec<String> = prepend.iter().cloned().collect();
    for entry in current.split(':') {
        if entry.is_empty()
            || remove.as_deref() == Some(entry)
            || prepend.as_deref() == Some(entry)
        {
            continue;
        }
        entries.push(entry.to_owned());
    }
    entries.join(":")
}

/// Shell code that makes `name` the active environment.
pub fn workon_fragment(
    layout: &RegistryLayout,
    name: &str,
    port: u16,
    ctx: &ShellContext,
) -> String {
    let previous_bin = ctx.active.as_deref().map(|p| layout.bin_dir(p));
    let previous_lib = ctx.active.as_deref().map(|p| layout.lib_dir(p));
    let path = path_list(
        &ctx.path,
        previous_bin.as_deref(),
        Some(&layout.bin_dir(name)),
    );
    let ld_library_path = path_list(
        &ctx.ld_library_path,
        previous_lib.as_deref(),
        Some(&layout.lib_dir(name)),
    );

    let mut out = String::new();
    let _ = writeln!(out, "export PATH={}", quote(&path));
    let _ = writeln!(out, "export LD_LIBRARY_PATH={}", quote(&ld_library_path));
    let _ = writeln!(out, "export PGPORT={port}");
    let _ = writeln!(out, r#"export PS1="[pg:{name}:{port}]${{PS1#\[pg:*\]}}""#);
    let _ = writeln!(out, "export {ENV_ACTIVE}={}", quote(name));
    let _ = writeln!(
        out,
        "export PGDATA={}",
        quote(&layout.data_dir(name).to_string_lossy())
    );
    let _ = writeln!(
        out,
        "export PG_VENV_LOG={}",
        quote(&layout.log_file(name).to_string_lossy())
    );
    out
}

/// Shell code that leaves the active environment.
pub fn deactivate_fragment(layout: &RegistryLayout, ctx: &ShellContext) -> Result<String, CoreError> {
    let active = ctx.active.as_deref().ok_or(CoreError::NoActiveEnvironment)?;
    let path = path_list(&ctx.path, Some(&layout.bin_dir(active)), None);
    let ld_library_path = path_list(&ctx.ld_library_path, Some(&layout.lib_dir(active)), None);

    let mut out = String::new();
    let _ = writeln!(out, "export PATH={}", quote(&path));
    if ld_library_path.is_empty() {
        out.push_str("unset LD_LIBRARY_PATH\n");
    } else {
        let _ = writeln!(out, "export LD_LIBRARY_PATH={}", quote(&ld_library_path));
    }
    let _ = writeln!(out, "unset {ENV_ACTIVE} PGPORT PGDATA PG_VENV_LOG");
    out.push_str(r#"export PS1="${PS1#\[pg:*\]}""#);
    out.push('\n');
    Ok(out)
}

/// Shell code that reports `message` on the calling shell's stderr.
pub fn error_fragment(message: &str) -> String {
    format!("printf '%s\\n' {} >&2\n", quote(&format!("error: {message}")))
}

fn valid_function_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The bash wrapper function and its completion hook.
///
/// `actions` is every action name and alias offered at the first position;
/// `eval_actions` are those whose tagged output is evaluated, and
/// `name_actions` those whose second word is an environment name.
pub fn shell_function(
    exe: &Path,
    fn_name: &str,
    actions: &[&str],
    eval_actions: &[&str],
    name_actions: &[&str],
) -> Result<String, CoreError> {
    if !valid_function_name(fn_name) {
        return Err(CoreError::InvalidName(format!(
            "'{fn_name}' is not a valid shell function name"
        )));
    }
    let exe = quote(&exe.to_string_lossy());
    let eval_tag = EVAL_PREFIX.trim_end();
    let status_tag = STATUS_PREFIX.trim_end();

    let mut out = String::new();
    let _ = writeln!(out, "# Add this line to your ~/.bashrc:");
    let _ = writeln!(out, "#   source <({exe} get_shell_function)");
    let _ = writeln!(out, "{fn_name}() {{");
    let _ = writeln!(out, "    local __pgvenv_arg __pgvenv_action= __pgvenv_skip=");
    let _ = writeln!(out, "    for __pgvenv_arg in \"$@\"; do");
    let _ = writeln!(out, "        if [[ -n $__pgvenv_skip ]]; then");
    let _ = writeln!(out, "            __pgvenv_skip=");
    let _ = writeln!(out, "        elif [[ $__pgvenv_arg == --home ]]; then");
    let _ = writeln!(out, "            __pgvenv_skip=1");
    let _ = writeln!(out, "        elif [[ $__pgvenv_arg != -* ]]; then");
    let _ = writeln!(out, "            __pgvenv_action=$__pgvenv_arg");
    let _ = writeln!(out, "            break");
    let _ = writeln!(out, "        fi");
    let _ = writeln!(out, "    done");
    if !eval_actions.is_empty() {
        let _ = writeln!(out, "    case $__pgvenv_action in");
        let _ = writeln!(out, "        {}) ;;", eval_actions.join("|"));
        let _ = writeln!(out, "        *)");
        let _ = writeln!(out, "            {exe} \"$@\"");
        let _ = writeln!(out, "            return");
        let _ = writeln!(out, "            ;;");
        let _ = writeln!(out, "    esac");
    } else {
        let _ = writeln!(out, "    {exe} \"$@\"");
        let _ = writeln!(out, "    return");
    }
    let _ = writeln!(out, "    local __pgvenv_line __pgvenv_status=0");
    let _ = writeln!(out, "    local -a __pgvenv_eval=()");
    let _ = writeln!(
        out,
        "    while IFS= read -r __pgvenv_line || [[ -n $__pgvenv_line ]]; do"
    );
    let _ = writeln!(out, "        case $__pgvenv_line in");
    let _ = writeln!(
        out,
        "            '{eval_tag} '*) __pgvenv_eval+=(\"${{__pgvenv_line#{eval_tag} }}\") ;;"
    );
    let _ = writeln!(
        out,
        "            '{status_tag} '*) __pgvenv_status=${{__pgvenv_line#{status_tag} }} ;;"
    );
    let _ = writeln!(out, "            *) printf '%s\\n' \"$__pgvenv_line\" ;;");
    let _ = writeln!(out, "        esac");
    let _ = writeln!(
        out,
        "    done < <({exe} \"$@\"; printf '{status_tag} %d\\n' \"$?\")"
    );
    let _ = writeln!(out, "    if ((${{#__pgvenv_eval[@]}})); then");
    let _ = writeln!(out, "        local IFS=$'\\n'");
    let _ = writeln!(out, "        eval \"${{__pgvenv_eval[*]}}\"");
    let _ = writeln!(out, "    fi");
    let _ = writeln!(out, "    return \"$__pgvenv_status\"");
    let _ = writeln!(out, "}}");
    let _ = writeln!(out);
    let _ = writeln!(out, "_{fn_name}_complete() {{");
    let _ = writeln!(out, "    local cur=${{COMP_WORDS[COMP_CWORD]}}");
    let _ = writeln!(out, "    COMPREPLY=()");
    let _ = writeln!(out, "    if ((COMP_CWORD == 1)); then");
    let _ = writeln!(
        out,
        "        COMPREPLY=($(compgen -W {} -- \"$cur\"))",
        quote(&actions.join(" "))
    );
    if !name_actions.is_empty() {
        let _ = writeln!(out, "    elif ((COMP_CWORD == 2)); then");
        let _ = writeln!(out, "        case ${{COMP_WORDS[1]}} in");
        let _ = writeln!(
            out,
            "            {})\n                COMPREPLY=($(compgen -W \"$({exe} list --names 2>/dev/null)\" -- \"$cur\"))\n                ;;",
            name_actions.join("|")
        );
        let _ = writeln!(out, "        esac");
    }
    let _ = writeln!(out, "    fi");
    let _ = writeln!(out, "}}");
    let _ = writeln!(out, "complete -F _{fn_name}_complete {fn_name}");
    Ok(out)
}
