//! CLI subprocess integration tests.
//!
//! These tests invoke the `pgvenv` binary with the mock toolchain and check
//! exit codes, stdout content and the evaluation tagging of the shell bridge.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

const EVAL_TAG: &str = "__PGVENV_EVAL__ ";

struct Sandbox {
    dir: tempfile::TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("postgresql")).unwrap();
        Self { dir }
    }

    fn home(&self) -> PathBuf {
        self.dir.path().join("venvs")
    }

    fn cmd(&self) -> Command {
        self.sandboxed(Command::new(env!("CARGO_BIN_EXE_pgvenv")))
    }

    /// `script` run by bash after sourcing the generated `pg` function.
    fn bash(&self, script: &str) -> Output {
        let mut cmd = self.sandboxed(Command::new("bash"));
        cmd.arg("-c")
            .arg(format!("source <(\"$PGVENV_BIN\" get_shell_function)\n{script}"))
            .env("PGVENV_BIN", env!("CARGO_BIN_EXE_pgvenv"));
        cmd.output().unwrap()
    }

    fn sandboxed(&self, mut cmd: Command) -> Command {
        cmd.env("HOME", self.dir.path())
            .env("PGVENV_CONFIG", self.dir.path().join("no-config.json"))
            .env("PG_VIRTUALENV_HOME", self.home())
            .env("PG_DIR", self.dir.path().join("postgresql"))
            .env("PGVENV_BACKEND", "mock")
            .env("PGVENV_SKIP_PREREQS", "1")
            .env_remove("PG_VENV")
            .env_remove("PG_CONFIGURE_OPTIONS")
            .env_remove("PGVENV_LOG")
            .stdin(Stdio::null());
        cmd
    }

    fn run(&self, args: &[&str]) -> Output {
        self.cmd().args(args).output().unwrap()
    }

    fn run_with_input(&self, args: &[&str], input: &str) -> Output {
        let mut child = self
            .cmd()
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        child
            .stdin
            .take()
            .unwrap()
            .write_all(input.as_bytes())
            .unwrap();
        child.wait_with_output().unwrap()
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Ok(out) = self.cmd().args(["list", "--names"]).output() {
            for name in String::from_utf8_lossy(&out.stdout).lines() {
                let _ = self.cmd().args(["stop", name]).output();
            }
        }
    }
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

fn all_tagged(text: &str) -> bool {
    !text.is_empty() && text.lines().all(|l| l.starts_with(EVAL_TAG))
}

fn none_tagged(text: &str) -> bool {
    !text.lines().any(|l| l.starts_with(EVAL_TAG))
}

fn data_dir(home: &Path, name: &str) -> PathBuf {
    home.join(name).join("data")
}

#[test]
fn cli_version_exits_zero() {
    let out = Sandbox::new().run(&["--version"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("pgvenv"));
}

#[test]
fn help_lists_actions_untagged() {
    let sandbox = Sandbox::new();
    for word in ["help", "h"] {
        let out = sandbox.run(&[word]);
        assert!(out.status.success(), "{word} must exit 0");
        let text = stdout(&out);
        assert!(text.contains("create_virtualenv"));
        assert!(text.contains("workon, w"));
        assert!(none_tagged(&text));
    }
}

#[test]
fn help_for_unknown_action_fails_untagged() {
    let out = Sandbox::new().run(&["help", "frobnicate"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(none_tagged(&stdout(&out)));
    assert!(stderr(&out).contains("unrecognized action"));
}

#[test]
fn workon_unknown_environment_is_tagged() {
    let sandbox = Sandbox::new();
    for word in ["workon", "w"] {
        let out = sandbox.run(&[word, "ghost"]);
        assert_eq!(out.status.code(), Some(1));
        let text = stdout(&out);
        assert!(all_tagged(&text), "unexpected output: {text}");
        assert!(text.contains("does not exist"));
        assert!(text.contains(">&2"));
    }
}

#[test]
fn workon_usage_error_is_tagged() {
    let out = Sandbox::new().run(&["workon"]);
    assert!(!out.status.success());
    assert!(all_tagged(&stdout(&out)));
}

#[test]
fn deactivate_without_active_environment_is_tagged() {
    let out = Sandbox::new().run(&["deactivate"]);
    assert_eq!(out.status.code(), Some(1));
    let text = stdout(&out);
    assert!(all_tagged(&text));
    assert!(text.contains("PG_VENV not set"));
}

#[test]
fn list_and_log_are_never_tagged() {
    let sandbox = Sandbox::new();
    let out = sandbox.run(&["list"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("no pg_venv found"));
    assert!(none_tagged(&stdout(&out)));

    let out = sandbox.run(&["log", "ghost"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(none_tagged(&stdout(&out)));
    assert!(stderr(&out).starts_with("error: "));
}

#[test]
fn unknown_backend_is_config_error() {
    let sandbox = Sandbox::new();
    let out = sandbox
        .cmd()
        .args(["list"])
        .env("PGVENV_BACKEND", "docker")
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(2));
    assert!(none_tagged(&stdout(&out)));
}

#[test]
fn create_without_source_dir_is_config_error() {
    let sandbox = Sandbox::new();
    let out = sandbox
        .cmd()
        .args(["create_virtualenv", "alpha"])
        .env_remove("PG_DIR")
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(2));
    assert!(stderr(&out).contains("PG_DIR"));
    assert!(!sandbox.home().join("alpha").exists());
}

#[test]
fn actions_on_active_environment_need_pg_venv() {
    let out = Sandbox::new().run(&["start"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("PG_VENV not set"));
}

#[test]
fn get_shell_function_is_untagged_bash() {
    let out = Sandbox::new().run(&["get_shell_function"]);
    assert!(out.status.success());
    let text = stdout(&out);
    assert!(none_tagged(&text));
    assert!(text.contains("pg() {"));
    assert!(text.contains("complete -F _pg_complete pg"));
    assert!(text.contains("list --names"));

    let out = Sandbox::new().run(&["get_shell_function", "--name", "bad;name"]);
    assert!(!out.status.success());
}

#[test]
fn shell_function_applies_workon_to_the_calling_shell() {
    let sandbox = Sandbox::new();
    let out = sandbox.run(&["create_virtualenv", "alpha"]);
    assert!(out.status.success(), "create failed: {}", stderr(&out));

    let out = sandbox.bash(
        "pg workon alpha\n\
         echo \"status=$? port=$PGPORT venv=$PG_VENV\"\n\
         pg --home \"$PG_VIRTUALENV_HOME\" deactivate\n\
         echo \"after=${PG_VENV:-none} port=${PGPORT:-none}\"",
    );
    let text = stdout(&out);
    assert!(out.status.success(), "bash failed: {}", stderr(&out));
    assert!(text.contains("status=0 port=24285 venv=alpha\n"), "{text}");
    assert!(text.contains("after=none port=none\n"), "{text}");
    assert!(none_tagged(&text));
}

#[test]
fn shell_function_never_evaluates_display_output() {
    let sandbox = Sandbox::new();
    let out = sandbox.run(&["create_virtualenv", "alpha"]);
    assert!(out.status.success(), "create failed: {}", stderr(&out));

    let marker = sandbox.dir.path().join("evaluated");
    let injected = format!("{EVAL_TAG}touch '{}'", marker.display());
    let mut log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(sandbox.home().join("alpha").join("alpha.log"))
        .unwrap();
    writeln!(log, "{injected}").unwrap();

    let out = sandbox.bash(
        "pg log alpha\n\
         echo \"log_status=$?\"\n\
         pg log ghost\n\
         echo \"ghost_status=$?\"",
    );
    let text = stdout(&out);
    assert!(!marker.exists(), "log output was evaluated");
    assert!(text.contains(&format!("{injected}\n")), "{text}");
    assert!(text.contains("log_status=0\n"), "{text}");
    assert!(text.contains("ghost_status=1\n"), "{text}");
}

#[test]
fn completions_generate_for_bash() {
    let out = Sandbox::new().run(&["completions", "bash"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("pgvenv"));
}

#[test]
fn full_lifecycle_through_the_cli() {
    let sandbox = Sandbox::new();

    let out = sandbox.run(&["create_virtualenv", "alpha"]);
    assert!(out.status.success(), "create failed: {}", stderr(&out));
    assert!(stdout(&out).contains("pg workon alpha"));

    let out = sandbox.run(&["list", "--names"]);
    assert_eq!(stdout(&out), "alpha\n");

    let out = sandbox.run(&["list", "--json"]);
    assert!(out.status.success());
    let json: serde_json::Value = serde_json::from_str(&stdout(&out)).unwrap();
    assert_eq!(json[0]["name"], "alpha");
    assert_eq!(json[0]["port"], 24285);
    assert_eq!(json[0]["state"], "running");
    assert_eq!(json[0]["current"], false);

    let out = sandbox.run(&["w", "alpha"]);
    assert!(out.status.success());
    let text = stdout(&out);
    assert!(all_tagged(&text));
    assert!(text.contains("export PGPORT=24285"));
    assert!(text.contains("export PG_VENV='alpha'"));

    let out = sandbox
        .cmd()
        .args(["list"])
        .env("PG_VENV", "alpha")
        .output()
        .unwrap();
    assert!(stdout(&out).contains("alpha [current]"));

    let out = sandbox.run(&["log", "alpha", "-n", "1"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("listening on port 24285"));

    let out = sandbox.run(&["stop", "alpha"]);
    assert!(out.status.success(), "stop failed: {}", stderr(&out));

    let out = sandbox.run(&["stop", "alpha"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("server is not running"));

    let out = sandbox.run_with_input(&["rm_data", "alpha"], "beta\n");
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("does not match"));
    assert!(data_dir(&sandbox.home(), "alpha").join("PG_VERSION").exists());

    let out = sandbox.run_with_input(&["rm_data", "alpha"], "alpha\n");
    assert!(out.status.success(), "rm_data failed: {}", stderr(&out));
    assert!(!data_dir(&sandbox.home(), "alpha").exists());

    let out = sandbox.run(&["--json", "list"]);
    let json: serde_json::Value = serde_json::from_str(&stdout(&out)).unwrap();
    assert_eq!(json[0]["state"], "installed");

    let out = sandbox.run_with_input(&["rm_virtualenv", "alpha"], "alpha\n");
    assert!(out.status.success());
    assert!(!sandbox.home().join("alpha").exists());
}

#[test]
fn make_uses_active_environment_and_propagates_state() {
    let sandbox = Sandbox::new();
    let out = sandbox.run(&["create_virtualenv", "beta"]);
    assert!(out.status.success());
    let _ = sandbox.run(&["stop", "beta"]);

    let out = sandbox
        .cmd()
        .args(["make", "-j2"])
        .env("PG_VENV", "beta")
        .output()
        .unwrap();
    assert!(out.status.success(), "make failed: {}", stderr(&out));

    let out = sandbox
        .cmd()
        .args(["--json", "restart"])
        .env("PG_VENV", "beta")
        .output()
        .unwrap();
    assert!(out.status.success(), "restart failed: {}", stderr(&out));
    let json: serde_json::Value = serde_json::from_str(&stdout(&out)).unwrap();
    assert_eq!(json["state"], "running");
}
