use std::fmt;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check the programs needed to provision and build a source tree.
/// An empty list means everything is in place.
pub fn check_toolchain_prereqs() -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !command_exists("git") {
        missing.push(MissingPrereq {
            name: "git",
            purpose: "exporting the postgresql source tree",
            install_hint: "zypper install git | apt install git | dnf install git | pacman -S git",
        });
    }

    if !command_exists("make") {
        missing.push(MissingPrereq {
            name: "make",
            purpose: "building postgresql",
            install_hint: "zypper install make | apt install make | dnf install make | pacman -S make",
        });
    }

    if !command_exists("cc") {
        missing.push(MissingPrereq {
            name: "cc",
            purpose: "compiling postgresql",
            install_hint: "zypper install gcc | apt install build-essential | dnf install gcc | pacman -S gcc",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\npgvenv needs these tools to build postgresql from source.");
    msg
}
