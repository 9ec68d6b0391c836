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

fn command_succeeds(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .output()
        .is_ok_and(|o| o.status.success())
}

/// Check prerequisites for the docker driver. Empty means all are met.
pub fn check_docker_prereqs() -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !command_succeeds("docker", &["--version"]) {
        missing.push(MissingPrereq {
            name: "docker",
            purpose: "container engine client",
            install_hint: "zypper install docker | apt install docker.io | dnf install moby-engine | pacman -S docker",
        });
    } else if !command_succeeds("docker", &["info", "--format", "{{.ServerVersion}}"]) {
        missing.push(MissingPrereq {
            name: "docker daemon",
            purpose: "running container engine reachable by this user",
            install_hint: "systemctl enable --now docker, and run the agent as root or a member of the docker group",
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
    msg.push_str("\nberth needs a local docker engine to manage services.");
    msg
}
