pub mod check_update;
pub mod completions;
pub mod control;
pub mod delete;
pub mod doctor;
pub mod env;
pub mod install;
pub mod list;
pub mod man_pages;
pub mod purge;
pub mod rebuild;
pub mod revert;
pub mod setup;
pub mod status;
pub mod update;

use berth_core::{CoreError, Fleet, RequiredVariables};
use berth_store::ServiceStatus;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;
/// The operation waits for environment variables (`berth env set`).
pub const EXIT_NEEDS_INPUT: u8 = 4;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

fn plain_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .map(|s| s.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]))
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Run `op` behind a spinner unless output is JSON.
pub fn with_spinner<T>(
    json: bool,
    msg: &str,
    done: &str,
    failed: &str,
    op: impl FnOnce() -> Result<T, CoreError>,
) -> Result<T, String> {
    let pb = (!json).then(|| spinner(msg));
    match op() {
        Ok(value) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, done);
            }
            Ok(value)
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, failed);
            }
            Err(e.to_string())
        }
    }
}

pub fn colorize_status(status: ServiceStatus) -> String {
    use console::Style;
    let text = status.as_str();
    match status {
        ServiceStatus::Running => Style::new().green().bold().apply_to(text).to_string(),
        ServiceStatus::Paused => Style::new().yellow().apply_to(text).to_string(),
        ServiceStatus::InstallPending | ServiceStatus::UpdatePending => {
            Style::new().magenta().apply_to(text).to_string()
        }
        s if s.is_transitional() => Style::new().cyan().apply_to(text).to_string(),
        s if s.is_failure() => Style::new().red().bold().apply_to(text).to_string(),
        _ => text.to_owned(),
    }
}

/// Report variables an operation waits for; returns [`EXIT_NEEDS_INPUT`].
pub fn print_required(service: &str, required: &RequiredVariables, json: bool) -> Result<u8, String> {
    if json {
        let payload = serde_json::json!({
            "service": service,
            "required": required,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("{service} needs values for these environment variables:");
        for (name, var) in required {
            let mutable = if var.mutable { "" } else { " (fixed once set)" };
            println!("  {name:<32} {}{mutable}", var.description);
        }
        println!("set them with `berth env set <NAME> <VALUE>` and run the command again");
    }
    Ok(EXIT_NEEDS_INPUT)
}

/// Wait for the background operation on `name`, then report its final status.
pub fn finish_background(
    fleet: &Fleet,
    name: &str,
    json: bool,
    msg: &str,
    done: &str,
) -> Result<u8, String> {
    let service = fleet.get(name).map_err(|e| e.to_string())?;
    let status = with_spinner(json, msg, done, "operation failed", || {
        service.wait()?;
        service.status()
    })?;
    print_status(name, status, json)?;
    if status.is_failure() {
        return Err(format!("{name} ended in status {status}"));
    }
    Ok(EXIT_SUCCESS)
}

pub fn print_status(name: &str, status: ServiceStatus, json: bool) -> Result<(), String> {
    if json {
        let payload = serde_json::json!({
            "service": name,
            "status": status,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("{name}: {}", colorize_status(status));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::RequiredVariable;

    #[test]
    fn json_pretty_serializes_map() {
        let val = serde_json::json!({"service": "notes"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"service\""));
        assert!(result.contains("\"notes\""));
    }

    #[test]
    fn colorize_status_keeps_text() {
        for status in [
            ServiceStatus::Running,
            ServiceStatus::Paused,
            ServiceStatus::UpdatePending,
            ServiceStatus::Installing,
            ServiceStatus::Builderror,
            ServiceStatus::Empty,
        ] {
            assert!(colorize_status(status).contains(status.as_str()));
        }
    }

    #[test]
    fn required_variables_exit_with_needs_input() {
        let mut required = RequiredVariables::new();
        required.insert(
            "DB_PASS".to_owned(),
            RequiredVariable {
                description: "database password".to_owned(),
                mutable: false,
            },
        );
        assert_eq!(print_required("notes", &required, true).unwrap(), EXIT_NEEDS_INPUT);
    }

    #[test]
    fn spinner_reports_errors_as_strings() {
        let err = with_spinner::<()>(true, "x", "ok", "failed", || {
            Err(CoreError::ServiceNotFound("ghost".to_owned()))
        })
        .unwrap_err();
        assert!(err.contains("ghost"));
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            EXIT_SUCCESS,
            EXIT_FAILURE,
            EXIT_CONFIG_ERROR,
            EXIT_STORE_ERROR,
            EXIT_NEEDS_INPUT,
        ];
        for (i, a) in codes.iter().enumerate() {
            assert!(codes[i + 1..].iter().all(|b| a != b));
        }
    }
}
