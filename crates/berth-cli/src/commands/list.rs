use super::{colorize_status, json_pretty, EXIT_SUCCESS};
use berth_core::Fleet;
use berth_remote::ServiceKind;

pub fn run(fleet: &Fleet, available: bool, json: bool) -> Result<u8, String> {
    if available {
        return run_available(fleet, json);
    }
    let report = fleet.status_report().map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&report)?);
    } else if report.is_empty() {
        println!("no services installed");
    } else {
        println!(
            "{:<20} {:<10} {:<16} {:<8} {:<10} PREVIOUS",
            "NAME", "VERSION", "STATUS", "RUNNING", "TYPE"
        );
        for s in &report {
            let running = if s.running { "yes" } else { "no" };
            // Pad before coloring so escape codes do not break the columns.
            let status = format!("{:<16}", s.status.as_str());
            println!(
                "{:<20} {:<10} {} {:<8} {:<10} {}",
                s.name,
                s.version,
                status.replace(s.status.as_str(), &colorize_status(s.status)),
                running,
                s.kind,
                s.previous
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

fn run_available(fleet: &Fleet, json: bool) -> Result<u8, String> {
    let entries = fleet
        .available(ServiceKind::Plugin)
        .map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("the repository publishes no plugins");
    } else {
        println!("{:<20} {:<10} DESCRIPTION", "NAME", "INSTALLED");
        for e in &entries {
            let installed = if e.installed { "yes" } else { "no" };
            println!("{:<20} {:<10} {}", e.name, installed, e.description);
        }
    }
    Ok(EXIT_SUCCESS)
}
