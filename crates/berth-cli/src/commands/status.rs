use super::{colorize_status, json_pretty, EXIT_SUCCESS};
use berth_core::{CoreError, Fleet};

pub fn run(fleet: &Fleet, name: &str, json: bool) -> Result<u8, String> {
    let report = fleet
        .status_report()
        .map_err(|e| e.to_string())?
        .into_iter()
        .find(|s| s.name == name)
        .ok_or_else(|| CoreError::ServiceNotFound(name.to_owned()).to_string())?;
    if json {
        println!("{}", json_pretty(&report)?);
        return Ok(EXIT_SUCCESS);
    }
    println!("service:  {}", report.name);
    println!("type:     {}", report.kind);
    println!("version:  {}", report.version);
    println!("status:   {}", colorize_status(report.status));
    println!("wanted:   {}", if report.wanted { "running" } else { "stopped" });
    println!("running:  {}", report.running);
    if !report.previous.is_empty() {
        println!("revert:   to {}", report.previous);
    }
    Ok(EXIT_SUCCESS)
}
