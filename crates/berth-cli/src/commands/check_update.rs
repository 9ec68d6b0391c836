use super::{json_pretty, EXIT_SUCCESS};
use berth_core::Fleet;

pub fn run(fleet: &Fleet, name: &str, json: bool) -> Result<u8, String> {
    let check = fleet.update_check(name).map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&check)?);
    } else if check.latest_possible == check.actual_version {
        println!("{name} {} is up to date", check.actual_version);
    } else {
        println!(
            "{name}: {} installed, {} available (berth update {name} {})",
            check.actual_version, check.latest_possible, check.latest_possible
        );
    }
    Ok(EXIT_SUCCESS)
}
