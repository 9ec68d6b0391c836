use super::{print_status, EXIT_SUCCESS};
use berth_core::Fleet;

pub fn run(fleet: &Fleet, name: &str, start: bool, json: bool) -> Result<u8, String> {
    let status = fleet.control(name, start).map_err(|e| e.to_string())?;
    print_status(name, status, json)?;
    Ok(EXIT_SUCCESS)
}
