use super::finish_background;
use berth_core::Fleet;

pub fn run(fleet: &Fleet, name: &str, json: bool) -> Result<u8, String> {
    fleet.delete(name).map_err(|e| e.to_string())?;
    let code = finish_background(
        fleet,
        name,
        json,
        &format!("deleting {name}..."),
        &format!("{name} deleted"),
    )?;
    // Observing the final status drops the service from the fleet.
    fleet.action_status(name).map_err(|e| e.to_string())?;
    Ok(code)
}
