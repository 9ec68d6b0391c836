use super::finish_background;
use berth_core::Fleet;

pub fn run(fleet: &Fleet, name: &str, json: bool) -> Result<u8, String> {
    fleet.execute_revert(name).map_err(|e| e.to_string())?;
    finish_background(
        fleet,
        name,
        json,
        &format!("reverting {name}..."),
        &format!("{name} reverted"),
    )
}
