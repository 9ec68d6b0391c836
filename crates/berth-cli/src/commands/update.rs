use super::{print_required, print_status, with_spinner, EXIT_SUCCESS};
use berth_core::{ActionResult, Fleet};
use berth_store::ServiceStatus;

/// Update `name` to `version`, or to the newest compatible version.
///
/// A service left in `updatePending` by an earlier run is resumed.
pub fn run(fleet: &Fleet, name: &str, version: Option<&str>, json: bool) -> Result<u8, String> {
    let service = fleet.get(name).map_err(|e| e.to_string())?;
    let status = service.status().map_err(|e| e.to_string())?;

    if status != ServiceStatus::UpdatePending {
        let target = match version {
            Some(v) => v.to_owned(),
            None => {
                fleet
                    .update_check(name)
                    .map_err(|e| e.to_string())?
                    .latest_possible
            }
        };
        let installed = service.installed_version().map_err(|e| e.to_string())?;
        if target == installed {
            if !json {
                println!("{name} {installed} is already up to date");
            }
            print_status(name, status, json)?;
            return Ok(EXIT_SUCCESS);
        }
        if let ActionResult::Required(required) = fleet
            .execute_update(name, &target)
            .map_err(|e| e.to_string())?
        {
            return print_required(name, &required, json);
        }
    }

    with_spinner(
        json,
        &format!("updating {name}..."),
        &format!("{name} updated"),
        &format!("{name} update failed"),
        || service.update(),
    )?;
    let status = service.status().map_err(|e| e.to_string())?;
    print_status(name, status, json)?;
    if status.is_failure() {
        return Err(format!("{name} ended in status {status}"));
    }
    Ok(EXIT_SUCCESS)
}
