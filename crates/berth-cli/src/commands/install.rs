use super::{print_required, print_status, with_spinner, EXIT_NEEDS_INPUT, EXIT_SUCCESS};
use berth_core::{ActionResult, Fleet};
use berth_store::ServiceStatus;

/// Install `name`, or resume an install that was waiting for variables.
pub fn run(fleet: &Fleet, name: &str, no_start: bool, json: bool) -> Result<u8, String> {
    let resumed = fleet.is_installed(name).map_err(|e| e.to_string())?
        && fleet
            .get(name)
            .and_then(|s| s.status())
            .map_err(|e| e.to_string())?
            == ServiceStatus::InstallPending;
    if !resumed {
        if let ActionResult::Required(required) =
            fleet.install(name).map_err(|e| e.to_string())?
        {
            return print_required(name, &required, json);
        }
    }

    let service = fleet.get(name).map_err(|e| e.to_string())?;
    let built = with_spinner(
        json,
        &format!("building {name}..."),
        &format!("{name} installed"),
        &format!("{name} failed to build"),
        || service.continue_installation(),
    )?;
    if !built {
        if !json {
            println!("{name} is still waiting for environment variables (see `berth env list`)");
        }
        print_status(name, ServiceStatus::InstallPending, json)?;
        return Ok(EXIT_NEEDS_INPUT);
    }

    if !no_start {
        service.start().map_err(|e| e.to_string())?;
    }
    let status = service.status().map_err(|e| e.to_string())?;
    print_status(name, status, json)?;
    Ok(EXIT_SUCCESS)
}
