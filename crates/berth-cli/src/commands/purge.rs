use super::{json_pretty, with_spinner, EXIT_SUCCESS};
use berth_core::Fleet;

pub fn run(fleet: &Fleet, yes: bool, json: bool) -> Result<u8, String> {
    if !yes {
        return Err(
            "purge force-removes every service container; pass --yes to confirm".to_owned(),
        );
    }
    let removed = with_spinner(
        json,
        "removing containers and pruning the engine...",
        "purge complete",
        "purge failed",
        || fleet.purge(),
    )?;
    if json {
        println!("{}", json_pretty(&serde_json::json!({ "removed": removed }))?);
    } else {
        println!("removed {removed} container(s)");
    }
    Ok(EXIT_SUCCESS)
}
