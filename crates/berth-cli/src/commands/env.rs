use super::{json_pretty, EXIT_SUCCESS};
use berth_core::{EnvUpdate, Fleet};

pub fn list(fleet: &Fleet, json: bool) -> Result<u8, String> {
    let entries = fleet.list_env().map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&entries)?);
        return Ok(EXIT_SUCCESS);
    }
    if entries.is_empty() {
        println!("no variables stored");
        return Ok(EXIT_SUCCESS);
    }
    println!("{:<32} {:<8} {:<24} DESCRIPTION", "NAME", "MUTABLE", "VALUE");
    for (name, entry) in &entries {
        let mutable = if entry.mutable { "yes" } else { "no" };
        println!(
            "{name:<32} {mutable:<8} {:<24} {}",
            entry.value, entry.description
        );
    }
    Ok(EXIT_SUCCESS)
}

/// Store one variable. `[service]NAME` targets a service's private store.
pub fn set(
    fleet: &Fleet,
    name: &str,
    value: &str,
    description: Option<&str>,
    mutable: bool,
    json: bool,
) -> Result<u8, String> {
    let update = EnvUpdate {
        id: name.to_owned(),
        value: value.to_owned(),
        description: description.unwrap_or_default().to_owned(),
        mutable,
    };
    fleet
        .store_env(std::slice::from_ref(&update))
        .map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&serde_json::json!({ "stored": name }))?);
    } else {
        println!("stored {name}");
    }
    Ok(EXIT_SUCCESS)
}
