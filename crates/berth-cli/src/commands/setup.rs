use super::{json_pretty, with_spinner, EXIT_SUCCESS};
use berth_core::Fleet;

pub fn run(fleet: &Fleet, json: bool) -> Result<u8, String> {
    let installed = with_spinner(
        json,
        "running first setup...",
        "first setup complete",
        "first setup failed",
        || fleet.first_setup(),
    )?;
    let token_file = fleet.context().layout.api_token_file();
    if json {
        let payload = serde_json::json!({
            "installed": installed,
            "token_file": token_file,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        if installed.is_empty() {
            println!("no essential services published by the repository");
        } else {
            println!("essential services installed: {}", installed.join(", "));
        }
        println!("API token written to {}", token_file.display());
    }
    Ok(EXIT_SUCCESS)
}
