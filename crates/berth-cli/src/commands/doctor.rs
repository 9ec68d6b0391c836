use super::{json_pretty, EXIT_FAILURE, EXIT_SUCCESS};
use berth_core::{AgentConfig, StoreLock};
use berth_remote::{HttpTransport, ManifestClient};
use berth_store::{RecordStore, StoreLayout};
use std::sync::Arc;

pub fn run(config: &AgentConfig, json: bool) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    if config.driver == "docker" {
        check_prereqs(&mut checks, &mut all_pass);
    } else {
        checks.push(Check::info(
            "runtime_prereqs",
            &format!("Runtime driver `{}` needs no host tools", config.driver),
        ));
    }

    let layout = StoreLayout::new(&config.store_root);
    if config.store_root.exists() {
        checks.push(Check::pass("store_exists", "Store directory exists"));
        check_store(&layout, &mut checks, &mut all_pass);
    } else {
        checks.push(Check::info(
            "store_exists",
            "Store not initialized (created by `berth setup`)",
        ));
    }

    check_repository(config, &mut checks, &mut all_pass);
    print_results(&checks, all_pass, json)
}

fn check_prereqs(checks: &mut Vec<Check>, all_pass: &mut bool) {
    let missing = berth_runtime::check_docker_prereqs();
    if missing.is_empty() {
        checks.push(Check::pass(
            "runtime_prereqs",
            "Container engine prerequisites satisfied",
        ));
    } else {
        *all_pass = false;
        checks.push(Check::fail(
            "runtime_prereqs",
            &format!(
                "Missing prerequisites: {}",
                berth_runtime::format_missing(&missing)
            ),
        ));
    }
}

fn check_store(layout: &StoreLayout, checks: &mut Vec<Check>, all_pass: &mut bool) {
    match layout.verify_version() {
        Ok(()) => checks.push(Check::pass("store_version", "Store format version valid")),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "store_version",
                &format!("Store version check failed: {e}"),
            ));
        }
    }

    if layout.setup_marker().exists() {
        checks.push(Check::pass("first_setup", "First setup has run"));
    } else {
        checks.push(Check::warn(
            "first_setup",
            "First setup has not run (`berth setup`)",
        ));
    }

    match StoreLock::try_acquire(&layout.lock_file()) {
        Ok(Some(_)) => checks.push(Check::pass("store_lock", "Store lock is free")),
        Ok(None) => checks.push(Check::warn(
            "store_lock",
            "Store lock is held by another process (agent running?)",
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "store_lock",
                &format!("Cannot check store lock: {e}"),
            ));
        }
    }

    match RecordStore::new(layout.clone()).list() {
        Ok(names) => checks.push(Check::info(
            "services",
            &format!("{} services recorded", names.len()),
        )),
        Err(e) => checks.push(Check::warn(
            "services",
            &format!("Cannot list services: {e}"),
        )),
    }
}

fn check_repository(config: &AgentConfig, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let remote = config.remote();
    let index_url = remote.index_url();
    let client = ManifestClient::new(
        index_url.clone(),
        Arc::new(HttpTransport::with_config(remote)),
    );
    match client.index() {
        Ok(index) => checks.push(Check::pass(
            "repository",
            &format!(
                "Repository reachable ({} services published)",
                index.modules.len()
            ),
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "repository",
                &format!("Cannot fetch {index_url}: {e}"),
            ));
        }
    }
}

fn print_results(checks: &[Check], all_pass: bool, json: bool) -> Result<u8, String> {
    if json {
        let payload = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("berth doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &'static str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_store_and_repository_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            store_root: dir.path().join("store"),
            repository_url: format!("file://{}", dir.path().join("repo").display()),
            driver: "mock".to_owned(),
            ..AgentConfig::default()
        };
        assert_eq!(run(&config, true).unwrap(), EXIT_FAILURE);
    }

    #[test]
    fn healthy_store_passes() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join("repository.json"), r#"{"modules": {}}"#).unwrap();
        let layout = StoreLayout::new(dir.path().join("store"));
        layout.initialize().unwrap();
        let config = AgentConfig {
            store_root: dir.path().join("store"),
            repository_url: format!("file://{}", repo.display()),
            driver: "mock".to_owned(),
            ..AgentConfig::default()
        };
        assert_eq!(run(&config, true).unwrap(), EXIT_SUCCESS);
    }
}
