//! Service lifecycle against the mock runtime and an in-memory repository.
//!
//! Covers the full install → update → revert cycle, including volume backups,
//! container renames and version directories, and checks after every step
//! that the record on disk equals the record in memory.

use berth_core::{AgentContext, CoreError, Service};
use berth_remote::{ManifestClient, StaticTransport};
use berth_runtime::{MockDriver, RuntimeDriver};
use berth_store::{ServiceRecord, ServiceStatus, StoreLayout};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;

const REPO: &str = "mem://repo";

const INDEX: &str = r#"{
    "modules": {
        "notes": {
            "type": "plugin",
            "description": "Shared notes",
            "versions": [
                {"version": "1.0.0", "url": "mem://repo/notes/1.0.0/service.json"},
                {"version": "2.0.0", "url": "mem://repo/notes/2.0.0/service.json", "required": "1.0.0", "revert": true},
                {"version": "3.0.0", "url": "mem://repo/notes/3.0.0/service.json", "required": "2.0.0"}
            ]
        },
        "board": {
            "type": "plugin",
            "versions": [
                {"version": "1.0.0", "url": "mem://repo/board/1.0.0/docker-compose.yml"}
            ]
        }
    }
}"#;

/// From 2.0.0 on, the app needs `API_KEY` and keeps a search index volume.
fn notes_manifest(image_tag: &str, search: bool) -> String {
    let (env_list, extra_decl, app_volumes, volumes) = if search {
        (
            r#"["DB_PASS", "API_KEY"]"#,
            r#", {"name": "API_KEY", "description": "api key", "mutable": true}"#,
            r#"[{"name": "notes_index", "mountpoint": "/srv/index"}]"#,
            r#"[{"name": "notes_data"}, {"name": "notes_index"}]"#,
        )
    } else {
        (r#"["DB_PASS"]"#, "", "[]", r#"[{"name": "notes_data"}]"#)
    };
    format!(
        r#"{{
        "containers": [
            {{"name": "db", "prebuilt": {{"name": "postgres", "version": "16"}},
              "networks": [{{"name": "notes_net"}}],
              "volumes": [{{"name": "notes_data", "mountpoint": "/var/lib/postgresql/data"}}],
              "environment": ["DB_PASS"]}},
            {{"name": "app", "prebuilt": {{"name": "notes", "version": "{image_tag}"}},
              "networks": [{{"name": "notes_net"}}, {{"name": "berth"}}],
              "volumes": {app_volumes},
              "environment": {env_list}}}
        ],
        "networks": [{{"name": "notes_net", "internal": true}}, {{"name": "berth"}}],
        "volumes": {volumes},
        "environment": [
            {{"name": "DB_PASS", "description": "database password", "mutable": false}}{extra_decl}
        ]
    }}"#
    )
}

const BOARD_COMPOSE: &str = r"
services:
  cache:
    image: redis
    networks:
      - board_net
    env_file: ./board.env
  web:
    networks:
      - board_net
    env_file: ./board.env
networks:
  board_net:
    internal: true
";

const BOARD_ENV: &str = "# Board title U\nBOARD_TITLE=Team board\n";

fn source_tarball() -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, data) in [
        ("web/Dockerfile", &b"FROM scratch\n"[..]),
        ("web/app.js", &b"console.log(1)\n"[..]),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

struct Fixture {
    _dir: tempfile::TempDir,
    driver: Arc<MockDriver>,
    ctx: Arc<AgentContext>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(StaticTransport::new());
    transport.insert(&format!("{REPO}/repository.json"), INDEX);
    transport.insert(
        &format!("{REPO}/notes/1.0.0/service.json"),
        notes_manifest("1", false),
    );
    transport.insert(
        &format!("{REPO}/notes/2.0.0/service.json"),
        notes_manifest("2", true),
    );
    transport.insert(
        &format!("{REPO}/notes/3.0.0/service.json"),
        notes_manifest("3", true),
    );
    transport.insert(
        &format!("{REPO}/board/1.0.0/docker-compose.yml"),
        BOARD_COMPOSE,
    );
    transport.insert(&format!("{REPO}/board/1.0.0/board.env"), BOARD_ENV);
    transport.insert(&format!("{REPO}/board/1.0.0/web.tar.gz"), source_tarball());

    let driver = Arc::new(MockDriver::with_root(dir.path().join("engine")));
    let manifests = Arc::new(ManifestClient::new(
        format!("{REPO}/repository.json"),
        transport,
    ));
    let ctx = Arc::new(
        AgentContext::new(
            StoreLayout::new(dir.path().join("store")),
            driver.clone(),
            manifests,
            "berth",
        )
        .unwrap(),
    );
    ctx.env
        .store_value("DB_PASS", "hunter2", "database password", false)
        .unwrap();
    Fixture {
        _dir: dir,
        driver,
        ctx,
    }
}

fn notes_url(version: &str) -> String {
    format!("{REPO}/notes/{version}/service.json")
}

fn strip(mut record: ServiceRecord) -> ServiceRecord {
    record.updated_at = None;
    record.checksum = None;
    record
}

fn assert_persisted(f: &Fixture, service: &Service) {
    let on_disk = f.ctx.records.get(service.name()).unwrap();
    assert_eq!(strip(on_disk), strip(service.record().unwrap()));
}

fn container_set(names_and_ids: &[berth_store::ContainerRef]) -> HashSet<(String, String)> {
    names_and_ids
        .iter()
        .map(|c| (c.name.clone(), c.id.to_string()))
        .collect()
}

fn install_notes(f: &Fixture) -> Service {
    let service = Service::create(f.ctx.clone(), "notes").unwrap();
    let required = service.prepare_build(&notes_url("1.0.0"), "1.0.0").unwrap();
    assert!(required.is_empty());
    assert_eq!(service.status().unwrap(), ServiceStatus::InstallPending);
    assert_persisted(f, &service);

    assert!(service.continue_installation().unwrap());
    assert_eq!(service.status().unwrap(), ServiceStatus::Paused);
    assert_persisted(f, &service);

    service.start().unwrap();
    assert_eq!(service.status().unwrap(), ServiceStatus::Running);
    assert_persisted(f, &service);
    service
}

fn volume_dir(f: &Fixture, service: &Service) -> std::path::PathBuf {
    let record = service.record().unwrap();
    f.driver.volume_path(&record.volumes[0].id).unwrap()
}

#[test]
fn update_then_revert_restores_containers_and_data() {
    let f = fixture();
    let service = install_notes(&f);
    let original = container_set(&service.record().unwrap().containers.actual);
    fs::write(volume_dir(&f, &service).join("notes.db"), b"version one").unwrap();

    let required = service.prepare_update(&notes_url("2.0.0"), "2.0.0").unwrap();
    assert_eq!(required.keys().collect::<Vec<_>>(), ["API_KEY"]);
    assert_eq!(service.status().unwrap(), ServiceStatus::UpdatePending);
    assert_eq!(service.installed_version().unwrap(), "2.0.0");
    assert_eq!(service.previous_version().unwrap(), "1.0.0");
    assert_persisted(&f, &service);

    f.ctx.env.store_value("API_KEY", "k", "api key", true).unwrap();
    service.update().unwrap();
    assert_eq!(service.status().unwrap(), ServiceStatus::Running);
    assert_persisted(&f, &service);

    let record = service.record().unwrap();
    let retired: HashSet<String> = record
        .containers
        .previous
        .iter()
        .map(|c| c.name.clone())
        .collect();
    assert_eq!(
        retired,
        HashSet::from(["db_1.0.0".to_owned(), "app_1.0.0".to_owned()])
    );
    assert_eq!(record.containers.actual.len(), 2);
    assert!(f.ctx.layout.backup_path("notes_data", "1.0.0").exists());
    assert!(record.volume("notes_index").is_some());
    assert!(service.is_running().unwrap());
    assert!(!f.driver.container_named("app_1.0.0").unwrap().1.running);

    fs::write(volume_dir(&f, &service).join("notes.db"), b"version two").unwrap();

    service.revert().unwrap();
    assert_eq!(service.status().unwrap(), ServiceStatus::Running);
    assert_persisted(&f, &service);

    let record = service.record().unwrap();
    assert_eq!(container_set(&record.containers.actual), original);
    assert!(record.containers.previous.is_empty());
    assert_eq!(record.actual_version, "1.0.0");
    assert!(record.previous_version.is_empty());
    assert_eq!(
        fs::read(volume_dir(&f, &service).join("notes.db")).unwrap(),
        b"version one"
    );
    assert!(!f.ctx.layout.backup_path("notes_data", "1.0.0").exists());
    let volumes: Vec<&str> = record.volumes.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(volumes, ["notes_data"]);
    assert!(!f.driver.volume_names().contains(&"notes_index".to_owned()));
    assert!(!f.ctx.layout.version_dir("notes", "2.0.0").exists());
    assert!(f.ctx.layout.version_dir("notes", "1.0.0").exists());
    assert_eq!(service.description().unwrap().unwrap().version(), "1.0.0");
}

#[test]
fn update_waits_for_new_variables() {
    let f = fixture();
    let service = Arc::new(install_notes(&f));
    service.prepare_update(&notes_url("2.0.0"), "2.0.0").unwrap();

    let err = service.update().unwrap_err();
    match err {
        CoreError::MissingVariables(names) => assert_eq!(names, ["API_KEY"]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(service.status().unwrap(), ServiceStatus::UpdatePending);
    assert!(service.async_update().is_err());
    assert_persisted(&f, &service);
}

#[test]
fn async_update_runs_in_background() {
    let f = fixture();
    f.ctx.env.store_value("API_KEY", "k", "", true).unwrap();
    let service = Arc::new(install_notes(&f));
    service.prepare_update(&notes_url("2.0.0"), "2.0.0").unwrap();

    service.async_update().unwrap();
    service.wait().unwrap();
    assert_eq!(service.status().unwrap(), ServiceStatus::Running);
    assert!(!service.is_busy().unwrap());
    assert_persisted(&f, &service);
}

#[test]
fn prepare_update_purges_stale_previous_version() {
    let f = fixture();
    f.ctx.env.store_value("API_KEY", "k", "", true).unwrap();
    let service = install_notes(&f);
    service.prepare_update(&notes_url("2.0.0"), "2.0.0").unwrap();
    service.update().unwrap();
    assert!(f.driver.container_named("db_1.0.0").is_some());

    service.prepare_update(&notes_url("3.0.0"), "3.0.0").unwrap();
    assert!(f.driver.container_named("db_1.0.0").is_none());
    assert!(f.driver.container_named("app_1.0.0").is_none());
    assert!(!f.ctx.layout.version_dir("notes", "1.0.0").exists());
    assert!(!f.ctx.layout.backup_path("notes_data", "1.0.0").exists());

    let record = service.record().unwrap();
    assert!(record.containers.previous.is_empty());
    assert_eq!(record.previous_version, "2.0.0");
    assert_eq!(record.actual_version, "3.0.0");
    assert_persisted(&f, &service);
}

#[test]
fn rebuild_recreates_containers_at_same_version() {
    let f = fixture();
    let service = install_notes(&f);
    let before = container_set(&service.record().unwrap().containers.actual);

    service.rebuild().unwrap();
    let record = service.record().unwrap();
    assert_eq!(record.status, ServiceStatus::Running);
    assert_eq!(record.actual_version, "1.0.0");
    assert_eq!(record.containers.actual.len(), 2);
    assert!(container_set(&record.containers.actual).is_disjoint(&before));
    assert_eq!(f.driver.containers().len(), 2);
    assert_persisted(&f, &service);
}

#[test]
fn delete_removes_runtime_objects_and_directory() {
    let f = fixture();
    let service = install_notes(&f);
    service.delete().unwrap();

    assert_eq!(service.status().unwrap(), ServiceStatus::Deleted);
    assert!(f.driver.containers().is_empty());
    assert!(!f.driver.volume_names().contains(&"notes_data".to_owned()));
    assert!(!f.ctx.layout.service_dir("notes").exists());
    assert!(f.driver.network_named("notes_net").is_none());
    assert!(f.driver.call_count("prune_images") >= 1);
}

#[test]
fn compose_service_builds_from_source_archive() {
    let f = fixture();
    let service = Service::create(f.ctx.clone(), "board").unwrap();
    let required = service
        .prepare_build(&format!("{REPO}/board/1.0.0/docker-compose.yml"), "1.0.0")
        .unwrap();
    assert!(required.is_empty());
    assert_eq!(
        f.ctx.env.value("BOARD_TITLE").unwrap().as_deref(),
        Some("Team board")
    );

    assert!(service.continue_installation().unwrap());
    assert_eq!(f.driver.call_count("build_image"), 1);
    assert_eq!(f.driver.call_count("pull_image"), 1);
    let (_, web) = f.driver.container_named("web").unwrap();
    assert_eq!(web.env["BOARD_TITLE"], "Team board");

    let version_dir = f.ctx.layout.version_dir("board", "1.0.0");
    assert!(version_dir.join("docker-compose.yml").exists());
    assert!(version_dir.join("board.env").exists());
    let cache: Vec<_> = fs::read_dir(f.ctx.layout.buildcache_dir())
        .unwrap()
        .collect();
    assert!(cache.is_empty());

    let reloaded = Service::load(f.ctx.clone(), "board").unwrap();
    assert_eq!(
        reloaded.description().unwrap().unwrap().container_count(),
        2
    );
}

#[test]
fn failed_manifest_fetch_leaves_error_status() {
    let f = fixture();
    let service = Service::create(f.ctx.clone(), "notes").unwrap();
    let err = service
        .prepare_build(&notes_url("9.9.9"), "9.9.9")
        .unwrap_err();
    assert!(matches!(err, CoreError::Remote(_)));
    assert_eq!(service.status().unwrap(), ServiceStatus::Error);
    assert_persisted(&f, &service);
}
