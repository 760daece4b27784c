use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Mutex;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde_json::{Value, json};

use boundary_vault::config::{Config, ConfigLoader, ResolvedConfig, Selection, Targets};
use boundary_vault::domain::CountryCode;
use boundary_vault::error::{FailureKind, VaultError};
use boundary_vault::overpass::{FetchResponse, OverpassClient, RetryPolicy};
use boundary_vault::runner::Runner;
use boundary_vault::store::{Layout, gz_path, read_backup};

type Handler = Box<dyn Fn(&str) -> Result<Value, VaultError>>;

struct MockOverpass {
    handler: Handler,
    calls: Mutex<Vec<String>>,
}

impl MockOverpass {
    fn new(handler: impl Fn(&str) -> Result<Value, VaultError> + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl OverpassClient for MockOverpass {
    fn fetch(&self, query: &str) -> Result<FetchResponse, VaultError> {
        self.calls.lock().unwrap().push(query.to_string());
        let payload = (self.handler)(query)?;
        Ok(FetchResponse {
            endpoint: "https://mock.example/api/interpreter".to_string(),
            raw_text: payload.to_string(),
            payload,
        })
    }
}

fn config(root: Utf8PathBuf, countries: Targets<CountryCode>, levels: Targets<u32>) -> ResolvedConfig {
    ResolvedConfig {
        countries,
        levels,
        output_dir: root,
        delay: Duration::ZERO,
        retain_raw: false,
        compress: true,
        missing_only: false,
        endpoints: vec!["https://a".to_string(), "https://b".to_string()],
        timeout: Duration::from_secs(60),
        retry: RetryPolicy::default(),
    }
}

fn root(temp: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(temp.path().join("backups")).unwrap()
}

fn ee() -> CountryCode {
    "EE".parse().unwrap()
}

fn square(x: f64, y: f64) -> Value {
    json!([
        {"lon": x, "lat": y},
        {"lon": x + 1.0, "lat": y},
        {"lon": x + 1.0, "lat": y + 1.0},
        {"lon": x, "lat": y + 1.0},
        {"lon": x, "lat": y}
    ])
}

fn boundary(id: i64, name: &str, level: u32) -> Value {
    json!({
        "type": "relation",
        "id": id,
        "tags": {"name": name, "admin_level": level.to_string(), "boundary": "administrative"},
        "members": [{"type": "way", "ref": id, "role": "outer", "geometry": square(id as f64, 0.0)}]
    })
}

fn too_large() -> VaultError {
    VaultError::FetchFailed {
        endpoint: "https://b".to_string(),
        kind: FailureKind::TooLarge,
        message: "runtime error: Query run out of memory".to_string(),
    }
}

fn transient() -> VaultError {
    VaultError::FetchFailed {
        endpoint: "https://b".to_string(),
        kind: FailureKind::Transient,
        message: "status 504".to_string(),
    }
}

#[test]
fn explicit_targets_are_written() {
    let temp = tempfile::tempdir().unwrap();
    let client = MockOverpass::new(|query| {
        assert!(query.contains("[\"admin_level\"=\"2\"];out geom;"));
        Ok(json!({"elements": [boundary(79510, "Eesti", 2)]}))
    });
    let runner = Runner::new(
        client,
        config(root(&temp), Targets::Only(vec![ee()]), Targets::Only(vec![2])),
    );

    let summary = runner.run().unwrap();
    assert_eq!(summary.written.len(), 1);
    assert_eq!(summary.written[0].rows, 1);
    assert!(!summary.written[0].chunked);
    assert!(summary.failures.is_empty());
    assert_eq!(summary.requests, 1);

    let path = runner.layout().backup_path(&ee(), 2);
    assert!(gz_path(&path).as_std_path().exists());
    let record = read_backup(runner.layout(), &ee(), 2).unwrap();
    assert_eq!(record["meta"]["country_code"], "EE");
    assert_eq!(record["meta"]["level"], 2);
    assert_eq!(record["meta"]["created_at"], summary.started_at);
    assert_eq!(record["rows"][0]["name"], "Eesti");
    assert_eq!(record["raw_api_response_file"], Value::Null);
}

#[test]
fn full_sweep_with_complete_outputs_is_a_no_op() {
    let temp = tempfile::tempdir().unwrap();
    let root = root(&temp);
    let layout = Layout::new(root.clone());
    layout.ensure_root().unwrap();
    std::fs::write(
        layout.countries_path().as_std_path(),
        r#"{"meta": {}, "countries": [{"country_code": "EE"}]}"#,
    )
    .unwrap();
    let catalog = r#"{"meta": {}, "levels_by_country": {"EE": [2, 4]}}"#;
    std::fs::write(layout.catalog_path().as_std_path(), catalog).unwrap();
    std::fs::write(gz_path(&layout.backup_path(&ee(), 2)).as_std_path(), b"stored").unwrap();
    std::fs::write(layout.backup_path(&ee(), 4).as_std_path(), b"stored").unwrap();

    let mut config = config(root, Targets::All, Targets::All);
    config.missing_only = true;
    let runner = Runner::new(
        MockOverpass::new(|query| panic!("unexpected request: {query}")),
        config,
    );

    let summary = runner.run().unwrap();
    assert!(runner.client().calls().is_empty());
    assert_eq!(summary.requests, 0);
    assert_eq!(summary.skipped_existing, 2);
    assert!(summary.written.is_empty());
    assert_eq!(
        std::fs::read_to_string(layout.catalog_path().as_std_path()).unwrap(),
        catalog
    );
    let files = std::fs::read_dir(layout.root().as_std_path()).unwrap().count();
    assert_eq!(files, 4);
}

#[test]
fn full_sweep_discovers_countries_and_levels() {
    let temp = tempfile::tempdir().unwrap();
    let client = MockOverpass::new(|query| {
        if query.contains("\"ISO3166-1\"~") {
            return Ok(json!({"elements": [
                {"type": "relation", "id": 79510, "tags": {"ISO3166-1": "EE", "name": "Eesti"}}
            ]}));
        }
        if query.contains("[\"admin_level\"];out tags;") {
            return Ok(json!({"elements": [
                {"type": "relation", "id": 79510, "tags": {"admin_level": "2"}}
            ]}));
        }
        Ok(json!({"elements": [boundary(79510, "Eesti", 2)]}))
    });
    let mut config = config(root(&temp), Targets::All, Targets::All);
    config.missing_only = true;
    config.retain_raw = true;
    let runner = Runner::new(client, config);

    let summary = runner.run().unwrap();
    assert_eq!(runner.client().calls().len(), 3);
    assert_eq!(summary.countries, 1);
    assert_eq!(summary.written.len(), 1);

    let layout = runner.layout();
    let countries: Value = serde_json::from_slice(
        &std::fs::read(layout.countries_path().as_std_path()).unwrap(),
    )
    .unwrap();
    assert_eq!(countries["countries"][0]["country_code"], "EE");
    assert_eq!(countries["raw_api_response_file"], "countries.raw.json");
    assert!(layout.countries_raw_path().as_std_path().exists());

    let catalog: Value =
        serde_json::from_slice(&std::fs::read(layout.catalog_path().as_std_path()).unwrap())
            .unwrap();
    assert_eq!(catalog["levels_by_country"]["EE"], json!([2]));

    let record = read_backup(layout, &ee(), 2).unwrap();
    assert_eq!(record["raw_api_response_file"], "EE_L2.raw.json");
    assert!(layout.raw_path(&ee(), 2).as_std_path().exists());
}

fn chunked_level_nine(query: &str) -> Result<Value, VaultError> {
    if query.contains("[\"admin_level\"=\"9\"];out geom;") && query.contains("area.country") {
        return Err(too_large());
    }
    if query.contains("[\"admin_level\"=\"7\"];out ids;") {
        return Ok(json!({"elements": [
            {"type": "relation", "id": 700},
            {"type": "relation", "id": 701},
            {"type": "relation", "id": 700}
        ]}));
    }
    if query.contains("rel(700);") {
        return Ok(json!({"elements": [
            boundary(900, "Kärdla", 9),
            boundary(901, "Border", 9)
        ]}));
    }
    if query.contains("rel(701);") {
        return Ok(json!({"elements": [
            boundary(901, "Border", 9),
            boundary(902, "Käina", 9)
        ]}));
    }
    panic!("unexpected request: {query}");
}

#[test]
fn oversized_level_falls_back_to_parent_chunks() {
    let temp = tempfile::tempdir().unwrap();
    let client = MockOverpass::new(chunked_level_nine);
    let mut config = config(root(&temp), Targets::Only(vec![ee()]), Targets::Only(vec![9]));
    config.retain_raw = true;
    let runner = Runner::new(client, config);

    let summary = runner.run().unwrap();
    assert!(summary.failures.is_empty());
    assert_eq!(summary.written.len(), 1);
    assert!(summary.written[0].chunked);
    assert_eq!(summary.written[0].rows, 3);
    assert_eq!(runner.client().calls().len(), 4);

    let record = read_backup(runner.layout(), &ee(), 9).unwrap();
    let endpoint = record["meta"]["endpoint"].as_str().unwrap();
    assert!(endpoint.starts_with("chunked(parent_level=7)"));

    let rows = record["rows"].as_array().unwrap();
    let keys = rows
        .iter()
        .map(|row| (row["osm_type"].clone(), row["osm_id"].as_i64().unwrap()))
        .map(|(kind, id)| format!("{}/{id}", kind.as_str().unwrap()))
        .collect::<HashSet<_>>();
    assert_eq!(keys.len(), rows.len());
    assert_eq!(
        record["raw_api_response_file"],
        json!(["EE_L9.raw.part1.json", "EE_L9.raw.part2.json"])
    );
    assert!(runner.layout().raw_part_path(&ee(), 9, 2).as_std_path().exists());
}

#[test]
fn failures_are_isolated_per_target() {
    let temp = tempfile::tempdir().unwrap();
    let client = MockOverpass::new(|query| {
        if query.contains("[\"admin_level\"=\"2\"];out geom;") {
            return Ok(json!({"elements": [boundary(79510, "Eesti", 2)]}));
        }
        if query.contains("[\"admin_level\"=\"4\"];out geom;") {
            return Err(transient());
        }
        if query.contains("[\"admin_level\"=\"8\"];out geom;") {
            return Err(transient());
        }
        if query.contains("[\"admin_level\"=\"6\"];out ids;") {
            return Ok(json!({"elements": []}));
        }
        panic!("unexpected request: {query}");
    });
    let runner = Runner::new(
        client,
        config(
            root(&temp),
            Targets::Only(vec![ee()]),
            Targets::Only(vec![2, 4, 8]),
        ),
    );

    let summary = runner.run().unwrap();
    assert_eq!(summary.written.len(), 1);
    assert_eq!(summary.failures.len(), 2);
    assert_eq!(summary.targets(), 3);
    assert_eq!(summary.failures[0].level, Some(4));
    assert_eq!(summary.failures[1].level, Some(8));
    assert!(summary.failures[1].error.contains("parent relations at level 6"));
    assert_eq!(runner.client().calls().len(), 4);
    assert!(runner.layout().backup_exists(&ee(), 2));
    assert!(!runner.layout().backup_exists(&ee(), 8));
}

#[test]
fn discovery_without_levels_skips_country() {
    let temp = tempfile::tempdir().unwrap();
    let client = MockOverpass::new(|_| Ok(json!({"elements": []})));
    let runner = Runner::new(
        client,
        config(root(&temp), Targets::Only(vec![ee()]), Targets::All),
    );

    let summary = runner.run().unwrap();
    assert_eq!(summary.skipped_countries, vec!["EE".to_string()]);
    assert_eq!(runner.client().calls().len(), 1);
    assert!(!runner.layout().catalog_path().as_std_path().exists());
}

#[test]
fn plain_all_countries_all_levels_run_only_fills_gaps() {
    let temp = tempfile::tempdir().unwrap();
    let root = root(&temp);
    let layout = Layout::new(root.clone());
    layout.ensure_root().unwrap();
    std::fs::write(
        layout.countries_path().as_std_path(),
        r#"{"meta": {}, "countries": [{"country_code": "EE"}]}"#,
    )
    .unwrap();
    std::fs::write(
        layout.catalog_path().as_std_path(),
        r#"{"meta": {}, "levels_by_country": {"EE": [2, 4]}}"#,
    )
    .unwrap();
    std::fs::write(gz_path(&layout.backup_path(&ee(), 2)).as_std_path(), b"stored").unwrap();

    let config = ConfigLoader::resolve_config(Config {
        countries: Some(Selection::Keyword("all".to_string())),
        levels: Some(Selection::Keyword("all".to_string())),
        output_dir: Some(root.to_string()),
        delay_ms: Some(0),
        ..Config::default()
    })
    .unwrap();
    assert!(config.is_full_sweep());

    let client = MockOverpass::new(|query| {
        assert!(query.contains("[\"admin_level\"=\"4\"];out geom;"));
        Ok(json!({"elements": [boundary(400, "Harju maakond", 4)]}))
    });
    let runner = Runner::new(client, config);

    let summary = runner.run().unwrap();
    assert_eq!(runner.client().calls().len(), 1);
    assert_eq!(summary.skipped_existing, 1);
    assert_eq!(summary.written.len(), 1);
    assert_eq!(summary.written[0].level, 4);
    assert_eq!(
        std::fs::read(gz_path(&layout.backup_path(&ee(), 2)).as_std_path()).unwrap(),
        b"stored"
    );
}

#[test]
fn politeness_delay_precedes_every_request_but_the_first() {
    let temp = tempfile::tempdir().unwrap();
    let slept = Rc::new(RefCell::new(Vec::new()));
    let recorder = Rc::clone(&slept);
    let mut config = config(root(&temp), Targets::Only(vec![ee()]), Targets::Only(vec![9]));
    config.delay = Duration::from_millis(250);
    let runner = Runner::new(MockOverpass::new(chunked_level_nine), config)
        .with_sleep(move |delay| recorder.borrow_mut().push(delay));

    let summary = runner.run().unwrap();
    assert_eq!(summary.requests, 4);
    assert_eq!(runner.client().calls().len(), 4);
    assert_eq!(*slept.borrow(), vec![Duration::from_millis(250); 3]);
}

#[test]
fn stale_raw_files_are_pruned() {
    let temp = tempfile::tempdir().unwrap();
    let root = root(&temp);
    let layout = Layout::new(root.clone());
    layout.ensure_root().unwrap();
    let stale_direct = layout.raw_path(&ee(), 9);
    let stale_part = layout.raw_part_path(&ee(), 9, 5);
    let other_target = layout.raw_path(&ee(), 2);
    for path in [&stale_direct, &stale_part, &other_target] {
        std::fs::write(path.as_std_path(), b"{}").unwrap();
    }

    let mut retained = config(root.clone(), Targets::Only(vec![ee()]), Targets::Only(vec![9]));
    retained.retain_raw = true;
    Runner::new(MockOverpass::new(chunked_level_nine), retained)
        .run()
        .unwrap();

    assert!(!stale_direct.as_std_path().exists());
    assert!(!stale_part.as_std_path().exists());
    assert!(layout.raw_part_path(&ee(), 9, 1).as_std_path().exists());
    assert!(layout.raw_part_path(&ee(), 9, 2).as_std_path().exists());
    assert!(other_target.as_std_path().exists());

    let plain = config(root, Targets::Only(vec![ee()]), Targets::Only(vec![9]));
    Runner::new(MockOverpass::new(chunked_level_nine), plain)
        .run()
        .unwrap();

    assert!(!layout.raw_part_path(&ee(), 9, 1).as_std_path().exists());
    assert!(!layout.raw_part_path(&ee(), 9, 2).as_std_path().exists());
    assert!(other_target.as_std_path().exists());
    let record = read_backup(&layout, &ee(), 9).unwrap();
    assert_eq!(record["raw_api_response_file"], Value::Null);
}
