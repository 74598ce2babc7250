use std::fs;

use assert_matches::assert_matches;
use dcor_depot::config::{ConfigLoader, ObjectStoreBackend};
use dcor_depot::error::DepotError;

fn write_config(content: &str) -> (tempfile::TempDir, String) {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("dcor-depot.json");
    fs::write(&path, content).unwrap();
    let path = path.to_str().unwrap().to_string();
    (temp, path)
}

#[test]
fn file_values_override_defaults() {
    let (_temp, path) = write_config(
        r#"{
            "schema_version": 1,
            "depot_root": "/srv/depot",
            "check": { "min_events": 100, "count_tolerance_max": 10 },
            "object_store": { "endpoint_url": "https://s3.example.org/", "bucket_prefix": "test-" }
        }"#,
    );
    let resolved = ConfigLoader::resolve(Some(&path)).unwrap();
    assert_eq!(resolved.depot_root, "/srv/depot");
    assert_eq!(resolved.check.min_events, 100);
    assert_eq!(resolved.check.count_tolerance_min, -10);
    assert_eq!(resolved.check.count_tolerance_max, Some(10));
    assert_eq!(resolved.check.small_count_mismatch, 5);
    assert_eq!(
        resolved.object_store.backend,
        ObjectStoreBackend::Http("https://s3.example.org".to_string())
    );
    assert_eq!(resolved.object_store.bucket_prefix, "test-");
    assert_eq!(resolved.tools.inspect, "rtdc-inspect");
}

#[test]
fn filesystem_backend_by_default() {
    let (_temp, path) = write_config("{}");
    let resolved = ConfigLoader::resolve(Some(&path)).unwrap();
    assert_eq!(
        resolved.object_store.backend,
        ObjectStoreBackend::Filesystem("/data/object-store".into())
    );
    assert_eq!(resolved.object_store.bucket_prefix, "circle-");
}

#[test]
fn unsupported_schema_version_is_rejected() {
    let (_temp, path) = write_config(r#"{ "schema_version": 2 }"#);
    let err = ConfigLoader::resolve(Some(&path)).unwrap_err();
    assert_matches!(err, DepotError::ConfigParse(message) if message.contains("schema_version"));
}

#[test]
fn inverted_tolerance_window_is_rejected() {
    let (_temp, path) = write_config(
        r#"{ "check": { "count_tolerance_min": 0, "count_tolerance_max": -5 } }"#,
    );
    assert_matches!(
        ConfigLoader::resolve(Some(&path)),
        Err(DepotError::ConfigParse(_))
    );
}

#[test]
fn malformed_json_is_a_parse_error() {
    let (_temp, path) = write_config("{ not json");
    assert_matches!(
        ConfigLoader::resolve(Some(&path)),
        Err(DepotError::ConfigParse(_))
    );
}

#[test]
fn missing_explicit_file_is_a_read_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(DepotError::ConfigRead(_))
    );
}
