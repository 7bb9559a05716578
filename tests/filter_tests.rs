//! Integration tests for filtering, history, values, export and favorites

mod common;

use predicates::prelude::*;
use serde_json::Value;
use tempfile::tempdir;

use common::{create_db, geofilter, json_stdout};

const BIG_TOWNS: &str = "population > 100";

/// Towns 2, 3 and 4
const MIDDLE: &str = "POLYGON ((1.5 -1, 4.5 -1, 4.5 1, 1.5 1, 1.5 -1))";

#[test]
fn test_attribute_filter_generic() {
    let dir = tempdir().unwrap();
    let db = create_db(dir.path());
    geofilter(&db)
        .args(["filter", "towns", "--where", BIG_TOWNS])
        .assert()
        .success()
        .stdout(predicate::str::contains("towns: 6 features (generic)"));

    geofilter(&db)
        .arg("layers")
        .assert()
        .success()
        .stdout(predicate::str::contains("[filtered: $id IN (5, 6, 7, 8, 9, 10)]"));
}

#[test]
fn test_filter_json_report() {
    let dir = tempdir().unwrap();
    let db = create_db(dir.path());
    let output = geofilter(&db)
        .args(["--format", "json", "filter", "towns", "-w", BIG_TOWNS])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report = &json_stdout(&output)["reports"][0];
    assert_eq!(report["dataset"], "towns");
    assert_eq!(report["status"], "applied");
    assert_eq!(report["backend"], "generic");
    assert_eq!(report["feature_count"], 6);
    assert_eq!(report["subset"], "$id IN (5, 6, 7, 8, 9, 10)");
}

#[test]
fn test_forced_embedded_falls_back_without_spatial_functions() {
    let dir = tempdir().unwrap();
    let db = create_db(dir.path());
    let output = geofilter(&db)
        .args(["--format", "json", "filter", "towns", "-w", BIG_TOWNS, "--backend", "embedded"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let body = json_stdout(&output);
    let report = &body["reports"][0];
    assert_eq!(report["backend"], "generic");
    assert_eq!(report["fallback"], true);
    assert_eq!(report["feature_count"], 6);
    assert!(report["warnings"][0].as_str().unwrap().contains("cannot serve"));
}

#[test]
fn test_spatial_filter_with_polygon() {
    let dir = tempdir().unwrap();
    let db = create_db(dir.path());
    geofilter(&db)
        .args(["filter", "towns", "-p", "intersects", "--source-wkt", MIDDLE])
        .assert()
        .success()
        .stdout(predicate::str::contains("towns: 3 features"));
}

#[test]
fn test_combine_with_current_filter() {
    let dir = tempdir().unwrap();
    let db = create_db(dir.path());
    geofilter(&db)
        .args(["filter", "towns", "-w", "population >= 75"])
        .assert()
        .success()
        .stdout(predicate::str::contains("8 features"));

    // 3..10 and 2..4
    geofilter(&db)
        .args(["filter", "towns", "-p", "intersects", "--source-wkt", MIDDLE, "-c", "and"])
        .assert()
        .success()
        .stdout(predicate::str::contains("towns: 2 features"));
}

#[test]
fn test_undo_redo_and_history() {
    let dir = tempdir().unwrap();
    let db = create_db(dir.path());
    geofilter(&db).args(["filter", "towns", "-w", BIG_TOWNS]).assert().success();

    geofilter(&db)
        .args(["undo", "towns"])
        .assert()
        .success()
        .stdout(predicate::str::contains("towns: no filter"));
    geofilter(&db)
        .args(["history", "towns"])
        .assert()
        .success()
        .stdout(predicate::str::contains("* 0  no filter"));

    geofilter(&db)
        .args(["redo", "towns"])
        .assert()
        .success()
        .stdout(predicate::str::contains("6 features"));
    geofilter(&db)
        .args(["undo", "towns"])
        .assert()
        .success();
    geofilter(&db)
        .args(["undo", "towns"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to undo"));
}

#[test]
fn test_global_undo_restores_every_layer() {
    let dir = tempdir().unwrap();
    let db = create_db(dir.path());
    geofilter(&db)
        .args(["filter", "towns", "roads", "-p", "intersects", "--source-wkt", MIDDLE])
        .assert()
        .success()
        .stdout(predicate::str::contains("towns: 3 features"))
        .stdout(predicate::str::contains("roads: 1 features"));

    geofilter(&db)
        .arg("history")
        .assert()
        .success()
        .stdout(predicate::str::contains("[roads, towns]"));

    geofilter(&db)
        .args(["undo", "--global"])
        .assert()
        .success()
        .stdout(predicate::str::contains("roads: no filter"))
        .stdout(predicate::str::contains("towns: no filter"));
}

#[test]
fn test_reset_removes_filter() {
    let dir = tempdir().unwrap();
    let db = create_db(dir.path());
    geofilter(&db).args(["filter", "towns", "-w", BIG_TOWNS]).assert().success();
    geofilter(&db)
        .args(["reset", "towns"])
        .assert()
        .success()
        .stdout(predicate::str::contains("towns: filter removed"));
    geofilter(&db)
        .arg("layers")
        .assert()
        .success()
        .stdout(predicate::str::contains("filtered").not());
}

#[test]
fn test_values_under_current_filter() {
    let dir = tempdir().unwrap();
    let db = create_db(dir.path());
    geofilter(&db).args(["filter", "towns", "-w", BIG_TOWNS]).assert().success();

    let output = geofilter(&db)
        .args(["--format", "json", "values", "towns", "population"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let values = json_stdout(&output);
    assert_eq!(values.as_array().unwrap().len(), 6);
    assert_eq!(values[0], 125);

    let output = geofilter(&db)
        .args(["--format", "json", "values", "towns", "population", "--all", "--limit", "3"])
        .output()
        .unwrap();
    assert_eq!(json_stdout(&output), serde_json::json!([25, 50, 75]));
}

#[test]
fn test_export_uses_current_filter() {
    let dir = tempdir().unwrap();
    let db = create_db(dir.path());
    let out = dir.path().join("out").join("big.geojson");
    geofilter(&db).args(["filter", "towns", "-w", BIG_TOWNS]).assert().success();

    geofilter(&db)
        .args(["export", "towns", "-o"])
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("towns: 6 features"));

    let written: Value = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(written["type"], "FeatureCollection");
    assert_eq!(written["features"].as_array().unwrap().len(), 6);
    assert_eq!(written["features"][0]["geometry"]["type"], "Point");
}

#[test]
fn test_export_all_in_batch() {
    let dir = tempdir().unwrap();
    let db = create_db(dir.path());
    let out = dir.path().join("batch");
    geofilter(&db).args(["filter", "towns", "-w", BIG_TOWNS]).assert().success();

    geofilter(&db)
        .args(["export", "towns", "roads", "--batch", "--all", "--as", "geojsonseq", "-o"])
        .arg(&out)
        .assert()
        .success();

    let towns = std::fs::read_to_string(out.join("towns.geojsonl")).unwrap();
    assert_eq!(towns.lines().count(), 10);
    assert!(out.join("roads.geojsonl").exists());
}

#[test]
fn test_favorites_round_trip() {
    let dir = tempdir().unwrap();
    let db = create_db(dir.path());
    geofilter(&db)
        .args(["favorites", "save", "big", "towns", "-w", BIG_TOWNS, "-d", "big towns"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Saved favorite 'big'"));

    geofilter(&db)
        .args(["favorites", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("big  [towns]  big towns"));

    geofilter(&db)
        .args(["favorites", "apply", "big"])
        .assert()
        .success()
        .stdout(predicate::str::contains("towns: 6 features"));
}

#[test]
fn test_unknown_favorite_fails() {
    let dir = tempdir().unwrap();
    let db = create_db(dir.path());
    geofilter(&db)
        .args(["favorites", "apply", "nothing"])
        .assert()
        .code(2);
}
