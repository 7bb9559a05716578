//! Shared fixtures for the command line tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use assert_cmd::{cargo::cargo_bin_cmd, Command};
use rusqlite::Connection;

/// Command for the geofilter binary against `db`, isolated from user config
pub fn geofilter(db: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("geofilter");
    cmd.arg("--db")
        .arg(db)
        .env_remove("GEOFILTER_DB")
        .env_remove("GEOFILTER_CONFIG")
        .env_remove("GEOFILTER_LOG")
        .env_remove("RUST_LOG")
        .env("XDG_CONFIG_HOME", db.parent().unwrap_or(db));
    cmd
}

/// Ten towns on the x axis (`POINT (i 0)`, population `25 * i`) and two roads
pub fn create_db(dir: &Path) -> PathBuf {
    let path = dir.join("layers.sqlite");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE towns (fid INTEGER PRIMARY KEY, name TEXT, population INTEGER, geom TEXT);
         CREATE TABLE roads (fid INTEGER PRIMARY KEY, name TEXT, geom TEXT);",
    )
    .unwrap();
    for i in 1..=10 {
        conn.execute(
            "INSERT INTO towns VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![i, format!("town {}", i), 25 * i, format!("POINT ({} 0)", i)],
        )
        .unwrap();
    }
    conn.execute_batch(
        "INSERT INTO roads VALUES (1, 'north', 'LINESTRING (0 5, 10 5)');
         INSERT INTO roads VALUES (2, 'cross', 'LINESTRING (3 -5, 3 5)');",
    )
    .unwrap();
    path
}

pub fn json_stdout(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap()
}
