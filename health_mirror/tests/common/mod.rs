#![allow(dead_code)]

use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use diesel::QueryableByName;
use diesel::prelude::*;
use diesel::sql_types::BigInt;
use tempfile::TempDir;

use health_mirror::config::EngineConfig;
use health_mirror::db::{connection, migrate};
use health_mirror::pipeline::MirrorEngine;

pub struct TestDb {
    _dir: TempDir, // keep alive for the life of the test
    pub path: String,
}

pub fn setup_db() -> (TestDb, SqliteConnection) {
    let dir = TempDir::new().expect("tempdir");
    let mut p = PathBuf::from(dir.path());
    p.push("mirror.db");
    let path = p.to_string_lossy().to_string();

    migrate::run_sqlite(&path).expect("migrations");

    let conn = connection::connect_sqlite(&path).expect("connect");
    (TestDb { _dir: dir, path }, conn)
}

pub fn engine() -> MirrorEngine {
    MirrorEngine::new(EngineConfig::default())
}

/// Base64-encode CSV text the way the upload queue does.
pub fn payload(csv_text: &str) -> String {
    BASE64.encode(csv_text)
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    n: i64,
}

pub fn count(conn: &mut SqliteConnection, table: &str) -> i64 {
    let row: CountRow = diesel::sql_query(format!("SELECT COUNT(*) AS n FROM {table}"))
        .get_result(conn)
        .unwrap();
    row.n
}

pub fn count_where(conn: &mut SqliteConnection, table: &str, predicate: &str) -> i64 {
    let row: CountRow =
        diesel::sql_query(format!("SELECT COUNT(*) AS n FROM {table} WHERE {predicate}"))
            .get_result(conn)
            .unwrap();
    row.n
}
