use idp_store_core::config::SqliteConfig;
use idp_store_core::db::migrations::latest_version;
use idp_store_core::db::{open_db, DbError};
use rusqlite::{params, Connection};

#[test]
fn open_db_in_memory_applies_all_migrations() {
    let conn = open_db(&SqliteConfig::in_memory()).expect("in-memory db should open");

    assert_eq!(schema_version(&conn), latest_version());
    for table in [
        "cloud_providers",
        "resource_types",
        "resource_type_cloud_mappings",
        "property_schemas",
        "blueprints",
        "blueprint_cloud_providers",
        "teams",
        "stacks",
        "api_keys",
    ] {
        assert_table_exists(&conn, table);
    }
}

#[test]
fn opening_same_database_twice_is_idempotent() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let config = SqliteConfig::file(dir.path().join("idp.db"));

    let conn_first = open_db(&config).expect("first open");
    assert_eq!(schema_version(&conn_first), latest_version());
    drop(conn_first);

    let conn_second = open_db(&config).expect("second open");
    assert_eq!(schema_version(&conn_second), latest_version());
    assert_table_exists(&conn_second, "stacks");
}

#[test]
fn opening_database_with_newer_schema_version_returns_error() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let path = dir.path().join("future.db");

    let conn = Connection::open(&path).expect("raw connection");
    conn.execute_batch("PRAGMA user_version = 999;")
        .expect("user_version should be writable");
    drop(conn);

    let err = open_db(&SqliteConfig::file(&path)).expect_err("newer schema must be rejected");
    match err {
        DbError::UnsupportedSchemaVersion {
            db_version,
            latest_supported,
        } => {
            assert_eq!(db_version, 999);
            assert_eq!(latest_supported, latest_version());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn stack_name_is_unique_per_creator_at_the_schema_level() {
    let conn = open_db(&SqliteConfig::in_memory()).expect("in-memory db should open");
    let insert = "INSERT INTO stacks (id, name, stack_type, is_public, created_by, created_at, updated_at)
                  VALUES (?1, ?2, 'RESTFUL_API', 0, ?3, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')";

    conn.execute(insert, params!["s1", "svc-a", "u1"])
        .expect("first stack");
    conn.execute(insert, params!["s2", "svc-a", "u2"])
        .expect("other creator may reuse the name");
    let err = conn
        .execute(insert, params!["s3", "svc-a", "u1"])
        .expect_err("duplicate (name, created_by)");
    assert!(err.to_string().contains("UNIQUE"), "{err}");
}

#[test]
fn foreign_keys_are_enforced_on_every_connection() {
    let conn = open_db(&SqliteConfig::in_memory()).expect("in-memory db should open");
    let enabled: i64 = conn
        .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
        .expect("pragma");
    assert_eq!(enabled, 1);
}

fn schema_version(conn: &Connection) -> u32 {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .expect("user_version should be readable")
}

fn assert_table_exists(conn: &Connection, table_name: &str) {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = 'table' AND name = ?1
            );",
            [table_name],
            |row| row.get(0),
        )
        .expect("sqlite_master query");
    assert_eq!(exists, 1, "table {table_name} does not exist");
}
