//! End-to-end flows over a scratch migrations directory and the in-memory ledger.

use gomigrate_engine::{
    create_migration, migration_fn, Collector, EngineError, FailPoint, MemoryLedger,
    MigrationRegistry, Migrator, TemplateKind,
};
use chrono::{TimeZone, Utc};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn write(dir: &Path, name: &str, content: &str) {
    fs::write(dir.join(name), content).unwrap();
}

fn migrator(dir: &Path, registry: MigrationRegistry, ledger: &MemoryLedger) -> Migrator {
    Migrator::new(
        Arc::new(ledger.clone()),
        Collector::new(dir, Arc::new(registry)),
    )
}

async fn history(migrator: &Migrator) -> Vec<String> {
    migrator
        .history(0)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.version)
        .collect()
}

#[tokio::test]
async fn test_scripts_and_code_interleave_by_version() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "m210101_000000_create_users.sql",
        "-- +gomigrate Up\nCREATE TABLE users (id INT);\n-- +gomigrate Down\nDROP TABLE users;\n",
    );
    write(
        dir.path(),
        "m210103_000000_create_posts.sql",
        "-- +gomigrate Up\nCREATE TABLE posts (id INT);\n-- +gomigrate Down\nDROP TABLE posts;\n",
    );

    let mut registry = MigrationRegistry::new();
    registry
        .register(
            "m210102_000000_seed_users.rs",
            Some(migration_fn(|db| {
                Box::pin(async move {
                    db.execute("INSERT INTO users VALUES (1)").await?;
                    Ok(())
                })
            })),
            Some(migration_fn(|db| {
                Box::pin(async move {
                    db.execute("DELETE FROM users").await?;
                    Ok(())
                })
            })),
        )
        .unwrap();

    let ledger = MemoryLedger::new();
    let migrator = migrator(dir.path(), registry, &ledger);

    let report = migrator.up(0).await.unwrap();
    assert_eq!(report.completed, 3);
    assert_eq!(
        ledger.executed(),
        vec![
            "CREATE TABLE users (id INT);\n",
            "INSERT INTO users VALUES (1)",
            "CREATE TABLE posts (id INT);\n"
        ]
    );

    // Apply times tie within a second; ties fall back to newest version first.
    assert_eq!(
        history(&migrator).await,
        vec![
            "m210103_000000_create_posts",
            "m210102_000000_seed_users",
            "m210101_000000_create_users"
        ]
    );
}

#[tokio::test]
async fn test_down_one_after_three_ups() {
    let dir = TempDir::new().unwrap();
    for (version, table) in [
        ("m210101_000000_m1", "one"),
        ("m210102_000000_m2", "two"),
        ("m210103_000000_m3", "three"),
    ] {
        write(
            dir.path(),
            &format!("{}.sql", version),
            &format!("-- +gomigrate Up\nCREATE TABLE {table} (id INT);\n-- +gomigrate Down\nDROP TABLE {table};\n"),
        );
    }

    let ledger = MemoryLedger::new();
    let migrator = migrator(dir.path(), MigrationRegistry::new(), &ledger);

    migrator.up(0).await.unwrap();
    let report = migrator.down(1).await.unwrap();

    assert_eq!(report.versions, vec!["m210103_000000_m3"]);
    assert_eq!(
        history(&migrator).await,
        vec!["m210102_000000_m2", "m210101_000000_m1"]
    );
    assert_eq!(
        migrator.new_migrations(0).await.unwrap().versions(),
        vec!["m210103_000000_m3"]
    );
}

#[tokio::test]
async fn test_failed_code_migration_leaves_no_row() {
    let dir = TempDir::new().unwrap();
    let mut registry = MigrationRegistry::new();
    registry
        .register(
            "m210101_000000_explode",
            Some(migration_fn(|db| {
                Box::pin(async move {
                    db.execute("CREATE TABLE half_done (id INT)").await?;
                    Err(EngineError::custom("data check failed"))
                })
            })),
            None,
        )
        .unwrap();

    let ledger = MemoryLedger::new();
    let migrator = migrator(dir.path(), registry, &ledger);

    let err = migrator.up(0).await.unwrap_err();
    assert!(matches!(err, EngineError::Function { .. }));
    assert_eq!(ledger.row("m210101_000000_explode"), None);
    assert!(ledger.executed().is_empty());

    // The version is still pending and can be retried.
    assert_eq!(migrator.new_migrations(0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_non_transactional_script_records_after_running() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "m210101_000000_concurrent_index.sql",
        "-- +gomigrate Up\n-- +gomigrate NO TRANSACTION\nCREATE INDEX CONCURRENTLY idx ON t (c);\n-- +gomigrate Down\nDROP INDEX CONCURRENTLY idx;\n",
    );

    let ledger = MemoryLedger::new();
    let migrator = migrator(dir.path(), MigrationRegistry::new(), &ledger);

    migrator.up(0).await.unwrap();
    assert!(matches!(
        ledger.row("m210101_000000_concurrent_index"),
        Some(Some(_))
    ));

    ledger.fail_on(FailPoint::DeleteRecord);
    let err = migrator.down(0).await.unwrap_err();
    assert!(err.needs_inspection());
    assert_eq!(
        ledger.executed().last().map(String::as_str),
        Some("DROP INDEX CONCURRENTLY idx;\n")
    );
}

#[tokio::test]
async fn test_custom_directive_tool() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "m210101_000000_legacy.sql",
        "-- +goose Up\nCREATE TABLE legacy (id INT);\n-- +goose Down\nDROP TABLE legacy;\n",
    );

    let ledger = MemoryLedger::new();
    let collector = Collector::new(dir.path(), Arc::new(MigrationRegistry::new()))
        .with_directive_tool("goose");
    let migrator = Migrator::new(Arc::new(ledger.clone()), collector);

    migrator.up(0).await.unwrap();
    assert_eq!(ledger.executed(), vec!["CREATE TABLE legacy (id INT);\n"]);
}

#[tokio::test]
async fn test_created_template_runs() {
    let dir = TempDir::new().unwrap();
    let created = Utc.with_ymd_and_hms(2021, 1, 31, 17, 18, 52).unwrap();
    create_migration(dir.path(), "add_user_table", TemplateKind::Sql, "gomigrate", created)
        .unwrap();

    let ledger = MemoryLedger::new();
    let migrator = migrator(dir.path(), MigrationRegistry::new(), &ledger);

    migrator.up(0).await.unwrap();
    migrator.redo(0).await.unwrap();
    assert_eq!(
        ledger.executed(),
        vec![
            "SELECT 'up SQL query';\n",
            "SELECT 'down SQL query';\n",
            "SELECT 'up SQL query';\n"
        ]
    );
    assert_eq!(history(&migrator).await, vec!["m210131_171852_add_user_table"]);
}
