//! A project-specific gomigrate binary with code migrations compiled in.
//!
//! ```bash
//! cargo run --example embedded_registry -- --dsn postgres://localhost/app -p migrations up
//! ```

use gomigrate_engine::{migration_fn, EngineResult, Executor, MigrationFuture, MigrationRegistry};
use std::process::ExitCode;

fn up(db: &mut dyn Executor) -> MigrationFuture<'_> {
    Box::pin(async move {
        db.execute("CREATE TABLE IF NOT EXISTS audit_log (id BIGSERIAL PRIMARY KEY, entry TEXT NOT NULL)")
            .await?;
        db.execute("INSERT INTO audit_log (entry) VALUES ('audit log created')")
            .await?;
        Ok(())
    })
}

fn down(db: &mut dyn Executor) -> MigrationFuture<'_> {
    Box::pin(async move {
        db.execute("DROP TABLE audit_log").await?;
        Ok(())
    })
}

fn registry() -> EngineResult<MigrationRegistry> {
    let mut registry = MigrationRegistry::new();
    registry
        .register("m210201_090000_create_audit_log.rs", Some(migration_fn(up)), Some(migration_fn(down)))?
        .register_non_transactional(
            "m210202_090000_index_audit_log",
            Some(migration_fn(|db| {
                Box::pin(async move {
                    db.execute("CREATE INDEX CONCURRENTLY IF NOT EXISTS audit_log_entry ON audit_log (entry)")
                        .await?;
                    Ok(())
                })
            })),
            Some(migration_fn(|db| {
                Box::pin(async move {
                    db.execute("DROP INDEX CONCURRENTLY IF EXISTS audit_log_entry").await?;
                    Ok(())
                })
            })),
        )?;
    Ok(registry)
}

#[tokio::main]
async fn main() -> ExitCode {
    match registry() {
        Ok(registry) => gomigrate::run(registry).await,
        Err(err) => {
            eprintln!("gomigrate error: {}", err);
            ExitCode::FAILURE
        }
    }
}
