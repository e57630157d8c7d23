use gomigrate_engine::MigrationRegistry;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    gomigrate::run(MigrationRegistry::new()).await
}
