use anyhow::Result;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use clap::{Args, Parser, Subcommand};

use health_mirror::config::{EngineConfig, load_config_path};
use health_mirror::db::{connection, migrate};
use health_mirror::pipeline::MirrorEngine;

#[derive(Parser)]
#[command(version, about = "Health Mirror CLI")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Apply pending schema migrations to the mirror database
    Migrate,
    /// Ingest one CSV batch for an owner
    Ingest(IngestCmd),
}

#[derive(Args)]
struct IngestCmd {
    /// Authenticated owner id the batch belongs to
    #[arg(long, value_name = "OWNER")]
    user: String,
    /// Path to the CSV file to mirror
    #[arg(long, value_name = "FILE")]
    file: String,
    /// Optional engine config TOML (retention window, retry policy)
    #[arg(long, value_name = "FILE")]
    config: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db_url = shared_utils::env::get_env_var("DATABASE_URL")?;

    match cli.cmd {
        Cmd::Migrate => {
            migrate::run_sqlite(&db_url)?;
            println!("migrations applied");
        }
        Cmd::Ingest(IngestCmd { user, file, config }) => {
            let cfg = match config {
                Some(path) => load_config_path(&path)?,
                None => EngineConfig::default(),
            };

            let bytes = std::fs::read(&file)?;
            let payload = BASE64.encode(&bytes);

            let engine = MirrorEngine::new(cfg);
            let mut conn = connection::connect_sqlite(&db_url)?;
            let report = engine.ingest_batch(&mut conn, &user, &payload)?;
            println!(
                "accepted, {} rows mirrored ({} dropped by retention)",
                report.mirrored, report.dropped_by_retention
            );
        }
    }

    Ok(())
}
