use std::sync::Arc;

use clap::Parser;

mod cli;
mod config;
mod eid;
mod embedding;
mod flush;
mod index;
mod service;
mod snapshot;
mod web;

use config::Config;

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    match args.command {
        cli::Command::Daemon { bind } => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
                )
                .init();

            let config = Config::load()?;
            let provider = embedding::from_config(&config.embedding, config.base_path().clone())?;
            let store = snapshot::SnapshotStore::new(config.snapshot_path());
            let service = Arc::new(service::DedupService::open(
                provider,
                store,
                config.service_options(),
            )?);

            web::start_daemon(service, bind);
            Ok(())
        }

        cli::Command::Submit { text, endpoint } => {
            let client = reqwest::blocking::Client::new();
            let response = client
                .post(format!("{endpoint}/api/similarity"))
                .json(&serde_json::json!({ "text": text }))
                .send()?;

            let status = response.status();
            let body: serde_json::Value = response.json()?;
            println!("{}", serde_json::to_string_pretty(&body)?);

            if !status.is_success() {
                anyhow::bail!("daemon returned {status}");
            }
            Ok(())
        }

        cli::Command::Stats { endpoint } => {
            let client = reqwest::blocking::Client::new();
            let body: serde_json::Value = client
                .get(format!("{endpoint}/api/stats"))
                .send()?
                .error_for_status()?
                .json()?;

            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
    }
}
