use anyhow::{bail, Context, Result};
use cirrus_harvester::config::HarvestConfig;
use cirrus_harvester::parser::Parser;
use cirrus_harvester::provider::{self, CloudProvider};
use cirrus_harvester::report::{self, ReportBuilder};
use cirrus_harvester::session::{OpenSshConnector, SshOptions};
use cirrus_harvester::topology::ClusterTopology;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
Usage: cirrus-harvester <command>

Commands:
  init                Write the default config if there is none yet
  collect             Sync collectl captures from every node into the cache
  parse <timing-log>  Report resource usage inside the pipeline window
  report              Report the live cluster topology

Nothing is retried. If nodes fail during `collect`, run it again: captures
already cached with the same size and mtime are not transferred twice.

Config is read from $CIRRUS_HARVESTER_CONFIG or the user config directory.";

enum Command {
    Init,
    Collect,
    Parse(PathBuf),
    Report,
}

impl Command {
    fn from_args(mut args: impl Iterator<Item = String>) -> Option<Self> {
        match args.next()?.as_str() {
            "init" => Some(Self::Init),
            "collect" => Some(Self::Collect),
            "parse" => args.next().map(|log| Self::Parse(PathBuf::from(log))),
            "report" => Some(Self::Report),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cirrus_harvester=info")),
        )
        .init();

    let Some(command) = Command::from_args(std::env::args().skip(1)) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    if let Command::Init = command {
        let path = HarvestConfig::config_file_path()?;
        if path.exists() {
            info!("Config already exists at {}", path.display());
        } else {
            HarvestConfig::default()
                .save()
                .await
                .context("Failed to write default config")?;
            info!("Wrote default config to {}", path.display());
        }
        return Ok(());
    }

    let config = HarvestConfig::load()
        .await
        .context("Failed to load harvester config")?;

    match command {
        Command::Init => {}
        Command::Collect => {
            let topology = ClusterTopology::load(&config.cluster.inventory)
                .await
                .context("Failed to load cluster inventory")?;
            let connector = OpenSshConnector::new(SshOptions {
                connect_timeout_secs: config.harvest.connect_timeout_secs,
                ..SshOptions::default()
            });

            let summary = cloud_provider(&config)?
                .collect_data(&topology, &config, &connector)
                .await
                .context("Harvest failed")?;

            let failed = summary.failed_hosts();
            if failed.is_empty() {
                info!(
                    "Harvest complete: {} downloaded, {} already cached",
                    summary.downloaded(),
                    summary.skipped()
                );
            } else {
                warn!(
                    "Harvest incomplete, failed: {}. Rerun `collect` to fetch the rest.",
                    failed.join(", ")
                );
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Parse(timing_log) => {
            if !timing_log.is_file() {
                bail!("timing log {} does not exist", timing_log.display());
            }
            // Offline: parsing never talks to the provider
            let parsed = Parser::new(&timing_log, &config.harvest.cache_dir)
                .run()
                .context("Failed to parse telemetry")?;

            let mut builder = ReportBuilder::new();
            report::add_telemetry(&mut builder, &parsed);
            println!("{}", serde_json::to_string_pretty(&builder.digest())?);
        }
        Command::Report => {
            let topology = ClusterTopology::load(&config.cluster.inventory)
                .await
                .context("Failed to load cluster inventory")?;
            let document = cloud_provider(&config)?.information(&topology).await;
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
    }

    Ok(())
}

fn cloud_provider(config: &HarvestConfig) -> Result<Box<dyn CloudProvider>> {
    provider::get(&config.cluster.provider, config).context("Failed to select cloud provider")
}
