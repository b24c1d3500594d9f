use std::path::PathBuf;

use anyhow::Context;
use billing_sync::sync::{PgConnector, trigger_full_sync};
use billing_sync::{config, logging, run};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
	name = "billing-sync",
	about = "billing-sync - central/regional event queue synchronizer"
)]
struct Cli {
	/// Additional settings file (json, toml, yaml or ini)
	#[arg(long, short, env = "BSY_CONFIG")]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Run the background synchronizer (default)
	Run,
	/// Enqueue a full resync of one site on the central database
	TriggerFull {
		/// Site that should receive every entity again
		#[arg(long)]
		site_id: i32,
	},
	/// Print the effective settings with passwords masked
	ShowConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	let settings = config::load_from(cli.config.as_deref()).context("failed to load settings")?;
	logging::init_logging(settings.log_level, settings.log_dir.as_deref().map(std::path::Path::new))?;

	match cli.command.unwrap_or(Commands::Run) {
		Commands::Run => run(settings, cli.config).await,
		Commands::TriggerFull { site_id } => {
			let dsn = settings.central.connection_string()?;
			if trigger_full_sync(&PgConnector, &dsn, site_id).await? {
				println!("Full synchronization initiated for site {site_id}.");
				Ok(())
			} else {
				anyhow::bail!("event.notify_all({site_id}) returned false")
			}
		}
		Commands::ShowConfig => {
			println!("{}", serde_json::to_string_pretty(&settings.redacted())?);
			Ok(())
		}
	}
}
