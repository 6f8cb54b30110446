use anyhow::Context;
use clap::{Parser, Subcommand};
use mc_registry::address::ServerAddress;
use mc_registry::config::{load_config, Config};
use mc_registry::database::{PgRegistry, RegistryStore};
use mc_registry::dedup::merge::MergeReport;
use mc_registry::dedup::{AnalyzeOptions, IdentityResolver, Strategy};
use mc_registry::scanner::Scanner;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "mc-registry")]
#[command(
	about = "Minecraft server registry: auth-mode probing and identity deduplication",
	long_about = None
)]
struct Cli {
	/// Path to the TOML config file
	#[arg(short, long, default_value = "config.toml")]
	config: PathBuf,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Verify every address in a file (one per line) and record the results
	Verify {
		file: PathBuf,

		/// Only print results, don't touch the database
		#[arg(long)]
		dry_run: bool,
	},

	/// Server list ping a single address
	Status { address: String },

	/// Run the login probe against a single address
	Probe { address: String },

	/// Print the identity fingerprint of a single address
	Fingerprint { address: String },

	/// Find duplicate identities in the registry
	Analyze {
		/// Restrict to these strategies, all of them by default
		#[arg(short, long, value_enum)]
		strategy: Vec<Strategy>,
	},

	/// Merge duplicate identities (dry run unless --apply)
	Merge {
		#[arg(short, long, value_enum)]
		strategy: Vec<Strategy>,

		#[arg(long)]
		apply: bool,
	},

	/// Show the canonical address and aliases of an address
	Resolve { address: String },
}

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.init();

	if let Err(e) = run(Cli::parse()).await {
		error!("{e:#}");
		std::process::exit(1);
	}
}

async fn run(cli: Cli) -> anyhow::Result<()> {
	info!("Using config file {}", cli.config.display());
	let config = Arc::new(load_config(&cli.config).context("failed to load config")?);

	match cli.command {
		Commands::Verify { file, dry_run } => {
			let contents = std::fs::read_to_string(&file)
				.with_context(|| format!("failed to read {}", file.display()))?;
			let inputs: Vec<String> = contents
				.lines()
				.map(str::trim)
				.filter(|line| !line.is_empty() && !line.starts_with('#'))
				.map(String::from)
				.collect();

			if dry_run {
				let scanner = Scanner::new(config).build();
				let report = scanner.verify_batch(inputs).await;
				for outcome in &report.outcomes {
					match &outcome.result {
						Ok(server) => println!(
							"{}\t{}\t{}",
							server.address, server.auth_mode, server.status.players_online
						),
						Err(e) => println!("{}\tERROR\t{e}", outcome.input),
					}
				}
			} else {
				let store = connect(&config).await?;
				let scanner = Scanner::new(config).store(store).build();
				scanner.run(inputs).await?;
			}
		}
		Commands::Status { address } => {
			let scanner = Scanner::new(config).build();
			let address = scanner.parse_address(&address)?;
			let status = scanner.probe_status(&address).await?;
			println!("{}", serde_json::to_string_pretty(&status)?);
		}
		Commands::Probe { address } => {
			let scanner = Scanner::new(config).build();
			let address = scanner.parse_address(&address)?;
			let probed = scanner.probe_auth_mode(&address).await;
			println!("login probe: {probed}");

			if let Ok(status) = scanner.probe_status(&address).await {
				println!("classified:  {}", scanner.classify(&address, &status).await);
			}
		}
		Commands::Fingerprint { address } => {
			let scanner = Scanner::new(config).build();
			let address = scanner.parse_address(&address)?;
			let favicon = scanner
				.probe_status(&address)
				.await
				.ok()
				.and_then(|status| status.favicon);
			let fingerprint = scanner.build_fingerprint(&address, favicon.as_deref()).await;
			println!("{}", serde_json::to_string_pretty(&fingerprint)?);
		}
		Commands::Analyze { strategy } => {
			let resolver = resolver(&config).await?;
			let report = resolver.analyze_duplicates(selection(&strategy)).await?;
			println!("{}", serde_json::to_string_pretty(&report)?);
		}
		Commands::Merge { strategy, apply } => {
			let resolver = resolver(&config).await?;
			let (_, report) = resolver.deduplicate(selection(&strategy), !apply).await?;
			print_merge(&report);
		}
		Commands::Resolve { address } => {
			let resolver = resolver(&config).await?;
			let address = ServerAddress::parse_with(&address, config.dedup.strip_www)?;

			match resolver.resolve_canonical(&address).await? {
				Some(canonical) => {
					println!("canonical: {canonical}");
					for edge in resolver.aliases_of(&canonical).await? {
						println!(
							"  {}\t{}\t{:.2}",
							edge.alias_address, edge.detection_method, edge.confidence
						);
					}
				}
				None => println!("{address} is not in the registry"),
			}
		}
	}

	Ok(())
}

fn selection(strategies: &[Strategy]) -> Option<&[Strategy]> {
	(!strategies.is_empty()).then_some(strategies)
}

async fn connect(config: &Config) -> anyhow::Result<Arc<dyn RegistryStore>> {
	let store = PgRegistry::connect(&config.database)
		.await
		.context("failed to connect to database")?;
	Ok(Arc::new(store))
}

async fn resolver(config: &Config) -> anyhow::Result<IdentityResolver> {
	let options = AnalyzeOptions {
		player_tolerance: config.dedup.player_tolerance,
	};
	Ok(IdentityResolver::new(connect(config).await?, options))
}

fn print_merge(report: &MergeReport) {
	let verb = if report.dry_run { "would merge" } else { "merged" };

	for step in &report.applied {
		println!(
			"{verb}\t{} -> {}\t{}\t{:.2}",
			step.matched.alias, step.matched.canonical, step.matched.method, step.matched.confidence
		);
	}
	for skipped in &report.skipped {
		println!(
			"skipped\t{} -> {}\t{}",
			skipped.matched.alias, skipped.matched.canonical, skipped.reason
		);
	}
	println!(
		"{} {verb}, {} unchanged, {} skipped",
		report.applied.len(),
		report.unchanged.len(),
		report.skipped.len()
	);

	if report.dry_run {
		println!("dry run, pass --apply to write");
	}
}
