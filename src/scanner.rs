use crate::address::ServerAddress;
use crate::classifier::{AuthClassifier, ServerMetadata};
use crate::config::Config;
use crate::database::{MemoryRegistry, Observation, RegistryStore, StoreError};
use crate::fingerprint::{Fingerprint, FingerprintBuilder, Resolve, SystemResolver};
use crate::geo_lookup::GeoLookup;
use crate::models::{AuthMode, GeoInfo, Snapshot};
use crate::ping::{self, StatusError};
use crate::protocol::LoginProbe;
use crate::ratelimiter::RateLimiter;
use crate::response::StatusMetadata;
use crate::utils::{progress_bar, ErrorCounts, RunError};
use chrono::{DateTime, Utc};
use futures_util::future;
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

pub struct ScanBuilder {
	config: Arc<Config>,
	store: Option<Arc<dyn RegistryStore>>,
	resolver: Option<Arc<dyn Resolve>>,
}

impl ScanBuilder {
	pub fn store(mut self, store: Arc<dyn RegistryStore>) -> ScanBuilder {
		self.store = Some(store);
		self
	}

	pub fn resolver(mut self, resolver: Arc<dyn Resolve>) -> ScanBuilder {
		self.resolver = Some(resolver);
		self
	}

	/// Falls back to an in-memory registry and the system resolver.
	/// Must be called inside a tokio runtime when `scanner.qps` is set.
	pub fn build(self) -> Scanner {
		let config = self.config;

		let login = LoginProbe {
			protocol_version: config.scanner.protocol_version,
			username: config.scanner.probe_username.clone(),
			timeout: config.scanner.timeout(),
			disconnect_policy: config.classifier.disconnect_policy,
		};

		let fingerprints = FingerprintBuilder::new(
			self.resolver.unwrap_or_else(|| Arc::new(SystemResolver)),
			config.dns.cache_ttl(),
			config.scanner.timeout(),
		);

		Scanner {
			store: self.store.unwrap_or_else(|| Arc::new(MemoryRegistry::new())),
			classifier: AuthClassifier::from_config(&config.classifier),
			geo: config.geo.enabled.then(|| GeoLookup::new(&config.geo)),
			permits: Semaphore::new(config.scanner.concurrency),
			limiter: (config.scanner.qps > 0).then(|| RateLimiter::new(config.scanner.qps)),
			login,
			fingerprints,
			config,
		}
	}
}

/// Everything learned about one reachable server
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedServer {
	pub address: ServerAddress,
	pub status: StatusMetadata,
	pub auth_mode: AuthMode,
	pub fingerprint: Fingerprint,
	pub geo: GeoInfo,
}

impl VerifiedServer {
	/// Servers nobody is playing on leave the registry
	pub fn should_purge(&self) -> bool {
		self.auth_mode == AuthMode::Offline || self.status.players_online <= 0
	}

	pub fn observation(&self, seen_at: DateTime<Utc>) -> Observation {
		Observation {
			address: self.address.clone(),
			favicon_hash: self.fingerprint.favicon_hash.clone(),
			favicon_raw: self.status.favicon.clone(),
			resolved_ip: self.fingerprint.resolved_ip,
			last_dns_check: self.fingerprint.dns_checked_at,
			geo: self.geo.clone(),
			seen_at,
		}
	}

	pub fn snapshot(&self, scan_id: i64, timestamp: DateTime<Utc>) -> Snapshot {
		Snapshot {
			scan_id,
			address: self.address.clone(),
			version: self.status.version.clone(),
			online: self.status.players_online,
			max_players: self.status.players_max,
			auth_mode: self.auth_mode,
			sample_size: self.status.sample_size,
			timestamp,
		}
	}
}

#[derive(Debug)]
pub struct AddressOutcome {
	pub input: String,
	/// `None` when the input did not parse
	pub address: Option<ServerAddress>,
	pub result: Result<VerifiedServer, RunError>,
}

#[derive(Debug, Default)]
pub struct BatchReport {
	pub outcomes: Vec<AddressOutcome>,
	pub succeeded: usize,
	pub offline: usize,
	pub unknown: usize,
	pub errors: ErrorCounts,
}

impl BatchReport {
	fn from_outcomes(outcomes: Vec<AddressOutcome>) -> Self {
		let mut report = BatchReport::default();

		for outcome in &outcomes {
			match &outcome.result {
				Ok(server) => match server.auth_mode {
					AuthMode::Offline => report.offline += 1,
					AuthMode::Unknown => report.unknown += 1,
					_ => report.succeeded += 1,
				},
				Err(e) => {
					if matches!(e, RunError::Offline(_)) {
						report.offline += 1;
					}
					report.errors.record(e);
				}
			}
		}

		report.outcomes = outcomes;
		report
	}

	pub fn failed(&self) -> usize {
		self.outcomes.len() - self.succeeded - self.offline - self.unknown
	}
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
	pub recorded: usize,
	pub purged: usize,
	pub skipped: usize,
}

pub struct Scanner {
	config: Arc<Config>,
	store: Arc<dyn RegistryStore>,
	login: LoginProbe,
	classifier: AuthClassifier,
	fingerprints: FingerprintBuilder,
	geo: Option<GeoLookup>,
	permits: Semaphore,
	limiter: Option<RateLimiter>,
}

impl Scanner {
	/// Creates a new instance of a ScanBuilder
	pub fn new(config: Arc<Config>) -> ScanBuilder {
		ScanBuilder {
			config,
			store: None,
			resolver: None,
		}
	}

	pub fn store(&self) -> &Arc<dyn RegistryStore> {
		&self.store
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn parse_address(&self, raw: &str) -> Result<ServerAddress, RunError> {
		Ok(ServerAddress::parse_with(raw, self.config.dedup.strip_www)?)
	}

	/// Holds one of the `scanner.concurrency` slots
	async fn permit(&self) -> Option<SemaphorePermit<'_>> {
		self.permits.acquire().await.ok()
	}

	/// Paces outgoing connections when `scanner.qps` is set
	async fn pace(&self) {
		if let Some(limiter) = &self.limiter {
			limiter.acquire().await;
		}
	}

	pub async fn probe_status(
		&self,
		address: &ServerAddress,
	) -> Result<StatusMetadata, StatusError> {
		let _permit = self.permit().await;
		self.status_inner(address).await
	}

	pub async fn probe_auth_mode(&self, address: &ServerAddress) -> AuthMode {
		let _permit = self.permit().await;
		self.auth_inner(address).await
	}

	pub async fn classify(&self, address: &ServerAddress, status: &StatusMetadata) -> AuthMode {
		let _permit = self.permit().await;
		self.classify_inner(address, status).await
	}

	pub async fn build_fingerprint(
		&self,
		address: &ServerAddress,
		favicon: Option<&str>,
	) -> Fingerprint {
		self.fingerprints.build(address, favicon, self.store.as_ref()).await
	}

	async fn status_inner(&self, address: &ServerAddress) -> Result<StatusMetadata, StatusError> {
		self.pace().await;
		ping::probe_status(address, self.config.scanner.timeout()).await
	}

	async fn auth_inner(&self, address: &ServerAddress) -> AuthMode {
		self.pace().await;
		self.login.probe_auth_mode(address).await
	}

	/// Heuristics first, the login probe only when none of them fire
	async fn classify_inner(&self, address: &ServerAddress, status: &StatusMetadata) -> AuthMode {
		let metadata = ServerMetadata::new(address.host(), &status.motd, status.players_online);

		if let Some(verdict) = self.classifier.heuristic(&metadata) {
			return verdict;
		}

		let probed = self.auth_inner(address).await;
		self.classifier.after_probe(&metadata, probed)
	}

	/// Status, classification, fingerprint and geolocation for one address
	pub async fn verify(&self, input: &str) -> AddressOutcome {
		let address = match self.parse_address(input) {
			Ok(address) => address,
			Err(e) => {
				debug!("[{input}] {e}");
				return AddressOutcome {
					input: input.to_string(),
					address: None,
					result: Err(e),
				};
			}
		};

		let _permit = self.permit().await;
		let result = self.verify_inner(&address).await;

		AddressOutcome {
			input: input.to_string(),
			address: Some(address),
			result,
		}
	}

	async fn verify_inner(&self, address: &ServerAddress) -> Result<VerifiedServer, RunError> {
		let status = self.status_inner(address).await?;
		let auth_mode = self.classify_inner(address, &status).await;
		let fingerprint = self.build_fingerprint(address, status.favicon.as_deref()).await;

		let geo = match (&self.geo, fingerprint.resolved_ip) {
			(Some(geo), Some(ip)) => geo.lookup(ip).await,
			_ => GeoInfo::default(),
		};

		debug!("[{address}] {auth_mode} with {} players", status.players_online);

		Ok(VerifiedServer {
			address: address.clone(),
			status,
			auth_mode,
			fingerprint,
			geo,
		})
	}

	/// Verifies every input concurrently and returns once all of them finished
	pub async fn verify_batch(&self, inputs: Vec<String>) -> BatchReport {
		let bar = progress_bar(inputs.len() as u64, self.config.scanner.progress);
		let progress = &bar;

		let handles = inputs
			.iter()
			.map(|input| async move {
				let outcome = self.verify(input).await;
				progress.inc(1);
				outcome
			})
			.collect::<Vec<_>>();

		// Wait for all tasks to finish
		let outcomes = future::join_all(handles).await;

		bar.finish_and_clear();

		let report = BatchReport::from_outcomes(outcomes);
		info!(
			"Verified {} addresses: {} succeeded, {} offline, {} unknown, {} failed",
			report.outcomes.len(),
			report.succeeded,
			report.offline,
			report.unknown,
			report.failed()
		);
		report.errors.log();

		report
	}

	/// Writes a finished batch to the registry. Live servers are upserted with a
	/// snapshot, dead or empty ones are purged.
	pub async fn record_results(
		&self,
		scan_id: i64,
		outcomes: &[AddressOutcome],
	) -> Result<IngestSummary, StoreError> {
		let mut summary = IngestSummary::default();
		let now = Utc::now();

		for outcome in outcomes {
			match (&outcome.result, &outcome.address) {
				(Ok(server), _) if server.should_purge() => {
					if self.store.purge_server(&server.address).await? {
						info!("[{}] Purged, no players online", server.address);
						summary.purged += 1;
					}
				}
				(Ok(server), _) => {
					self.store.upsert_server(&server.observation(now)).await?;
					self.store.append_snapshot(&server.snapshot(scan_id, now)).await?;
					summary.recorded += 1;
				}
				(Err(RunError::Offline(_)), Some(address)) => {
					if self.store.purge_server(address).await? {
						info!("[{address}] Purged, server offline");
						summary.purged += 1;
					}
				}
				(Err(e), _) => {
					debug!("[{}] Not recorded: {e}", outcome.input);
					summary.skipped += 1;
				}
			}
		}

		info!(
			"Recorded {} servers, purged {}, skipped {}",
			summary.recorded, summary.purged, summary.skipped
		);

		Ok(summary)
	}

	/// One full scan: new scan id, verify everything, persist
	pub async fn run(
		&self,
		inputs: Vec<String>,
	) -> Result<(BatchReport, IngestSummary), StoreError> {
		if inputs.is_empty() {
			warn!("Nothing to scan");
		}

		let scan_id = self.store.create_scan().await?;
		info!("Starting scan {scan_id} over {} addresses", inputs.len());

		let report = self.verify_batch(inputs).await;
		let summary = self.record_results(scan_id, &report.outcomes).await?;

		Ok((report, summary))
	}
}
