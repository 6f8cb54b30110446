use crate::protocol::{DisconnectPolicy, LEGACY_PROTOCOL_VERSION};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config file {path}")]
	Read {
		path: String,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to parse config")]
	Parse(#[from] toml::de::Error),
	#[error("invalid config: {0}")]
	Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	#[serde(default)]
	pub database: Database,
	#[serde(default)]
	pub scanner: Scanner,
	pub classifier: Classifier,
	#[serde(default)]
	pub dns: Dns,
	#[serde(default)]
	pub dedup: Dedup,
	#[serde(default)]
	pub geo: Geo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Database {
	pub url: String,
	pub port: u16,
	pub user: String,
	pub password: String,
	pub table: String,
	pub max_connections: u32,
}

impl Default for Database {
	fn default() -> Self {
		Self {
			url: "localhost".to_string(),
			port: 5432,
			user: "postgres".to_string(),
			password: String::new(),
			table: "postgres".to_string(),
			max_connections: 10,
		}
	}
}

impl Database {
	pub fn connection_string(&self) -> String {
		format!(
			"postgresql://{}:{}@{}:{}/{}",
			self.user, self.password, self.url, self.port, self.table
		)
	}
}

/// Refill periods below one microsecond are not meaningful for a probe pacer
pub const MAX_QPS: u32 = 1_000_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Scanner {
	pub timeout_ms: u64,
	/// Upper bound on probes in flight at once
	pub concurrency: usize,
	/// Optional global probes-per-second cap, 0 disables it
	pub qps: u32,
	pub protocol_version: u32,
	pub probe_username: String,
	pub progress: bool,
}

impl Default for Scanner {
	fn default() -> Self {
		Self {
			timeout_ms: 5000,
			concurrency: 500,
			qps: 0,
			protocol_version: LEGACY_PROTOCOL_VERSION,
			probe_username: "RegistryProbe".to_string(),
			progress: true,
		}
	}
}

impl Scanner {
	pub fn timeout(&self) -> Duration {
		Duration::from_millis(self.timeout_ms)
	}
}

/// Signature lists have no defaults: a missing list is a startup error
#[derive(Debug, Clone, Deserialize)]
pub struct Classifier {
	pub known_networks: Vec<String>,
	pub auth_plugin_signatures: Vec<String>,
	pub cracked_keywords: Vec<String>,
	#[serde(default)]
	pub disconnect_policy: DisconnectPolicy,
	#[serde(default)]
	pub hybrid_upgrade: HybridUpgrade,
}

/// Secondary NON_PREMIUM -> SEMI_PREMIUM heuristic
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HybridUpgrade {
	pub enabled: bool,
	pub min_players: i64,
	pub min_keyword_hits: usize,
	pub keywords: Vec<String>,
}

impl Default for HybridUpgrade {
	fn default() -> Self {
		Self {
			enabled: true,
			min_players: 100,
			min_keyword_hits: 2,
			keywords: [
				"premium", "original", "oficial", "pirata", "java", "bedrock", "cracked", "login",
			]
				.into_iter()
				.map(String::from)
				.collect(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Dns {
	pub cache_ttl_hours: i64,
}

impl Default for Dns {
	fn default() -> Self {
		Self { cache_ttl_hours: 48 }
	}
}

impl Dns {
	pub fn cache_ttl(&self) -> chrono::Duration {
		chrono::Duration::hours(self.cache_ttl_hours)
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Dedup {
	/// Max relative player-count difference for the favicon strategy
	pub player_tolerance: f64,
	pub strip_www: bool,
}

impl Default for Dedup {
	fn default() -> Self {
		Self {
			player_tolerance: 0.05,
			strip_www: true,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Geo {
	pub enabled: bool,
	pub endpoint: String,
	pub concurrent_requests: usize,
	/// ip-api.com allows 45 requests per minute on the free tier
	pub request_delay_ms: u64,
}

impl Default for Geo {
	fn default() -> Self {
		Self {
			enabled: false,
			endpoint: "http://ip-api.com/json/".to_string(),
			concurrent_requests: 3,
			request_delay_ms: 1500,
		}
	}
}

impl std::str::FromStr for Config {
	type Err = ConfigError;

	fn from_str(contents: &str) -> Result<Self, Self::Err> {
		let mut config: Config = toml::from_str(contents)?;
		config.classifier.lowercase_lists();
		config.validate()?;
		Ok(config)
	}
}

impl Classifier {
	fn lowercase_lists(&mut self) {
		for list in [
			&mut self.known_networks,
			&mut self.auth_plugin_signatures,
			&mut self.cracked_keywords,
			&mut self.hybrid_upgrade.keywords,
		] {
			for entry in list.iter_mut() {
				*entry = entry.trim().to_lowercase();
			}
			list.retain(|entry| !entry.is_empty());
		}
	}
}

impl Config {
	pub fn validate(&self) -> Result<(), ConfigError> {
		let required = [
			("classifier.known_networks", &self.classifier.known_networks),
			("classifier.auth_plugin_signatures", &self.classifier.auth_plugin_signatures),
			("classifier.cracked_keywords", &self.classifier.cracked_keywords),
		];
		for (name, list) in required {
			if list.is_empty() {
				return Err(ConfigError::Invalid(format!("{name} must not be empty")));
			}
		}

		if self.scanner.concurrency == 0 {
			return Err(ConfigError::Invalid("scanner.concurrency must be at least 1".into()));
		}
		if self.scanner.qps > MAX_QPS {
			return Err(ConfigError::Invalid(format!("scanner.qps must be at most {MAX_QPS}")));
		}
		if self.scanner.timeout_ms == 0 {
			return Err(ConfigError::Invalid("scanner.timeout_ms must be positive".into()));
		}
		if self.dns.cache_ttl_hours <= 0 {
			return Err(ConfigError::Invalid("dns.cache_ttl_hours must be positive".into()));
		}
		if !(0.0..=1.0).contains(&self.dedup.player_tolerance) {
			return Err(ConfigError::Invalid("dedup.player_tolerance must be within 0..=1".into()));
		}
		let upgrade = &self.classifier.hybrid_upgrade;
		if upgrade.enabled && upgrade.keywords.is_empty() {
			return Err(ConfigError::Invalid(
				"classifier.hybrid_upgrade.keywords must not be empty when enabled".into(),
			));
		}
		if self.geo.enabled && self.geo.concurrent_requests == 0 {
			return Err(ConfigError::Invalid("geo.concurrent_requests must be at least 1".into()));
		}

		Ok(())
	}
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
	let path = path.as_ref();
	let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
		path: path.display().to_string(),
		source,
	})?;

	contents.parse()
}
