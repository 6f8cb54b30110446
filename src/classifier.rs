use crate::config;
use crate::models::AuthMode;
use std::sync::Arc;
use tracing::debug;

/// Verdicts the heuristics are allowed to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
	Premium,
	SemiPremium,
	NonPremium,
}

impl From<ServerType> for AuthMode {
	fn from(value: ServerType) -> Self {
		match value {
			ServerType::Premium => AuthMode::Premium,
			ServerType::SemiPremium => AuthMode::SemiPremium,
			ServerType::NonPremium => AuthMode::NonPremium,
		}
	}
}

/// Text the heuristics look at. Stored lowercased so rules can use plain substring checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMetadata {
	hostname: String,
	motd: String,
	players_online: i64,
}

impl ServerMetadata {
	pub fn new(hostname: &str, motd: &str, players_online: i64) -> Self {
		Self {
			hostname: hostname.to_lowercase(),
			motd: motd.to_lowercase(),
			players_online,
		}
	}

	pub fn hostname(&self) -> &str {
		&self.hostname
	}

	pub fn motd(&self) -> &str {
		&self.motd
	}

	pub fn players_online(&self) -> i64 {
		self.players_online
	}
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
	needles.iter().any(|needle| haystack.contains(needle.as_str()))
}

#[derive(Debug, Clone)]
pub enum ClassifierRule {
	/// Hostname or MOTD names a network known to run hybrid auth
	KnownNetwork(Vec<String>),
	/// MOTD advertises a plugin implementing optional premium login
	AuthPluginSignature(Vec<String>),
	/// Cracked keyword next to an auth plugin still means hybrid
	CrackedWithAuthPlugin { cracked: Vec<String>, signatures: Vec<String> },
	CrackedKeyword(Vec<String>),
}

impl ClassifierRule {
	pub fn name(&self) -> &'static str {
		match self {
			ClassifierRule::KnownNetwork(_) => "known_network",
			ClassifierRule::AuthPluginSignature(_) => "auth_plugin_signature",
			ClassifierRule::CrackedWithAuthPlugin { .. } => "cracked_with_auth_plugin",
			ClassifierRule::CrackedKeyword(_) => "cracked_keyword",
		}
	}

	pub fn classify(&self, metadata: &ServerMetadata) -> Option<ServerType> {
		let matched = match self {
			ClassifierRule::KnownNetwork(networks) => {
				contains_any(&metadata.hostname, networks) || contains_any(&metadata.motd, networks)
			}
			ClassifierRule::AuthPluginSignature(signatures) => {
				contains_any(&metadata.motd, signatures)
			}
			ClassifierRule::CrackedWithAuthPlugin { cracked, signatures } => {
				contains_any(&metadata.motd, cracked) && contains_any(&metadata.motd, signatures)
			}
			ClassifierRule::CrackedKeyword(cracked) => contains_any(&metadata.motd, cracked),
		};

		if !matched {
			return None;
		}

		Some(match self {
			ClassifierRule::CrackedKeyword(_) => ServerType::NonPremium,
			_ => ServerType::SemiPremium,
		})
	}
}

/// Ordered rule list, first match wins
#[derive(Debug, Clone)]
pub struct HeuristicClassifier {
	rules: Vec<ClassifierRule>,
}

impl HeuristicClassifier {
	pub fn new(rules: Vec<ClassifierRule>) -> Self {
		Self { rules }
	}

	pub fn from_config(config: &config::Classifier) -> Self {
		Self::new(vec![
			ClassifierRule::KnownNetwork(config.known_networks.clone()),
			ClassifierRule::AuthPluginSignature(config.auth_plugin_signatures.clone()),
			ClassifierRule::CrackedWithAuthPlugin {
				cracked: config.cracked_keywords.clone(),
				signatures: config.auth_plugin_signatures.clone(),
			},
			ClassifierRule::CrackedKeyword(config.cracked_keywords.clone()),
		])
	}

	pub fn rules(&self) -> &[ClassifierRule] {
		&self.rules
	}

	/// `None` means no rule fired and the login probe has to decide
	pub fn classify(&self, metadata: &ServerMetadata) -> Option<ServerType> {
		self.rules.iter().find_map(|rule| {
			let verdict = rule.classify(metadata)?;
			debug!("[{}] Rule {} matched: {verdict:?}", metadata.hostname, rule.name());
			Some(verdict)
		})
	}
}

/// Post-probe adjustment of a verdict the login exchange produced
pub trait UpgradePolicy: Send + Sync {
	fn upgrade(&self, metadata: &ServerMetadata, verdict: AuthMode) -> AuthMode;
}

pub struct NeverUpgrade;

impl UpgradePolicy for NeverUpgrade {
	fn upgrade(&self, _metadata: &ServerMetadata, verdict: AuthMode) -> AuthMode {
		verdict
	}
}

/// Busy NON_PREMIUM servers whose MOTD keeps talking about premium logins
/// often do the auth in a plugin after login, which the raw probe never sees.
#[derive(Debug, Clone)]
pub struct PopularHybridPolicy {
	pub min_players: i64,
	pub min_keyword_hits: usize,
	pub keywords: Vec<String>,
}

impl PopularHybridPolicy {
	pub fn from_config(config: &config::HybridUpgrade) -> Self {
		Self {
			min_players: config.min_players,
			min_keyword_hits: config.min_keyword_hits,
			keywords: config.keywords.clone(),
		}
	}

	fn keyword_hits(&self, motd: &str) -> usize {
		self.keywords.iter().filter(|keyword| motd.contains(keyword.as_str())).count()
	}
}

impl UpgradePolicy for PopularHybridPolicy {
	fn upgrade(&self, metadata: &ServerMetadata, verdict: AuthMode) -> AuthMode {
		if verdict != AuthMode::NonPremium || metadata.players_online <= self.min_players {
			return verdict;
		}

		if self.keyword_hits(&metadata.motd) >= self.min_keyword_hits {
			debug!("[{}] Upgrading NON_PREMIUM to SEMI_PREMIUM", metadata.hostname);
			AuthMode::SemiPremium
		} else {
			verdict
		}
	}
}

/// Heuristics in front of the login probe, upgrade policy behind it
#[derive(Clone)]
pub struct AuthClassifier {
	heuristics: HeuristicClassifier,
	upgrade: Arc<dyn UpgradePolicy>,
}

impl AuthClassifier {
	pub fn new(heuristics: HeuristicClassifier, upgrade: Arc<dyn UpgradePolicy>) -> Self {
		Self { heuristics, upgrade }
	}

	pub fn from_config(config: &config::Classifier) -> Self {
		let upgrade: Arc<dyn UpgradePolicy> = if config.hybrid_upgrade.enabled {
			Arc::new(PopularHybridPolicy::from_config(&config.hybrid_upgrade))
		} else {
			Arc::new(NeverUpgrade)
		};

		Self::new(HeuristicClassifier::from_config(config), upgrade)
	}

	pub fn heuristic(&self, metadata: &ServerMetadata) -> Option<AuthMode> {
		self.heuristics.classify(metadata).map(AuthMode::from)
	}

	pub fn after_probe(&self, metadata: &ServerMetadata, probed: AuthMode) -> AuthMode {
		self.upgrade.upgrade(metadata, probed)
	}
}
