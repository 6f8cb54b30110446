use crate::address::ServerAddress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthMode {
	Premium,
	NonPremium,
	SemiPremium,
	Unknown,
	Offline,
}

impl AuthMode {
	pub fn as_str(&self) -> &'static str {
		match self {
			AuthMode::Premium => "PREMIUM",
			AuthMode::NonPremium => "NON_PREMIUM",
			AuthMode::SemiPremium => "SEMI_PREMIUM",
			AuthMode::Unknown => "UNKNOWN",
			AuthMode::Offline => "OFFLINE",
		}
	}
}

impl fmt::Display for AuthMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for AuthMode {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"PREMIUM" => Ok(AuthMode::Premium),
			"NON_PREMIUM" => Ok(AuthMode::NonPremium),
			"SEMI_PREMIUM" => Ok(AuthMode::SemiPremium),
			"UNKNOWN" => Ok(AuthMode::Unknown),
			"OFFLINE" => Ok(AuthMode::Offline),
			other => Err(format!("unknown auth mode {other}")),
		}
	}
}

/// Which strategy produced a duplicate match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
	DnsResolution,
	FaviconAndPlayers,
	StringNormalization,
}

impl DetectionMethod {
	pub fn as_str(&self) -> &'static str {
		match self {
			DetectionMethod::DnsResolution => "dns_resolution",
			DetectionMethod::FaviconAndPlayers => "favicon_and_players",
			DetectionMethod::StringNormalization => "string_normalization",
		}
	}

	pub fn confidence(&self) -> f64 {
		match self {
			DetectionMethod::DnsResolution => 1.0,
			DetectionMethod::FaviconAndPlayers => 0.85,
			DetectionMethod::StringNormalization => 0.70,
		}
	}
}

impl fmt::Display for DetectionMethod {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for DetectionMethod {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"dns_resolution" => Ok(DetectionMethod::DnsResolution),
			"favicon_and_players" => Ok(DetectionMethod::FaviconAndPlayers),
			"string_normalization" => Ok(DetectionMethod::StringNormalization),
			other => Err(format!("unknown detection method {other}")),
		}
	}
}

/// One row per normalized address ever observed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
	pub address: ServerAddress,
	pub country: Option<String>,
	pub isp: Option<String>,
	pub favicon_hash: Option<String>,
	/// Only kept on canonical records
	pub favicon_raw: Option<String>,
	pub resolved_ip: Option<Ipv4Addr>,
	pub last_dns_check: Option<DateTime<Utc>>,
	pub is_canonical: bool,
	pub canonical_of: Option<ServerAddress>,
	pub first_seen: DateTime<Utc>,
	pub last_seen: DateTime<Utc>,
}

impl ServerRecord {
	pub fn status(&self) -> CanonicalStatus {
		CanonicalStatus::from_flags(self.is_canonical, self.canonical_of.clone())
	}
}

/// Where a record sits in the canonical/alias state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalStatus {
	Unknown,
	Canonical,
	Alias(ServerAddress),
}

impl CanonicalStatus {
	pub fn from_flags(is_canonical: bool, canonical_of: Option<ServerAddress>) -> Self {
		match (is_canonical, canonical_of) {
			(_, Some(canonical)) => CanonicalStatus::Alias(canonical),
			(true, None) => CanonicalStatus::Canonical,
			(false, None) => CanonicalStatus::Unknown,
		}
	}
}

/// Point-in-time probe result, append-only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
	pub scan_id: i64,
	pub address: ServerAddress,
	pub version: String,
	pub online: i64,
	pub max_players: i64,
	pub auth_mode: AuthMode,
	pub sample_size: i64,
	pub timestamp: DateTime<Utc>,
}

/// Audit trail for why two identities were merged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasEdge {
	pub alias_address: ServerAddress,
	pub canonical_address: ServerAddress,
	pub detection_method: DetectionMethod,
	pub confidence: f64,
	pub created_at: DateTime<Utc>,
}

/// Cached DNS answer for an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsEntry {
	pub resolved_ip: Option<Ipv4Addr>,
	pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GeoInfo {
	pub country: Option<String>,
	pub isp: Option<String>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn auth_mode_round_trips_through_text() {
		for mode in [
			AuthMode::Premium,
			AuthMode::NonPremium,
			AuthMode::SemiPremium,
			AuthMode::Unknown,
			AuthMode::Offline,
		] {
			assert_eq!(mode.as_str().parse::<AuthMode>().unwrap(), mode);
			assert_eq!(serde_json::to_string(&mode).unwrap(), format!("\"{mode}\""));
		}
	}

	#[test]
	fn detection_methods_carry_fixed_confidence() {
		assert_eq!(DetectionMethod::DnsResolution.confidence(), 1.0);
		assert_eq!(DetectionMethod::FaviconAndPlayers.confidence(), 0.85);
		assert_eq!(DetectionMethod::StringNormalization.confidence(), 0.70);
		assert_eq!(
			"favicon_and_players".parse::<DetectionMethod>().unwrap(),
			DetectionMethod::FaviconAndPlayers
		);
	}

	#[test]
	fn canonical_status_from_flags() {
		let target = ServerAddress::parse("example.com").unwrap();
		assert_eq!(CanonicalStatus::from_flags(true, None), CanonicalStatus::Canonical);
		assert_eq!(CanonicalStatus::from_flags(false, None), CanonicalStatus::Unknown);
		assert_eq!(
			CanonicalStatus::from_flags(false, Some(target.clone())),
			CanonicalStatus::Alias(target)
		);
	}
}
