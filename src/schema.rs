//! Postgres tables and the raw rows read back from them.

use crate::address::ServerAddress;
use crate::database::StoreError;
use crate::models::{AliasEdge, AuthMode, DetectionMethod, ServerRecord, Snapshot};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::net::Ipv4Addr;

/// Applied on every connect, every statement is idempotent
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS servers (
	address TEXT PRIMARY KEY,
	country TEXT,
	isp TEXT,
	favicon_hash TEXT,
	favicon_raw TEXT,
	resolved_ip TEXT,
	last_dns_check TIMESTAMPTZ,
	is_canonical BOOLEAN NOT NULL DEFAULT TRUE,
	canonical_of TEXT REFERENCES servers (address),
	first_seen TIMESTAMPTZ NOT NULL,
	last_seen TIMESTAMPTZ NOT NULL,
	CONSTRAINT servers_not_self_alias CHECK (canonical_of IS NULL OR canonical_of <> address),
	CONSTRAINT servers_alias_has_canonical CHECK (is_canonical = (canonical_of IS NULL))
);

CREATE INDEX IF NOT EXISTS servers_resolved_ip_idx ON servers (resolved_ip);
CREATE INDEX IF NOT EXISTS servers_favicon_hash_idx ON servers (favicon_hash);
CREATE INDEX IF NOT EXISTS servers_canonical_of_idx ON servers (canonical_of);

CREATE TABLE IF NOT EXISTS scans (
	id BIGSERIAL PRIMARY KEY,
	started_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS server_snapshots (
	id BIGSERIAL PRIMARY KEY,
	scan_id BIGINT NOT NULL REFERENCES scans (id),
	address TEXT NOT NULL REFERENCES servers (address) ON DELETE CASCADE,
	version TEXT NOT NULL,
	online BIGINT NOT NULL,
	max_players BIGINT NOT NULL,
	auth_mode TEXT NOT NULL,
	sample_size BIGINT NOT NULL,
	timestamp TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS server_snapshots_address_idx ON server_snapshots (address, id DESC);

CREATE TABLE IF NOT EXISTS server_aliases (
	alias_address TEXT PRIMARY KEY REFERENCES servers (address) ON DELETE CASCADE,
	canonical_address TEXT NOT NULL REFERENCES servers (address) ON DELETE CASCADE,
	detection_method TEXT NOT NULL,
	confidence DOUBLE PRECISION NOT NULL CHECK (confidence >= 0 AND confidence <= 1),
	created_at TIMESTAMPTZ NOT NULL,
	CONSTRAINT server_aliases_not_self CHECK (alias_address <> canonical_address)
);

CREATE INDEX IF NOT EXISTS server_aliases_canonical_idx ON server_aliases (canonical_address);
"#;

/// Rows that break the one-hop rule: aliases of non-canonicals, and edges that
/// disagree with their alias record
pub const INVARIANT_VIOLATIONS: &str = r#"
SELECT
	(SELECT count(*) FROM servers a JOIN servers c ON a.canonical_of = c.address WHERE NOT c.is_canonical)
	+ (SELECT count(*) FROM server_aliases e JOIN servers s ON s.address = e.alias_address
		WHERE s.canonical_of IS DISTINCT FROM e.canonical_address)
"#;

fn stored_address(raw: &str) -> Result<ServerAddress, StoreError> {
	ServerAddress::parse_with(raw, false).map_err(|e| StoreError::Corrupt {
		address: raw.to_string(),
		reason: e.to_string(),
	})
}

fn corrupt(address: &str, reason: impl ToString) -> StoreError {
	StoreError::Corrupt {
		address: address.to_string(),
		reason: reason.to_string(),
	}
}

#[derive(Debug, FromRow)]
pub struct ServerRow {
	pub address: String,
	pub country: Option<String>,
	pub isp: Option<String>,
	pub favicon_hash: Option<String>,
	pub favicon_raw: Option<String>,
	pub resolved_ip: Option<String>,
	pub last_dns_check: Option<DateTime<Utc>>,
	pub is_canonical: bool,
	pub canonical_of: Option<String>,
	pub first_seen: DateTime<Utc>,
	pub last_seen: DateTime<Utc>,
}

pub fn parse_ip(address: &str, raw: Option<String>) -> Result<Option<Ipv4Addr>, StoreError> {
	raw.map(|ip| ip.parse::<Ipv4Addr>().map_err(|e| corrupt(address, e)))
		.transpose()
}

impl TryFrom<ServerRow> for ServerRecord {
	type Error = StoreError;

	fn try_from(row: ServerRow) -> Result<Self, Self::Error> {
		Ok(ServerRecord {
			resolved_ip: parse_ip(&row.address, row.resolved_ip)?,
			canonical_of: row.canonical_of.as_deref().map(stored_address).transpose()?,
			address: stored_address(&row.address)?,
			country: row.country,
			isp: row.isp,
			favicon_hash: row.favicon_hash,
			favicon_raw: row.favicon_raw,
			last_dns_check: row.last_dns_check,
			is_canonical: row.is_canonical,
			first_seen: row.first_seen,
			last_seen: row.last_seen,
		})
	}
}

#[derive(Debug, FromRow)]
pub struct SnapshotRow {
	pub scan_id: i64,
	pub address: String,
	pub version: String,
	pub online: i64,
	pub max_players: i64,
	pub auth_mode: String,
	pub sample_size: i64,
	pub timestamp: DateTime<Utc>,
}

impl TryFrom<SnapshotRow> for Snapshot {
	type Error = StoreError;

	fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
		Ok(Snapshot {
			auth_mode: row.auth_mode.parse::<AuthMode>().map_err(|e| corrupt(&row.address, e))?,
			address: stored_address(&row.address)?,
			scan_id: row.scan_id,
			version: row.version,
			online: row.online,
			max_players: row.max_players,
			sample_size: row.sample_size,
			timestamp: row.timestamp,
		})
	}
}

#[derive(Debug, FromRow)]
pub struct AliasRow {
	pub alias_address: String,
	pub canonical_address: String,
	pub detection_method: String,
	pub confidence: f64,
	pub created_at: DateTime<Utc>,
}

impl TryFrom<AliasRow> for AliasEdge {
	type Error = StoreError;

	fn try_from(row: AliasRow) -> Result<Self, Self::Error> {
		Ok(AliasEdge {
			detection_method: row
				.detection_method
				.parse::<DetectionMethod>()
				.map_err(|e| corrupt(&row.alias_address, e))?,
			alias_address: stored_address(&row.alias_address)?,
			canonical_address: stored_address(&row.canonical_address)?,
			confidence: row.confidence,
			created_at: row.created_at,
		})
	}
}

#[derive(Debug, FromRow)]
pub struct FingerprintSqlRow {
	pub address: String,
	pub favicon_hash: Option<String>,
	pub resolved_ip: Option<String>,
	pub players_online: Option<i64>,
	pub first_seen: DateTime<Utc>,
	pub snapshot_count: i64,
}
