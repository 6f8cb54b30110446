mod memory;
mod postgres;

pub use memory::MemoryRegistry;
pub use postgres::PgRegistry;

use crate::address::ServerAddress;
use crate::dedup::merge::{IdentityState, MergeStep, StepOutcome};
use crate::models::{AliasEdge, DnsEntry, GeoInfo, ServerRecord, Snapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("database error")]
	Database(#[from] sqlx::Error),
	#[error("corrupt row for {address}: {reason}")]
	Corrupt { address: String, reason: String },
	#[error("{0} is not in the registry")]
	NotFound(ServerAddress),
}

/// Everything a successful probe learned about one address
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
	pub address: ServerAddress,
	pub favicon_hash: Option<String>,
	pub favicon_raw: Option<String>,
	pub resolved_ip: Option<Ipv4Addr>,
	pub last_dns_check: Option<DateTime<Utc>>,
	pub geo: GeoInfo,
	pub seen_at: DateTime<Utc>,
}

/// Per-address input to duplicate analysis
#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintRow {
	pub address: ServerAddress,
	pub favicon_hash: Option<String>,
	pub resolved_ip: Option<Ipv4Addr>,
	/// From the latest snapshot
	pub players_online: Option<i64>,
	pub first_seen: DateTime<Utc>,
	pub snapshot_count: i64,
}

#[async_trait]
pub trait RegistryStore: Send + Sync {
	async fn create_scan(&self) -> Result<i64, StoreError>;

	async fn get_server(&self, address: &ServerAddress) -> Result<Option<ServerRecord>, StoreError>;

	/// Inserts on first sight (as canonical) and refreshes fields afterwards.
	/// `first_seen` is never moved and only canonical records keep the raw favicon.
	async fn upsert_server(&self, observation: &Observation) -> Result<ServerRecord, StoreError>;

	async fn append_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

	async fn snapshots_of(&self, address: &ServerAddress) -> Result<Vec<Snapshot>, StoreError>;

	/// Removes the record with its snapshots and alias edges. Aliases of a purged
	/// canonical become canonical themselves. Returns false if nothing was there.
	async fn purge_server(&self, address: &ServerAddress) -> Result<bool, StoreError>;

	async fn cached_dns(&self, address: &ServerAddress) -> Result<Option<DnsEntry>, StoreError>;

	/// No-op for addresses that have no record yet
	async fn store_dns(&self, address: &ServerAddress, entry: DnsEntry) -> Result<(), StoreError>;

	async fn fingerprint_rows(&self) -> Result<Vec<FingerprintRow>, StoreError>;

	async fn load_identity_state(&self) -> Result<IdentityState, StoreError>;

	/// Applies every step atomically and on its own. A rejected step leaves no
	/// trace and the rest still run. An `Err` means nothing was committed.
	async fn apply_merge(&self, steps: &[MergeStep]) -> Result<Vec<StepOutcome>, StoreError>;

	async fn resolve_canonical(
		&self,
		address: &ServerAddress,
	) -> Result<Option<ServerAddress>, StoreError>;

	/// Highest confidence first, newest first among equals
	async fn aliases_of(&self, canonical: &ServerAddress) -> Result<Vec<AliasEdge>, StoreError>;
}

pub(crate) fn sort_aliases(edges: &mut [AliasEdge]) {
	edges.sort_by(|a, b| {
		b.confidence
			.total_cmp(&a.confidence)
			.then_with(|| b.created_at.cmp(&a.created_at))
			.then_with(|| a.alias_address.cmp(&b.alias_address))
	});
}
