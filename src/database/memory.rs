use super::{sort_aliases, FingerprintRow, Observation, RegistryStore, StoreError};
use crate::address::ServerAddress;
use crate::dedup::merge::{IdentityState, MergeStep, RegistryWrite, StepOutcome};
use crate::models::{AliasEdge, DnsEntry, ServerRecord, Snapshot};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

#[derive(Debug, Default, Clone)]
struct Tables {
	next_scan_id: i64,
	servers: BTreeMap<ServerAddress, ServerRecord>,
	snapshots: Vec<Snapshot>,
	aliases: BTreeMap<ServerAddress, AliasEdge>,
}

impl Tables {
	fn identity_state(&self) -> IdentityState {
		let mut state = IdentityState::new();
		for record in self.servers.values() {
			state.insert_record(record.address.clone(), record.status());
		}
		for edge in self.aliases.values() {
			state.insert_edge(edge.clone());
		}
		state
	}

	fn apply(&mut self, write: &RegistryWrite) -> Result<(), String> {
		match write {
			RegistryWrite::MarkCanonical { address } => {
				let record = self
					.servers
					.get_mut(address)
					.ok_or_else(|| format!("{address} is not in the registry"))?;
				record.is_canonical = true;
				record.canonical_of = None;
				self.aliases.remove(address);
			}
			RegistryWrite::MarkAlias { address, canonical } => {
				if !self.servers.contains_key(canonical) {
					return Err(format!("{canonical} is not in the registry"));
				}
				let record = self
					.servers
					.get_mut(address)
					.ok_or_else(|| format!("{address} is not in the registry"))?;
				record.is_canonical = false;
				record.canonical_of = Some(canonical.clone());
				record.favicon_raw = None;
			}
			RegistryWrite::UpsertEdge(edge) => {
				let replace = match self.aliases.get(&edge.alias_address) {
					Some(existing) => {
						existing.canonical_address != edge.canonical_address
							|| edge.confidence > existing.confidence
					}
					None => true,
				};
				if replace {
					self.aliases.insert(edge.alias_address.clone(), edge.clone());
				}
			}
		}

		Ok(())
	}
}

/// In-process registry with the same semantics as the Postgres one
#[derive(Debug, Default)]
pub struct MemoryRegistry {
	tables: Mutex<Tables>,
}

impl MemoryRegistry {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl RegistryStore for MemoryRegistry {
	async fn create_scan(&self) -> Result<i64, StoreError> {
		let mut tables = self.tables.lock().await;
		tables.next_scan_id += 1;
		Ok(tables.next_scan_id)
	}

	async fn get_server(
		&self,
		address: &ServerAddress,
	) -> Result<Option<ServerRecord>, StoreError> {
		Ok(self.tables.lock().await.servers.get(address).cloned())
	}

	async fn upsert_server(&self, observation: &Observation) -> Result<ServerRecord, StoreError> {
		let mut tables = self.tables.lock().await;

		let record = tables
			.servers
			.entry(observation.address.clone())
			.or_insert_with(|| ServerRecord {
				address: observation.address.clone(),
				country: None,
				isp: None,
				favicon_hash: None,
				favicon_raw: None,
				resolved_ip: None,
				last_dns_check: None,
				is_canonical: true,
				canonical_of: None,
				first_seen: observation.seen_at,
				last_seen: observation.seen_at,
			});

		record.last_seen = observation.seen_at;
		record.favicon_hash = observation.favicon_hash.clone();
		record.favicon_raw = if record.is_canonical {
			observation.favicon_raw.clone()
		} else {
			None
		};
		if observation.last_dns_check.is_some() {
			record.resolved_ip = observation.resolved_ip;
			record.last_dns_check = observation.last_dns_check;
		}
		if observation.geo.country.is_some() {
			record.country = observation.geo.country.clone();
		}
		if observation.geo.isp.is_some() {
			record.isp = observation.geo.isp.clone();
		}

		Ok(record.clone())
	}

	async fn append_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
		let mut tables = self.tables.lock().await;
		if !tables.servers.contains_key(&snapshot.address) {
			return Err(StoreError::NotFound(snapshot.address.clone()));
		}
		tables.snapshots.push(snapshot.clone());
		Ok(())
	}

	async fn snapshots_of(&self, address: &ServerAddress) -> Result<Vec<Snapshot>, StoreError> {
		let tables = self.tables.lock().await;
		Ok(tables
			.snapshots
			.iter()
			.filter(|snapshot| &snapshot.address == address)
			.cloned()
			.collect())
	}

	async fn purge_server(&self, address: &ServerAddress) -> Result<bool, StoreError> {
		let mut tables = self.tables.lock().await;

		if tables.servers.remove(address).is_none() {
			return Ok(false);
		}

		tables.snapshots.retain(|snapshot| &snapshot.address != address);
		tables.aliases.remove(address);
		tables.aliases.retain(|_, edge| &edge.canonical_address != address);

		for record in tables.servers.values_mut() {
			if record.canonical_of.as_ref() == Some(address) {
				record.canonical_of = None;
				record.is_canonical = true;
			}
		}

		Ok(true)
	}

	async fn cached_dns(&self, address: &ServerAddress) -> Result<Option<DnsEntry>, StoreError> {
		let tables = self.tables.lock().await;
		Ok(tables.servers.get(address).and_then(|record| {
			record.last_dns_check.map(|checked_at| DnsEntry {
				resolved_ip: record.resolved_ip,
				checked_at,
			})
		}))
	}

	async fn store_dns(&self, address: &ServerAddress, entry: DnsEntry) -> Result<(), StoreError> {
		let mut tables = self.tables.lock().await;
		if let Some(record) = tables.servers.get_mut(address) {
			record.resolved_ip = entry.resolved_ip;
			record.last_dns_check = Some(entry.checked_at);
		}
		Ok(())
	}

	async fn fingerprint_rows(&self) -> Result<Vec<FingerprintRow>, StoreError> {
		let tables = self.tables.lock().await;

		Ok(tables
			.servers
			.values()
			.map(|record| {
				let history: Vec<&Snapshot> = tables
					.snapshots
					.iter()
					.filter(|snapshot| snapshot.address == record.address)
					.collect();

				FingerprintRow {
					address: record.address.clone(),
					favicon_hash: record.favicon_hash.clone(),
					resolved_ip: record.resolved_ip,
					// Snapshots are appended in order, the last one is the latest
					players_online: history.last().map(|snapshot| snapshot.online),
					first_seen: record.first_seen,
					snapshot_count: history.len() as i64,
				}
			})
			.collect())
	}

	async fn load_identity_state(&self) -> Result<IdentityState, StoreError> {
		Ok(self.tables.lock().await.identity_state())
	}

	async fn apply_merge(&self, steps: &[MergeStep]) -> Result<Vec<StepOutcome>, StoreError> {
		let mut tables = self.tables.lock().await;
		let mut outcomes = Vec::with_capacity(steps.len());

		for step in steps {
			let mut candidate = tables.clone();

			let applied = step.writes.iter().try_for_each(|write| candidate.apply(write));
			let result = applied.and_then(|_| candidate.identity_state().validate());

			match result {
				Ok(()) => {
					*tables = candidate;
					outcomes.push(StepOutcome::Applied);
				}
				Err(reason) => outcomes.push(StepOutcome::Rejected(reason)),
			}
		}

		Ok(outcomes)
	}

	async fn resolve_canonical(
		&self,
		address: &ServerAddress,
	) -> Result<Option<ServerAddress>, StoreError> {
		let tables = self.tables.lock().await;
		Ok(tables.servers.get(address).map(|record| {
			record.canonical_of.clone().unwrap_or_else(|| record.address.clone())
		}))
	}

	async fn aliases_of(&self, canonical: &ServerAddress) -> Result<Vec<AliasEdge>, StoreError> {
		let tables = self.tables.lock().await;
		let mut edges: Vec<AliasEdge> = tables
			.aliases
			.values()
			.filter(|edge| &edge.canonical_address == canonical)
			.cloned()
			.collect();
		sort_aliases(&mut edges);
		Ok(edges)
	}
}
