//! Turns duplicate matches into registry writes without touching the store.
//!
//! [`plan_merge`] walks the matches against a working copy of the identity
//! state, so every planned step sees the effect of the ones before it. The
//! store applies each step atomically and may still reject one, which only
//! skips that step.

use crate::address::ServerAddress;
use crate::dedup::{dedupe_matches, DuplicateMatch};
use crate::models::{AliasEdge, CanonicalStatus};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryWrite {
	/// `is_canonical = true`, `canonical_of = null`, drops the record's own alias edge
	MarkCanonical { address: ServerAddress },
	/// `is_canonical = false`, `canonical_of = canonical`
	MarkAlias { address: ServerAddress, canonical: ServerAddress },
	/// Insert, or replace when the canonical moved or the confidence is higher
	UpsertEdge(AliasEdge),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeStep {
	pub matched: DuplicateMatch,
	pub writes: Vec<RegistryWrite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
	SelfReference,
	UnknownAddress(ServerAddress),
	/// The alias already belongs to a different canonical that stays canonical
	AliasClaimed { current: ServerAddress },
	/// The proposed canonical is itself an alias and nothing in the batch demotes its owner
	CanonicalIsAlias { canonical_of: ServerAddress },
	/// The store refused the step
	Rejected(String),
}

impl fmt::Display for SkipReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SkipReason::SelfReference => write!(f, "alias and canonical are the same address"),
			SkipReason::UnknownAddress(address) => write!(f, "{address} is not in the registry"),
			SkipReason::AliasClaimed { current } => write!(f, "already an alias of {current}"),
			SkipReason::CanonicalIsAlias { canonical_of } => {
				write!(f, "canonical is an alias of {canonical_of}")
			}
			SkipReason::Rejected(reason) => write!(f, "rejected by store: {reason}"),
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedMatch {
	pub matched: DuplicateMatch,
	pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
	pub steps: Vec<MergeStep>,
	/// Already reflected in the registry
	pub unchanged: Vec<DuplicateMatch>,
	pub skipped: Vec<SkippedMatch>,
}

/// Per-step result reported back by a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
	Applied,
	Rejected(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
	pub dry_run: bool,
	/// Planned steps on a dry run, committed steps otherwise
	pub applied: Vec<MergeStep>,
	pub unchanged: Vec<DuplicateMatch>,
	pub skipped: Vec<SkippedMatch>,
}

impl MergeReport {
	pub fn from_plan(plan: MergePlan, dry_run: bool) -> Self {
		Self {
			dry_run,
			applied: plan.steps,
			unchanged: plan.unchanged,
			skipped: plan.skipped,
		}
	}
}

/// Canonical status of every record plus the alias edges. Enough to plan and
/// check merges without a database.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityState {
	records: BTreeMap<ServerAddress, CanonicalStatus>,
	edges: BTreeMap<ServerAddress, AliasEdge>,
}

impl IdentityState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert_record(&mut self, address: ServerAddress, status: CanonicalStatus) {
		self.records.insert(address, status);
	}

	pub fn insert_edge(&mut self, edge: AliasEdge) {
		self.edges.insert(edge.alias_address.clone(), edge);
	}

	pub fn status(&self, address: &ServerAddress) -> Option<&CanonicalStatus> {
		self.records.get(address)
	}

	pub fn edge(&self, alias: &ServerAddress) -> Option<&AliasEdge> {
		self.edges.get(alias)
	}

	pub fn records(&self) -> impl Iterator<Item = (&ServerAddress, &CanonicalStatus)> {
		self.records.iter()
	}

	pub fn edges(&self) -> impl Iterator<Item = &AliasEdge> {
		self.edges.values()
	}

	pub fn followers_of(&self, canonical: &ServerAddress) -> Vec<ServerAddress> {
		self.records
			.iter()
			.filter(|(_, status)| {
				matches!(status, CanonicalStatus::Alias(owner) if owner == canonical)
			})
			.map(|(address, _)| address.clone())
			.collect()
	}

	/// Terminal canonical for an address, at most one hop away
	pub fn resolve(&self, address: &ServerAddress) -> Option<ServerAddress> {
		match self.records.get(address)? {
			CanonicalStatus::Alias(owner) => Some(owner.clone()),
			_ => Some(address.clone()),
		}
	}

	pub fn apply(&mut self, write: &RegistryWrite) -> Result<(), String> {
		match write {
			RegistryWrite::MarkCanonical { address } => {
				let status = self
					.records
					.get_mut(address)
					.ok_or_else(|| format!("{address} is not in the registry"))?;
				*status = CanonicalStatus::Canonical;
				self.edges.remove(address);
			}
			RegistryWrite::MarkAlias { address, canonical } => {
				if !self.records.contains_key(canonical) {
					return Err(format!("{canonical} is not in the registry"));
				}
				let status = self
					.records
					.get_mut(address)
					.ok_or_else(|| format!("{address} is not in the registry"))?;
				*status = CanonicalStatus::Alias(canonical.clone());
			}
			RegistryWrite::UpsertEdge(edge) => {
				if edge.alias_address == edge.canonical_address {
					return Err(format!("{} cannot alias itself", edge.alias_address));
				}
				let replace = match self.edges.get(&edge.alias_address) {
					Some(existing) => {
						existing.canonical_address != edge.canonical_address
							|| edge.confidence > existing.confidence
					}
					None => true,
				};
				if replace {
					self.edges.insert(edge.alias_address.clone(), edge.clone());
				}
			}
		}

		Ok(())
	}

	/// Every alias points one hop at a canonical record, and every edge agrees
	/// with its alias record.
	pub fn validate(&self) -> Result<(), String> {
		for (address, status) in &self.records {
			if let CanonicalStatus::Alias(owner) = status {
				if owner == address {
					return Err(format!("{address} points at itself"));
				}
				match self.records.get(owner) {
					Some(CanonicalStatus::Canonical) => {}
					Some(_) => return Err(format!("{address} points at non-canonical {owner}")),
					None => return Err(format!("{address} points at missing {owner}")),
				}
			}
		}

		for edge in self.edges.values() {
			match self.records.get(&edge.alias_address) {
				Some(CanonicalStatus::Alias(owner)) if *owner == edge.canonical_address => {}
				_ => {
					return Err(format!(
						"edge {} -> {} disagrees with the alias record",
						edge.alias_address, edge.canonical_address
					))
				}
			}
		}

		Ok(())
	}
}

/// Plans one step per match. Matches are deduplicated first, so the same
/// input always yields the same plan.
pub fn plan_merge(
	state: &IdentityState,
	matches: &[DuplicateMatch],
	now: DateTime<Utc>,
) -> MergePlan {
	let matches = dedupe_matches(matches.to_vec());
	let pairs: BTreeSet<(ServerAddress, ServerAddress)> = matches
		.iter()
		.map(|m| (m.alias.clone(), m.canonical.clone()))
		.collect();

	let mut working = state.clone();
	let mut plan = MergePlan::default();

	for matched in matches {
		match plan_step(&working, &matched, &pairs, now) {
			Ok(writes) if writes.is_empty() => plan.unchanged.push(matched),
			Ok(writes) => {
				let mut applied = true;
				for write in &writes {
					if let Err(reason) = working.apply(write) {
						plan.skipped.push(SkippedMatch {
							matched: matched.clone(),
							reason: SkipReason::Rejected(reason),
						});
						applied = false;
						break;
					}
				}
				if applied {
					plan.steps.push(MergeStep { matched, writes });
				}
			}
			Err(reason) => plan.skipped.push(SkippedMatch { matched, reason }),
		}
	}

	plan
}

fn plan_step(
	state: &IdentityState,
	matched: &DuplicateMatch,
	pairs: &BTreeSet<(ServerAddress, ServerAddress)>,
	now: DateTime<Utc>,
) -> Result<Vec<RegistryWrite>, SkipReason> {
	let (alias, canonical) = (&matched.alias, &matched.canonical);

	if alias == canonical {
		return Err(SkipReason::SelfReference);
	}

	let alias_status = state
		.status(alias)
		.ok_or_else(|| SkipReason::UnknownAddress(alias.clone()))?;
	let canonical_status = state
		.status(canonical)
		.ok_or_else(|| SkipReason::UnknownAddress(canonical.clone()))?;

	// The owner of a demoted canonical must itself be joining the new canonical,
	// either through this very match or another one in the batch
	let joins_canonical = |owner: &ServerAddress| {
		owner == alias || pairs.contains(&(owner.clone(), canonical.clone()))
	};

	let promote = match canonical_status {
		CanonicalStatus::Canonical => false,
		CanonicalStatus::Unknown => true,
		CanonicalStatus::Alias(owner) if joins_canonical(owner) => true,
		CanonicalStatus::Alias(owner) => {
			return Err(SkipReason::CanonicalIsAlias {
				canonical_of: owner.clone(),
			})
		}
	};

	let edge = AliasEdge {
		alias_address: alias.clone(),
		canonical_address: canonical.clone(),
		detection_method: matched.method,
		confidence: matched.confidence,
		created_at: now,
	};

	match alias_status {
		CanonicalStatus::Alias(current) if current == canonical => {
			let stronger = state
				.edge(alias)
				.map_or(true, |existing| matched.confidence > existing.confidence);
			return Ok(if stronger {
				vec![RegistryWrite::UpsertEdge(edge)]
			} else {
				Vec::new()
			});
		}
		CanonicalStatus::Alias(current)
			if !pairs.contains(&(current.clone(), canonical.clone())) =>
		{
			return Err(SkipReason::AliasClaimed {
				current: current.clone(),
			});
		}
		_ => {}
	}

	let mut writes = Vec::new();

	if promote {
		writes.push(RegistryWrite::MarkCanonical {
			address: canonical.clone(),
		});
	}

	// Anything that pointed at the alias moves along with it
	for follower in state.followers_of(alias) {
		if &follower == canonical {
			continue;
		}
		writes.push(RegistryWrite::MarkAlias {
			address: follower.clone(),
			canonical: canonical.clone(),
		});
		if let Some(existing) = state.edge(&follower) {
			writes.push(RegistryWrite::UpsertEdge(AliasEdge {
				canonical_address: canonical.clone(),
				created_at: now,
				..existing.clone()
			}));
		}
	}

	writes.push(RegistryWrite::MarkAlias {
		address: alias.clone(),
		canonical: canonical.clone(),
	});
	writes.push(RegistryWrite::UpsertEdge(edge));

	Ok(writes)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::models::DetectionMethod;

	fn addr(raw: &str) -> ServerAddress {
		ServerAddress::parse(raw).unwrap()
	}

	fn matched(alias: &str, canonical: &str, method: DetectionMethod) -> DuplicateMatch {
		DuplicateMatch {
			canonical: addr(canonical),
			alias: addr(alias),
			method,
			confidence: method.confidence(),
		}
	}

	fn state(records: &[(&str, CanonicalStatus)]) -> IdentityState {
		let mut state = IdentityState::new();
		for (address, status) in records {
			state.insert_record(addr(address), status.clone());
		}
		state
	}

	fn apply_plan(state: &IdentityState, plan: &MergePlan) -> IdentityState {
		let mut next = state.clone();
		for step in &plan.steps {
			for write in &step.writes {
				next.apply(write).unwrap();
			}
		}
		next.validate().unwrap();
		next
	}

	#[test]
	fn merges_fresh_cluster() {
		let initial = state(&[
			("example.com", CanonicalStatus::Canonical),
			("a.example.com", CanonicalStatus::Canonical),
			("b.example.com", CanonicalStatus::Unknown),
		]);
		let matches = [
			matched("a.example.com", "example.com", DetectionMethod::DnsResolution),
			matched("b.example.com", "example.com", DetectionMethod::DnsResolution),
		];

		let plan = plan_merge(&initial, &matches, Utc::now());
		assert_eq!(plan.steps.len(), 2);
		assert!(plan.skipped.is_empty());

		let merged = apply_plan(&initial, &plan);
		assert_eq!(
			merged.status(&addr("a.example.com")),
			Some(&CanonicalStatus::Alias(addr("example.com")))
		);
		assert_eq!(merged.edges().count(), 2);
	}

	#[test]
	fn second_run_changes_nothing() {
		let initial = state(&[
			("example.com", CanonicalStatus::Canonical),
			("a.example.com", CanonicalStatus::Canonical),
		]);
		let matches = [matched("a.example.com", "example.com", DetectionMethod::DnsResolution)];

		let once = apply_plan(&initial, &plan_merge(&initial, &matches, Utc::now()));
		let replan = plan_merge(&once, &matches, Utc::now());
		assert!(replan.steps.is_empty());
		assert_eq!(replan.unchanged.len(), 1);
		assert_eq!(apply_plan(&once, &replan), once);
	}

	#[test]
	fn weaker_evidence_keeps_existing_edge() {
		let initial = state(&[
			("example.com", CanonicalStatus::Canonical),
			("a.example.com", CanonicalStatus::Canonical),
		]);
		let strong = [matched("a.example.com", "example.com", DetectionMethod::DnsResolution)];
		let merged = apply_plan(&initial, &plan_merge(&initial, &strong, Utc::now()));

		let weak = [matched("a.example.com", "example.com", DetectionMethod::StringNormalization)];
		let replan = plan_merge(&merged, &weak, Utc::now());
		assert!(replan.steps.is_empty());
		let edge = merged.edge(&addr("a.example.com")).unwrap();
		assert_eq!(edge.detection_method, DetectionMethod::DnsResolution);
	}

	#[test]
	fn stronger_evidence_upgrades_edge() {
		let initial = state(&[
			("example.com", CanonicalStatus::Canonical),
			("a.example.com", CanonicalStatus::Canonical),
		]);
		let weak = [matched("a.example.com", "example.com", DetectionMethod::StringNormalization)];
		let merged = apply_plan(&initial, &plan_merge(&initial, &weak, Utc::now()));

		let strong = [matched("a.example.com", "example.com", DetectionMethod::DnsResolution)];
		let upgraded = apply_plan(&merged, &plan_merge(&merged, &strong, Utc::now()));
		let edge = upgraded.edge(&addr("a.example.com")).unwrap();
		assert_eq!(edge.detection_method, DetectionMethod::DnsResolution);
		assert_eq!(edge.confidence, 1.0);
	}

	#[test]
	fn reversal_promotes_alias_and_repoints_followers() {
		let mut initial = state(&[
			("old.example.com", CanonicalStatus::Canonical),
			("example.com", CanonicalStatus::Alias(addr("old.example.com"))),
			("x.example.com", CanonicalStatus::Alias(addr("old.example.com"))),
		]);
		for alias in ["example.com", "x.example.com"] {
			initial.insert_edge(AliasEdge {
				alias_address: addr(alias),
				canonical_address: addr("old.example.com"),
				detection_method: DetectionMethod::FaviconAndPlayers,
				confidence: 0.85,
				created_at: Utc::now(),
			});
		}
		initial.validate().unwrap();

		let matches = [matched("old.example.com", "example.com", DetectionMethod::DnsResolution)];
		let plan = plan_merge(&initial, &matches, Utc::now());
		assert!(plan.skipped.is_empty());

		let merged = apply_plan(&initial, &plan);
		assert_eq!(merged.status(&addr("example.com")), Some(&CanonicalStatus::Canonical));
		for alias in ["old.example.com", "x.example.com"] {
			assert_eq!(
				merged.status(&addr(alias)),
				Some(&CanonicalStatus::Alias(addr("example.com")))
			);
			assert_eq!(merged.edge(&addr(alias)).unwrap().canonical_address, addr("example.com"));
		}
		assert!(merged.edge(&addr("example.com")).is_none());
	}

	#[test]
	fn corrective_run_moves_whole_cluster_in_any_order() {
		let initial = state(&[
			("x.example.com", CanonicalStatus::Canonical),
			("example.com", CanonicalStatus::Alias(addr("x.example.com"))),
			("a.example.com", CanonicalStatus::Alias(addr("x.example.com"))),
		]);
		let matches = [
			matched("a.example.com", "example.com", DetectionMethod::DnsResolution),
			matched("x.example.com", "example.com", DetectionMethod::DnsResolution),
		];

		let plan = plan_merge(&initial, &matches, Utc::now());
		assert!(plan.skipped.is_empty(), "{:?}", plan.skipped);
		let merged = apply_plan(&initial, &plan);
		assert_eq!(merged.followers_of(&addr("example.com")).len(), 2);
	}

	#[test]
	fn skips_with_reasons() {
		let initial = state(&[
			("example.com", CanonicalStatus::Canonical),
			("other.com", CanonicalStatus::Canonical),
			("a.example.com", CanonicalStatus::Alias(addr("other.com"))),
			("b.other.com", CanonicalStatus::Alias(addr("other.com"))),
		]);
		let matches = [
			matched("example.com", "example.com", DetectionMethod::DnsResolution),
			matched("missing.com", "example.com", DetectionMethod::DnsResolution),
			matched("a.example.com", "example.com", DetectionMethod::DnsResolution),
			matched("example.com", "b.other.com", DetectionMethod::DnsResolution),
		];

		let plan = plan_merge(&initial, &matches, Utc::now());
		assert!(plan.steps.is_empty());
		let reasons: Vec<_> = plan.skipped.iter().map(|s| s.reason.clone()).collect();
		assert!(reasons.contains(&SkipReason::SelfReference));
		assert!(reasons.contains(&SkipReason::UnknownAddress(addr("missing.com"))));
		assert!(reasons.contains(&SkipReason::AliasClaimed { current: addr("other.com") }));
		assert!(reasons.contains(&SkipReason::CanonicalIsAlias {
			canonical_of: addr("other.com")
		}));
	}

	#[test]
	fn canonical_demoted_earlier_in_batch_is_refused() {
		let initial = state(&[
			("a.com", CanonicalStatus::Canonical),
			("b.com", CanonicalStatus::Canonical),
			("c.com", CanonicalStatus::Canonical),
		]);
		// b joins a first, after which b can no longer take c
		let matches = [
			matched("b.com", "a.com", DetectionMethod::DnsResolution),
			matched("c.com", "b.com", DetectionMethod::DnsResolution),
		];

		let plan = plan_merge(&initial, &matches, Utc::now());
		let merged = apply_plan(&initial, &plan);
		merged.validate().unwrap();
		assert_eq!(plan.steps.len(), 1);
		assert_eq!(plan.skipped.len(), 1);
	}

	#[test]
	fn validate_rejects_two_hop_chains() {
		let chained = state(&[
			("a.com", CanonicalStatus::Canonical),
			("b.com", CanonicalStatus::Alias(addr("a.com"))),
			("c.com", CanonicalStatus::Alias(addr("b.com"))),
		]);
		assert!(chained.validate().is_err());
	}
}
