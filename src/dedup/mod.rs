pub mod canonical;
pub mod merge;
pub mod strategies;

use crate::address::ServerAddress;
use crate::database::{FingerprintRow, RegistryStore, StoreError};
use crate::models::{AliasEdge, DetectionMethod};
use canonical::{canonical_score, select_canonical, CandidateStats};
use chrono::{DateTime, Utc};
use merge::{plan_merge, MergeReport, SkipReason, SkippedMatch, StepOutcome};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use strategies::Evidence;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Strategy {
	Dns,
	Favicon,
	Normalization,
}

impl Strategy {
	pub const ALL: [Strategy; 3] = [Strategy::Dns, Strategy::Favicon, Strategy::Normalization];

	pub fn method(&self) -> DetectionMethod {
		match self {
			Strategy::Dns => DetectionMethod::DnsResolution,
			Strategy::Favicon => DetectionMethod::FaviconAndPlayers,
			Strategy::Normalization => DetectionMethod::StringNormalization,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateMatch {
	pub canonical: ServerAddress,
	pub alias: ServerAddress,
	pub method: DetectionMethod,
	pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateCluster {
	pub canonical: ServerAddress,
	/// Sorted, canonical included
	pub members: Vec<ServerAddress>,
	pub methods: BTreeSet<DetectionMethod>,
	/// Weighted score of the winner, for audit output
	pub score: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfidenceBands {
	/// >= 0.9
	pub high: usize,
	/// 0.5 up to 0.9
	pub medium: usize,
	/// < 0.5
	pub low: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DuplicateReport {
	pub fingerprints: usize,
	pub strategies: Vec<Strategy>,
	pub clusters: Vec<DuplicateCluster>,
	pub matches: Vec<DuplicateMatch>,
}

impl DuplicateReport {
	pub fn bands(&self) -> ConfidenceBands {
		let mut bands = ConfidenceBands::default();
		for m in &self.matches {
			match m.confidence {
				c if c >= 0.9 => bands.high += 1,
				c if c >= 0.5 => bands.medium += 1,
				_ => bands.low += 1,
			}
		}
		bands
	}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyzeOptions {
	pub player_tolerance: f64,
}

impl Default for AnalyzeOptions {
	fn default() -> Self {
		Self { player_tolerance: 0.05 }
	}
}

/// One match per `(canonical, alias)`, the most confident explanation wins
pub fn dedupe_matches(matches: Vec<DuplicateMatch>) -> Vec<DuplicateMatch> {
	let mut best: BTreeMap<(ServerAddress, ServerAddress), DuplicateMatch> = BTreeMap::new();

	for m in matches {
		let key = (m.canonical.clone(), m.alias.clone());
		match best.get(&key) {
			Some(existing) if existing.confidence >= m.confidence => {}
			_ => {
				best.insert(key, m);
			}
		}
	}

	best.into_values().collect()
}

fn permille(method: DetectionMethod) -> u32 {
	(method.confidence() * 1000.0).round() as u32
}

struct DisjointSet {
	parent: Vec<usize>,
}

impl DisjointSet {
	fn new(len: usize) -> Self {
		Self {
			parent: (0..len).collect(),
		}
	}

	fn find(&mut self, mut i: usize) -> usize {
		while self.parent[i] != i {
			self.parent[i] = self.parent[self.parent[i]];
			i = self.parent[i];
		}
		i
	}

	fn union(&mut self, a: usize, b: usize) {
		let (ra, rb) = (self.find(a), self.find(b));
		if ra != rb {
			self.parent[ra.max(rb)] = ra.min(rb);
		}
	}
}

type Adjacency = BTreeMap<ServerAddress, BTreeMap<ServerAddress, DetectionMethod>>;

/// Strongest link between every connected pair
fn adjacency(evidence: &[Evidence]) -> Adjacency {
	let mut graph: Adjacency = BTreeMap::new();

	for e in evidence {
		for (from, to) in [(&e.left, &e.right), (&e.right, &e.left)] {
			let slot = graph.entry(from.clone()).or_default().entry(to.clone()).or_insert(e.method);
			if permille(e.method) > permille(*slot) {
				*slot = e.method;
			}
		}
	}

	graph
}

/// Widest path from the canonical: an alias is only as certain as the weakest
/// link connecting it. The method reported is the one on that weakest link.
fn alias_methods(
	canonical: &ServerAddress,
	graph: &Adjacency,
) -> BTreeMap<ServerAddress, DetectionMethod> {
	let mut width: BTreeMap<ServerAddress, (u32, Option<DetectionMethod>)> = BTreeMap::new();
	let mut done: BTreeSet<ServerAddress> = BTreeSet::new();
	width.insert(canonical.clone(), (u32::MAX, None));

	loop {
		let next = width
			.iter()
			.filter(|(address, _)| !done.contains(*address))
			.max_by(|(a, (wa, _)), (b, (wb, _))| wa.cmp(wb).then_with(|| b.cmp(a)))
			.map(|(address, (w, method))| (address.clone(), *w, *method));

		let Some((current, current_width, current_method)) = next else {
			break;
		};
		done.insert(current.clone());

		for (neighbour, method) in graph.get(&current).into_iter().flatten() {
			if done.contains(neighbour) {
				continue;
			}

			let link = permille(*method);
			let (candidate, bottleneck) = if link <= current_width {
				(link, Some(*method))
			} else {
				(current_width, current_method)
			};

			let improves = width.get(neighbour).map_or(true, |(w, _)| candidate > *w);
			if improves {
				width.insert(neighbour.clone(), (candidate, bottleneck));
			}
		}
	}

	width
		.into_iter()
		.filter_map(|(address, (_, method))| Some((address, method?)))
		.collect()
}

/// Runs the chosen strategies over the fingerprint set, clusters everything
/// they link transitively and picks one canonical per cluster.
pub fn analyze(
	rows: &[FingerprintRow],
	selected: &[Strategy],
	options: &AnalyzeOptions,
	now: DateTime<Utc>,
) -> DuplicateReport {
	let selected: Vec<Strategy> = selected
		.iter()
		.copied()
		.collect::<BTreeSet<_>>()
		.into_iter()
		.collect();

	let mut evidence = Vec::new();
	for strategy in &selected {
		let found = match strategy {
			Strategy::Dns => strategies::dns_evidence(rows),
			Strategy::Favicon => strategies::favicon_evidence(rows, options.player_tolerance),
			Strategy::Normalization => strategies::normalization_evidence(rows),
		};
		debug!("Strategy {strategy:?} produced {} links", found.len());
		evidence.extend(found);
	}

	let index: BTreeMap<&ServerAddress, usize> = rows
		.iter()
		.enumerate()
		.map(|(i, row)| (&row.address, i))
		.collect();
	let mut sets = DisjointSet::new(rows.len());
	for e in &evidence {
		if let (Some(&a), Some(&b)) = (index.get(&e.left), index.get(&e.right)) {
			sets.union(a, b);
		}
	}

	let mut groups: BTreeMap<usize, Vec<&FingerprintRow>> = BTreeMap::new();
	for (i, row) in rows.iter().enumerate() {
		groups.entry(sets.find(i)).or_default().push(row);
	}

	let graph = adjacency(&evidence);
	let mut clusters = Vec::new();
	let mut matches = Vec::new();

	for members in groups.into_values().filter(|members| members.len() > 1) {
		let candidates: Vec<CandidateStats> = members
			.iter()
			.map(|row| CandidateStats {
				address: row.address.clone(),
				first_seen: row.first_seen,
				snapshot_count: row.snapshot_count,
			})
			.collect();

		let Some(canonical) = select_canonical(&candidates, now) else {
			continue;
		};
		let score = candidates
			.iter()
			.find(|candidate| candidate.address == canonical)
			.map_or(0, |candidate| canonical_score(candidate, now));

		let methods = alias_methods(&canonical, &graph);
		for (alias, method) in &methods {
			matches.push(DuplicateMatch {
				canonical: canonical.clone(),
				alias: alias.clone(),
				method: *method,
				confidence: method.confidence(),
			});
		}

		let mut addresses: Vec<ServerAddress> =
			members.iter().map(|row| row.address.clone()).collect();
		addresses.sort();
		clusters.push(DuplicateCluster {
			canonical,
			members: addresses,
			methods: methods.into_values().collect(),
			score,
		});
	}

	clusters.sort_by(|a, b| a.canonical.cmp(&b.canonical));

	DuplicateReport {
		fingerprints: rows.len(),
		strategies: selected,
		clusters,
		matches: dedupe_matches(matches),
	}
}

/// Analysis and merging against a registry store. Merges are serialized
/// through one lock so no two passes interleave their canonical decisions.
pub struct IdentityResolver {
	store: Arc<dyn RegistryStore>,
	options: AnalyzeOptions,
	merge_lock: Mutex<()>,
}

impl IdentityResolver {
	pub fn new(store: Arc<dyn RegistryStore>, options: AnalyzeOptions) -> Self {
		Self {
			store,
			options,
			merge_lock: Mutex::new(()),
		}
	}

	pub fn store(&self) -> &Arc<dyn RegistryStore> {
		&self.store
	}

	/// All strategies when `strategies` is `None`
	pub async fn analyze_duplicates(
		&self,
		strategies: Option<&[Strategy]>,
	) -> Result<DuplicateReport, StoreError> {
		let rows = self.store.fingerprint_rows().await?;
		let selected = strategies.unwrap_or(&Strategy::ALL);
		let report = analyze(&rows, selected, &self.options, Utc::now());

		let bands = report.bands();
		info!(
			"Analyzed {} fingerprints: {} clusters, {} matches ({} high, {} medium, {} low confidence)",
			report.fingerprints,
			report.clusters.len(),
			report.matches.len(),
			bands.high,
			bands.medium,
			bands.low
		);

		Ok(report)
	}

	pub async fn merge(
		&self,
		matches: &[DuplicateMatch],
		dry_run: bool,
	) -> Result<MergeReport, StoreError> {
		let _guard = self.merge_lock.lock().await;
		self.merge_locked(matches, dry_run).await
	}

	/// Analysis and merge in one critical section
	pub async fn deduplicate(
		&self,
		strategies: Option<&[Strategy]>,
		dry_run: bool,
	) -> Result<(DuplicateReport, MergeReport), StoreError> {
		let _guard = self.merge_lock.lock().await;
		let report = self.analyze_duplicates(strategies).await?;
		let merged = self.merge_locked(&report.matches, dry_run).await?;
		Ok((report, merged))
	}

	async fn merge_locked(
		&self,
		matches: &[DuplicateMatch],
		dry_run: bool,
	) -> Result<MergeReport, StoreError> {
		let state = self.store.load_identity_state().await?;
		let plan = plan_merge(&state, matches, Utc::now());

		for skipped in &plan.skipped {
			warn!(
				"Skipping merge of {} into {}: {}",
				skipped.matched.alias, skipped.matched.canonical, skipped.reason
			);
		}

		if dry_run {
			info!(
				"Dry run: {} merges planned, {} unchanged, {} skipped",
				plan.steps.len(),
				plan.unchanged.len(),
				plan.skipped.len()
			);
			return Ok(MergeReport::from_plan(plan, true));
		}

		let outcomes = self.store.apply_merge(&plan.steps).await?;

		let mut report = MergeReport {
			dry_run: false,
			applied: Vec::new(),
			unchanged: plan.unchanged,
			skipped: plan.skipped,
		};

		for (step, outcome) in plan.steps.into_iter().zip(outcomes) {
			match outcome {
				StepOutcome::Applied => report.applied.push(step),
				StepOutcome::Rejected(reason) => {
					warn!(
						"Store rejected merge of {} into {}: {reason}",
						step.matched.alias, step.matched.canonical
					);
					report.skipped.push(SkippedMatch {
						matched: step.matched,
						reason: SkipReason::Rejected(reason),
					});
				}
			}
		}

		info!(
			"Merged {} aliases, {} unchanged, {} skipped",
			report.applied.len(),
			report.unchanged.len(),
			report.skipped.len()
		);

		Ok(report)
	}

	pub async fn resolve_canonical(
		&self,
		address: &ServerAddress,
	) -> Result<Option<ServerAddress>, StoreError> {
		self.store.resolve_canonical(address).await
	}

	pub async fn aliases_of(
		&self,
		canonical: &ServerAddress,
	) -> Result<Vec<AliasEdge>, StoreError> {
		self.store.aliases_of(canonical).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Duration;
	use std::net::Ipv4Addr;

	fn row(address: &str) -> FingerprintRow {
		FingerprintRow {
			address: ServerAddress::parse(address).unwrap(),
			favicon_hash: None,
			resolved_ip: None,
			players_online: None,
			first_seen: Utc::now() - Duration::days(1),
			snapshot_count: 1,
		}
	}

	fn with_ip(address: &str, ip: [u8; 4]) -> FingerprintRow {
		let mut row = row(address);
		row.resolved_ip = Some(Ipv4Addr::from(ip));
		row
	}

	#[test]
	fn dns_cluster_of_three() {
		let rows = [
			with_ip("a.example.com", [1, 2, 3, 4]),
			with_ip("b.example.com", [1, 2, 3, 4]),
			with_ip("example.com", [1, 2, 3, 4]),
		];

		let report = analyze(&rows, &Strategy::ALL, &AnalyzeOptions::default(), Utc::now());
		assert_eq!(report.clusters.len(), 1);

		let cluster = &report.clusters[0];
		assert_eq!(cluster.members.len(), 3);
		assert_eq!(cluster.canonical.to_string(), "example.com");
		assert_eq!(cluster.methods, BTreeSet::from([DetectionMethod::DnsResolution]));
		assert_eq!(cluster.score, -10_000 - 1_100 + 1 + 10);

		assert_eq!(report.matches.len(), 2);
		for m in &report.matches {
			assert_eq!(m.canonical.to_string(), "example.com");
			assert_eq!(m.confidence, 1.0);
		}
	}

	#[test]
	fn stronger_strategy_overrides_weaker() {
		let rows = [
			with_ip("example.com", [1, 2, 3, 4]),
			with_ip("example.com:25566", [1, 2, 3, 4]),
		];

		let report = analyze(&rows, &Strategy::ALL, &AnalyzeOptions::default(), Utc::now());
		assert_eq!(report.matches.len(), 1);
		assert_eq!(report.matches[0].method, DetectionMethod::DnsResolution);
		assert_eq!(report.matches[0].confidence, 1.0);
		assert_eq!(report.matches[0].method.as_str(), "dns_resolution");
	}

	#[test]
	fn transitive_alias_takes_weakest_link() {
		// example.com -dns- b.example.com -normalization- b.example.com:25566
		let mut port_variant = row("b.example.com:25566");
		port_variant.resolved_ip = None;
		let rows = [
			with_ip("example.com", [1, 2, 3, 4]),
			with_ip("b.example.com", [1, 2, 3, 4]),
			port_variant,
		];

		let report = analyze(&rows, &Strategy::ALL, &AnalyzeOptions::default(), Utc::now());
		assert_eq!(report.clusters.len(), 1);

		let far = report
			.matches
			.iter()
			.find(|m| m.alias.to_string() == "b.example.com:25566")
			.unwrap();
		assert_eq!(far.method, DetectionMethod::StringNormalization);
		assert_eq!(far.confidence, 0.70);

		let bands = report.bands();
		assert_eq!(bands.high, 1);
		assert_eq!(bands.medium, 1);
	}

	#[test]
	fn strategy_subset_is_respected() {
		let rows = [
			with_ip("example.com", [1, 2, 3, 4]),
			with_ip("mirror.net", [1, 2, 3, 4]),
			row("other.org"),
			row("other.org:25570"),
		];

		let dns_only = analyze(&rows, &[Strategy::Dns], &AnalyzeOptions::default(), Utc::now());
		assert_eq!(dns_only.clusters.len(), 1);
		assert_eq!(dns_only.strategies, vec![Strategy::Dns]);

		let normalization_only = analyze(
			&rows,
			&[Strategy::Normalization],
			&AnalyzeOptions::default(),
			Utc::now(),
		);
		assert_eq!(normalization_only.clusters.len(), 1);
		assert_eq!(normalization_only.clusters[0].canonical.to_string(), "other.org");
	}

	#[test]
	fn favicon_cluster() {
		let mut a = row("play.alpha.net");
		let mut b = row("beta.org");
		for (r, players) in [(&mut a, 400), (&mut b, 390)] {
			r.favicon_hash = Some("f00d".into());
			r.players_online = Some(players);
		}

		let report = analyze(&[a, b], &Strategy::ALL, &AnalyzeOptions::default(), Utc::now());
		assert_eq!(report.matches.len(), 1);
		assert_eq!(report.matches[0].canonical.to_string(), "beta.org");
		assert_eq!(report.matches[0].confidence, 0.85);
	}

	#[test]
	fn dedupe_keeps_highest_confidence() {
		let canonical = ServerAddress::parse("example.com").unwrap();
		let alias = ServerAddress::parse("www2.example.com").unwrap();
		let weak = DuplicateMatch {
			canonical: canonical.clone(),
			alias: alias.clone(),
			method: DetectionMethod::StringNormalization,
			confidence: 0.70,
		};
		let strong = DuplicateMatch {
			method: DetectionMethod::DnsResolution,
			confidence: 1.0,
			..weak.clone()
		};

		let deduped = dedupe_matches(vec![weak.clone(), strong.clone(), weak]);
		assert_eq!(deduped, vec![strong]);
	}

	#[test]
	fn unrelated_rows_produce_nothing() {
		let rows = [row("one.com"), row("two.com")];
		let report = analyze(&rows, &Strategy::ALL, &AnalyzeOptions::default(), Utc::now());
		assert!(report.clusters.is_empty());
		assert!(report.matches.is_empty());
		assert_eq!(report.fingerprints, 2);
	}
}
