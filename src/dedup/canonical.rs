use crate::address::ServerAddress;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;

const DOT_WEIGHT: i64 = -10_000;
const LENGTH_WEIGHT: i64 = -100;
const AGE_WEIGHT: i64 = 1;
const SNAPSHOT_WEIGHT: i64 = 10;

/// What the canonical score looks at for one cluster member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateStats {
	pub address: ServerAddress,
	pub first_seen: DateTime<Utc>,
	pub snapshot_count: i64,
}

/// Operators advertise their shortest root domain, so dots dominate, then length,
/// then age and observation volume. Only reported in analysis output; the winner
/// is picked by [`select_canonical`].
pub fn canonical_score(candidate: &CandidateStats, now: DateTime<Utc>) -> i64 {
	let host = candidate.address.host();
	let age_days = age_days(candidate, now);

	DOT_WEIGHT * candidate.address.dot_count() as i64
		+ LENGTH_WEIGHT * host.chars().count() as i64
		+ AGE_WEIGHT * age_days
		+ SNAPSHOT_WEIGHT * candidate.snapshot_count
}

fn age_days(candidate: &CandidateStats, now: DateTime<Utc>) -> i64 {
	(now - candidate.first_seen).num_days().max(0)
}

type Rank = (usize, usize, Reverse<i64>, Reverse<i64>);

/// Sort key where smaller is better: fewer dots, shorter host, older, busier
fn rank(candidate: &CandidateStats, now: DateTime<Utc>) -> Rank {
	(
		candidate.address.dot_count(),
		candidate.address.host().chars().count(),
		Reverse(age_days(candidate, now)),
		Reverse(candidate.snapshot_count),
	)
}

/// Each criterion only breaks ties left by the previous one; exact ties go to the
/// smallest address.
pub fn select_canonical(cluster: &[CandidateStats], now: DateTime<Utc>) -> Option<ServerAddress> {
	cluster
		.iter()
		.min_by(|a, b| {
			rank(a, now)
				.cmp(&rank(b, now))
				.then_with(|| a.address.cmp(&b.address))
		})
		.map(|candidate| candidate.address.clone())
}
