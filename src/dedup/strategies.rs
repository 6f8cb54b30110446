use crate::address::{normalize_hostname, ServerAddress};
use crate::database::FingerprintRow;
use crate::models::DetectionMethod;
use std::collections::BTreeMap;

/// Two addresses one strategy believes are the same server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evidence {
	pub left: ServerAddress,
	pub right: ServerAddress,
	pub method: DetectionMethod,
}

fn group_by<K: Ord>(
	rows: &[FingerprintRow],
	key: impl Fn(&FingerprintRow) -> Option<K>,
) -> BTreeMap<K, Vec<&FingerprintRow>> {
	let mut groups: BTreeMap<K, Vec<&FingerprintRow>> = BTreeMap::new();
	for row in rows {
		if let Some(k) = key(row) {
			groups.entry(k).or_default().push(row);
		}
	}

	for members in groups.values_mut() {
		members.sort_by(|a, b| a.address.cmp(&b.address));
	}

	groups
}

/// Every member of a group is linked to the group's first member. Within one
/// strategy all links carry the same confidence, so a star connects the group
/// exactly as strongly as a clique would.
fn star(members: &[&FingerprintRow], method: DetectionMethod) -> Vec<Evidence> {
	let Some((hub, rest)) = members.split_first() else {
		return Vec::new();
	};

	rest.iter()
		.map(|member| Evidence {
			left: hub.address.clone(),
			right: member.address.clone(),
			method,
		})
		.collect()
}

/// Same A record, same endpoint
pub fn dns_evidence(rows: &[FingerprintRow]) -> Vec<Evidence> {
	group_by(rows, |row| row.resolved_ip)
		.values()
		.filter(|members| members.len() > 1)
		.flat_map(|members| star(members, DetectionMethod::DnsResolution))
		.collect()
}

/// Relative difference against the larger count. Two empty servers prove nothing.
pub fn players_within(left: i64, right: i64, tolerance: f64) -> bool {
	let larger = left.max(right);
	if larger <= 0 {
		return false;
	}

	(left - right).abs() as f64 <= tolerance * larger as f64
}

/// Same favicon and near-identical player counts
pub fn favicon_evidence(rows: &[FingerprintRow], tolerance: f64) -> Vec<Evidence> {
	let mut evidence = Vec::new();

	for members in group_by(rows, |row| row.favicon_hash.clone()).values() {
		for (i, left) in members.iter().enumerate() {
			let Some(left_players) = left.players_online else {
				continue;
			};

			for right in &members[i + 1..] {
				let Some(right_players) = right.players_online else {
					continue;
				};

				if players_within(left_players, right_players, tolerance) {
					evidence.push(Evidence {
						left: left.address.clone(),
						right: right.address.clone(),
						method: DetectionMethod::FaviconAndPlayers,
					});
				}
			}
		}
	}

	evidence
}

/// Same host once case, port and "www." are gone
pub fn normalization_evidence(rows: &[FingerprintRow]) -> Vec<Evidence> {
	group_by(rows, |row| Some(normalize_hostname(&row.address)))
		.values()
		.filter(|members| members.len() > 1)
		.flat_map(|members| star(members, DetectionMethod::StringNormalization))
		.collect()
}
