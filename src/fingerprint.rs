use crate::address::{normalize_hostname, ServerAddress};
use crate::database::RegistryStore;
use crate::models::DnsEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Signals used to spot two addresses serving the same server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fingerprint {
	pub address: ServerAddress,
	pub favicon_hash: Option<String>,
	pub resolved_ip: Option<Ipv4Addr>,
	pub normalized_hostname: String,
	/// When `resolved_ip` was last confirmed, `None` if it never was
	pub dns_checked_at: Option<DateTime<Utc>>,
}

/// SHA-256 of the favicon exactly as the server sent it, hex encoded
pub fn hash_favicon(favicon: &str) -> String {
	hex::encode(Sha256::digest(favicon.as_bytes()))
}

#[async_trait]
pub trait Resolve: Send + Sync {
	/// First A record for `host`, `None` when it has none
	async fn resolve(&self, host: &str) -> io::Result<Option<Ipv4Addr>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
	async fn resolve(&self, host: &str) -> io::Result<Option<Ipv4Addr>> {
		let mut addresses = tokio::net::lookup_host((host, 0)).await?;
		Ok(addresses.find_map(|address| match address.ip() {
			IpAddr::V4(ip) => Some(ip),
			IpAddr::V6(_) => None,
		}))
	}
}

#[derive(Clone)]
pub struct FingerprintBuilder {
	resolver: Arc<dyn Resolve>,
	cache_ttl: chrono::Duration,
	timeout: Duration,
}

impl FingerprintBuilder {
	pub fn new(resolver: Arc<dyn Resolve>, cache_ttl: chrono::Duration, timeout: Duration) -> Self {
		Self {
			resolver,
			cache_ttl,
			timeout,
		}
	}

	/// DNS problems never fail the fingerprint, they only leave `resolved_ip` empty
	pub async fn build(
		&self,
		address: &ServerAddress,
		favicon: Option<&str>,
		store: &dyn RegistryStore,
	) -> Fingerprint {
		let (resolved_ip, dns_checked_at) = match self.resolve(address, store).await {
			Some((ip, checked_at)) => (Some(ip), Some(checked_at)),
			None => (None, None),
		};

		Fingerprint {
			address: address.clone(),
			favicon_hash: favicon.map(hash_favicon),
			resolved_ip,
			normalized_hostname: normalize_hostname(address),
			dns_checked_at,
		}
	}

	async fn resolve(
		&self,
		address: &ServerAddress,
		store: &dyn RegistryStore,
	) -> Option<(Ipv4Addr, DateTime<Utc>)> {
		let now = Utc::now();

		if let Some(ip) = address.ipv4() {
			return Some((ip, now));
		}

		match store.cached_dns(address).await {
			Ok(Some(DnsEntry {
				resolved_ip: Some(ip),
				checked_at,
			})) if now - checked_at < self.cache_ttl => {
				debug!("[{address}] DNS cache hit: {ip}");
				return Some((ip, checked_at));
			}
			Ok(_) => {}
			Err(e) => warn!("[{address}] Failed to read DNS cache: {e}"),
		}

		let lookup = self.resolver.resolve(address.host());
		let ip = match tokio::time::timeout(self.timeout, lookup).await {
			Ok(Ok(Some(ip))) => ip,
			Ok(Ok(None)) => {
				warn!("[{address}] Host has no A record");
				return None;
			}
			Ok(Err(e)) => {
				warn!("[{address}] DNS lookup failed: {e}");
				return None;
			}
			Err(_) => {
				warn!("[{address}] DNS lookup timed out");
				return None;
			}
		};

		let entry = DnsEntry {
			resolved_ip: Some(ip),
			checked_at: now,
		};
		if let Err(e) = store.store_dns(address, entry).await {
			warn!("[{address}] Failed to cache DNS answer: {e}");
		}

		Some((ip, now))
	}
}
