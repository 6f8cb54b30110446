use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use thiserror::Error;
use url::Host;

pub const DEFAULT_PORT: u16 = 25565;

const SCHEME_PREFIXES: [&str; 4] = ["minecraft://", "mc://", "http://", "https://"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
	#[error("address is empty")]
	Empty,
	#[error("invalid port: {0}")]
	InvalidPort(String),
	#[error("unterminated IPv6 literal: {0}")]
	UnterminatedBracket(String),
}

/// Hostname or IP plus port, in normalized form.
///
/// Two raw strings that normalize to the same value are the same network identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerAddress {
	host: String,
	port: u16,
}

impl ServerAddress {
	/// Normalizes with `www.` stripping enabled
	pub fn parse(raw: &str) -> Result<Self, AddressError> {
		Self::parse_with(raw, true)
	}

	pub fn parse_with(raw: &str, strip_www: bool) -> Result<Self, AddressError> {
		let mut address = raw.trim();

		for prefix in SCHEME_PREFIXES {
			if address.len() >= prefix.len()
				&& address[..prefix.len()].eq_ignore_ascii_case(prefix)
			{
				address = &address[prefix.len()..];
				break;
			}
		}

		// Anything after a path separator is not part of the address
		if let Some(end) = address.find('/') {
			address = &address[..end];
		}

		let (host, port) = split_port(address)?;
		let mut host = normalize_host(host.trim_end_matches('.'));

		while strip_www && host.len() > 4 && host.starts_with("www.") {
			host.drain(..4);
		}

		if host.is_empty() {
			return Err(AddressError::Empty);
		}

		Ok(Self { host, port })
	}

	pub fn host(&self) -> &str {
		&self.host
	}

	pub fn port(&self) -> u16 {
		self.port
	}

	pub fn ipv4(&self) -> Option<Ipv4Addr> {
		self.host.parse().ok()
	}

	/// Number of `.` separators in the hostname (port excluded)
	pub fn dot_count(&self) -> usize {
		self.host.matches('.').count()
	}
}

fn split_port(address: &str) -> Result<(&str, u16), AddressError> {
	if let Some(rest) = address.strip_prefix('[') {
		let end = rest
			.find(']')
			.ok_or_else(|| AddressError::UnterminatedBracket(address.to_string()))?;
		let port = match rest[end + 1..].strip_prefix(':') {
			Some(port) => parse_port(port)?,
			None => DEFAULT_PORT,
		};
		return Ok((&rest[..end], port));
	}

	match address.matches(':').count() {
		0 => Ok((address, DEFAULT_PORT)),
		1 => {
			let (host, port) = address.split_once(':').unwrap_or((address, ""));
			Ok((host, parse_port(port)?))
		}
		// Bare IPv6 literal
		_ => Ok((address, DEFAULT_PORT)),
	}
}

fn parse_port(port: &str) -> Result<u16, AddressError> {
	match port.trim().parse::<u16>() {
		Ok(0) | Err(_) => Err(AddressError::InvalidPort(port.to_string())),
		Ok(port) => Ok(port),
	}
}

/// Lowercases and punycode-encodes internationalized names
fn normalize_host(host: &str) -> String {
	if let Ok(ip) = host.parse::<Ipv6Addr>() {
		return ip.to_string();
	}

	match Host::parse(host) {
		Ok(Host::Domain(domain)) => domain,
		Ok(Host::Ipv4(ip)) => ip.to_string(),
		Ok(Host::Ipv6(ip)) => ip.to_string(),
		// Not a valid hostname, keep it as the caller wrote it
		Err(_) => host.to_lowercase(),
	}
}

/// Hostname used for fuzzy matching only: lowercase, no port, no `www.`.
///
/// Stronger than [`ServerAddress`] normalization and never used as an identity key.
pub fn normalize_hostname(address: &ServerAddress) -> String {
	let mut host = address.host().to_lowercase();
	while host.len() > 4 && host.starts_with("www.") {
		host.drain(..4);
	}
	host
}

/// Normalizes a raw address string into its canonical textual form
pub fn normalize(raw: &str) -> Result<String, AddressError> {
	ServerAddress::parse(raw).map(|address| address.to_string())
}

impl fmt::Display for ServerAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let bracketed = self.host.contains(':');

		match (bracketed, self.port == DEFAULT_PORT) {
			(false, true) => write!(f, "{}", self.host),
			(false, false) => write!(f, "{}:{}", self.host, self.port),
			(true, true) => write!(f, "[{}]", self.host),
			(true, false) => write!(f, "[{}]:{}", self.host, self.port),
		}
	}
}

impl FromStr for ServerAddress {
	type Err = AddressError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}

impl TryFrom<String> for ServerAddress {
	type Error = AddressError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::parse(&value)
	}
}

impl From<ServerAddress> for String {
	fn from(address: ServerAddress) -> Self {
		address.to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strips_default_port_and_case() {
		assert_eq!(normalize("Play.Hypixel.NET:25565").unwrap(), "play.hypixel.net");
	}

	#[test]
	fn strips_www() {
		assert_eq!(normalize("www.Server.com").unwrap(), "server.com");
		assert_eq!(
			ServerAddress::parse_with("www.Server.com", false).unwrap().to_string(),
			"www.server.com"
		);
	}

	#[test]
	fn keeps_non_default_port() {
		let address = ServerAddress::parse("mc.example.com:25566").unwrap();
		assert_eq!(address.host(), "mc.example.com");
		assert_eq!(address.port(), 25566);
		assert_eq!(address.to_string(), "mc.example.com:25566");
	}

	#[test]
	fn strips_scheme_prefixes_and_paths() {
		assert_eq!(normalize("minecraft://Example.org").unwrap(), "example.org");
		assert_eq!(normalize("HTTPS://example.org:25570/join").unwrap(), "example.org:25570");
		assert_eq!(normalize("  mc://example.org  ").unwrap(), "example.org");
	}

	#[test]
	fn encodes_internationalized_names() {
		assert_eq!(normalize("münchen.de").unwrap(), "xn--mnchen-3ya.de");
		assert_eq!(normalize("MÜNCHEN.de:25565").unwrap(), "xn--mnchen-3ya.de");
	}

	#[test]
	fn handles_ip_literals() {
		assert_eq!(normalize("1.2.3.4:25565").unwrap(), "1.2.3.4");
		assert_eq!(normalize("[::1]:25566").unwrap(), "[::1]:25566");
		assert_eq!(normalize("::1").unwrap(), "[::1]");
		assert_eq!(
			ServerAddress::parse("1.2.3.4").unwrap().ipv4(),
			Some(Ipv4Addr::new(1, 2, 3, 4))
		);
	}

	#[test]
	fn rejects_bad_input() {
		assert_eq!(normalize("   "), Err(AddressError::Empty));
		assert!(matches!(normalize("example.com:notaport"), Err(AddressError::InvalidPort(_))));
		assert!(matches!(normalize("example.com:0"), Err(AddressError::InvalidPort(_))));
		assert!(matches!(normalize("[::1"), Err(AddressError::UnterminatedBracket(_))));
	}

	#[test]
	fn normalization_is_idempotent() {
		let inputs = [
			"Play.Hypixel.NET:25565",
			"www.Server.com",
			"www.www.example.com",
			"münchen.de:1234",
			"https://Mc.Example.org/",
			"10.0.0.1:25570",
			"[2001:db8::1]:25565",
			"example.com.",
			"weird host!",
		];

		for input in inputs {
			let once = normalize(input).unwrap();
			let twice = normalize(&once).unwrap();
			assert_eq!(once, twice, "input {input:?}");
		}
	}

	#[test]
	fn fuzzy_hostname_drops_port_and_www() {
		let address = ServerAddress::parse_with("WWW.Example.com:25570", false).unwrap();
		assert_eq!(normalize_hostname(&address), "example.com");
	}

	#[test]
	fn counts_dots_on_host_only() {
		assert_eq!(ServerAddress::parse("sub.deep.example.com:25570").unwrap().dot_count(), 3);
		assert_eq!(ServerAddress::parse("example.com").unwrap().dot_count(), 1);
	}

	#[test]
	fn serde_uses_normalized_string() {
		let address: ServerAddress = serde_json::from_str("\"Play.Example.com:25565\"").unwrap();
		assert_eq!(serde_json::to_string(&address).unwrap(), "\"play.example.com\"");
	}
}
