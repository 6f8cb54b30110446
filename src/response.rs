use serde::{Deserialize, Serialize};

/// Status response JSON as sent by the server
#[derive(Debug, Deserialize)]
pub struct Server {
	pub version: Version,
	pub favicon: Option<String>,
	pub description: Option<Description>,
	pub players: Option<Players>,
}

#[derive(Debug, Deserialize)]
pub struct Players {
	pub max: i64,
	pub online: i64,
	pub sample: Option<Vec<Player>>,
}

#[derive(Debug, Deserialize)]
pub struct Version {
	pub name: String,
	pub protocol: i64,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
pub struct Player {
	pub id: String,
	pub name: String,
}

/// MOTDs come either as a legacy string or as a chat component tree
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Description {
	Text(String),
	Component(TextComponent),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TextComponent {
	pub text: String,
	pub extra: Vec<Description>,
}

impl Description {
	/// Flattens the component tree into plain text without formatting codes
	pub fn to_plain(&self) -> String {
		let mut out = String::new();
		self.collect(&mut out);
		strip_formatting(&out)
	}

	fn collect(&self, out: &mut String) {
		match self {
			Description::Text(text) => out.push_str(text),
			Description::Component(component) => {
				out.push_str(&component.text);
				for child in &component.extra {
					child.collect(out);
				}
			}
		}
	}
}

/// Removes legacy `§x` colour and style codes
pub fn strip_formatting(text: &str) -> String {
	let mut out = String::with_capacity(text.len());
	let mut chars = text.chars();

	while let Some(c) = chars.next() {
		if c == '§' {
			chars.next();
			continue;
		}
		out.push(c);
	}

	out
}

/// What the status prober hands to the rest of the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMetadata {
	pub version: String,
	pub protocol: i64,
	pub motd: String,
	pub players_online: i64,
	pub players_max: i64,
	pub sample_size: i64,
	pub favicon: Option<String>,
	pub latency_ms: u64,
}

impl Server {
	pub fn into_metadata(self, latency_ms: u64) -> StatusMetadata {
		let (players_online, players_max, sample_size) = match &self.players {
			Some(players) => (
				players.online,
				players.max,
				players.sample.as_ref().map_or(0, |sample| sample.len() as i64),
			),
			None => (0, 0, 0),
		};

		StatusMetadata {
			version: self.version.name,
			protocol: self.version.protocol,
			motd: self.description.map(|d| d.to_plain()).unwrap_or_default(),
			players_online,
			players_max,
			sample_size,
			favicon: self.favicon.filter(|favicon| !favicon.is_empty()),
			latency_ms,
		}
	}
}

pub fn parse_response(response: &str) -> Result<Server, serde_json::Error> {
	serde_json::from_str(response)
}
