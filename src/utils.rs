use crate::address::AddressError;
use crate::database::StoreError;
use crate::ping::StatusError;
use crate::protocol::ProtocolError;
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tracing::{info, warn};

/// Why a single address in a batch produced no verified record
#[derive(Debug, Error)]
pub enum RunError {
	#[error("Failed to parse address")]
	InvalidAddress(#[from] AddressError),
	#[error("Server is offline: {0}")]
	Offline(String),
	#[error("Malformed response")]
	MalformedResponse(#[from] ProtocolError),
	#[error("Unexpected packet id {0:#04x}")]
	UnexpectedPacket(u32),
	#[error("Error while parsing response")]
	ParseResponse(#[from] serde_json::Error),
	#[error("Connection timed out")]
	TimedOut,
	#[error("Error while updating server in database")]
	Database(#[from] StoreError),
}

impl From<StatusError> for RunError {
	fn from(value: StatusError) -> Self {
		match value {
			StatusError::Offline(reason) => RunError::Offline(reason),
			StatusError::TimedOut => RunError::TimedOut,
			StatusError::Protocol(e) => RunError::MalformedResponse(e),
			StatusError::UnexpectedPacket(id) => RunError::UnexpectedPacket(id),
			StatusError::Parse(e) => RunError::ParseResponse(e),
		}
	}
}

pub const RUN_ERROR_KINDS: usize = 6;

impl From<&RunError> for usize {
	fn from(value: &RunError) -> Self {
		use RunError::*;

		match value {
			InvalidAddress(_) => 0,
			Offline(_) => 1,
			MalformedResponse(_) | UnexpectedPacket(_) => 2,
			ParseResponse(_) => 3,
			TimedOut => 4,
			Database(_) => 5,
		}
	}
}

/// Per-kind error tally for a finished batch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCounts([u32; RUN_ERROR_KINDS]);

impl ErrorCounts {
	pub fn record(&mut self, error: &RunError) {
		let i: usize = error.into();
		self.0[i] += 1;
	}

	pub fn total(&self) -> u32 {
		self.0.iter().sum()
	}

	pub fn invalid_addresses(&self) -> u32 {
		self.0[0]
	}

	pub fn offline(&self) -> u32 {
		self.0[1]
	}

	pub fn malformed(&self) -> u32 {
		self.0[2]
	}

	pub fn unparsable(&self) -> u32 {
		self.0[3]
	}

	pub fn timed_out(&self) -> u32 {
		self.0[4]
	}

	pub fn database(&self) -> u32 {
		self.0[5]
	}

	pub fn log(&self) {
		if self.total() == 0 {
			return;
		}

		warn!("Batch returned {} total errors!", self.total());
		warn!("{} errors while parsing addresses", self.invalid_addresses());
		info!("{} servers offline", self.offline());
		warn!("{} malformed responses", self.malformed());
		warn!("{} errors while parsing responses", self.unparsable());
		warn!("{} servers timed out", self.timed_out());
		warn!("{} database errors", self.database());
	}
}

pub fn progress_bar(len: u64, visible: bool) -> ProgressBar {
	if !visible {
		return ProgressBar::hidden();
	}

	let style =
		ProgressStyle::with_template("[{elapsed}] [{bar:40.white/blue}] {pos:>7}/{len:7} ETA {eta}")
		.map(|style| style.progress_chars("=>-"))
		.unwrap_or_else(|_| ProgressStyle::default_bar());

	ProgressBar::new(len).with_style(style)
}
