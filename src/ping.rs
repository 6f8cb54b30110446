use crate::address::ServerAddress;
use crate::protocol::{
	handshake_packet, read_packet, status_request_packet, ProtocolError, STATUS_STATE,
};
use crate::response::{parse_response, StatusMetadata};
use crate::varint::decode_varint;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Servers ignore the version in a status handshake, -1 is the conventional "unknown"
const STATUS_PROTOCOL_VERSION: u32 = u32::MAX;

#[derive(Debug, Error)]
pub enum StatusError {
	#[error("server is offline: {0}")]
	Offline(String),
	#[error("server did not answer the status request in time")]
	TimedOut,
	#[error("malformed status response")]
	Protocol(#[from] ProtocolError),
	#[error("unexpected packet id {0:#04x} in status response")]
	UnexpectedPacket(u32),
	#[error("error while parsing status JSON")]
	Parse(#[from] serde_json::Error),
}

/// Server list ping: handshake with next state 1, then one status request.
pub async fn probe_status(
	address: &ServerAddress,
	time_limit: Duration,
) -> Result<StatusMetadata, StatusError> {
	let (host, port) = (address.host(), address.port());

	let mut stream = match timeout(time_limit, TcpStream::connect((host, port))).await {
		Ok(Ok(stream)) => stream,
		Ok(Err(e)) => return Err(StatusError::Offline(e.to_string())),
		Err(_) => return Err(StatusError::Offline("connect timed out".to_string())),
	};

	let result = match timeout(time_limit, exchange(&mut stream, host, port)).await {
		Ok(result) => result,
		Err(_) => Err(StatusError::TimedOut),
	};

	let _ = stream.shutdown().await;

	if let Err(e) = &result {
		debug!("[{address}] Status probe failed: {e}");
	}

	result
}

async fn exchange(
	stream: &mut TcpStream,
	host: &str,
	port: u16,
) -> Result<StatusMetadata, StatusError> {
	let mut request = handshake_packet(STATUS_PROTOCOL_VERSION, host, port, STATUS_STATE);
	request.extend(status_request_packet());

	let started = Instant::now();
	stream.write_all(&request).await.map_err(ProtocolError::from)?;

	let (packet_id, payload) = read_packet(stream).await?;
	let latency_ms = started.elapsed().as_millis() as u64;

	if packet_id != 0 {
		return Err(StatusError::UnexpectedPacket(packet_id));
	}

	let json = read_json_string(&payload)?;
	Ok(parse_response(&json)?.into_metadata(latency_ms))
}

/// The payload is one VarInt-prefixed string
fn read_json_string(payload: &[u8]) -> Result<String, ProtocolError> {
	let (string_length, prefix_length) = decode_varint(payload)?;
	let end = prefix_length + string_length as usize;

	if end > payload.len() {
		return Err(ProtocolError::UnexpectedEof);
	}

	Ok(String::from_utf8_lossy(&payload[prefix_length..end]).to_string())
}
