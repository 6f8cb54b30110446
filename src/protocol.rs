//! Login-phase probe that classifies a server's authentication mode from the
//! first packet it answers a Login Start with.

use crate::address::ServerAddress;
use crate::models::AuthMode;
use crate::varint::{read_varint, write_string, write_varint};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Protocol 47 (1.8.x). Old enough that proxies and ViaVersion setups accept it,
/// and its Login Start carries only the username.
pub const LEGACY_PROTOCOL_VERSION: u32 = 47;

pub const STATUS_STATE: u32 = 1;
pub const LOGIN_STATE: u32 = 2;

/// Largest frame the vanilla server will ever send (3 byte varint)
pub const MAX_PACKET_LENGTH: u32 = 2_097_151;

const LOGIN_DISCONNECT: u32 = 0x00;
const ENCRYPTION_REQUEST: u32 = 0x01;
const LOGIN_SUCCESS: u32 = 0x02;
const SET_COMPRESSION: u32 = 0x03;

#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("malformed varint")]
	MalformedVarInt,
	#[error("received empty packet")]
	EmptyPacket,
	#[error("stream closed before the packet was complete")]
	UnexpectedEof,
	#[error("packet length {0} exceeds protocol maximum")]
	PacketTooLarge(u32),
	#[error("I/O error")]
	Io(#[from] std::io::Error),
}

/// What a login-phase Disconnect (0x00) is taken to mean
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectPolicy {
	/// The server never asked for encryption, so it does not enforce session auth
	#[default]
	NonPremium,
	/// Whitelists and version mismatches also disconnect; don't guess
	Unknown,
}

fn frame(body: Vec<u8>) -> Vec<u8> {
	let mut packet = Vec::with_capacity(body.len() + 3);
	write_varint(&mut packet, body.len() as u32);
	packet.extend(body);
	packet
}

/// Builds a framed Handshake packet (id 0x00)
pub fn handshake_packet(protocol_version: u32, host: &str, port: u16, next_state: u32) -> Vec<u8> {
	let mut body = vec![0x00];
	write_varint(&mut body, protocol_version);
	write_string(&mut body, host);
	body.extend_from_slice(&port.to_be_bytes());
	write_varint(&mut body, next_state);
	frame(body)
}

/// Builds a framed legacy Login Start packet (id 0x00, username only)
pub fn login_start_packet(username: &str) -> Vec<u8> {
	let mut body = vec![0x00];
	write_string(&mut body, username);
	frame(body)
}

/// Builds a framed Status Request packet (id 0x00, no fields)
pub fn status_request_packet() -> Vec<u8> {
	frame(vec![0x00])
}

/// Reads exactly one length-prefixed packet and splits off its id.
pub async fn read_packet<R>(reader: &mut R) -> Result<(u32, Vec<u8>), ProtocolError>
where
	R: AsyncRead + Unpin,
{
	let length = read_varint(reader).await?;
	if length == 0 {
		return Err(ProtocolError::EmptyPacket);
	}
	if length > MAX_PACKET_LENGTH {
		return Err(ProtocolError::PacketTooLarge(length));
	}

	// WARNING: Don't allocate based on what the server says it will send.
	// Let the buffer grow with what actually arrives.
	let mut data = Vec::new();
	reader.take(length as u64).read_to_end(&mut data).await?;
	if data.len() < length as usize {
		return Err(ProtocolError::UnexpectedEof);
	}

	let (packet_id, id_length) = crate::varint::decode_varint(&data)?;
	data.drain(..id_length);

	Ok((packet_id, data))
}

/// Maps the first login-phase packet id onto a verdict
pub fn classify_login_packet(packet_id: u32, policy: DisconnectPolicy) -> AuthMode {
	match packet_id {
		ENCRYPTION_REQUEST => AuthMode::Premium,
		LOGIN_SUCCESS | SET_COMPRESSION => AuthMode::NonPremium,
		LOGIN_DISCONNECT => match policy {
			DisconnectPolicy::NonPremium => AuthMode::NonPremium,
			DisconnectPolicy::Unknown => AuthMode::Unknown,
		},
		_ => AuthMode::Unknown,
	}
}

#[derive(Debug, Clone)]
pub struct LoginProbe {
	pub protocol_version: u32,
	pub username: String,
	pub timeout: Duration,
	pub disconnect_policy: DisconnectPolicy,
}

impl Default for LoginProbe {
	fn default() -> Self {
		Self {
			protocol_version: LEGACY_PROTOCOL_VERSION,
			username: "RegistryProbe".to_string(),
			timeout: Duration::from_secs(5),
			disconnect_policy: DisconnectPolicy::default(),
		}
	}
}

impl LoginProbe {
	/// Connects, starts a login and classifies the server from its reply.
	///
	/// Never fails: transport problems are [`AuthMode::Offline`], anything
	/// that goes wrong after the connection is up is [`AuthMode::Unknown`].
	pub async fn probe_auth_mode(&self, address: &ServerAddress) -> AuthMode {
		let (host, port) = (address.host(), address.port());

		let mut stream = match timeout(self.timeout, TcpStream::connect((host, port))).await {
			Ok(Ok(stream)) => stream,
			Ok(Err(e)) => {
				debug!("[{address}] Connection failed: {e}");
				return AuthMode::Offline;
			}
			Err(_) => {
				debug!("[{address}] Connection timed out");
				return AuthMode::Offline;
			}
		};

		let verdict = match timeout(self.timeout, self.exchange(&mut stream, host, port)).await {
			Ok(Ok(packet_id)) => {
				debug!("[{address}] Login answered with packet id {packet_id:#04x}");
				classify_login_packet(packet_id, self.disconnect_policy)
			}
			Ok(Err(e)) => {
				debug!("[{address}] Login probe failed: {e}");
				AuthMode::Unknown
			}
			Err(_) => {
				debug!("[{address}] Server accepted the connection but never answered the login");
				AuthMode::Unknown
			}
		};

		// Close errors are irrelevant to the verdict
		let _ = stream.shutdown().await;

		verdict
	}

	async fn exchange(
		&self,
		stream: &mut TcpStream,
		host: &str,
		port: u16,
	) -> Result<u32, ProtocolError> {
		let mut request = handshake_packet(self.protocol_version, host, port, LOGIN_STATE);
		request.extend(login_start_packet(&self.username));
		stream.write_all(&request).await?;
		stream.flush().await?;

		let (packet_id, _) = read_packet(stream).await?;
		Ok(packet_id)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn handshake_layout_is_bit_exact() {
		let packet = handshake_packet(47, "localhost", 25565, LOGIN_STATE);
		let mut expected = vec![
			15,   // length
			0x00, // packet id
			47,   // protocol version
			9,    // host length
		];
		expected.extend_from_slice(b"localhost");
		expected.extend_from_slice(&[0x63, 0xDD]); // 25565 big-endian
		expected.push(2); // next state: login
		assert_eq!(packet, expected);
	}

	#[test]
	fn handshake_encodes_multibyte_protocol_version() {
		let packet = handshake_packet(763, "a", 1, STATUS_STATE);
		assert_eq!(packet, vec![8, 0x00, 0xFB, 0x05, 1, b'a', 0x00, 0x01, 1]);
	}

	#[test]
	fn login_start_has_no_uuid() {
		assert_eq!(
			login_start_packet("Probe"),
			vec![7, 0x00, 5, b'P', b'r', b'o', b'b', b'e']
		);
	}

	#[test]
	fn status_request_is_two_bytes() {
		assert_eq!(status_request_packet(), vec![1, 0]);
	}

	#[test]
	fn packet_ids_map_to_verdicts() {
		let policy = DisconnectPolicy::NonPremium;
		assert_eq!(classify_login_packet(0x01, policy), AuthMode::Premium);
		assert_eq!(classify_login_packet(0x02, policy), AuthMode::NonPremium);
		assert_eq!(classify_login_packet(0x03, policy), AuthMode::NonPremium);
		assert_eq!(classify_login_packet(0x00, policy), AuthMode::NonPremium);
		assert_eq!(classify_login_packet(0x04, policy), AuthMode::Unknown);
		assert_eq!(classify_login_packet(0x7F, policy), AuthMode::Unknown);
	}

	#[test]
	fn disconnect_policy_can_defer() {
		assert_eq!(
			classify_login_packet(0x00, DisconnectPolicy::Unknown),
			AuthMode::Unknown
		);
		assert_eq!(
			classify_login_packet(0x01, DisconnectPolicy::Unknown),
			AuthMode::Premium
		);
	}

	#[tokio::test]
	async fn reads_one_framed_packet() {
		let mut bytes: &[u8] = &[3, 0x01, 0xAA, 0xBB, 9, 9];
		let (id, payload) = read_packet(&mut bytes).await.unwrap();
		assert_eq!(id, 0x01);
		assert_eq!(payload, vec![0xAA, 0xBB]);
		// Trailing bytes stay in the stream
		assert_eq!(bytes, &[9, 9]);
	}

	#[tokio::test]
	async fn zero_length_is_empty_packet() {
		let mut bytes: &[u8] = &[0];
		assert!(matches!(
			read_packet(&mut bytes).await,
			Err(ProtocolError::EmptyPacket)
		));
	}

	#[tokio::test]
	async fn short_body_is_unexpected_eof() {
		let mut bytes: &[u8] = &[10, 0x02, 0x00];
		assert!(matches!(
			read_packet(&mut bytes).await,
			Err(ProtocolError::UnexpectedEof)
		));
	}

	#[tokio::test]
	async fn truncated_length_prefix_is_unexpected_eof() {
		let mut bytes: &[u8] = &[0x80];
		assert!(matches!(
			read_packet(&mut bytes).await,
			Err(ProtocolError::UnexpectedEof)
		));
	}

	#[tokio::test]
	async fn oversized_length_is_rejected() {
		let mut bytes: &[u8] = &[0xFF, 0xFF, 0xFF, 0x0F];
		assert!(matches!(
			read_packet(&mut bytes).await,
			Err(ProtocolError::PacketTooLarge(_))
		));
	}
}
