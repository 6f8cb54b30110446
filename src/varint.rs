use crate::protocol::ProtocolError;
use tokio::io::{AsyncRead, AsyncReadExt};

/// A 32-bit value never takes more than 5 bytes to encode
pub const MAX_VARINT_LEN: usize = 5;

pub fn encode_varint(value: u32) -> Vec<u8> {
	let mut out = Vec::with_capacity(MAX_VARINT_LEN);
	write_varint(&mut out, value);
	out
}

pub fn write_varint(buffer: &mut Vec<u8>, mut value: u32) {
	loop {
		let byte = (value & 0x7F) as u8;
		value >>= 7;

		if value == 0 {
			buffer.push(byte);
			return;
		}

		buffer.push(byte | 0x80);
	}
}

/// Writes a VarInt length prefix followed by the UTF-8 bytes of `value`
pub fn write_string(buffer: &mut Vec<u8>, value: &str) {
	write_varint(buffer, value.len() as u32);
	buffer.extend_from_slice(value.as_bytes());
}

// returns the decoded varint and how many bytes were read
pub fn decode_varint(bytes: &[u8]) -> Result<(u32, usize), ProtocolError> {
	let mut value: u32 = 0;

	for (index, byte) in bytes.iter().take(MAX_VARINT_LEN).enumerate() {
		// The 5th byte may only carry the top 4 bits of a u32
		if index == MAX_VARINT_LEN - 1 && byte & 0xF0 != 0 {
			return Err(ProtocolError::MalformedVarInt);
		}

		value |= ((byte & 0x7F) as u32) << (7 * index);

		if byte & 0x80 == 0 {
			return Ok((value, index + 1));
		}
	}

	// Either 5 continuation bytes or the slice ended mid-varint
	Err(ProtocolError::MalformedVarInt)
}

/// Reads a VarInt one byte at a time from a stream
pub async fn read_varint<R>(reader: &mut R) -> Result<u32, ProtocolError>
where
	R: AsyncRead + Unpin,
{
	let mut value: u32 = 0;

	for index in 0..MAX_VARINT_LEN {
		let byte = match reader.read_u8().await {
			Ok(byte) => byte,
			Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
				return Err(ProtocolError::UnexpectedEof)
			}
			Err(e) => return Err(e.into()),
		};

		if index == MAX_VARINT_LEN - 1 && byte & 0xF0 != 0 {
			return Err(ProtocolError::MalformedVarInt);
		}

		value |= ((byte & 0x7F) as u32) << (7 * index);

		if byte & 0x80 == 0 {
			return Ok(value);
		}
	}

	Err(ProtocolError::MalformedVarInt)
}
