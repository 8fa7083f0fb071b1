//! WebSocket frame codec for the live channel.
//!
//! Implements the subset of RFC 6455 framing the hub speaks, directly over
//! the byte stream:
//!
//! ```text
//! [FIN|RSV|opcode] [MASK|len7] [len16 | len64]? [mask key]? [payload]
//! ```
//!
//! - `len7 <= 125`: length is inline
//! - `len7 == 126`: 16-bit big-endian extended length follows
//! - `len7 == 127`: 64-bit big-endian extended length follows
//!
//! Server-to-client frames are never masked. Client frames usually are and
//! get unmasked here. Only unfragmented text, close, ping and pong are
//! surfaced. Any other opcode (binary, continuation, reserved) is skipped,
//! and so is a text frame without FIN: the first fragment of a message the
//! hub never reassembles.

use thiserror::Error;

use crate::constants::MAX_FRAME_PAYLOAD;

/// Frame opcodes.
pub mod opcode {
    /// Continuation of a fragmented message.
    pub const CONTINUATION: u8 = 0x0;
    /// UTF-8 text frame.
    pub const TEXT: u8 = 0x1;
    /// Binary frame.
    pub const BINARY: u8 = 0x2;
    /// Connection close.
    pub const CLOSE: u8 = 0x8;
    /// Ping.
    pub const PING: u8 = 0x9;
    /// Pong.
    pub const PONG: u8 = 0xA;
}

/// Close status codes.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint is going away (hub shutdown, peer evicted).
    pub const GOING_AWAY: u16 = 1001;
    /// Peer violated the framing protocol.
    pub const PROTOCOL_ERROR: u16 = 1002;
}

/// A decoded message from the live channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text frame.
    Text(String),
    /// Ping with its application data.
    Ping(Vec<u8>),
    /// Pong with its application data.
    Pong(Vec<u8>),
    /// Close with the status code, if the peer sent one.
    Close(Option<u16>),
}

/// Errors the decoder cannot recover from.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Declared payload exceeds [`MAX_FRAME_PAYLOAD`].
    #[error("frame payload too large: {0} bytes (max {MAX_FRAME_PAYLOAD})")]
    TooLarge(u64),
}

/// Encode a text frame.
pub fn encode_text(payload: &str) -> Vec<u8> {
    encode_frame(opcode::TEXT, payload.as_bytes())
}

/// Encode a close frame carrying `code`.
pub fn encode_close(code: u16) -> Vec<u8> {
    encode_frame(opcode::CLOSE, &code.to_be_bytes())
}

/// Encode a ping frame.
pub fn encode_ping(payload: &[u8]) -> Vec<u8> {
    encode_frame(opcode::PING, payload)
}

/// Encode a pong frame echoing `payload`.
pub fn encode_pong(payload: &[u8]) -> Vec<u8> {
    encode_frame(opcode::PONG, payload)
}

/// Encode a single unmasked, unfragmented frame.
fn encode_frame(op: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut buf = Vec::with_capacity(len + 10);
    buf.push(0x80 | op);

    if len <= 125 {
        buf.push(len as u8);
    } else if let Ok(len16) = u16::try_from(len) {
        buf.push(126);
        buf.extend_from_slice(&len16.to_be_bytes());
    } else {
        buf.push(127);
        buf.extend_from_slice(&(len as u64).to_be_bytes());
    }

    buf.extend_from_slice(payload);
    buf
}

/// Parsed frame header.
#[derive(Debug)]
struct Header {
    fin: bool,
    opcode: u8,
    header_len: usize,
    payload_len: usize,
    mask: Option<[u8; 4]>,
}

/// Parse the header at the start of `buf`.
///
/// Returns `Ok(None)` when the header itself is not fully buffered yet.
fn parse_header(buf: &[u8]) -> Result<Option<Header>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & 0x80 != 0;
    let opcode = buf[0] & 0x0F;
    let masked = buf[1] & 0x80 != 0;
    let len7 = buf[1] & 0x7F;

    let (declared, mut header_len) = match len7 {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut len = [0u8; 8];
            len.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(len), 10)
        }
        n => (u64::from(n), 2),
    };

    if declared > MAX_FRAME_PAYLOAD {
        return Err(FrameError::TooLarge(declared));
    }

    let mask = if masked {
        if buf.len() < header_len + 4 {
            return Ok(None);
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&buf[header_len..header_len + 4]);
        header_len += 4;
        Some(key)
    } else {
        None
    };

    Ok(Some(Header {
        fin,
        opcode,
        header_len,
        // Bounded by MAX_FRAME_PAYLOAD above.
        payload_len: declared as usize,
        mask,
    }))
}

/// Decode every complete frame at the front of `buf`.
///
/// Returns the decoded messages and the unconsumed remainder. A frame whose
/// declared length runs past the end of `buf` stops decoding; it and
/// everything after it come back as the remainder for the next read.
///
/// # Errors
///
/// Returns [`FrameError::TooLarge`] if a frame declares an oversized payload.
pub fn decode(buf: &[u8]) -> Result<(Vec<Message>, &[u8]), FrameError> {
    let mut messages = Vec::new();
    let mut offset = 0;

    loop {
        let rest = &buf[offset..];
        let Some(header) = parse_header(rest)? else {
            break;
        };

        let total = header.header_len + header.payload_len;
        if rest.len() < total {
            break;
        }

        let mut payload = rest[header.header_len..total].to_vec();
        if let Some(key) = header.mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }
        offset += total;

        let message = match header.opcode {
            opcode::TEXT if !header.fin => {
                log::debug!("[Live] Skipping fragmented text frame");
                continue;
            }
            opcode::TEXT => Message::Text(String::from_utf8_lossy(&payload).into_owned()),
            opcode::CLOSE => {
                let code = (payload.len() >= 2).then(|| u16::from_be_bytes([payload[0], payload[1]]));
                Message::Close(code)
            }
            opcode::PING => Message::Ping(payload),
            opcode::PONG => Message::Pong(payload),
            other => {
                log::debug!("[Live] Skipping frame with opcode 0x{other:x}");
                continue;
            }
        };
        messages.push(message);
    }

    Ok((messages, &buf[offset..]))
}

/// Incremental decoder that buffers partial frames across reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a decoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and extract every message that is now complete.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame is oversized. The decoder should be
    /// discarded afterwards.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Message>, FrameError> {
        self.buf.extend_from_slice(bytes);
        let (messages, remaining) = {
            let (messages, rest) = decode(&self.buf)?;
            (messages, rest.len())
        };
        let consumed = self.buf.len() - remaining;
        self.buf.drain(..consumed);
        Ok(messages)
    }

    /// Returns true if part of a frame is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a client-style masked frame.
    fn masked_frame(op: u8, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        let mut buf = vec![0x80 | op];
        let len = payload.len();
        if len <= 125 {
            buf.push(0x80 | len as u8);
        } else if len <= 65535 {
            buf.push(0x80 | 126);
            buf.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            buf.push(0x80 | 127);
            buf.extend_from_slice(&(len as u64).to_be_bytes());
        }
        buf.extend_from_slice(&key);
        buf.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        buf
    }

    #[test]
    fn test_text_round_trip_at_boundary_lengths() {
        for len in [0usize, 1, 125, 126, 65535, 65536] {
            let payload = "a".repeat(len);
            let encoded = encode_text(&payload);
            let (messages, rest) = decode(&encoded).unwrap();
            assert_eq!(messages, vec![Message::Text(payload)], "len {len}");
            assert!(rest.is_empty(), "len {len} left {} bytes", rest.len());
        }
    }

    #[test]
    fn test_header_width_selection() {
        let header_len = |len: usize| encode_text(&"x".repeat(len)).len() - len;
        assert_eq!(header_len(0), 2);
        assert_eq!(header_len(125), 2);
        assert_eq!(header_len(126), 4);
        assert_eq!(header_len(65535), 4);
        assert_eq!(header_len(65536), 10);

        assert_eq!(encode_text(&"x".repeat(125))[1], 125);
        assert_eq!(encode_text(&"x".repeat(126))[1], 126);
        assert_eq!(encode_text(&"x".repeat(65536))[1], 127);
    }

    #[test]
    fn test_server_frames_are_unmasked_and_final() {
        let encoded = encode_text("hello");
        assert_eq!(encoded[0], 0x81);
        assert_eq!(encoded[1] & 0x80, 0);
    }

    #[test]
    fn test_partial_frame_prefixes_yield_nothing_until_complete() {
        let encoded = encode_text(&"payload ".repeat(40));
        for cut in 0..encoded.len() {
            let (messages, rest) = decode(&encoded[..cut]).unwrap();
            assert!(messages.is_empty(), "cut {cut}");
            assert_eq!(rest.len(), cut);
        }
        let (messages, rest) = decode(&encoded).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_decoder_byte_at_a_time_emits_exactly_once() {
        let encoded = encode_text("{\"type\":\"heartbeat\"}");
        let mut decoder = FrameDecoder::new();
        let mut seen = Vec::new();
        for (i, byte) in encoded.iter().enumerate() {
            let messages = decoder.feed(&[*byte]).unwrap();
            if i < encoded.len() - 1 {
                assert!(messages.is_empty());
                assert!(decoder.has_partial());
            }
            seen.extend(messages);
        }
        assert_eq!(seen, vec![Message::Text("{\"type\":\"heartbeat\"}".into())]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_masked_payload_across_mask_cycles() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        for len in [1usize, 3, 5, 7, 130, 70_001] {
            let payload: String = (0..len).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
            let frame = masked_frame(opcode::TEXT, payload.as_bytes(), key);
            let (messages, rest) = decode(&frame).unwrap();
            assert_eq!(messages, vec![Message::Text(payload)], "len {len}");
            assert!(rest.is_empty());
        }
    }

    #[test]
    fn test_multiple_frames_and_trailing_partial() {
        let mut buf = encode_text("one");
        buf.extend(masked_frame(opcode::PING, b"p", [1, 2, 3, 4]));
        buf.extend(encode_text("two"));
        let partial = encode_text("three");
        buf.extend_from_slice(&partial[..3]);

        let (messages, rest) = decode(&buf).unwrap();
        assert_eq!(
            messages,
            vec![
                Message::Text("one".into()),
                Message::Ping(b"p".to_vec()),
                Message::Text("two".into()),
            ]
        );
        assert_eq!(rest, &partial[..3]);
    }

    #[test]
    fn test_unknown_and_binary_opcodes_are_skipped() {
        let mut buf = masked_frame(opcode::BINARY, b"\x00\x01", [9, 9, 9, 9]);
        buf.extend(masked_frame(0x3, b"reserved", [1, 1, 1, 1]));
        buf.extend(masked_frame(opcode::CONTINUATION, b"cont", [2, 2, 2, 2]));
        buf.extend(masked_frame(opcode::TEXT, b"after", [4, 3, 2, 1]));

        let (messages, rest) = decode(&buf).unwrap();
        assert_eq!(messages, vec![Message::Text("after".into())]);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_fragmented_text_is_skipped_whole() {
        let mut first = masked_frame(opcode::TEXT, b"{\"type\":", [1, 2, 3, 4]);
        first[0] &= 0x7F;
        let mut middle = masked_frame(opcode::CONTINUATION, b"\"heart", [5, 6, 7, 8]);
        middle[0] &= 0x7F;
        let last = masked_frame(opcode::CONTINUATION, b"beat\"}", [9, 9, 9, 9]);

        let mut buf = first;
        buf.extend(middle);
        buf.extend(masked_frame(opcode::PING, b"p", [1, 1, 1, 1]));
        buf.extend(last);
        buf.extend(masked_frame(opcode::TEXT, b"whole", [4, 3, 2, 1]));

        let (messages, rest) = decode(&buf).unwrap();
        assert_eq!(
            messages,
            vec![Message::Ping(b"p".to_vec()), Message::Text("whole".into())]
        );
        assert!(rest.is_empty());
    }

    #[test]
    fn test_close_codes() {
        let (messages, _) = decode(&encode_close(close_code::NORMAL)).unwrap();
        assert_eq!(messages, vec![Message::Close(Some(1000))]);

        let (messages, _) = decode(&encode_close(close_code::GOING_AWAY)).unwrap();
        assert_eq!(messages, vec![Message::Close(Some(1001))]);

        let bare = masked_frame(opcode::CLOSE, b"", [5, 6, 7, 8]);
        let (messages, _) = decode(&bare).unwrap();
        assert_eq!(messages, vec![Message::Close(None)]);
    }

    #[test]
    fn test_ping_pong_payloads() {
        let (messages, _) = decode(&encode_ping(b"are you there")).unwrap();
        assert_eq!(messages, vec![Message::Ping(b"are you there".to_vec())]);
        let (messages, _) = decode(&encode_pong(b"yes")).unwrap();
        assert_eq!(messages, vec![Message::Pong(b"yes".to_vec())]);
    }

    #[test]
    fn test_oversized_frame_rejected_from_header_alone() {
        let mut buf = vec![0x81, 127];
        buf.extend_from_slice(&(MAX_FRAME_PAYLOAD + 1).to_be_bytes());
        assert_eq!(decode(&buf).unwrap_err(), FrameError::TooLarge(MAX_FRAME_PAYLOAD + 1));

        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&buf).is_err());
    }
}
