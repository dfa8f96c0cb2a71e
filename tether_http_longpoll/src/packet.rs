//! Wire format of the long-poll transport.

use serde::{Deserialize, Serialize};

/// One unit of a poll response or a client `POST` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Packet {
    /// An application text frame.
    Message(String),

    /// The sender is closing the session.
    Close,

    /// Keeps a poll alive without carrying data.
    Noop,
}

/// Body of the session-opening response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// The new session's ID, hex encoded.
    pub sid: String,

    /// Largest message the server accepts, in bytes of text.
    pub max_payload: usize,

    /// How long the server holds a poll open before answering `204`.
    pub poll_timeout_ms: u64,
}

/// Bytes a batch spends on one message besides its escaped text:
/// `{"type":"message","data":""}` and a separator.
pub const MESSAGE_OVERHEAD: usize = 29;

/// Upper bound on the body of a batch carrying one message of `len` bytes.
/// JSON escaping turns a control byte into the six-byte `\u00XX`.
#[must_use]
pub const fn max_batch_len(len: usize) -> usize {
    len.saturating_mul(6).saturating_add(MESSAGE_OVERHEAD + 2)
}

/// Size of a message packet carrying `text` once encoded in a batch,
/// separator included.
#[must_use]
pub fn message_len(text: &str) -> usize {
    let escaped: usize = text
        .bytes()
        .map(|b| match b {
            b'"' | b'\\' | b'\n' | b'\r' | b'\t' | 0x08 | 0x0c => 2,
            0x00..=0x1f => 6,
            _ => 1,
        })
        .sum();
    escaped + MESSAGE_OVERHEAD
}

/// Encode a batch as a JSON array.
///
/// # Errors
///
/// Fails only if serialization itself fails.
pub fn encode_batch(packets: &[Packet]) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(packets)
}

/// Decode a JSON array of packets.
///
/// # Errors
///
/// Returns the parse error for anything that is not a packet array.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Packet>, serde_json::Error> {
    serde_json::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packets_use_tagged_json() -> Result<(), serde_json::Error> {
        let bytes = encode_batch(&[Packet::Message("hi".into()), Packet::Close])?;
        assert_eq!(
            std::str::from_utf8(&bytes).ok(),
            Some(r#"[{"type":"message","data":"hi"},{"type":"close"}]"#)
        );
        Ok(())
    }

    #[test]
    fn decodes_noop_and_message() -> Result<(), serde_json::Error> {
        let packets = decode_batch(br#"[{"type":"noop"},{"type":"message","data":"x"}]"#)?;
        assert_eq!(packets, vec![Packet::Noop, Packet::Message("x".into())]);
        Ok(())
    }

    #[test]
    fn rejects_unknown_packet_types() {
        assert!(decode_batch(br#"[{"type":"upgrade"}]"#).is_err());
        assert!(decode_batch(b"not json").is_err());
    }

    #[test]
    fn batch_bound_covers_fully_escaped_messages() -> Result<(), serde_json::Error> {
        let plain = encode_batch(&[Packet::Message("x".repeat(8))])?;
        assert_eq!(plain.len(), 8 + MESSAGE_OVERHEAD + 1);

        let escaped = encode_batch(&[Packet::Message("\u{1}".repeat(8))])?;
        assert_eq!(escaped.len(), max_batch_len(8) - 1);
        assert!(escaped.len() <= max_batch_len(8));

        assert_eq!(message_len("ab"), 2 + MESSAGE_OVERHEAD);
        Ok(())
    }

    #[test]
    fn message_len_matches_the_encoding() -> Result<(), serde_json::Error> {
        for text in ["", "plain", "quote\" and \\ slash", "tab\tline\n", "\u{7}bell", "näive ✓"] {
            let batch = encode_batch(&[Packet::Message(text.into())])?;
            assert_eq!(batch.len(), message_len(text) + 1, "{text:?}");
        }
        Ok(())
    }

    #[test]
    fn handshake_uses_camel_case() -> Result<(), serde_json::Error> {
        let json = serde_json::to_string(&Handshake {
            sid: "ab".into(),
            max_payload: 10,
            poll_timeout_ms: 25_000,
        })?;
        assert_eq!(json, r#"{"sid":"ab","maxPayload":10,"pollTimeoutMs":25000}"#);
        Ok(())
    }
}
