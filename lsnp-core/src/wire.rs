//! LSNP text framing: `KEY: value` lines terminated by a blank line, one message per datagram.

use crate::protocol::{keys, Message, Value};

/// Largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// Encode a message: every field except the internal BROADCAST flag, in insertion order.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let mut out = String::new();
    for (key, value) in msg.iter() {
        if key == keys::BROADCAST {
            continue;
        }
        let value = value.to_string();
        if key.contains(['\n', ':']) || value.contains('\n') {
            return Err(FrameEncodeError::InvalidField(key.to_string()));
        }
        out.push_str(key);
        out.push_str(": ");
        out.push_str(&value);
        out.push('\n');
    }
    out.push('\n');
    if out.len() > MAX_DATAGRAM_LEN {
        return Err(FrameEncodeError::TooLarge(out.len()));
    }
    Ok(out.into_bytes())
}

/// Error encoding a message (field that would break framing, or oversized payload).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("field {0:?} cannot be framed")]
    InvalidField(String),
    #[error("encoded message is {0} bytes, larger than a datagram")]
    TooLarge(usize),
}

/// Decode one datagram. Lines without a colon are skipped; digit-only values become integers.
pub fn decode_message(bytes: &[u8]) -> Result<Message, FrameDecodeError> {
    if bytes.len() > MAX_DATAGRAM_LEN {
        return Err(FrameDecodeError::TooLarge(bytes.len()));
    }
    let text = std::str::from_utf8(bytes)?;
    let mut msg = Message::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        msg.insert(key, coerce(value.trim()));
    }
    Ok(msg)
}

fn coerce(value: &str) -> Value {
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        // Digit runs too long for u64 stay textual.
        if let Ok(n) = value.parse::<u64>() {
            return Value::Int(n);
        }
    }
    Value::Text(value.to_string())
}

/// Error decoding a datagram (size limit or non-UTF-8 payload).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("datagram is {0} bytes, larger than allowed")]
    TooLarge(usize),
    #[error("payload is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}
