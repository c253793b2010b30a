//! Wire encoding for the upstream chat body.
//!
//! The upstream expects the JSON payload as a base64 string whose two halves
//! are interleaved character by character, wrapped as `{"__data__": "..."}`.
//! This is obfuscation only; anyone can reverse it with [`decode`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid base64 after de-interleaving: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("decoded payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Serialize `payload` compactly and apply the split-interleave transform.
pub fn encode<T: Serialize + ?Sized>(payload: &T) -> serde_json::Result<String> {
    let json = serde_json::to_string(payload)?;
    Ok(interleave(&BASE64.encode(json.as_bytes())))
}

/// Wrap an encoded string in the envelope the chat endpoint accepts.
pub fn wrap(encoded: String) -> Value {
    serde_json::json!({ "__data__": encoded })
}

/// Reverse [`encode`], returning the compact JSON text.
pub fn decode(encoded: &str) -> Result<String, DecodeError> {
    let b64 = deinterleave(encoded);
    let bytes = BASE64.decode(b64.as_bytes())?;
    Ok(String::from_utf8(bytes)?)
}

// base64 output is ASCII, so byte indexing is char indexing here.
fn interleave(b64: &str) -> String {
    let bytes = b64.as_bytes();
    let half = bytes.len().div_ceil(2);
    let (first, second) = bytes.split_at(half);

    let mut out = String::with_capacity(bytes.len());
    for (i, &c) in first.iter().enumerate() {
        out.push(c as char);
        if let Some(&d) = second.get(i) {
            out.push(d as char);
        }
    }
    out
}

fn deinterleave(encoded: &str) -> String {
    let mut first = String::with_capacity(encoded.len().div_ceil(2));
    let mut second = String::with_capacity(encoded.len() / 2);
    for (i, c) in encoded.chars().enumerate() {
        if i % 2 == 0 {
            first.push(c);
        } else {
            second.push(c);
        }
    }
    first.push_str(&second);
    first
}
