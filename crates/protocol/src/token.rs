//! Upload-token generation and validation.
//!
//! A token binds one client upload session to one logical file id for
//! an expiration window. The token string itself is 16 CSPRNG bytes
//! rendered as 32 lowercase hex characters.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::constants::TOKEN_HEX_LEN;

/// Opaque session handle issued by the server on `create_file`.
///
/// Required on `verify_hash`, `upload_chunk`, and `merge_file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadToken {
    /// The 32-hex session secret.
    pub token: String,
    /// Server-assigned logical file id this session writes to.
    pub file_id: String,
    /// Chunk size negotiated for the whole session, in bytes.
    pub chunk_size: u64,
    /// Expiry as epoch milliseconds.
    pub expires_at: u64,
}

impl UploadToken {
    /// Returns `true` if the token is expired at `now_ms` (epoch ms).
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }
}

/// Mints a fresh session secret from CSPRNG bytes, rendered as
/// [`TOKEN_HEX_LEN`] lowercase hex characters.
pub fn generate_token() -> String {
    let secret: [u8; TOKEN_HEX_LEN / 2] = rand::thread_rng().gen();
    hex::encode(secret)
}

/// Returns `true` if `s` has the shape of a token (32 lowercase hex).
pub fn is_token_shaped(s: &str) -> bool {
    s.len() == TOKEN_HEX_LEN
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Checks a presented token against the expected one.
///
/// Both sides must be token-shaped; the byte comparison accumulates
/// over the full width so timing does not leak how far a forgery
/// matched.
pub fn validate_token(presented: &str, expected: &str) -> bool {
    if !is_token_shaped(presented) || !is_token_shaped(expected) {
        return false;
    }
    let mismatch = presented
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    mismatch == 0
}
