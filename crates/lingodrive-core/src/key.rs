//! Drive key validation
//!
//! Users paste drive keys as hex strings. [`validate`] trims surrounding
//! whitespace and decodes the string to its canonical bytes, rejecting empty
//! and malformed input before any network or storage resource is touched.
//!
//! Any even-length hex string is a valid [`DriveKey`]. Replicated drives are
//! addressed by a 32-byte ed25519 public key, which is checked separately by
//! [`DriveKey::require_drive_len`] when a peer-to-peer connection is about to
//! be opened.

use std::fmt;
use std::str::FromStr;

use crate::error::{DriveError, DriveResult, InvalidKeyReason};

/// Byte length of a replicated drive's public key
pub const DRIVE_KEY_LEN: usize = 32;

/// Identifier of a remote drive, in canonical binary form
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriveKey(Vec<u8>);

impl DriveKey {
    /// Build a key from raw bytes
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Number of decoded bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key has no bytes (never true for validated keys)
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lowercase hex form, as shown to users
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Short form for log lines
    pub fn short(&self) -> String {
        let hex = self.to_hex();
        hex.chars().take(8).collect()
    }

    /// The key as a fixed 32-byte drive public key
    pub fn require_drive_len(&self) -> DriveResult<[u8; DRIVE_KEY_LEN]> {
        self.0.as_slice().try_into().map_err(|_| {
            DriveError::InvalidKey(InvalidKeyReason::WrongLength {
                expected: DRIVE_KEY_LEN,
                actual: self.0.len(),
            })
        })
    }
}

impl fmt::Debug for DriveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DriveKey({})", self.to_hex())
    }
}

impl fmt::Display for DriveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for DriveKey {
    type Err = DriveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate(s)
    }
}

impl From<[u8; DRIVE_KEY_LEN]> for DriveKey {
    fn from(bytes: [u8; DRIVE_KEY_LEN]) -> Self {
        Self(bytes.to_vec())
    }
}

/// Validate and normalize a user-supplied drive key.
///
/// # Errors
///
/// - `InvalidKey: empty` for empty or whitespace-only input
/// - `InvalidKey: malformed` for odd-length input or non-hex characters
pub fn validate(raw: &str) -> DriveResult<DriveKey> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DriveError::InvalidKey(InvalidKeyReason::Empty));
    }

    if trimmed.len() % 2 != 0 || !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DriveError::InvalidKey(InvalidKeyReason::Malformed));
    }

    let bytes =
        hex::decode(trimmed).map_err(|_| DriveError::InvalidKey(InvalidKeyReason::Malformed))?;
    Ok(DriveKey(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_short_key_decodes() {
        let key = validate("deadbeef").unwrap();
        assert_eq!(key.as_bytes(), &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(key.len(), 4);
    }

    #[test]
    fn test_odd_length_is_malformed() {
        let err = validate("deadbee").unwrap_err();
        assert!(matches!(
            err,
            DriveError::InvalidKey(InvalidKeyReason::Malformed)
        ));
    }

    #[test]
    fn test_non_hex_is_malformed() {
        for raw in ["zz", "dead-beef", "0x00", "ab cd"] {
            let err = validate(raw).unwrap_err();
            assert!(
                matches!(err, DriveError::InvalidKey(InvalidKeyReason::Malformed)),
                "{raw:?} should be malformed"
            );
        }
    }

    #[test]
    fn test_empty_and_whitespace() {
        for raw in ["", " ", "\t\n", "   \r\n "] {
            let err = validate(raw).unwrap_err();
            assert!(matches!(err, DriveError::InvalidKey(InvalidKeyReason::Empty)));
        }
    }

    #[test]
    fn test_surrounding_whitespace_is_trimmed() {
        let key = validate("  DEADbeef\n").unwrap();
        assert_eq!(key.to_hex(), "deadbeef");
    }

    #[test]
    fn test_require_drive_len() {
        let short = validate("deadbeef").unwrap();
        let err = short.require_drive_len().unwrap_err();
        assert!(matches!(
            err,
            DriveError::InvalidKey(InvalidKeyReason::WrongLength {
                expected: 32,
                actual: 4
            })
        ));

        let full = validate(&"ab".repeat(32)).unwrap();
        assert_eq!(full.require_drive_len().unwrap(), [0xab; 32]);
    }

    #[test]
    fn test_from_str() {
        let key: DriveKey = "00ff".parse().unwrap();
        assert_eq!(key.as_bytes(), &[0x00, 0xff]);
        assert!("0".parse::<DriveKey>().is_err());
    }
}
