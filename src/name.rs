//! Peer naming.
//!
//! Every router instance carries a fixed 8-byte `PeerName`, generated once
//! at startup (or configured) and globally unique with overwhelming
//! probability. Names are totally ordered, which gives deterministic
//! tie-breaking for route selection and simultaneous-dial resolution, and
//! binary-comparable so they can prefix UDP datagrams on the wire.

use rand::Rng;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Size of a peer name on the wire, in bytes.
pub const NAME_SIZE: usize = 8;

/// Errors from parsing a peer name.
#[derive(Debug, Error)]
pub enum NameError {
    #[error("invalid peer name length: expected {NAME_SIZE} bytes, got {0}")]
    InvalidLength(usize),

    #[error("invalid peer name '{0}': expected {NAME_SIZE} colon-separated hex octets")]
    InvalidFormat(String),

    #[error("invalid hex in peer name: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// 8-byte globally-unique router identifier.
///
/// Displayed as colon-separated hex octets (`7a:11:e4:...`), in the style
/// of a hardware address but two octets longer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerName([u8; NAME_SIZE]);

impl PeerName {
    /// Create a PeerName from an 8-byte array.
    pub fn from_bytes(bytes: [u8; NAME_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a PeerName from a slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self, NameError> {
        if slice.len() != NAME_SIZE {
            return Err(NameError::InvalidLength(slice.len()));
        }
        let mut bytes = [0u8; NAME_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Generate a random PeerName.
    pub fn random() -> Self {
        let mut bytes = [0u8; NAME_SIZE];
        rand::thread_rng().fill(&mut bytes);
        Self(bytes)
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; NAME_SIZE] {
        &self.0
    }

    /// Return the bytes as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for PeerName {
    type Err = NameError;

    /// Parse from colon-separated hex octets, e.g. `00:11:22:33:44:55:66:77`.
    fn from_str(s: &str) -> Result<Self, NameError> {
        let octets: Vec<&str> = s.split(':').collect();
        if octets.len() != NAME_SIZE {
            return Err(NameError::InvalidFormat(s.to_string()));
        }
        let mut bytes = [0u8; NAME_SIZE];
        for (i, octet) in octets.iter().enumerate() {
            if octet.len() != 2 {
                return Err(NameError::InvalidFormat(s.to_string()));
            }
            let decoded = hex::decode(octet)?;
            bytes[i] = decoded[0];
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{:02x}", b)).collect();
        write!(f, "{}", parts.join(":"))
    }
}

impl fmt::Debug for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerName({})", self)
    }
}

impl AsRef<[u8]> for PeerName {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_display_parse() {
        let name = PeerName::from_bytes([0, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0xff]);
        assert_eq!(name.to_string(), "00:11:22:33:44:55:66:ff");
        let parsed: PeerName = name.to_string().parse().unwrap();
        assert_eq!(parsed, name);
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        assert!(matches!(
            PeerName::from_slice(&[1, 2, 3]),
            Err(NameError::InvalidLength(3))
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("not-a-name".parse::<PeerName>().is_err());
        assert!("00:11:22:33:44:55:66".parse::<PeerName>().is_err());
        assert!("00:11:22:33:44:55:66:zz".parse::<PeerName>().is_err());
    }

    #[test]
    fn test_ordering_is_byte_lexicographic() {
        let a = PeerName::from_bytes([0, 0, 0, 0, 0, 0, 0, 1]);
        let b = PeerName::from_bytes([0, 0, 0, 0, 0, 0, 0, 2]);
        let c = PeerName::from_bytes([1, 0, 0, 0, 0, 0, 0, 0]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_random_names_differ() {
        assert_ne!(PeerName::random(), PeerName::random());
    }
}
