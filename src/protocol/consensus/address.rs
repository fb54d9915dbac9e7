use std::fmt::Display;
use std::str::FromStr;

use sha2::Digest;
use sha2::Sha256;

/// Characters allowed in a base58-encoded address. Excludes `0`, `O`, `I`
/// and `l`, which base58 drops to avoid transcription mistakes.
const BASE58_CHARS: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

const MIN_ADDRESS_LEN: usize = 26;
const MAX_ADDRESS_LEN: usize = 35;

/// A reward address in its canonical base58 string form.
///
/// The coinbase-eligibility rules treat addresses as opaque strings: the
/// prohibited-set comparison, the balance lookup and the rule-3 hash all
/// operate on the string representation, so that is what this type stores.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(String);

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid address format: {0}")]
pub struct InvalidAddress(pub String);

impl Address {
    /// Parse and validate a candidate address string.
    pub fn parse(s: &str) -> Result<Self, InvalidAddress> {
        let len_ok = (MIN_ADDRESS_LEN..=MAX_ADDRESS_LEN).contains(&s.len());
        let charset_ok = s.chars().all(|c| BASE58_CHARS.contains(c));
        if len_ok && charset_ok {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidAddress(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercase hex encoding of the SHA-256 of the address string. This is
    /// the digest whose suffix rule 3 compares against the block hash.
    pub fn sha256_hex(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl FromStr for Address {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
