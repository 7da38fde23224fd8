use crate::*;
use sha2::{Digest, Sha256};
use std::convert::TryInto;
use std::fmt;
use std::str::FromStr;

/// SHA-256 over the exact bytes of a sealed blob.
///
/// Hex-encoded in Display and on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Commitment([u8; 32]);

impl Commitment {
    /// Commit to sealed blob bytes
    pub fn of(sealed: &[u8]) -> Self {
        Commitment(Sha256::digest(sealed).into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Commitment(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Commitment({})", self)
    }
}

impl FromStr for Commitment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|_| Error::InvalidIdentifier(format!("commitment {} is not hex", s)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidIdentifier(format!("commitment {} is not 32 bytes", s)))?;
        Ok(Commitment(bytes))
    }
}

impl serde::Serialize for Commitment {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Commitment {
    fn deserialize<D>(deserializer: D) -> Result<Commitment, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let s = String::deserialize(deserializer)?;
        Commitment::from_str(&s).map_err(|e| D::Error::custom(e.to_string()))
    }
}

/// Opaque transaction id assigned by the ledger when a commitment is recorded.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ReferenceId(String);

impl ReferenceId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        ReferenceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
