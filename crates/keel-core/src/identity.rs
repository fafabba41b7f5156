//! Content-derived contract identities
//!
//! A [`ContractId`] is the SHA-256 digest of the deployed module bytes, so
//! identical modules always share an identity and distinct modules never do
//! (with overwhelming probability).

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Length of a contract identity in bytes
pub const CONTRACT_ID_LEN: usize = 32;

/// 32-byte identity of a deployed contract
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ContractId([u8; CONTRACT_ID_LEN]);

impl ContractId {
    /// Derive the identity of a module from its bytes
    pub fn for_module(code: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(code);
        ContractId(hasher.finalize().into())
    }

    pub const fn from_bytes(bytes: [u8; CONTRACT_ID_LEN]) -> Self {
        ContractId(bytes)
    }

    /// Build an identity from a raw slice taken off the boundary.
    ///
    /// Rejects slices that are not exactly 32 bytes and the all-zero null
    /// identity.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::InvalidArgument("contract identity is empty".into()));
        }
        let array: [u8; CONTRACT_ID_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidArgument(format!(
                "contract identity must be {} bytes, got {}",
                CONTRACT_ID_LEN,
                bytes.len()
            ))
        })?;
        let id = ContractId(array);
        if id.is_null() {
            return Err(Error::InvalidArgument("null contract identity".into()));
        }
        Ok(id)
    }

    pub fn as_bytes(&self) -> &[u8; CONTRACT_ID_LEN] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, used in log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContractId({})", self.to_hex())
    }
}

impl FromStr for ContractId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| Error::InvalidArgument(format!("contract identity is not hex: {}", e)))?;
        ContractId::from_slice(&bytes)
    }
}
