//! Node identity tokens.
//!
//! A token is the BLAKE3 keyed hash of the node id under the coordinator's
//! identity secret. A node presenting `(node_id, token)` in `hello` proves it
//! was issued that id by this coordinator and resumes its session.

use crate::types::NodeId;

#[derive(Clone)]
pub struct IdentityKey {
    key: [u8; 32],
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity secret must be 64 hex characters: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("identity secret must be 32 bytes, got {0}")]
    WrongLength(usize),
}

impl IdentityKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Random key. Tokens issued under it do not survive a restart.
    pub fn generate() -> Self {
        Self { key: rand::random() }
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(hex_str.trim())?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::WrongLength(bytes.len()))?;
        Ok(Self { key })
    }

    /// Issue the token for `node_id`.
    pub fn issue(&self, node_id: &NodeId) -> String {
        blake3::keyed_hash(&self.key, node_id.as_str().as_bytes()).to_hex().to_string()
    }

    /// Constant-time check of a presented token.
    pub fn verify(&self, node_id: &NodeId, token: &str) -> bool {
        let Ok(bytes) = hex::decode(token) else {
            return false;
        };
        let Ok(presented) = <[u8; 32]>::try_from(bytes.as_slice()) else {
            return false;
        };
        blake3::keyed_hash(&self.key, node_id.as_str().as_bytes()) == blake3::Hash::from(presented)
    }
}
