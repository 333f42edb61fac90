//! Mesh link cipher and authentication response
//!
//! Plejd frames are obfuscated with a keystream XOR: the 16-byte keystream
//! block is the AES-128-ECB encryption of the peer's mesh address repeated
//! to fill one block. The same function encrypts and decrypts.
//!
//! Authentication uses a challenge-response over SHA-256 of the key XORed
//! with the gateway's challenge, folded down to 16 bytes.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{PlejdError, Result};

/// Size of the site-wide mesh key
pub const MESH_KEY_LEN: usize = 16;

/// Size of a mesh address (reversed BLE hardware address)
pub const MESH_ADDRESS_LEN: usize = 6;

/// Shared 16-byte AES key for one Plejd site
#[derive(Clone, PartialEq, Eq)]
pub struct MeshKey([u8; MESH_KEY_LEN]);

impl MeshKey {
    /// Wrap raw key bytes
    pub fn new(bytes: [u8; MESH_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a key from its hex form, as delivered by the cloud API
    /// (dashes are ignored)
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let cleaned: String = hex_key.chars().filter(|c| *c != '-').collect();
        let bytes = hex::decode(cleaned.trim())?;
        let bytes: [u8; MESH_KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            PlejdError::InvalidKey(format!(
                "expected {} bytes, got {}",
                MESH_KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; MESH_KEY_LEN] {
        &self.0
    }
}

impl FromStr for MeshKey {
    type Err = PlejdError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

// Never print key material
impl fmt::Debug for MeshKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MeshKey(**redacted**)")
    }
}

/// Encrypt or decrypt `data` for the link to `mesh_address`.
///
/// `mesh_address` is the peer's BLE hardware address in reversed byte
/// order; the caller is responsible for the reversal.
pub fn encrypt_decrypt(
    key: &MeshKey,
    mesh_address: &[u8; MESH_ADDRESS_LEN],
    data: &[u8],
) -> Vec<u8> {
    let keystream = keystream_block(key, mesh_address);
    data.iter()
        .enumerate()
        .map(|(i, byte)| byte ^ keystream[i % keystream.len()])
        .collect()
}

fn keystream_block(key: &MeshKey, mesh_address: &[u8; MESH_ADDRESS_LEN]) -> [u8; 16] {
    let mut seed = [0u8; 16];
    seed[..6].copy_from_slice(mesh_address);
    seed[6..12].copy_from_slice(mesh_address);
    seed[12..].copy_from_slice(&mesh_address[..4]);

    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut block = GenericArray::clone_from_slice(&seed);
    cipher.encrypt_block(&mut block);

    let mut out = [0u8; 16];
    out.copy_from_slice(&block);
    out
}

/// Compute the authentication response for a gateway challenge.
pub fn challenge_response(key: &MeshKey, challenge: &[u8]) -> Result<[u8; 16]> {
    if challenge.len() != MESH_KEY_LEN {
        return Err(PlejdError::InvalidChallenge(challenge.len()));
    }

    let mixed: Vec<u8> = key
        .as_bytes()
        .iter()
        .zip(challenge)
        .map(|(k, c)| k ^ c)
        .collect();
    let digest = Sha256::digest(&mixed);

    let mut response = [0u8; 16];
    for (i, byte) in response.iter_mut().enumerate() {
        *byte = digest[i] ^ digest[i + 16];
    }
    Ok(response)
}
