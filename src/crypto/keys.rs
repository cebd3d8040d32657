use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

pub const DEK_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// A 256-bit data encryption key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Dek {
    bytes: [u8; DEK_LEN],
}

/// AES-GCM nonce, fresh per encryption.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Iv([u8; IV_LEN]);

impl Dek {
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; DEK_LEN];
        fill_random(&mut bytes)?;
        Ok(Self { bytes })
    }

    pub fn from_bytes(bytes: [u8; DEK_LEN]) -> Self {
        Self { bytes }
    }

    /// Rebuild a DEK returned by a backend unwrap.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; DEK_LEN] = bytes.try_into().map_err(|_| Error::InvalidKeySize {
            expected: DEK_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; DEK_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for Dek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Dek(***)")
    }
}

impl Iv {
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; IV_LEN];
        fill_random(&mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; IV_LEN] = bytes.try_into().map_err(|_| Error::InvalidIvSize {
            expected: IV_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; IV_LEN] {
        &self.0
    }
}

fn fill_random(buf: &mut [u8]) -> Result<()> {
    getrandom::getrandom(buf).map_err(|e| Error::RandomnessUnavailable(e.to_string()))
}
