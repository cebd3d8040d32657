use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, Payload},
};

use super::keys::{Dek, Iv};
use crate::error::{Error, Result};

/// Output of a local envelope encryption. The DEK is handed to the
/// backend for wrapping and then dropped (zeroized).
#[derive(Debug)]
pub struct Sealed {
    pub dek: Dek,
    pub iv: Iv,
    /// AES-GCM output, tag appended.
    pub ciphertext: Vec<u8>,
}

/// Encrypt `plaintext` under a fresh DEK and IV.
pub fn encrypt(plaintext: &[u8], aad: Option<&[u8]>) -> Result<Sealed> {
    let dek = Dek::generate()?;
    let iv = Iv::generate()?;
    let cipher =
        Aes256Gcm::new_from_slice(dek.as_bytes()).map_err(|e| Error::CipherFailure(e.to_string()))?;
    let payload = Payload {
        msg: plaintext,
        aad: aad.unwrap_or_default(),
    };
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(iv.as_bytes()), payload)
        .map_err(|e| Error::CipherFailure(format!("envelope encrypt failed: {e}")))?;
    Ok(Sealed { dek, iv, ciphertext })
}

/// Decrypt an envelope ciphertext with an unwrapped DEK.
pub fn decrypt(dek: &[u8], iv: &[u8], ciphertext: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>> {
    let dek = Dek::from_slice(dek)?;
    let iv = Iv::from_slice(iv)?;
    let cipher =
        Aes256Gcm::new_from_slice(dek.as_bytes()).map_err(|e| Error::CipherFailure(e.to_string()))?;
    let payload = Payload {
        msg: ciphertext,
        aad: aad.unwrap_or_default(),
    };
    // aes-gcm reports every open failure as an opaque error; with key and
    // nonce sizes checked above that can only be the tag.
    cipher
        .decrypt(Nonce::from_slice(iv.as_bytes()), payload)
        .map_err(|_| Error::AuthTagMismatch)
}
