use std::fmt;

/// How the ciphertext in a [`BlobInfo`] was produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mechanism {
    /// The backend encrypted the plaintext itself; no local envelope.
    DirectEncrypt,
    /// AES-256-GCM under a DEK that the backend wrapped.
    EnvelopeAesGcm,
    /// A tag written by a newer version. Never decrypted.
    Unknown(u32),
}

impl Mechanism {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Mechanism::DirectEncrypt,
            1 => Mechanism::EnvelopeAesGcm,
            other => Mechanism::Unknown(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Mechanism::DirectEncrypt => 0,
            Mechanism::EnvelopeAesGcm => 1,
            Mechanism::Unknown(code) => code,
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mechanism::DirectEncrypt => f.write_str("direct-encrypt"),
            Mechanism::EnvelopeAesGcm => f.write_str("envelope-aes-gcm"),
            Mechanism::Unknown(code) => write!(f, "unknown({code})"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyInfo {
    pub mechanism: Mechanism,
    /// Remote key version that wrapped `wrapped_key`.
    pub key_id: String,
    pub wrapped_key: Vec<u8>,
}

/// The persisted envelope. Produced by the wrapping service, owned by the
/// host afterwards.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlobInfo {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    /// Absent for legacy blobs written before envelopes were used.
    pub key_info: Option<KeyInfo>,
}

impl BlobInfo {
    /// A legacy blob holding only backend-encrypted ciphertext.
    pub fn direct(ciphertext: Vec<u8>) -> Self {
        Self {
            ciphertext,
            iv: Vec::new(),
            key_info: None,
        }
    }

    /// Always defined: a blob without key info is direct-encrypt.
    pub fn mechanism(&self) -> Mechanism {
        self.key_info
            .as_ref()
            .map_or(Mechanism::DirectEncrypt, |info| info.mechanism)
    }

    pub fn key_id(&self) -> Option<&str> {
        self.key_info.as_ref().map(|info| info.key_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_key_info_means_direct_encrypt() {
        let blob = BlobInfo::direct(vec![1, 2, 3]);
        assert_eq!(blob.mechanism(), Mechanism::DirectEncrypt);
        assert_eq!(blob.key_id(), None);
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(Mechanism::from_code(0), Mechanism::DirectEncrypt);
        assert_eq!(Mechanism::from_code(1), Mechanism::EnvelopeAesGcm);
        assert_eq!(Mechanism::from_code(9), Mechanism::Unknown(9));
        assert_eq!(Mechanism::Unknown(9).code(), 9);
        assert_eq!(Mechanism::EnvelopeAesGcm.code(), 1);
    }
}
