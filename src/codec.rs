//! Binary container for [`BlobInfo`].
//!
//! ```text
//! [ magic "SEALBLOB" (8) | version u32 LE | bincode(WireBlob) ]
//! ```
//!
//! The body keeps the canonical field order `mechanism, keyId,
//! wrappedKey, iv, ciphertext`. A blob without key info encodes the
//! option as `None`, so it decodes back to an absent `key_info`.

use bincode::Options;

use crate::{
    blob::{BlobInfo, KeyInfo, Mechanism},
    error::{Error, Result},
};

const BLOB_MAGIC: &[u8; 8] = b"SEALBLOB";
const BLOB_VERSION: u32 = 1;
const HEADER_LEN: usize = BLOB_MAGIC.len() + 4;

#[derive(serde::Serialize, serde::Deserialize)]
struct WireKeyInfo {
    mechanism: u32,
    key_id: String,
    wrapped_key: Vec<u8>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct WireBlob {
    key_info: Option<WireKeyInfo>,
    iv: Vec<u8>,
    ciphertext: Vec<u8>,
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

pub fn encode(blob: &BlobInfo) -> Result<Vec<u8>> {
    let wire = WireBlob {
        key_info: blob.key_info.as_ref().map(|info| WireKeyInfo {
            mechanism: info.mechanism.code(),
            key_id: info.key_id.clone(),
            wrapped_key: info.wrapped_key.clone(),
        }),
        iv: blob.iv.clone(),
        ciphertext: blob.ciphertext.clone(),
    };
    let body = wire_options()
        .serialize(&wire)
        .map_err(|e| Error::Internal(format!("blob encode: {e}")))?;

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(BLOB_MAGIC);
    out.extend_from_slice(&BLOB_VERSION.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<BlobInfo> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::MalformedBlob(format!(
            "{} bytes is shorter than the {HEADER_LEN} byte header",
            bytes.len()
        )));
    }
    let (magic, rest) = bytes.split_at(BLOB_MAGIC.len());
    if magic != BLOB_MAGIC {
        return Err(Error::MalformedBlob("bad magic".into()));
    }
    let (version, body) = rest.split_at(4);
    let version = u32::from_le_bytes([version[0], version[1], version[2], version[3]]);
    if version != BLOB_VERSION {
        return Err(Error::MalformedBlob(format!("unsupported format version {version}")));
    }

    let wire: WireBlob = wire_options()
        .deserialize(body)
        .map_err(|e| Error::MalformedBlob(e.to_string()))?;

    Ok(BlobInfo {
        ciphertext: wire.ciphertext,
        iv: wire.iv,
        key_info: wire.key_info.map(|info| KeyInfo {
            mechanism: Mechanism::from_code(info.mechanism),
            key_id: info.key_id,
            wrapped_key: info.wrapped_key,
        }),
    })
}
