//! Seal/unseal wrapping core: envelope encryption of small secrets under a
//! remote key-management service.
//!
//! A [`WrappingService`] is configured with one backend (AWS KMS, Azure
//! Key Vault, GCP Cloud KMS, Vault Transit or the in-process mock). Each
//! `encrypt` seals the plaintext with AES-256-GCM under a fresh data key
//! and asks the backend to wrap that key; the result is a [`BlobInfo`]
//! the host persists, typically through [`codec::encode`].

pub mod blob;
pub mod codec;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod kms;
pub mod lifecycle;
pub mod metadata;
pub mod service;

pub use blob::{BlobInfo, KeyInfo, Mechanism};
pub use config::Options;
pub use context::Context;
pub use error::{Error, ErrorKind, Result};
pub use kms::{BackendType, KmsBackend, WrappedKey};
pub use lifecycle::State;
pub use service::WrappingService;
