//! In-process backend for tests and local smoke runs.
//!
//! A DEK is "wrapped" by XOR with `sha256(key_id)`, so unwrapping with a
//! different version id yields a different (wrong) DEK, which the AEAD
//! layer then rejects. Nothing here is secure.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::{BackendType, KmsBackend, WrappedKey};
use crate::{
    config::{DefaultSource, OptionSpec, Requirement, Resolved},
    context::Context,
    error::{Error, Result},
};

pub const DEFAULT_KEY_ID: &str = "mock-key";

pub static OPTIONS: &[OptionSpec] = &[OptionSpec {
    name: "key_id",
    env: &["KMS_KEY_ID"],
    requirement: Requirement::Optional,
    default: DefaultSource::Static(DEFAULT_KEY_ID),
}];

const DIRECT_PAD_LABEL: &[u8] = b"mock-direct-encrypt";

struct Script {
    versions: Vec<String>,
    /// Index of the version the next wrap reports.
    cursor: usize,
    wrap_failure: Option<Error>,
    wrap_delay: Duration,
}

impl Script {
    fn current(&self) -> &str {
        &self.versions[self.cursor]
    }

    fn advance(&mut self) -> String {
        let id = self.versions[self.cursor].clone();
        if self.cursor + 1 < self.versions.len() {
            self.cursor += 1;
        }
        id
    }
}

#[derive(Default)]
struct Calls {
    describe: AtomicUsize,
    wrap: AtomicUsize,
    unwrap: AtomicUsize,
    direct_decrypt: AtomicUsize,
}

pub struct MockKms {
    script: Mutex<Script>,
    calls: Calls,
    closed: AtomicBool,
    /// Option provenance when built from a resolved option map.
    sources: BTreeMap<String, String>,
}

impl MockKms {
    pub fn new(key_id: impl Into<String>) -> Self {
        Self::with_versions([key_id.into()])
    }

    /// Successive wraps report these ids in order, then keep reporting
    /// the last one. An empty list behaves like [`DEFAULT_KEY_ID`].
    pub fn with_versions<I, S>(versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut versions: Vec<String> = versions.into_iter().map(Into::into).collect();
        if versions.is_empty() {
            versions.push(DEFAULT_KEY_ID.to_string());
        }
        Self {
            script: Mutex::new(Script {
                versions,
                cursor: 0,
                wrap_failure: None,
                wrap_delay: Duration::ZERO,
            }),
            calls: Calls::default(),
            closed: AtomicBool::new(false),
            sources: BTreeMap::new(),
        }
    }

    pub fn from_resolved(resolved: &Resolved) -> Self {
        let mut kms = Self::new(resolved.get("key_id").unwrap_or(DEFAULT_KEY_ID));
        kms.sources = resolved.metadata(&[]);
        kms
    }

    /// Every wrap fails with `failure` until cleared.
    pub fn set_wrap_failure(&self, failure: Option<Error>) {
        self.script.lock().wrap_failure = failure;
    }

    /// Block each wrap for `delay`; the wait ends early on cancellation.
    pub fn set_wrap_delay(&self, delay: Duration) {
        self.script.lock().wrap_delay = delay;
    }

    /// Produce a legacy direct-encrypt ciphertext this backend can read.
    pub fn direct_encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        xor_cycle(plaintext, &Sha256::digest(DIRECT_PAD_LABEL))
    }

    pub fn describe_calls(&self) -> usize {
        self.calls.describe.load(Ordering::SeqCst)
    }

    pub fn wrap_calls(&self) -> usize {
        self.calls.wrap.load(Ordering::SeqCst)
    }

    pub fn unwrap_calls(&self) -> usize {
        self.calls.unwrap.load(Ordering::SeqCst)
    }

    pub fn direct_decrypt_calls(&self) -> usize {
        self.calls.direct_decrypt.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn pad(key_id: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(key_id.as_bytes()));
    out
}

fn xor_cycle(data: &[u8], pad: &[u8]) -> Vec<u8> {
    data.iter()
        .zip(pad.iter().cycle())
        .map(|(d, p)| d ^ p)
        .collect()
}

impl KmsBackend for MockKms {
    fn backend_type(&self) -> BackendType {
        BackendType::Mock
    }

    fn describe(&self, ctx: &Context) -> Result<String> {
        self.calls.describe.fetch_add(1, Ordering::SeqCst);
        ctx.check()?;
        Ok(self.script.lock().current().to_string())
    }

    fn wrap(&self, ctx: &Context, dek: &[u8]) -> Result<WrappedKey> {
        self.calls.wrap.fetch_add(1, Ordering::SeqCst);
        let (failure, delay) = {
            let script = self.script.lock();
            (script.wrap_failure.clone(), script.wrap_delay)
        };
        if !delay.is_zero() && !ctx.sleep(delay) {
            return Err(Error::Canceled);
        }
        ctx.check()?;
        if let Some(err) = failure {
            return Err(err);
        }
        let key_id = self.script.lock().advance();
        log::debug!("mock: wrapped {} byte key under {key_id}", dek.len());
        Ok(WrappedKey {
            ciphertext: xor_cycle(dek, &pad(&key_id)),
            key_id,
        })
    }

    fn unwrap(&self, ctx: &Context, wrapped: &[u8], key_id: &str) -> Result<Zeroizing<Vec<u8>>> {
        self.calls.unwrap.fetch_add(1, Ordering::SeqCst);
        ctx.check()?;
        if key_id.is_empty() {
            return Err(Error::DecryptionFailure("mock unwrap needs a key id".into()));
        }
        if wrapped.len() != 32 {
            return Err(Error::DecryptionFailure(format!(
                "wrapped key is {} bytes, expected 32",
                wrapped.len()
            )));
        }
        Ok(Zeroizing::new(xor_cycle(wrapped, &pad(key_id))))
    }

    fn direct_decrypt(&self, ctx: &Context, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.calls.direct_decrypt.fetch_add(1, Ordering::SeqCst);
        ctx.check()?;
        Ok(self.direct_encrypt(ciphertext))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        let mut out = self.sources.clone();
        out.insert("key_id".into(), self.script.lock().current().to_string());
        out
    }
}
