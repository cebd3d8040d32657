//! The wrapping service: envelope encryption over one remote key backend.
//!
//! `encrypt` seals locally under a fresh DEK, has the backend wrap the DEK
//! and records the key version the backend reports. `decrypt` dispatches
//! on the blob's mechanism. No lock is held across a backend call.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::{Mutex, RwLock};
use zeroize::Zeroizing;

use crate::{
    blob::{BlobInfo, KeyInfo, Mechanism},
    config::{
        self, COMMON_OPTIONS, EnvSource, OPT_KEY_NOT_REQUIRED, OPT_TYPE, Options, ProcessEnv,
        Resolver,
    },
    context::Context,
    crypto::envelope,
    error::{Error, Result},
    kms::{self, BackendType, KmsBackend},
    lifecycle::State,
    metadata::{MetadataSource, PlatformMetadata},
};

struct Slot {
    state: State,
    backend: Option<Arc<dyn KmsBackend>>,
}

pub struct WrappingService {
    env: Arc<dyn EnvSource>,
    metadata: Arc<dyn MetadataSource>,
    slot: RwLock<Slot>,
    current_key_id: RwLock<Arc<String>>,
    configuring: Mutex<()>,
}

impl Default for WrappingService {
    fn default() -> Self {
        Self::new()
    }
}

impl WrappingService {
    /// A service that reads the process environment and probes the
    /// platform's instance metadata.
    pub fn new() -> Self {
        Self::with_sources(Arc::new(ProcessEnv), Arc::new(PlatformMetadata::new()))
    }

    pub fn with_sources(env: Arc<dyn EnvSource>, metadata: Arc<dyn MetadataSource>) -> Self {
        Self {
            env,
            metadata,
            slot: RwLock::new(Slot {
                state: State::Unconfigured,
                backend: None,
            }),
            current_key_id: RwLock::new(Arc::new(String::new())),
            configuring: Mutex::new(()),
        }
    }

    pub fn state(&self) -> State {
        self.slot.read().state
    }

    /// Resolve the options, build the backend they name and bring it up.
    /// Returns a non-sensitive description of the configuration.
    pub fn configure(&self, ctx: &Context, options: &Options) -> Result<BTreeMap<String, String>> {
        if self.state() == State::Closed {
            return Err(Error::AlreadyClosed);
        }
        let common = Resolver::new(self.env.as_ref(), self.metadata.as_ref())
            .resolve(COMMON_OPTIONS, options)?;
        let kind: BackendType = common.require(OPT_TYPE)?.parse()?;
        config::warn_unrecognized(options, &[COMMON_OPTIONS, kind.options()]);

        let backend = kms::build(kind, options, self.env.as_ref(), self.metadata.as_ref())?;
        let mut summary = self.configure_backend(ctx, options, backend)?;
        summary.extend(common.metadata(&[]));
        Ok(summary)
    }

    /// Bring up a caller-supplied backend. Only `disallow_env_vars` and
    /// `key_not_required` are read from `options`.
    pub fn configure_backend(
        &self,
        ctx: &Context,
        options: &Options,
        backend: Arc<dyn KmsBackend>,
    ) -> Result<BTreeMap<String, String>> {
        let _configuring = self
            .configuring
            .try_lock()
            .ok_or_else(|| Error::Internal("configure already in progress".into()))?;
        {
            let mut slot = self.slot.write();
            match slot.state {
                State::Closed => return Err(Error::AlreadyClosed),
                State::Unconfigured => slot.state = State::Configuring,
                State::Configuring | State::Ready => {}
            }
        }

        let outcome = self.bring_up(ctx, options, &backend);

        let mut slot = self.slot.write();
        if slot.state == State::Closed {
            drop(slot);
            backend.close();
            return Err(Error::AlreadyClosed);
        }
        match outcome {
            Ok(key_id) => {
                let previous = slot.backend.replace(backend.clone());
                slot.state = State::Ready;
                // Published before any encrypt can reach the new backend.
                *self.current_key_id.write() = Arc::new(key_id.clone());
                drop(slot);
                if let Some(previous) = previous {
                    previous.close();
                }
                log::info!(
                    "configured {} backend, key id {:?}",
                    backend.backend_type(),
                    key_id
                );

                let mut summary = backend.metadata();
                summary.insert("type".into(), backend.backend_type().to_string());
                summary.insert("key_id".into(), key_id);
                Ok(summary)
            }
            Err(e) => {
                if slot.backend.is_none() {
                    slot.state = State::Unconfigured;
                }
                drop(slot);
                backend.close();
                log::info!("configure {} backend failed: {e}", backend.backend_type());
                Err(e)
            }
        }
    }

    fn bring_up(&self, ctx: &Context, options: &Options, backend: &Arc<dyn KmsBackend>) -> Result<String> {
        let key_not_required = options
            .get(OPT_KEY_NOT_REQUIRED)
            .map(|v| config::parse_bool(OPT_KEY_NOT_REQUIRED, v))
            .transpose()?
            .unwrap_or(false);

        let key_id = if key_not_required {
            String::new()
        } else {
            let probe = backend.clone();
            let worker_ctx = ctx.clone();
            ctx.run("describe", move || probe.describe(&worker_ctx))?
        };
        backend.on_ready(ctx)?;
        Ok(key_id)
    }

    fn ready_backend(&self) -> Result<Arc<dyn KmsBackend>> {
        let slot = self.slot.read();
        match slot.state {
            State::Closed => Err(Error::AlreadyClosed),
            _ => slot.backend.clone().ok_or(Error::NotConfigured),
        }
    }

    pub fn backend_type(&self) -> Result<BackendType> {
        Ok(self.ready_backend()?.backend_type())
    }

    /// Key version of the latest successful wrap or describe probe; empty
    /// before either.
    pub fn current_key_id(&self) -> String {
        self.current_key_id.read().as_str().to_string()
    }

    pub fn encrypt(&self, ctx: &Context, plaintext: &[u8], aad: Option<&[u8]>) -> Result<BlobInfo> {
        let backend = self.ready_backend()?;
        let sealed = envelope::encrypt(plaintext, aad)?;

        let dek = sealed.dek.clone();
        let worker_ctx = ctx.clone();
        let wrapper = backend.clone();
        let wrapped = ctx.run("wrap", move || wrapper.wrap(&worker_ctx, dek.as_bytes()))?;
        // A wrap that finished after cancellation is not published.
        ctx.check()?;
        if wrapped.ciphertext.is_empty() || wrapped.key_id.is_empty() {
            return Err(Error::Internal(format!(
                "{} backend returned an empty wrapped key or key id",
                backend.backend_type()
            )));
        }

        *self.current_key_id.write() = Arc::new(wrapped.key_id.clone());
        log::debug!("sealed {} bytes under {}", plaintext.len(), wrapped.key_id);

        Ok(BlobInfo {
            ciphertext: sealed.ciphertext,
            iv: sealed.iv.as_bytes().to_vec(),
            key_info: Some(KeyInfo {
                mechanism: Mechanism::EnvelopeAesGcm,
                key_id: wrapped.key_id,
                wrapped_key: wrapped.ciphertext,
            }),
        })
    }

    pub fn decrypt(&self, ctx: &Context, blob: &BlobInfo, aad: Option<&[u8]>) -> Result<Vec<u8>> {
        let backend = self.ready_backend()?;
        let worker_ctx = ctx.clone();
        match blob.mechanism() {
            Mechanism::DirectEncrypt => {
                let ciphertext = blob.ciphertext.clone();
                ctx.run("direct-decrypt", move || {
                    backend.direct_decrypt(&worker_ctx, &ciphertext)
                })
            }
            Mechanism::EnvelopeAesGcm => {
                let (wrapped_key, key_id) = match &blob.key_info {
                    Some(info) if !info.wrapped_key.is_empty() && !blob.iv.is_empty() => {
                        (info.wrapped_key.clone(), info.key_id.clone())
                    }
                    _ => {
                        return Err(Error::MalformedBlob(
                            "envelope blob without wrapped key or iv".into(),
                        ));
                    }
                };
                let dek = ctx.run("unwrap", move || {
                    backend.unwrap(&worker_ctx, &wrapped_key, &key_id)
                })?;
                envelope::decrypt(&dek, &blob.iv, &blob.ciphertext, aad)
            }
            Mechanism::Unknown(code) => Err(Error::UnsupportedMechanism(format!(
                "blob mechanism code {code}"
            ))),
        }
    }

    /// Whether `blob` was wrapped under the current key version. Everything
    /// counts as current until a key version is known.
    pub fn is_up_to_date(&self, blob: &BlobInfo) -> bool {
        let current = self.current_key_id.read().clone();
        current.is_empty() || blob.key_id() == Some(current.as_str())
    }

    /// Decrypt and report whether the blob should be rewrapped.
    pub fn decrypt_checked(
        &self,
        ctx: &Context,
        blob: &BlobInfo,
        aad: Option<&[u8]>,
    ) -> Result<(Vec<u8>, bool)> {
        let plaintext = self.decrypt(ctx, blob, aad)?;
        Ok((plaintext, self.is_up_to_date(blob)))
    }

    /// Re-seal `blob` under a fresh DEK and the backend's current key.
    pub fn rewrap(&self, ctx: &Context, blob: &BlobInfo, aad: Option<&[u8]>) -> Result<BlobInfo> {
        let plaintext = Zeroizing::new(self.decrypt(ctx, blob, aad)?);
        self.encrypt(ctx, &plaintext, aad)
    }

    /// Stop the backend and refuse further work. Safe to call repeatedly.
    pub fn close(&self) {
        let backend = {
            let mut slot = self.slot.write();
            if slot.state == State::Closed {
                return;
            }
            slot.state = State::Closed;
            slot.backend.take()
        };
        if let Some(backend) = backend {
            backend.close();
            log::info!("closed {} backend", backend.backend_type());
        }
    }
}

impl Drop for WrappingService {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::MapEnv,
        kms::{WrappedKey, mock::MockKms},
        metadata::NoMetadata,
    };

    fn service() -> WrappingService {
        WrappingService::with_sources(Arc::new(MapEnv::new()), Arc::new(NoMetadata))
    }

    #[test]
    fn lifecycle_states() {
        let svc = service();
        let ctx = Context::background();
        assert_eq!(svc.state(), State::Unconfigured);
        assert_eq!(svc.encrypt(&ctx, b"x", None), Err(Error::NotConfigured));

        svc.configure_backend(&ctx, &Options::new(), Arc::new(MockKms::new("k1")))
            .unwrap();
        assert_eq!(svc.state(), State::Ready);
        assert_eq!(svc.current_key_id(), "k1");

        svc.close();
        assert_eq!(svc.state(), State::Closed);
        assert_eq!(svc.encrypt(&ctx, b"x", None), Err(Error::AlreadyClosed));
        assert_eq!(
            svc.configure_backend(&ctx, &Options::new(), Arc::new(MockKms::new("k2")))
                .unwrap_err(),
            Error::AlreadyClosed
        );
    }

    #[test]
    fn failed_first_configure_returns_to_unconfigured() {
        let svc = service();
        let ctx = Context::background();
        ctx.cancel();
        let err = svc
            .configure_backend(&ctx, &Options::new(), Arc::new(MockKms::new("k")))
            .unwrap_err();
        assert_eq!(err, Error::Canceled);
        assert_eq!(svc.state(), State::Unconfigured);
    }

    /// Describes as `v1` but wraps under `v2`.
    struct Rotated;

    impl KmsBackend for Rotated {
        fn backend_type(&self) -> BackendType {
            BackendType::Mock
        }

        fn describe(&self, _ctx: &Context) -> Result<String> {
            Ok("v1".into())
        }

        fn wrap(&self, _ctx: &Context, dek: &[u8]) -> Result<WrappedKey> {
            Ok(WrappedKey {
                ciphertext: dek.to_vec(),
                key_id: "v2".into(),
            })
        }

        fn unwrap(&self, _ctx: &Context, wrapped: &[u8], _key_id: &str) -> Result<Zeroizing<Vec<u8>>> {
            Ok(Zeroizing::new(wrapped.to_vec()))
        }

        fn metadata(&self) -> BTreeMap<String, String> {
            BTreeMap::new()
        }
    }

    #[test]
    fn describe_result_never_overwrites_a_later_wrap() {
        for _ in 0..50 {
            let svc = Arc::new(service());
            let sealer = svc.clone();
            let racer = std::thread::spawn(move || {
                let ctx = Context::background();
                loop {
                    match sealer.encrypt(&ctx, b"x", None) {
                        Ok(blob) => return blob,
                        Err(Error::NotConfigured) => std::thread::yield_now(),
                        Err(e) => panic!("unexpected {e}"),
                    }
                }
            });
            svc.configure_backend(&Context::background(), &Options::new(), Arc::new(Rotated))
                .unwrap();
            let blob = racer.join().unwrap();
            assert_eq!(blob.key_id(), Some("v2"));
            assert_eq!(svc.current_key_id(), "v2");
        }
    }

    #[test]
    fn configure_reads_type_from_options() {
        let svc = service();
        let options: Options = [("type", "mock"), ("key_id", "from-options")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let summary = svc.configure(&Context::background(), &options).unwrap();
        assert_eq!(svc.backend_type().unwrap(), BackendType::Mock);
        assert_eq!(svc.current_key_id(), "from-options");
        assert_eq!(summary.get("type").map(String::as_str), Some("mock"));
        assert_eq!(summary.get("type.source").map(String::as_str), Some("options"));
    }

    #[test]
    fn configure_without_type_is_missing_config() {
        let svc = service();
        let err = svc.configure(&Context::background(), &Options::new()).unwrap_err();
        assert!(matches!(err, Error::MissingConfig(_)));
        assert_eq!(svc.state(), State::Unconfigured);
    }
}
