pub mod aws;
pub mod azure;
pub mod gcp;
pub mod http;
pub mod mock;
pub mod transit;

use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};

use zeroize::Zeroizing;

use crate::{
    blob::Mechanism,
    config::{EnvSource, OptionSpec, Options, Resolver},
    context::Context,
    error::{Error, Result},
    metadata::MetadataSource,
};

/// Which remote key service protects the DEKs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendType {
    Aws,
    Azure,
    Gcp,
    Transit,
    Mock,
}

impl BackendType {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendType::Aws => "awskms",
            BackendType::Azure => "azurekeyvault",
            BackendType::Gcp => "gcpckms",
            BackendType::Transit => "transit",
            BackendType::Mock => "mock",
        }
    }

    /// The option table the backend resolves at configure time.
    pub fn options(self) -> &'static [OptionSpec] {
        match self {
            BackendType::Aws => aws::OPTIONS,
            BackendType::Azure => azure::OPTIONS,
            BackendType::Gcp => gcp::OPTIONS,
            BackendType::Transit => transit::OPTIONS,
            BackendType::Mock => mock::OPTIONS,
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "awskms" | "aws" => Ok(BackendType::Aws),
            "azurekeyvault" | "azure" => Ok(BackendType::Azure),
            "gcpckms" | "gcp" => Ok(BackendType::Gcp),
            "transit" => Ok(BackendType::Transit),
            "mock" => Ok(BackendType::Mock),
            other => Err(Error::InvalidConfig(format!("unknown backend type {other:?}"))),
        }
    }
}

/// A DEK as protected by the remote key, plus the key version that did it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrappedKey {
    pub ciphertext: Vec<u8>,
    pub key_id: String,
}

/// Synchronous interface to a remote key-management service.
///
/// Implementations must be safe to call concurrently. Every call takes the
/// caller's [`Context`] and must give up once it is done.
pub trait KmsBackend: Send + Sync + 'static {
    fn backend_type(&self) -> BackendType;

    /// Probe the configured key and return its current version id.
    fn describe(&self, ctx: &Context) -> Result<String>;

    /// Protect a DEK under the remote key.
    fn wrap(&self, ctx: &Context, dek: &[u8]) -> Result<WrappedKey>;

    /// Recover a DEK. `key_id` is the id recorded at wrap time; backends
    /// that embed the version in `wrapped` may ignore it.
    fn unwrap(&self, ctx: &Context, wrapped: &[u8], key_id: &str) -> Result<Zeroizing<Vec<u8>>>;

    /// Decrypt a legacy blob the backend encrypted itself.
    fn direct_decrypt(&self, _ctx: &Context, _ciphertext: &[u8]) -> Result<Vec<u8>> {
        Err(Error::unsupported(
            Mechanism::DirectEncrypt,
            self.backend_type().as_str(),
        ))
    }

    /// Called once the backend is ready (after the describe probe, or
    /// directly when the probe is skipped).
    fn on_ready(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    /// Stop background work. Called at most once.
    fn close(&self) {}

    /// Non-sensitive description, safe to log.
    fn metadata(&self) -> BTreeMap<String, String>;
}

/// Construct a backend of `kind` from the option map.
pub fn build(
    kind: BackendType,
    options: &Options,
    env: &dyn EnvSource,
    metadata: &dyn MetadataSource,
) -> Result<Arc<dyn KmsBackend>> {
    let resolver = Resolver::new(env, metadata);
    let resolved = resolver.resolve(kind.options(), options)?;
    let backend: Arc<dyn KmsBackend> = match kind {
        BackendType::Aws => Arc::new(aws::AwsKms::new(resolved)?),
        BackendType::Azure => Arc::new(azure::AzureKeyVault::new(resolved)?),
        BackendType::Gcp => Arc::new(gcp::GcpKms::new(resolved)?),
        BackendType::Transit => Arc::new(transit::TransitKms::new(resolved)?),
        BackendType::Mock => Arc::new(mock::MockKms::from_resolved(&resolved)),
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names_and_aliases() {
        for kind in [
            BackendType::Aws,
            BackendType::Azure,
            BackendType::Gcp,
            BackendType::Transit,
            BackendType::Mock,
        ] {
            assert_eq!(kind.as_str().parse::<BackendType>().unwrap(), kind);
        }
        assert_eq!("AWS".parse::<BackendType>().unwrap(), BackendType::Aws);
        assert_eq!("gcp".parse::<BackendType>().unwrap(), BackendType::Gcp);
        assert!(matches!("pkcs11".parse::<BackendType>(), Err(Error::InvalidConfig(_))));
    }
}
