//! AWS KMS backend on the official SDK.
//!
//! The keyId recorded for a blob is the key ARN returned by `Encrypt`,
//! not the alias or name that was configured.

mod rt;

use std::{collections::BTreeMap, future::Future, path::PathBuf, time::Duration};

use aws_config::{
    imds::credentials::ImdsCredentialsProvider,
    meta::credentials::CredentialsProviderChain,
    profile::{
        ProfileFileCredentialsProvider,
        profile_file::{ProfileFileKind, ProfileFiles},
    },
};
use aws_sdk_kms::{
    Client,
    config::{BehaviorVersion, Credentials, Region, retry::RetryConfig, timeout::TimeoutConfig},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::Blob,
};
use zeroize::Zeroizing;

use super::{BackendType, KmsBackend, WrappedKey, http};
use crate::{
    config::{DefaultSource, OptionSpec, Requirement, Resolved},
    context::Context,
    error::{Error, Result},
    metadata::MetadataKey,
};

pub static OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        name: "kms_key_id",
        env: &["AWSKMS_WRAPPER_KEY_ID", "VAULT_AWSKMS_SEAL_KEY_ID", "KMS_KEY_ID"],
        requirement: Requirement::KeyIdentifier,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "region",
        env: &["AWSKMS_WRAPPER_REGION", "AWS_REGION", "AWS_DEFAULT_REGION", "KMS_REGION"],
        requirement: Requirement::Optional,
        default: DefaultSource::MetadataOr(MetadataKey::AwsRegion, "us-east-1"),
    },
    OptionSpec {
        name: "endpoint",
        env: &["AWS_KMS_ENDPOINT", "KMS_ENDPOINT"],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "access_key",
        env: &["AWS_ACCESS_KEY_ID"],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "secret_key",
        env: &["AWS_SECRET_ACCESS_KEY"],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "session_token",
        env: &["AWS_SESSION_TOKEN"],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "shared_creds_file",
        env: &["AWS_SHARED_CREDENTIALS_FILE", "KMS_CREDENTIALS_PATH"],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "profile",
        env: &["AWS_PROFILE"],
        requirement: Requirement::Optional,
        default: DefaultSource::Static("default"),
    },
];

const PUBLIC_OPTIONS: &[&str] = &["kms_key_id", "region", "endpoint", "profile", "shared_creds_file"];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound for a single call when the context has no deadline.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Map a KMS service error code to an error kind.
fn classify_code(code: &str, message: &str) -> Error {
    // "com.amazonaws.kms#NotFoundException" -> "NotFoundException"
    let code = code.rsplit('#').next().unwrap_or(code);
    let detail = if message.is_empty() {
        code.to_string()
    } else {
        format!("{code}: {message}")
    };
    match code {
        "ThrottlingException" | "Throttling" | "RequestLimitExceeded" | "TooManyRequestsException" => {
            Error::RateLimited(detail)
        }
        "NotFoundException" => Error::KeyNotFound(detail),
        "AccessDeniedException"
        | "UnrecognizedClientException"
        | "InvalidSignatureException"
        | "IncompleteSignature"
        | "MissingAuthenticationToken"
        | "ExpiredTokenException" => Error::Unauthorized(detail),
        "InvalidCiphertextException" | "IncorrectKeyException" => Error::DecryptionFailure(detail),
        "KMSInternalException" | "DependencyTimeoutException" | "InternalFailure"
        | "ServiceUnavailable" => Error::Transient(detail),
        _ => Error::Permanent(detail),
    }
}

fn sdk_error<E>(op: &str, err: SdkError<E>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let detail = format!("{op}: {}", DisplayErrorContext(&err));
    match &err {
        SdkError::ServiceError(_) => match err.code() {
            Some(code) => classify_code(code, err.message().unwrap_or_default()),
            None => {
                let status = err.raw_response().map_or(0, |r| r.status().as_u16());
                http::status_error(status, &detail)
            }
        },
        SdkError::DispatchFailure(failure) if failure.is_timeout() => Error::Transient(detail),
        SdkError::DispatchFailure(_) => Error::BackendUnavailable(detail),
        SdkError::TimeoutError(_) | SdkError::ResponseError(_) => Error::Transient(detail),
        // Credential resolution fails before the request is dispatched.
        SdkError::ConstructionFailure(_) => Error::Unauthorized(detail),
        _ => Error::Internal(detail),
    }
}

/// Shared credentials file, then the EC2 instance role.
fn fallback_chain(resolved: &Resolved) -> CredentialsProviderChain {
    let imds = ImdsCredentialsProvider::builder().build();
    let shared_file = resolved.get("shared_creds_file").map(PathBuf::from);
    // The default file location comes from `$HOME`.
    if shared_file.is_none() && resolved.disallow_env_vars() {
        return CredentialsProviderChain::first_try("Ec2InstanceMetadata", imds);
    }

    let mut profile = ProfileFileCredentialsProvider::builder()
        .profile_name(resolved.get("profile").unwrap_or("default"));
    if let Some(path) = shared_file {
        profile = profile.profile_files(
            ProfileFiles::builder()
                .with_file(ProfileFileKind::Credentials, path)
                .build(),
        );
    }
    CredentialsProviderChain::first_try("Profile", profile.build())
        .or_else("Ec2InstanceMetadata", imds)
}

pub struct AwsKms {
    client: Client,
    key_id: String,
    summary: BTreeMap<String, String>,
}

impl AwsKms {
    pub fn new(resolved: Resolved) -> Result<Self> {
        let region = resolved.get("region").unwrap_or("us-east-1").to_string();
        let endpoint = resolved.get("endpoint").map(str::to_string);

        let mut builder = aws_sdk_kms::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.clone()));
        builder.set_endpoint_url(endpoint.clone());
        let builder = builder
            .retry_config(RetryConfig::disabled())
            .timeout_config(TimeoutConfig::builder().connect_timeout(CONNECT_TIMEOUT).build());

        let (builder, credentials) = match (resolved.get("access_key"), resolved.get("secret_key")) {
            (Some(access), Some(secret)) => {
                let creds = Credentials::new(
                    access,
                    secret,
                    resolved.get("session_token").map(str::to_string),
                    None,
                    "sealwrap-static",
                );
                (builder.credentials_provider(creds), "static")
            }
            (None, None) => (builder.credentials_provider(fallback_chain(&resolved)), "chain"),
            _ => {
                return Err(Error::InvalidConfig(
                    "access_key and secret_key must be set together".into(),
                ));
            }
        };

        let mut summary = resolved.metadata(PUBLIC_OPTIONS);
        summary.insert("region".into(), region.clone());
        summary.insert(
            "endpoint".into(),
            endpoint.unwrap_or_else(|| format!("https://kms.{region}.amazonaws.com")),
        );
        summary.insert("credentials".into(), credentials.into());

        Ok(Self {
            client: Client::from_conf(builder.build()),
            key_id: resolved.get("kms_key_id").unwrap_or_default().to_string(),
            summary,
        })
    }

    fn require_key_id(&self) -> Result<&str> {
        if self.key_id.is_empty() {
            return Err(Error::MissingConfig("option \"kms_key_id\"".into()));
        }
        Ok(&self.key_id)
    }

    /// Run one SDK operation, bounded by the context deadline.
    fn call<T, E, F>(&self, ctx: &Context, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, SdkError<E>>>,
        E: ProvideErrorMetadata + std::error::Error + 'static,
    {
        ctx.check()?;
        let limit = ctx.remaining().unwrap_or(DEFAULT_CALL_TIMEOUT);
        match rt::sync_await(async move { tokio::time::timeout(limit, fut).await })? {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(sdk_error(op, err)),
            Err(_) if ctx.is_done() => Err(Error::Canceled),
            Err(_) => Err(Error::Transient(format!("{op}: no reply within {limit:?}"))),
        }
    }

    fn decrypt_blob(&self, ctx: &Context, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let output = self.call(
            ctx,
            "Decrypt",
            self.client
                .decrypt()
                .ciphertext_blob(Blob::new(ciphertext))
                .send(),
        )?;
        output
            .plaintext()
            .map(|blob| Zeroizing::new(blob.as_ref().to_vec()))
            .ok_or_else(|| Error::Permanent("Decrypt returned no plaintext".into()))
    }
}

impl KmsBackend for AwsKms {
    fn backend_type(&self) -> BackendType {
        BackendType::Aws
    }

    fn describe(&self, ctx: &Context) -> Result<String> {
        let key_id = self.require_key_id()?;
        let output = self.call(
            ctx,
            "DescribeKey",
            self.client.describe_key().key_id(key_id).send(),
        )?;
        output
            .key_metadata()
            .and_then(|meta| meta.arn())
            .map(str::to_string)
            .ok_or_else(|| Error::Permanent("DescribeKey returned no key ARN".into()))
    }

    fn wrap(&self, ctx: &Context, dek: &[u8]) -> Result<WrappedKey> {
        let key_id = self.require_key_id()?;
        let output = self.call(
            ctx,
            "Encrypt",
            self.client
                .encrypt()
                .key_id(key_id)
                .plaintext(Blob::new(dek))
                .send(),
        )?;
        let ciphertext = output
            .ciphertext_blob()
            .map(|blob| blob.as_ref().to_vec())
            .ok_or_else(|| Error::Permanent("Encrypt returned no ciphertext".into()))?;
        let key_id = output
            .key_id()
            .map(str::to_string)
            .ok_or_else(|| Error::Permanent("Encrypt returned no key id".into()))?;
        log::debug!("aws: wrapped key under {key_id}");
        Ok(WrappedKey { ciphertext, key_id })
    }

    /// The key is recovered from the ciphertext blob; `key_id` is unused.
    fn unwrap(&self, ctx: &Context, wrapped: &[u8], _key_id: &str) -> Result<Zeroizing<Vec<u8>>> {
        self.decrypt_blob(ctx, wrapped)
    }

    fn direct_decrypt(&self, ctx: &Context, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(self.decrypt_blob(ctx, ciphertext)?.to_vec())
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        self.summary.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_service_codes() {
        assert!(matches!(
            classify_code("ThrottlingException", "Rate exceeded"),
            Error::RateLimited(m) if m.contains("Rate exceeded")
        ));
        assert!(matches!(
            classify_code("com.amazonaws.kms#NotFoundException", "alias/x"),
            Error::KeyNotFound(_)
        ));
        assert!(matches!(classify_code("RequestLimitExceeded", ""), Error::RateLimited(_)));
        assert!(matches!(
            classify_code("InvalidCiphertextException", ""),
            Error::DecryptionFailure(_)
        ));
        assert!(matches!(classify_code("AccessDeniedException", "no"), Error::Unauthorized(_)));
        assert!(matches!(classify_code("KMSInternalException", ""), Error::Transient(_)));
        assert!(matches!(classify_code("DisabledException", ""), Error::Permanent(_)));
    }
}
