//! Vault Transit backend.
//!
//! The DEK is sent as the plaintext of a Transit `encrypt` call; the
//! returned `vault:v<N>:<payload>` string is stored verbatim as the
//! wrapped key, so unwrap recovers the version from the blob itself.

use std::{collections::BTreeMap, sync::Arc};

use base64::{Engine, engine::general_purpose::STANDARD};
use parking_lot::Mutex;
use serde::Deserialize;
use zeroize::Zeroizing;

use super::{
    BackendType, KmsBackend, WrappedKey,
    http::{self, Body, HttpClient, TlsSettings},
};
use crate::{
    config::{DefaultSource, OptionSpec, Requirement, Resolved},
    context::Context,
    error::{Error, Result},
    lifecycle::{KeepAlive, Lease, Renew},
};

pub static OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        name: "address",
        env: &["VAULT_ADDR", "KMS_ENDPOINT"],
        requirement: Requirement::Required,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "token",
        env: &["VAULT_TOKEN", "KMS_TOKEN"],
        requirement: Requirement::Required,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "key_name",
        env: &["VAULT_TRANSIT_SEAL_KEY_NAME", "KMS_KEY_ID"],
        requirement: Requirement::KeyIdentifier,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "mount_path",
        env: &["VAULT_TRANSIT_SEAL_MOUNT_PATH"],
        requirement: Requirement::Optional,
        default: DefaultSource::Static("transit"),
    },
    OptionSpec {
        name: "namespace",
        env: &["VAULT_NAMESPACE", "KMS_NAMESPACE"],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "disable_renewal",
        env: &["VAULT_TRANSIT_SEAL_DISABLE_RENEWAL", "KMS_DISABLE_RENEWAL"],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "key_id_prefix",
        env: &["VAULT_TRANSIT_SEAL_KEY_ID_PREFIX"],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: http::OPT_TLS_CA_CERT,
        env: &["VAULT_CACERT"],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: http::OPT_TLS_SKIP_VERIFY,
        env: &["VAULT_SKIP_VERIFY"],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: http::OPT_TLS_SERVER_NAME,
        env: &["VAULT_TLS_SERVER_NAME"],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
    },
];

const PUBLIC_OPTIONS: &[&str] = &[
    "address",
    "key_name",
    "mount_path",
    "namespace",
    "key_id_prefix",
];

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct EncryptData {
    ciphertext: String,
}

#[derive(Deserialize)]
struct DecryptData {
    plaintext: String,
}

#[derive(Deserialize)]
struct KeyData {
    latest_version: u64,
}

#[derive(Deserialize)]
struct RenewResponse {
    auth: RenewAuth,
}

#[derive(Deserialize)]
struct RenewAuth {
    lease_duration: u64,
    #[serde(default)]
    renewable: bool,
}

#[derive(Deserialize)]
struct VaultErrors {
    #[serde(default)]
    errors: Vec<String>,
}

fn vault_errors(body: &str) -> String {
    serde_json::from_str::<VaultErrors>(body)
        .ok()
        .filter(|e| !e.errors.is_empty())
        .map(|e| e.errors.join("; "))
        .unwrap_or_else(|| http::truncate(body).to_string())
}

fn classify(status: u16, body: &str) -> Option<Error> {
    let detail = vault_errors(body);
    let lower = detail.to_ascii_lowercase();
    match status {
        400 if lower.contains("key not found") || lower.contains("encryption key not found") => {
            Some(Error::KeyNotFound(detail))
        }
        400 => Some(Error::Permanent(detail)),
        403 => Some(Error::Unauthorized(detail)),
        _ => None,
    }
}

fn classify_decrypt(status: u16, body: &str) -> Option<Error> {
    let detail = vault_errors(body);
    let lower = detail.to_ascii_lowercase();
    if status == 400
        && (lower.contains("unable to decrypt")
            || lower.contains("message authentication failed")
            || lower.contains("invalid ciphertext"))
    {
        return Some(Error::DecryptionFailure(detail));
    }
    classify(status, body)
}

/// Split `vault:v<N>:<payload>` and return `v<N>`.
fn key_version(ciphertext: &str) -> Result<&str> {
    let malformed = || {
        Error::Permanent(format!(
            "unexpected transit ciphertext {:?}",
            http::truncate(ciphertext)
        ))
    };
    let rest = ciphertext.strip_prefix("vault:").ok_or_else(malformed)?;
    let (version, payload) = rest.split_once(':').ok_or_else(malformed)?;
    let number = version.strip_prefix('v').ok_or_else(malformed)?;
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) || payload.is_empty() {
        return Err(malformed());
    }
    Ok(version)
}

/// The HTTP side of the backend; shared with the renewal thread.
struct TransitClient {
    http: HttpClient,
    token: Zeroizing<String>,
    namespace: Option<String>,
    mount_path: String,
    key_name: String,
}

impl TransitClient {
    fn request(&self, method: &str, path: &str) -> Result<ureq::Request> {
        let url = self.http.url(&format!("v1/{path}"))?;
        let mut req = self
            .http
            .request(method, url.as_str())
            .set("X-Vault-Token", &self.token)
            .set("X-Vault-Request", "true");
        if let Some(ns) = &self.namespace {
            req = req.set("X-Vault-Namespace", ns);
        }
        Ok(req)
    }

    fn key_path(&self, op: &str) -> String {
        format!("{}/{op}/{}", self.mount_path, self.key_name)
    }

    fn encrypt(&self, ctx: &Context, plaintext: &[u8]) -> Result<String> {
        let body = serde_json::json!({ "plaintext": STANDARD.encode(plaintext) });
        let req = self.request("POST", &self.key_path("encrypt"))?;
        let resp: Envelope<EncryptData> = self.http.call_json(ctx, req, Body::Json(&body), classify)?;
        Ok(resp.data.ciphertext)
    }

    fn decrypt(&self, ctx: &Context, ciphertext: &str) -> Result<Zeroizing<Vec<u8>>> {
        let body = serde_json::json!({ "ciphertext": ciphertext });
        let req = self.request("POST", &self.key_path("decrypt"))?;
        let resp: Envelope<DecryptData> =
            self.http.call_json(ctx, req, Body::Json(&body), classify_decrypt)?;
        let plaintext = Zeroizing::new(resp.data.plaintext);
        STANDARD
            .decode(plaintext.as_bytes())
            .map(Zeroizing::new)
            .map_err(|e| Error::Permanent(format!("transit plaintext is not base64: {e}")))
    }

    fn latest_version(&self, ctx: &Context) -> Result<u64> {
        let req = self.request("GET", &self.key_path("keys"))?;
        let resp: Envelope<KeyData> = self.http.call_json(ctx, req, Body::Empty, classify)?;
        Ok(resp.data.latest_version)
    }
}

impl Renew for TransitClient {
    fn renew(&self, ctx: &Context) -> Result<Lease> {
        let req = self.request("POST", "auth/token/renew-self")?;
        let body = serde_json::json!({});
        let resp: RenewResponse = self.http.call_json(ctx, req, Body::Json(&body), classify)?;
        Ok(Lease {
            duration: std::time::Duration::from_secs(resp.auth.lease_duration),
            renewable: resp.auth.renewable,
        })
    }
}

pub struct TransitKms {
    client: Arc<TransitClient>,
    key_id_prefix: String,
    disable_renewal: bool,
    keep_alive: Mutex<Option<KeepAlive>>,
    summary: BTreeMap<String, String>,
}

impl TransitKms {
    pub fn new(resolved: Resolved) -> Result<Self> {
        let tls = TlsSettings::from_resolved(&resolved)?;
        let http = HttpClient::new(resolved.require("address")?, &tls)?;
        let mount_path = resolved
            .get("mount_path")
            .unwrap_or("transit")
            .trim_matches('/')
            .to_string();
        if mount_path.is_empty() {
            return Err(Error::InvalidConfig("mount_path must not be empty".into()));
        }
        let client = TransitClient {
            http,
            token: Zeroizing::new(resolved.require("token")?.to_string()),
            namespace: resolved.get("namespace").map(str::to_string),
            mount_path,
            key_name: resolved.get("key_name").unwrap_or_default().to_string(),
        };

        let disable_renewal = resolved.flag("disable_renewal")?;
        let mut summary = resolved.metadata(PUBLIC_OPTIONS);
        summary.insert("disable_renewal".into(), disable_renewal.to_string());

        Ok(Self {
            client: Arc::new(client),
            key_id_prefix: resolved.get("key_id_prefix").unwrap_or_default().to_string(),
            disable_renewal,
            keep_alive: Mutex::new(None),
            summary,
        })
    }

    fn require_key_name(&self) -> Result<()> {
        if self.client.key_name.is_empty() {
            return Err(Error::MissingConfig("option \"key_name\"".into()));
        }
        Ok(())
    }

    /// Whether the background renewal thread is alive.
    pub fn is_renewing(&self) -> bool {
        self.keep_alive.lock().as_ref().is_some_and(KeepAlive::is_running)
    }
}

impl KmsBackend for TransitKms {
    fn backend_type(&self) -> BackendType {
        BackendType::Transit
    }

    fn describe(&self, ctx: &Context) -> Result<String> {
        self.require_key_name()?;
        let version = self.client.latest_version(ctx)?;
        Ok(format!("{}v{version}", self.key_id_prefix))
    }

    fn wrap(&self, ctx: &Context, dek: &[u8]) -> Result<WrappedKey> {
        self.require_key_name()?;
        let ciphertext = self.client.encrypt(ctx, dek)?;
        let key_id = format!("{}{}", self.key_id_prefix, key_version(&ciphertext)?);
        log::debug!("transit: wrapped key under {key_id}");
        Ok(WrappedKey {
            ciphertext: ciphertext.into_bytes(),
            key_id,
        })
    }

    fn unwrap(&self, ctx: &Context, wrapped: &[u8], _key_id: &str) -> Result<Zeroizing<Vec<u8>>> {
        self.require_key_name()?;
        let ciphertext = std::str::from_utf8(wrapped)
            .map_err(|_| Error::DecryptionFailure("transit wrapped key is not UTF-8".into()))?;
        key_version(ciphertext).map_err(|_| {
            Error::DecryptionFailure("transit wrapped key lacks the vault:v<N>: prefix".into())
        })?;
        self.client.decrypt(ctx, ciphertext)
    }

    fn on_ready(&self, ctx: &Context) -> Result<()> {
        if self.disable_renewal {
            log::info!("transit: token renewal disabled");
            return Ok(());
        }
        let lease = match self.client.renew(ctx) {
            Ok(lease) => lease,
            Err(e) => {
                log::info!("transit: token is not renewable, skipping renewal: {e}");
                return Ok(());
            }
        };
        if !lease.renewable {
            log::info!("transit: token is not renewable, skipping renewal");
            return Ok(());
        }
        let renewer: Arc<dyn Renew> = self.client.clone();
        let keep_alive = KeepAlive::start("transit", renewer, lease)?;
        let previous = self.keep_alive.lock().replace(keep_alive);
        if let Some(mut previous) = previous {
            previous.stop();
        }
        Ok(())
    }

    fn close(&self) {
        let keep_alive = self.keep_alive.lock().take();
        if let Some(mut keep_alive) = keep_alive {
            keep_alive.stop();
        }
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        self.summary.clone()
    }
}
