//! Google Cloud KMS backend (REST v1).
//!
//! The keyId recorded for a blob is the full CryptoKeyVersion resource
//! name that `:encrypt` reports.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{
    BackendType, KmsBackend, WrappedKey,
    http::{self, Body, HttpClient, OAuthToken, TlsSettings, TokenCache},
};
use crate::{
    config::{DefaultSource, OptionSpec, Requirement, Resolved},
    context::Context,
    error::{Error, Result},
    metadata::{GCE_METADATA_BASE, MetadataKey},
};

pub static OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        name: "project",
        env: &["GCPCKMS_WRAPPER_PROJECT", "VAULT_GCPCKMS_SEAL_PROJECT", "GOOGLE_PROJECT"],
        requirement: Requirement::Required,
        default: DefaultSource::Metadata(MetadataKey::GcpProject),
    },
    OptionSpec {
        name: "region",
        env: &["GCPCKMS_WRAPPER_REGION", "VAULT_GCPCKMS_SEAL_REGION", "GOOGLE_REGION", "KMS_REGION"],
        requirement: Requirement::Optional,
        default: DefaultSource::Static("global"),
    },
    OptionSpec {
        name: "key_ring",
        env: &["GCPCKMS_WRAPPER_KEY_RING", "VAULT_GCPCKMS_SEAL_KEY_RING"],
        requirement: Requirement::Required,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "crypto_key",
        env: &["GCPCKMS_WRAPPER_CRYPTO_KEY", "VAULT_GCPCKMS_SEAL_CRYPTO_KEY", "KMS_KEY_ID"],
        requirement: Requirement::KeyIdentifier,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "credentials",
        env: &["GOOGLE_APPLICATION_CREDENTIALS", "KMS_CREDENTIALS_PATH"],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "access_token",
        env: &["GOOGLE_OAUTH_ACCESS_TOKEN", "KMS_TOKEN"],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "endpoint",
        env: &["KMS_ENDPOINT"],
        requirement: Requirement::Optional,
        default: DefaultSource::Static("https://cloudkms.googleapis.com/"),
    },
    OptionSpec {
        name: http::OPT_TLS_CA_CERT,
        env: &[],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: http::OPT_TLS_SKIP_VERIFY,
        env: &[],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: http::OPT_TLS_SERVER_NAME,
        env: &[],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
    },
];

const PUBLIC_OPTIONS: &[&str] = &["project", "region", "key_ring", "crypto_key", "credentials", "endpoint"];

/// Permissions a seal key must grant; checked by the describe probe.
pub const REQUIRED_PERMISSIONS: &[&str] = &[
    "cloudkms.cryptoKeyVersions.useToEncrypt",
    "cloudkms.cryptoKeyVersions.useToDecrypt",
    "cloudkms.cryptoKeys.get",
];

const OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/cloudkms";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const JWT_LIFETIME_SECS: i64 = 3600;

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

enum Auth {
    Static(Zeroizing<String>),
    ServiceAccount {
        email: String,
        token_uri: String,
        key: Box<EncodingKey>,
    },
    Metadata,
}

impl Auth {
    fn kind(&self) -> &'static str {
        match self {
            Auth::Static(_) => "access-token",
            Auth::ServiceAccount { .. } => "service-account",
            Auth::Metadata => "gce-metadata",
        }
    }
}

fn load_service_account(path: &Path) -> Result<Auth> {
    let text = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
        Error::InvalidConfig(format!("read credentials {}: {e}", path.display()))
    })?);
    let parsed: ServiceAccountKey = serde_json::from_str(&text).map_err(|e| {
        Error::InvalidConfig(format!("parse credentials {}: {e}", path.display()))
    })?;
    let pem = Zeroizing::new(parsed.private_key);
    let key = EncodingKey::from_rsa_pem(pem.as_bytes())
        .map_err(|e| Error::InvalidConfig(format!("service account private key: {e}")))?;
    Ok(Auth::ServiceAccount {
        email: parsed.client_email,
        token_uri: parsed.token_uri,
        key: Box::new(key),
    })
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// RS256-signed assertion for the JWT bearer grant.
fn signed_assertion(key: &EncodingKey, email: &str, audience: &str, issued_at: i64) -> Result<String> {
    let claims = AssertionClaims {
        iss: email,
        scope: OAUTH_SCOPE,
        aud: audience,
        iat: issued_at,
        exp: issued_at + JWT_LIFETIME_SECS,
    };
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, key)
        .map_err(|e| Error::Internal(format!("sign assertion: {e}")))
}

#[derive(Deserialize)]
struct EncryptResponse {
    name: String,
    ciphertext: String,
}

#[derive(Deserialize)]
struct DecryptResponse {
    plaintext: String,
}

#[derive(Deserialize)]
struct CryptoKey {
    primary: Option<CryptoKeyVersion>,
}

#[derive(Deserialize)]
struct CryptoKeyVersion {
    name: String,
}

#[derive(Deserialize)]
struct Permissions {
    #[serde(default)]
    permissions: Vec<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

/// Classify by the google.rpc status name.
fn classify(_status: u16, body: &str) -> Option<Error> {
    let detail = serde_json::from_str::<ErrorEnvelope>(body).ok()?.error;
    let text = format!("{}: {}", detail.status, detail.message);
    Some(match detail.status.as_str() {
        "RESOURCE_EXHAUSTED" => Error::RateLimited(text),
        "NOT_FOUND" => Error::KeyNotFound(text),
        "PERMISSION_DENIED" | "UNAUTHENTICATED" => Error::Unauthorized(text),
        "UNAVAILABLE" | "DEADLINE_EXCEEDED" | "INTERNAL" | "ABORTED" => Error::Transient(text),
        "" => return None,
        _ => Error::Permanent(text),
    })
}

fn classify_decrypt(status: u16, body: &str) -> Option<Error> {
    match classify(status, body) {
        Some(Error::Permanent(text)) if text.starts_with("INVALID_ARGUMENT") => {
            Some(Error::DecryptionFailure(text))
        }
        other => other,
    }
}

fn classify_token(status: u16, body: &str) -> Option<Error> {
    match status {
        400 | 401 | 403 => Some(Error::Unauthorized(format!(
            "token request rejected: {}",
            http::truncate(body)
        ))),
        _ => None,
    }
}

pub struct GcpKms {
    http: HttpClient,
    key_name: String,
    auth: Auth,
    token: TokenCache,
    summary: BTreeMap<String, String>,
}

impl GcpKms {
    pub fn new(resolved: Resolved) -> Result<Self> {
        let project = resolved.require("project")?;
        let region = resolved.get("region").unwrap_or("global");
        let key_ring = resolved.require("key_ring")?;
        let crypto_key = resolved.get("crypto_key").unwrap_or_default();
        let key_name = if crypto_key.is_empty() {
            String::new()
        } else {
            format!("projects/{project}/locations/{region}/keyRings/{key_ring}/cryptoKeys/{crypto_key}")
        };

        let tls = TlsSettings::from_resolved(&resolved)?;
        let endpoint = resolved
            .get("endpoint")
            .unwrap_or("https://cloudkms.googleapis.com/");
        let http = HttpClient::new(endpoint, &tls)?;

        let auth = if let Some(token) = resolved.get("access_token") {
            Auth::Static(Zeroizing::new(token.to_string()))
        } else if let Some(path) = resolved.get("credentials") {
            load_service_account(&PathBuf::from(path))?
        } else {
            Auth::Metadata
        };

        let mut summary = resolved.metadata(PUBLIC_OPTIONS);
        summary.insert("auth".into(), auth.kind().into());
        if !key_name.is_empty() {
            summary.insert("key_name".into(), key_name.clone());
        }

        Ok(Self {
            http,
            key_name,
            auth,
            token: TokenCache::default(),
            summary,
        })
    }

    fn access_token(&self, ctx: &Context) -> Result<Zeroizing<String>> {
        match &self.auth {
            Auth::Static(token) => Ok(token.clone()),
            Auth::ServiceAccount {
                email,
                token_uri,
                key,
            } => self.token.get_or_fetch(|| {
                let assertion = signed_assertion(key, email, token_uri, chrono::Utc::now().timestamp())?;
                let form = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())];
                let req = self.http.request("POST", token_uri);
                self.http.call_json(ctx, req, Body::Form(&form), classify_token)
            }),
            Auth::Metadata => self.token.get_or_fetch(|| {
                let url = format!("{GCE_METADATA_BASE}/instance/service-accounts/default/token");
                let req = self.http.request("GET", &url).set("Metadata-Flavor", "Google");
                self.http.call_json(ctx, req, Body::Empty, classify_token)
            }),
        }
    }

    fn require_key_name(&self) -> Result<&str> {
        if self.key_name.is_empty() {
            return Err(Error::MissingConfig("option \"crypto_key\"".into()));
        }
        Ok(&self.key_name)
    }

    fn request(&self, ctx: &Context, method: &str, path: &str) -> Result<ureq::Request> {
        let token = self.access_token(ctx)?;
        let url = self.http.url(&format!("v1/{path}"))?;
        Ok(self
            .http
            .request(method, url.as_str())
            .set("Authorization", &format!("Bearer {}", token.as_str())))
    }

    fn decrypt_blob(&self, ctx: &Context, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let name = self.require_key_name()?;
        let req = self.request(ctx, "POST", &format!("{name}:decrypt"))?;
        let body = serde_json::json!({ "ciphertext": STANDARD.encode(ciphertext) });
        let resp: DecryptResponse =
            self.http.call_json(ctx, req, Body::Json(&body), classify_decrypt)?;
        let plaintext = Zeroizing::new(resp.plaintext);
        STANDARD
            .decode(plaintext.as_bytes())
            .map(Zeroizing::new)
            .map_err(|e| Error::Permanent(format!("decrypt returned bad base64: {e}")))
    }

    fn check_permissions(&self, ctx: &Context, name: &str) -> Result<()> {
        let req = self.request(ctx, "POST", &format!("{name}:testIamPermissions"))?;
        let body = serde_json::json!({ "permissions": REQUIRED_PERMISSIONS });
        let granted: Permissions = self.http.call_json(ctx, req, Body::Json(&body), classify)?;
        let missing: Vec<&str> = REQUIRED_PERMISSIONS
            .iter()
            .copied()
            .filter(|p| !granted.permissions.iter().any(|g| g == p))
            .collect();
        if !missing.is_empty() {
            return Err(Error::Unauthorized(format!(
                "missing permissions on {name}: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }
}

impl KmsBackend for GcpKms {
    fn backend_type(&self) -> BackendType {
        BackendType::Gcp
    }

    fn describe(&self, ctx: &Context) -> Result<String> {
        let name = self.require_key_name()?;
        self.check_permissions(ctx, name)?;
        let req = self.request(ctx, "GET", name)?;
        let key: CryptoKey = self.http.call_json(ctx, req, Body::Empty, classify)?;
        key.primary
            .map(|version| version.name)
            .ok_or_else(|| Error::Permanent(format!("{name} has no primary version")))
    }

    fn wrap(&self, ctx: &Context, dek: &[u8]) -> Result<WrappedKey> {
        let name = self.require_key_name()?;
        let req = self.request(ctx, "POST", &format!("{name}:encrypt"))?;
        let body = serde_json::json!({ "plaintext": STANDARD.encode(dek) });
        let resp: EncryptResponse = self.http.call_json(ctx, req, Body::Json(&body), classify)?;
        let ciphertext = STANDARD
            .decode(resp.ciphertext.as_bytes())
            .map_err(|e| Error::Permanent(format!("encrypt returned bad base64: {e}")))?;
        log::debug!("gcp: wrapped key under {}", resp.name);
        Ok(WrappedKey {
            ciphertext,
            key_id: resp.name,
        })
    }

    /// Cloud KMS finds the version from the ciphertext; `key_id` is unused.
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
    use crate::{
        config::{MapEnv, Options, Resolver},
        metadata::{NoMetadata, StaticMetadata},
    };

    fn options(pairs: &[(&str, &str)]) -> Options {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn key_name_and_project_fallback() {
        let env = MapEnv::new();
        let meta = StaticMetadata::new().with(MetadataKey::GcpProject, "meta-proj");
        let resolved = Resolver::new(&env, &meta)
            .resolve(
                OPTIONS,
                &options(&[("key_ring", "ring"), ("crypto_key", "seal"), ("access_token", "t")]),
            )
            .unwrap();
        let kms = GcpKms::new(resolved).unwrap();
        assert_eq!(
            kms.key_name,
            "projects/meta-proj/locations/global/keyRings/ring/cryptoKeys/seal"
        );
        assert_eq!(kms.auth.kind(), "access-token");
        assert_eq!(
            kms.metadata().get("project.source").map(String::as_str),
            Some("metadata")
        );
    }

    #[test]
    fn project_is_required_without_metadata() {
        let env = MapEnv::new();
        let err = Resolver::new(&env, &NoMetadata)
            .resolve(OPTIONS, &options(&[("key_ring", "ring"), ("crypto_key", "seal")]))
            .unwrap_err();
        assert!(matches!(err, Error::MissingConfig(ref m) if m.contains("project")));
    }

    #[test]
    fn classification() {
        let exhausted = r#"{"error":{"code":429,"status":"RESOURCE_EXHAUSTED","message":"quota"}}"#;
        assert!(matches!(classify(429, exhausted), Some(Error::RateLimited(_))));
        let denied = r#"{"error":{"code":403,"status":"PERMISSION_DENIED","message":"no"}}"#;
        assert!(matches!(classify(403, denied), Some(Error::Unauthorized(_))));
        let bad = r#"{"error":{"code":400,"status":"INVALID_ARGUMENT","message":"Decryption failed"}}"#;
        assert!(matches!(classify_decrypt(400, bad), Some(Error::DecryptionFailure(_))));
        assert!(matches!(classify(400, bad), Some(Error::Permanent(_))));
        assert_eq!(classify(502, "oops"), None);
    }

    #[test]
    fn assertion_is_rs256_signed_for_the_token_endpoint() {
        let key = EncodingKey::from_rsa_pem(include_bytes!("../../tests/fixtures/service-account.pem"))
            .unwrap();
        let now = chrono::Utc::now().timestamp();
        let audience = "https://oauth2.example.test/token";
        let jwt = signed_assertion(&key, "seal@proj.iam.gserviceaccount.com", audience, now).unwrap();

        let public = jsonwebtoken::DecodingKey::from_rsa_pem(include_bytes!(
            "../../tests/fixtures/service-account.pub.pem"
        ))
        .unwrap();
        let mut validation = jsonwebtoken::Validation::new(Algorithm::RS256);
        validation.set_audience(&[audience]);
        let token = jsonwebtoken::decode::<serde_json::Value>(&jwt, &public, &validation).unwrap();
        assert_eq!(token.header.typ.as_deref(), Some("JWT"));
        assert_eq!(token.claims["iss"], "seal@proj.iam.gserviceaccount.com");
        assert_eq!(token.claims["scope"], OAUTH_SCOPE);
        assert_eq!(token.claims["exp"].as_i64(), Some(now + JWT_LIFETIME_SECS));
    }

    #[test]
    fn unreadable_credentials_file_is_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sa.json");
        std::fs::write(&path, r#"{"client_email":"x@y","private_key":"not a pem"}"#).unwrap();
        assert!(matches!(load_service_account(&path), Err(Error::InvalidConfig(_))));
        assert!(matches!(
            load_service_account(&dir.path().join("missing.json")),
            Err(Error::InvalidConfig(_))
        ));
    }
}
