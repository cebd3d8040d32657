//! Azure Key Vault backend (REST API 7.4, `RSA-OAEP-256` key wrap).

use std::collections::BTreeMap;

use base64::{
    Engine,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use serde::Deserialize;
use zeroize::Zeroizing;

use super::{
    BackendType, KmsBackend, WrappedKey,
    http::{self, Body, HttpClient, OAuthToken, TlsSettings, TokenCache},
};
use crate::{
    config::{DefaultSource, OptionSpec, Requirement, Resolved},
    context::Context,
    error::{Error, Result},
    metadata::LINK_LOCAL_IMDS,
};

pub static OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        name: "vault_name",
        env: &["AZUREKEYVAULT_WRAPPER_VAULT_NAME", "VAULT_AZUREKEYVAULT_VAULT_NAME"],
        requirement: Requirement::Required,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "key_name",
        env: &["AZUREKEYVAULT_WRAPPER_KEY_NAME", "VAULT_AZUREKEYVAULT_KEY_NAME", "KMS_KEY_ID"],
        requirement: Requirement::KeyIdentifier,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "tenant_id",
        env: &["AZURE_TENANT_ID", "KMS_TENANT_ID"],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "client_id",
        env: &["AZURE_CLIENT_ID", "KMS_CLIENT_ID"],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "client_secret",
        env: &["AZURE_CLIENT_SECRET", "KMS_CLIENT_SECRET"],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "access_token",
        env: &["AZURE_ACCESS_TOKEN", "KMS_TOKEN"],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "environment",
        env: &["AZURE_ENVIRONMENT"],
        requirement: Requirement::Optional,
        default: DefaultSource::Static("AzurePublicCloud"),
    },
    OptionSpec {
        name: "resource",
        env: &["AZURE_AD_RESOURCE"],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
    },
    OptionSpec {
        name: "endpoint",
        env: &["KMS_ENDPOINT"],
        requirement: Requirement::Optional,
        default: DefaultSource::None,
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

const PUBLIC_OPTIONS: &[&str] = &[
    "vault_name",
    "key_name",
    "tenant_id",
    "client_id",
    "environment",
    "resource",
    "endpoint",
];

const API_VERSION: &str = "7.4";
const ALGORITHM: &str = "RSA-OAEP-256";

/// Key Vault emits unpadded base64url; accept padding on input too.
const B64URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// A sovereign cloud: where to get tokens and which DNS suffix vaults use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cloud {
    pub name: &'static str,
    pub active_directory: &'static str,
    pub key_vault_dns_suffix: &'static str,
}

const CLOUDS: &[Cloud] = &[
    Cloud {
        name: "AzurePublicCloud",
        active_directory: "https://login.microsoftonline.com/",
        key_vault_dns_suffix: "vault.azure.net",
    },
    Cloud {
        name: "AzureChinaCloud",
        active_directory: "https://login.chinacloudapi.cn/",
        key_vault_dns_suffix: "vault.azure.cn",
    },
    Cloud {
        name: "AzureUSGovernmentCloud",
        active_directory: "https://login.microsoftonline.us/",
        key_vault_dns_suffix: "vault.usgovcloudapi.net",
    },
    Cloud {
        name: "AzureGermanCloud",
        active_directory: "https://login.microsoftonline.de/",
        key_vault_dns_suffix: "vault.microsoftazure.de",
    },
];

pub fn cloud(name: &str) -> Result<Cloud> {
    CLOUDS
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(name))
        .copied()
        .ok_or_else(|| Error::InvalidConfig(format!("unknown Azure environment {name:?}")))
}

enum Auth {
    Static(Zeroizing<String>),
    ClientSecret {
        token_url: String,
        client_id: String,
        client_secret: Zeroizing<String>,
    },
    ManagedIdentity {
        client_id: Option<String>,
    },
}

impl Auth {
    fn kind(&self) -> &'static str {
        match self {
            Auth::Static(_) => "access-token",
            Auth::ClientSecret { .. } => "client-secret",
            Auth::ManagedIdentity { .. } => "managed-identity",
        }
    }
}

#[derive(Deserialize)]
struct KeyOperationResult {
    kid: String,
    value: String,
}

#[derive(Deserialize)]
struct KeyBundle {
    key: JsonWebKey,
}

#[derive(Deserialize)]
struct JsonWebKey {
    kid: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

fn classify(status: u16, body: &str) -> Option<Error> {
    let detail = serde_json::from_str::<ErrorEnvelope>(body).ok()?.error;
    let text = format!("{}: {}", detail.code, detail.message);
    match (status, detail.code.as_str()) {
        (_, "Throttled") | (429, _) => Some(Error::RateLimited(text)),
        (_, "KeyNotFound") | (404, _) => Some(Error::KeyNotFound(text)),
        (_, "Unauthorized" | "Forbidden") | (401 | 403, _) => Some(Error::Unauthorized(text)),
        _ => None,
    }
}

fn classify_unwrap(status: u16, body: &str) -> Option<Error> {
    if status == 400 {
        let detail = serde_json::from_str::<ErrorEnvelope>(body).ok()?.error;
        return Some(Error::DecryptionFailure(format!("{}: {}", detail.code, detail.message)));
    }
    classify(status, body)
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

/// The version segment of a key URL such as
/// `https://v.vault.azure.net/keys/name/0123abcd`.
fn key_version(kid: &str) -> Result<&str> {
    let version = kid.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
    if version.is_empty() || !kid.contains("/keys/") {
        return Err(Error::Permanent(format!("unexpected key id {kid:?}")));
    }
    Ok(version)
}

pub struct AzureKeyVault {
    http: HttpClient,
    key_name: String,
    scope: String,
    auth: Auth,
    token: TokenCache,
    summary: BTreeMap<String, String>,
}

impl AzureKeyVault {
    pub fn new(resolved: Resolved) -> Result<Self> {
        let cloud = cloud(resolved.get("environment").unwrap_or("AzurePublicCloud"))?;
        let dns_suffix = resolved
            .get("resource")
            .unwrap_or(cloud.key_vault_dns_suffix)
            .trim_matches('/')
            .to_string();
        let vault_name = resolved.require("vault_name")?;
        let base = match resolved.get("endpoint") {
            Some(endpoint) => endpoint.to_string(),
            None => format!("https://{vault_name}.{dns_suffix}/"),
        };
        let tls = TlsSettings::from_resolved(&resolved)?;
        let http = HttpClient::new(&base, &tls)?;

        let auth = match (
            resolved.get("access_token"),
            resolved.get("tenant_id"),
            resolved.get("client_id"),
            resolved.get("client_secret"),
        ) {
            (Some(token), ..) => Auth::Static(Zeroizing::new(token.to_string())),
            (None, Some(tenant), Some(client_id), Some(secret)) => Auth::ClientSecret {
                token_url: format!("{}{tenant}/oauth2/v2.0/token", cloud.active_directory),
                client_id: client_id.to_string(),
                client_secret: Zeroizing::new(secret.to_string()),
            },
            (None, _, client_id, _) => Auth::ManagedIdentity {
                client_id: client_id.map(str::to_string),
            },
        };

        let mut summary = resolved.metadata(PUBLIC_OPTIONS);
        summary.insert("vault_url".into(), http.base().to_string());
        summary.insert("auth".into(), auth.kind().into());

        Ok(Self {
            http,
            key_name: resolved.get("key_name").unwrap_or_default().to_string(),
            scope: format!("https://{dns_suffix}"),
            auth,
            token: TokenCache::default(),
            summary,
        })
    }

    fn access_token(&self, ctx: &Context) -> Result<Zeroizing<String>> {
        match &self.auth {
            Auth::Static(token) => Ok(token.clone()),
            _ => self.token.get_or_fetch(|| self.fetch_token(ctx)),
        }
    }

    fn fetch_token(&self, ctx: &Context) -> Result<OAuthToken> {
        match &self.auth {
            Auth::Static(token) => Ok(OAuthToken {
                access_token: token.to_string(),
                expires_in: serde_json::Value::Null,
            }),
            Auth::ClientSecret {
                token_url,
                client_id,
                client_secret,
            } => {
                let scope = format!("{}/.default", self.scope);
                let form = [
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                    ("scope", scope.as_str()),
                ];
                let req = self.http.request("POST", token_url);
                self.http.call_json(ctx, req, Body::Form(&form), classify_token)
            }
            Auth::ManagedIdentity { client_id } => {
                let mut req = self
                    .http
                    .request("GET", &format!("{LINK_LOCAL_IMDS}/metadata/identity/oauth2/token"))
                    .set("Metadata", "true")
                    .query("api-version", "2018-02-01")
                    .query("resource", &self.scope);
                if let Some(id) = client_id {
                    req = req.query("client_id", id);
                }
                self.http.call_json(ctx, req, Body::Empty, classify_token)
            }
        }
    }

    fn require_key_name(&self) -> Result<&str> {
        if self.key_name.is_empty() {
            return Err(Error::MissingConfig("option \"key_name\"".into()));
        }
        Ok(&self.key_name)
    }

    fn key_request(&self, ctx: &Context, method: &str, path: &str) -> Result<ureq::Request> {
        let token = self.access_token(ctx)?;
        let url = self.http.url(path)?;
        Ok(self
            .http
            .request(method, url.as_str())
            .query("api-version", API_VERSION)
            .set("Authorization", &format!("Bearer {}", token.as_str())))
    }
}

impl KmsBackend for AzureKeyVault {
    fn backend_type(&self) -> BackendType {
        BackendType::Azure
    }

    fn describe(&self, ctx: &Context) -> Result<String> {
        let key = self.require_key_name()?;
        let req = self.key_request(ctx, "GET", &format!("keys/{key}"))?;
        let bundle: KeyBundle = self.http.call_json(ctx, req, Body::Empty, classify)?;
        Ok(key_version(&bundle.key.kid)?.to_string())
    }

    fn wrap(&self, ctx: &Context, dek: &[u8]) -> Result<WrappedKey> {
        let key = self.require_key_name()?;
        let req = self.key_request(ctx, "POST", &format!("keys/{key}/wrapkey"))?;
        let body = serde_json::json!({ "alg": ALGORITHM, "value": B64URL.encode(dek) });
        let result: KeyOperationResult = self.http.call_json(ctx, req, Body::Json(&body), classify)?;
        let ciphertext = B64URL
            .decode(result.value.as_bytes())
            .map_err(|e| Error::Permanent(format!("wrapkey returned bad base64url: {e}")))?;
        let key_id = key_version(&result.kid)?.to_string();
        log::debug!("azure: wrapped key under {key_id}");
        Ok(WrappedKey { ciphertext, key_id })
    }

    fn unwrap(&self, ctx: &Context, wrapped: &[u8], key_id: &str) -> Result<Zeroizing<Vec<u8>>> {
        let key = self.require_key_name()?;
        // Older blobs stored the base64url text rather than raw bytes.
        let raw = std::str::from_utf8(wrapped)
            .ok()
            .and_then(|text| B64URL.decode(text.trim()).ok())
            .unwrap_or_else(|| wrapped.to_vec());
        let path = if key_id.is_empty() {
            format!("keys/{key}/unwrapkey")
        } else {
            format!("keys/{key}/{key_id}/unwrapkey")
        };
        let req = self.key_request(ctx, "POST", &path)?;
        let body = serde_json::json!({ "alg": ALGORITHM, "value": B64URL.encode(&raw) });
        let result: KeyOperationResult =
            self.http.call_json(ctx, req, Body::Json(&body), classify_unwrap)?;
        let value = Zeroizing::new(result.value);
        B64URL
            .decode(value.as_bytes())
            .map(Zeroizing::new)
            .map_err(|e| Error::Permanent(format!("unwrapkey returned bad base64url: {e}")))
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        self.summary.clone()
    }
}
