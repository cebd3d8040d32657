//! Shared HTTP plumbing for the remote backends: one `ureq` agent per
//! backend, TLS trust policy, deadline-bounded calls, and the default
//! mapping from HTTP failures to error kinds.

use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Deserialize, de::DeserializeOwned};
use url::Url;
use zeroize::Zeroizing;

use crate::{
    config::Resolved,
    context::Context,
    error::{Error, Result},
};

pub const OPT_TLS_CA_CERT: &str = "tls_ca_cert";
pub const OPT_TLS_SKIP_VERIFY: &str = "tls_skip_verify";
pub const OPT_TLS_SERVER_NAME: &str = "tls_server_name";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Refresh bearer tokens this long before they expire.
const TOKEN_MARGIN: Duration = Duration::from_secs(60);
/// Longer `expires_in` values are treated as this.
const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);
/// Upper bound for a single call when the context has no deadline.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Default)]
pub struct TlsSettings {
    /// PEM bundle added to the trust store.
    pub ca_cert: Option<PathBuf>,
    pub skip_verify: bool,
    /// Name used for SNI and certificate verification instead of the
    /// endpoint's host.
    pub server_name: Option<String>,
}

impl TlsSettings {
    pub fn from_resolved(resolved: &Resolved) -> Result<Self> {
        Ok(Self {
            ca_cert: resolved.get(OPT_TLS_CA_CERT).map(PathBuf::from),
            skip_verify: resolved.flag(OPT_TLS_SKIP_VERIFY)?,
            server_name: resolved.get(OPT_TLS_SERVER_NAME).map(str::to_string),
        })
    }
}

pub enum Body<'a> {
    Empty,
    Json(&'a serde_json::Value),
    Form(&'a [(&'a str, &'a str)]),
    /// Pre-serialized bytes; the caller sets `Content-Type`.
    Bytes(&'a [u8]),
}

/// Refines the default status mapping from the service's error body.
pub type Classifier = fn(status: u16, body: &str) -> Option<Error>;

#[derive(Clone)]
pub struct HttpClient {
    agent: ureq::Agent,
    base: Url,
}

impl HttpClient {
    pub fn new(endpoint: &str, tls: &TlsSettings) -> Result<Self> {
        let mut base = parse_endpoint(endpoint)?;

        let mut tls_builder = native_tls::TlsConnector::builder();
        tls_builder.danger_accept_invalid_certs(tls.skip_verify);
        if let Some(path) = &tls.ca_cert {
            let pem = std::fs::read(path).map_err(|e| {
                Error::InvalidConfig(format!("read CA bundle {}: {e}", path.display()))
            })?;
            let cert = native_tls::Certificate::from_pem(&pem).map_err(|e| {
                Error::InvalidConfig(format!("parse CA bundle {}: {e}", path.display()))
            })?;
            tls_builder.add_root_certificate(cert);
        }
        let connector = tls_builder
            .build()
            .map_err(|e| Error::InvalidConfig(format!("TLS setup: {e}")))?;

        let mut builder = ureq::AgentBuilder::new()
            .tls_connector(Arc::new(connector))
            .timeout_connect(CONNECT_TIMEOUT);

        if let Some(name) = tls.server_name.clone() {
            // Address requests to the server name so SNI and certificate
            // checks use it, and dial the real endpoint underneath.
            let dial_host = base
                .host_str()
                .ok_or_else(|| Error::InvalidConfig(format!("endpoint {endpoint} has no host")))?
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            base.set_host(Some(&name))
                .map_err(|e| Error::InvalidConfig(format!("tls_server_name {name:?}: {e}")))?;
            builder = builder.resolver(move |netloc: &str| -> io::Result<Vec<SocketAddr>> {
                let (host, port) = split_netloc(netloc)?;
                let host = if host.eq_ignore_ascii_case(&name) {
                    dial_host.as_str()
                } else {
                    host
                };
                Ok((host, port).to_socket_addrs()?.collect())
            });
        }

        Ok(Self {
            agent: builder.build(),
            base,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Resolve `path` against the endpoint.
    pub fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::InvalidConfig(format!("bad request path {path:?}: {e}")))
    }

    /// `Host` value the agent will send for `url`; needed for signing.
    pub fn host_header(url: &Url) -> String {
        let host = url.host_str().unwrap_or_default();
        match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    pub fn request(&self, method: &str, url: &str) -> ureq::Request {
        self.agent.request(method, url)
    }

    /// Send `req` within the context's deadline and decode a JSON reply.
    pub fn call_json<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        req: ureq::Request,
        body: Body<'_>,
        classify: Classifier,
    ) -> Result<T> {
        let resp = self.send(ctx, req, body, classify)?;
        resp.into_json::<T>()
            .map_err(|e| Error::Permanent(format!("decode response: {e}")))
    }

    pub fn send(
        &self,
        ctx: &Context,
        req: ureq::Request,
        body: Body<'_>,
        classify: Classifier,
    ) -> Result<ureq::Response> {
        ctx.check()?;
        let req = req.timeout(ctx.remaining().unwrap_or(DEFAULT_CALL_TIMEOUT));
        let result = match body {
            Body::Empty => req.call(),
            Body::Json(value) => req.send_json(value),
            Body::Form(pairs) => req.send_form(pairs),
            Body::Bytes(bytes) => req.send_bytes(bytes),
        };
        match result {
            Ok(resp) => Ok(resp),
            Err(ureq::Error::Status(status, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                Err(classify(status, &body).unwrap_or_else(|| status_error(status, &body)))
            }
            Err(ureq::Error::Transport(transport)) => {
                if ctx.is_done() {
                    Err(Error::Canceled)
                } else {
                    Err(transport_error(&transport))
                }
            }
        }
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| Error::InvalidConfig(format!("endpoint {endpoint:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::InvalidConfig(format!(
            "endpoint {endpoint:?}: scheme must be http or https"
        )));
    }
    if url.host_str().is_none() {
        return Err(Error::InvalidConfig(format!("endpoint {endpoint:?} has no host")));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn split_netloc(netloc: &str) -> io::Result<(&str, u16)> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidInput, format!("bad netloc {netloc:?}"));
    let (host, port) = netloc.rsplit_once(':').ok_or_else(invalid)?;
    let port = port.parse().map_err(|_| invalid())?;
    Ok((host.trim_start_matches('[').trim_end_matches(']'), port))
}

/// Default status mapping when the backend's classifier has no opinion.
pub fn status_error(status: u16, body: &str) -> Error {
    let detail = format!("HTTP {status}: {}", truncate(body));
    match status {
        401 | 403 => Error::Unauthorized(detail),
        404 => Error::KeyNotFound(detail),
        429 => Error::RateLimited(detail),
        500..=599 => Error::Transient(detail),
        _ => Error::Permanent(detail),
    }
}

fn transport_error(transport: &ureq::Transport) -> Error {
    let detail = transport.to_string();
    match transport.kind() {
        ureq::ErrorKind::Dns | ureq::ErrorKind::ConnectionFailed => Error::BackendUnavailable(detail),
        ureq::ErrorKind::Io => Error::Transient(detail),
        _ => Error::Permanent(detail),
    }
}

/// OAuth2 token endpoint reply (Azure AD, Google, both metadata servers).
#[derive(Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    /// A number from most issuers, a string from Azure IMDS.
    #[serde(default)]
    pub expires_in: serde_json::Value,
}

impl OAuthToken {
    pub fn lifetime(&self) -> Duration {
        let secs = match &self.expires_in {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        };
        Duration::from_secs(secs.unwrap_or(0)).min(MAX_TOKEN_LIFETIME)
    }
}

/// Memoized bearer token, refetched shortly before it expires.
#[derive(Default)]
pub struct TokenCache {
    slot: Mutex<Option<(Zeroizing<String>, Instant)>>,
}

impl TokenCache {
    pub fn get_or_fetch(
        &self,
        fetch: impl FnOnce() -> Result<OAuthToken>,
    ) -> Result<Zeroizing<String>> {
        if let Some((token, expires)) = self.slot.lock().as_ref() {
            if Instant::now() + TOKEN_MARGIN < *expires {
                return Ok(token.clone());
            }
        }
        let fresh = fetch()?;
        let now = Instant::now();
        let expires = now
            .checked_add(fresh.lifetime())
            .unwrap_or(now + MAX_TOKEN_LIFETIME);
        let token = Zeroizing::new(fresh.access_token);
        *self.slot.lock() = Some((token.clone(), expires));
        Ok(token)
    }
}

/// Error bodies end up in messages; keep them readable.
pub fn truncate(body: &str) -> &str {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body;
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
