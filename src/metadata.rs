//! Instance-metadata defaults (EC2 IMDSv2, GCE metadata server).
//!
//! Only consulted when neither the environment nor the option map
//! supplies a value. All probes are best-effort: any failure reads as
//! "no value".

use std::{collections::HashMap, time::Duration};

use parking_lot::Mutex;

/// Link-local instance metadata address shared by EC2 and Azure.
pub const LINK_LOCAL_IMDS: &str = "http://169.254.169.254";
pub const GCE_METADATA_BASE: &str = "http://metadata.google.internal/computeMetadata/v1";

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const IMDS_TOKEN_TTL_SECS: &str = "60";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetadataKey {
    AwsRegion,
    GcpProject,
}

pub trait MetadataSource: Send + Sync {
    fn lookup(&self, key: MetadataKey) -> Option<String>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoMetadata;

impl MetadataSource for NoMetadata {
    fn lookup(&self, _key: MetadataKey) -> Option<String> {
        None
    }
}

#[derive(Clone, Debug, Default)]
pub struct StaticMetadata {
    values: HashMap<MetadataKey, String>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: MetadataKey, value: impl Into<String>) -> Self {
        self.values.insert(key, value.into());
        self
    }
}

impl MetadataSource for StaticMetadata {
    fn lookup(&self, key: MetadataKey) -> Option<String> {
        self.values.get(&key).cloned()
    }
}

/// Probes the platform the process runs on. Answers are memoized,
/// including misses, so an unreachable metadata service costs one
/// timeout per key.
pub struct PlatformMetadata {
    agent: ureq::Agent,
    cache: Mutex<HashMap<MetadataKey, Option<String>>>,
}

impl Default for PlatformMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformMetadata {
    pub fn new() -> Self {
        Self {
            agent: probe_agent(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn probe(&self, key: MetadataKey) -> Option<String> {
        match key {
            MetadataKey::AwsRegion => {
                let token = aws_imds_token(&self.agent);
                aws_imds_get(&self.agent, "placement/region", token.as_deref())
            }
            MetadataKey::GcpProject => gce_get(&self.agent, "project/project-id"),
        }
    }
}

impl MetadataSource for PlatformMetadata {
    fn lookup(&self, key: MetadataKey) -> Option<String> {
        if let Some(hit) = self.cache.lock().get(&key) {
            return hit.clone();
        }
        let value = self.probe(key);
        log::debug!("metadata probe {key:?}: {}", if value.is_some() { "found" } else { "none" });
        self.cache.lock().insert(key, value.clone());
        value
    }
}

fn probe_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(PROBE_TIMEOUT)
        .timeout(PROBE_TIMEOUT)
        .build()
}

/// IMDSv2 session token; `None` falls back to IMDSv1 requests.
fn aws_imds_token(agent: &ureq::Agent) -> Option<String> {
    agent
        .put(&format!("{LINK_LOCAL_IMDS}/latest/api/token"))
        .set("X-aws-ec2-metadata-token-ttl-seconds", IMDS_TOKEN_TTL_SECS)
        .call()
        .ok()?
        .into_string()
        .ok()
}

fn aws_imds_get(agent: &ureq::Agent, path: &str, token: Option<&str>) -> Option<String> {
    let mut req = agent.get(&format!("{LINK_LOCAL_IMDS}/latest/meta-data/{path}"));
    if let Some(token) = token {
        req = req.set("X-aws-ec2-metadata-token", token);
    }
    req.call()
        .ok()?
        .into_string()
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn gce_get(agent: &ureq::Agent, path: &str) -> Option<String> {
    agent
        .get(&format!("{GCE_METADATA_BASE}/{path}"))
        .set("Metadata-Flavor", "Google")
        .call()
        .ok()?
        .into_string()
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
