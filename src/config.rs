//! Option resolution.
//!
//! Every backend declares its options as a static [`OptionSpec`] table.
//! [`Resolver`] walks a table and picks each value from the first tier
//! that has one:
//!
//! 1. process environment (skipped when `disallow_env_vars` is set),
//! 2. the supplied option map,
//! 3. instance metadata,
//! 4. a static default, or `MissingConfig` when the option is required.

use std::collections::{BTreeMap, HashMap};

use crate::{
    error::{Error, Result},
    metadata::{MetadataKey, MetadataSource},
};

pub type Options = BTreeMap<String, String>;

pub const OPT_TYPE: &str = "type";
pub const OPT_DISALLOW_ENV_VARS: &str = "disallow_env_vars";
pub const OPT_KEY_NOT_REQUIRED: &str = "key_not_required";

/// Options understood regardless of backend.
pub static COMMON_OPTIONS: &[OptionSpec] = &[OptionSpec {
    name: OPT_TYPE,
    env: &["KMS_TYPE"],
    requirement: Requirement::Required,
    default: DefaultSource::None,
}];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requirement {
    Optional,
    Required,
    /// The logical key name: required unless `key_not_required` is set.
    KeyIdentifier,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefaultSource {
    None,
    Static(&'static str),
    Metadata(MetadataKey),
    MetadataOr(MetadataKey, &'static str),
}

#[derive(Clone, Copy, Debug)]
pub struct OptionSpec {
    pub name: &'static str,
    /// Checked in order; concrete backend names first, `KMS_*` last.
    pub env: &'static [&'static str],
    pub requirement: Requirement,
    pub default: DefaultSource,
}

/// Which tier a resolved value came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Env(&'static str),
    Options,
    Metadata,
    Default,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Env(name) => write!(f, "env:{name}"),
            Source::Options => f.write_str("options"),
            Source::Metadata => f.write_str("metadata"),
            Source::Default => f.write_str("default"),
        }
    }
}

// ── environment ────────────────────────────────────────────────────

pub trait EnvSource: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// A fixed environment, for tests and embedding hosts.
#[derive(Clone, Debug, Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }
}

impl EnvSource for MapEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}

// ── resolution ─────────────────────────────────────────────────────

#[derive(Clone, Debug, Default)]
pub struct Resolved {
    values: BTreeMap<&'static str, (String, Source)>,
    disallow_env_vars: bool,
    key_not_required: bool,
}

impl Resolved {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|(v, _)| v.as_str())
    }

    pub fn source(&self, name: &str) -> Option<Source> {
        self.values.get(name).map(|(_, s)| *s)
    }

    /// The value of an option the table marks as required; only absent
    /// when `key_not_required` waived it.
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| Error::MissingConfig(name.to_string()))
    }

    pub fn flag(&self, name: &str) -> Result<bool> {
        self.get(name)
            .map(|v| parse_bool(name, v))
            .transpose()
            .map(|v| v.unwrap_or(false))
    }

    pub fn disallow_env_vars(&self) -> bool {
        self.disallow_env_vars
    }

    pub fn key_not_required(&self) -> bool {
        self.key_not_required
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str, Source)> + '_ {
        self.values
            .iter()
            .map(|(name, (value, source))| (*name, value.as_str(), *source))
    }

    /// Loggable summary: the values of the `public` options, and the
    /// source tier of every resolved option.
    pub fn metadata(&self, public: &[&str]) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (name, value, source) in self.iter() {
            if public.contains(&name) {
                out.insert(name.to_string(), value.to_string());
            }
            out.insert(format!("{name}.source"), source.to_string());
        }
        out
    }
}

pub struct Resolver<'a> {
    env: &'a dyn EnvSource,
    metadata: &'a dyn MetadataSource,
}

impl<'a> Resolver<'a> {
    pub fn new(env: &'a dyn EnvSource, metadata: &'a dyn MetadataSource) -> Self {
        Self { env, metadata }
    }

    pub fn resolve(&self, specs: &[OptionSpec], options: &Options) -> Result<Resolved> {
        let disallow_env_vars = option_flag(options, OPT_DISALLOW_ENV_VARS)?;
        let key_not_required = option_flag(options, OPT_KEY_NOT_REQUIRED)?;

        let mut values = BTreeMap::new();
        for spec in specs {
            if let Some(found) = self.lookup(spec, options, disallow_env_vars)? {
                values.insert(spec.name, found);
                continue;
            }
            let required = match spec.requirement {
                Requirement::Optional => false,
                Requirement::Required => true,
                Requirement::KeyIdentifier => !key_not_required,
            };
            if required {
                return Err(Error::MissingConfig(describe_missing(spec, disallow_env_vars)));
            }
        }

        Ok(Resolved {
            values,
            disallow_env_vars,
            key_not_required,
        })
    }

    fn lookup(
        &self,
        spec: &OptionSpec,
        options: &Options,
        disallow_env_vars: bool,
    ) -> Result<Option<(String, Source)>> {
        if !disallow_env_vars {
            for &name in spec.env {
                if let Some(value) = self.env.var(name).filter(|v| !v.trim().is_empty()) {
                    return Ok(Some((value, Source::Env(name))));
                }
            }
        }

        if let Some(value) = options.get(spec.name) {
            if !value.trim().is_empty() {
                return Ok(Some((value.clone(), Source::Options)));
            }
            if spec.requirement != Requirement::Optional {
                return Err(Error::InvalidConfig(format!("{} must not be empty", spec.name)));
            }
        }

        let from_metadata = |key| {
            self.metadata
                .lookup(key)
                .filter(|v| !v.trim().is_empty())
                .map(|v| (v, Source::Metadata))
        };
        Ok(match spec.default {
            DefaultSource::None => None,
            DefaultSource::Static(value) => Some((value.to_string(), Source::Default)),
            DefaultSource::Metadata(key) => from_metadata(key),
            DefaultSource::MetadataOr(key, value) => {
                from_metadata(key).or_else(|| Some((value.to_string(), Source::Default)))
            }
        })
    }
}

fn describe_missing(spec: &OptionSpec, disallow_env_vars: bool) -> String {
    if spec.env.is_empty() || disallow_env_vars {
        format!("option {:?}", spec.name)
    } else {
        format!("option {:?} (or env {})", spec.name, spec.env.join(" / "))
    }
}

fn option_flag(options: &Options, name: &str) -> Result<bool> {
    options
        .get(name)
        .map(|v| parse_bool(name, v))
        .transpose()
        .map(|v| v.unwrap_or(false))
}

pub fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        other => Err(Error::InvalidConfig(format!("{name}: {other:?} is not a boolean"))),
    }
}

/// Log option keys that no table recognizes; usually a typo.
pub fn warn_unrecognized(options: &Options, tables: &[&[OptionSpec]]) {
    for key in options.keys() {
        let known = key == OPT_DISALLOW_ENV_VARS
            || key == OPT_KEY_NOT_REQUIRED
            || tables.iter().any(|t| t.iter().any(|s| s.name == key));
        if !known {
            log::warn!("ignoring unrecognized option {key:?}");
        }
    }
}
