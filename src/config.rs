//! Configuration management for the shaper.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

use crate::error::{Result, ShaperError};

/// Main configuration for the shaper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShaperConfig {
    /// Limiter entries, in load order
    #[serde(default)]
    pub limiters: Vec<LimiterOptions>,

    /// Relay configuration
    #[serde(default)]
    pub relay: RelayConfig,
}

/// One limiter entry as it appears in the configuration file.
///
/// Rates and timeouts stay as strings here; they are parsed when the
/// registry is built so a bad entry can be reported by its position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimiterOptions {
    /// Tag referenced by routing rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// Download (server to client) byte rate, e.g. `"10 MB"`
    #[serde(
        default,
        deserialize_with = "deserialize_byte_rate",
        skip_serializing_if = "Option::is_none"
    )]
    pub download: Option<String>,

    /// Upload (client to server) byte rate
    #[serde(
        default,
        deserialize_with = "deserialize_byte_rate",
        skip_serializing_if = "Option::is_none"
    )]
    pub upload: Option<String>,

    /// Idle timeout, e.g. `"30s"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Authenticated users this entry applies to
    #[serde(default, skip_serializing_if = "Listable::is_empty")]
    pub auth_user: Listable<String>,

    /// Give every user its own limiter instead of sharing one
    #[serde(default)]
    pub auth_user_independent: bool,

    /// Inbound listeners this entry applies to
    #[serde(default, skip_serializing_if = "Listable::is_empty")]
    pub inbound: Listable<String>,

    /// Give every inbound its own limiter instead of sharing one
    #[serde(default)]
    pub inbound_independent: bool,
}

/// Accept a byte rate written either as a string or as a bare number of bytes.
fn deserialize_byte_rate<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Bytes(u64),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(text) => text,
        Raw::Bytes(bytes) => bytes.to_string(),
    }))
}

/// A list that may also be written as a single bare value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Listable<T>(pub Vec<T>);

impl<T> Default for Listable<T> {
    fn default() -> Self {
        Listable(Vec::new())
    }
}

impl<T> Listable<T> {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.0.iter()
    }
}

impl<T> From<Vec<T>> for Listable<T> {
    fn from(items: Vec<T>) -> Self {
        Listable(items)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Listable<T> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany<T> {
            One(T),
            Many(Vec<T>),
        }

        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(item) => Listable(vec![item]),
            OneOrMany::Many(items) => Listable(items),
        })
    }
}

/// Relay configuration used by the `shaper relay` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address to accept client connections on
    #[serde(default = "default_listen_addr")]
    pub listen: SocketAddr,

    /// Address every accepted connection is forwarded to
    #[serde(default)]
    pub upstream: Option<SocketAddr>,

    /// Inbound name reported for connections accepted by this relay
    #[serde(default = "default_inbound")]
    pub inbound: String,

    /// User attributed to relayed connections, if any
    #[serde(default)]
    pub user: Option<String>,

    /// Limiter tags applied to every relayed connection
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
            upstream: None,
            inbound: default_inbound(),
            user: None,
            tags: Vec::new(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 1080))
}

fn default_inbound() -> String {
    "relay-in".to_string()
}

impl ShaperConfig {
    /// Load configuration from a file path.
    ///
    /// Files ending in `.json` are read as JSON, everything else as YAML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading shaper configuration");

        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ShaperError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ShaperError::Config(format!("Failed to parse config: {}", e)))
    }
}

const SI_UNITS: [(&str, u32); 7] = [
    ("b", 0),
    ("kb", 1),
    ("mb", 2),
    ("gb", 3),
    ("tb", 4),
    ("pb", 5),
    ("eb", 6),
];

/// Parse a human readable byte count such as `"10 MB"`, `"1.5GiB"` or `"512"`.
///
/// SI units (`KB`, `MB`, ...) step by 1000 and IEC units (`KiB`, `MiB`, ...)
/// by 1024. The trailing `b` may be dropped (`"10k"`, `"2Mi"`), and matching
/// is case-insensitive.
pub fn parse_bytes(s: &str) -> std::result::Result<u64, String> {
    let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
    let split = cleaned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(cleaned.len());
    let (number, unit) = cleaned.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid byte size {:?}", s))?;

    let unit = unit.trim().to_ascii_lowercase();
    let multiplier = byte_multiplier(&unit).ok_or_else(|| format!("unknown unit {:?} in {:?}", unit, s))?;

    let bytes = value * multiplier;
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(format!("byte size {:?} out of range", s));
    }
    Ok(bytes as u64)
}

fn byte_multiplier(unit: &str) -> Option<f64> {
    if unit.is_empty() {
        return Some(1.0);
    }
    let unit = if unit.ends_with('b') {
        unit.to_string()
    } else {
        format!("{}b", unit)
    };

    if let Some(prefix) = unit.strip_suffix("ib") {
        let (_, exp) = SI_UNITS
            .iter()
            .skip(1)
            .find(|(name, _)| name.starts_with(prefix) && prefix.len() == 1)?;
        return Some(1024f64.powi(*exp as i32));
    }

    SI_UNITS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, exp)| 1000f64.powi(*exp as i32))
}

/// Parse a human readable duration such as `"30s"` or `"1m 30s"`.
pub fn parse_duration(s: &str) -> std::result::Result<std::time::Duration, String> {
    humantime::parse_duration(s.trim()).map_err(|e| format!("invalid duration {:?}: {}", s, e))
}
