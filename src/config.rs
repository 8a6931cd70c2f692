//! Configuration
//!
//! Serde-deserializable settings for the cache layer and the cleaner. Durations
//! are written as Go-style strings (`"500ms"`, `"30s"`, `"1h30m"`, `"7d"`).
//!
//! ```yaml
//! cache:
//!   expiry: 7d
//!   not_found_expiry: 1m
//! cleaner:
//!   tick_interval: 1s
//!   slots: 300
//!   workers: 5
//! nodes:
//!   - name: redis-a
//!     weight: 100
//!   - name: redis-b
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default cache entry lifetime
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(7 * 24 * 3600);

/// Default lifetime of a not-found placeholder
pub const DEFAULT_NOT_FOUND_EXPIRY: Duration = Duration::from_secs(60);

/// Default (and maximum) node weight on the hash ring
pub const DEFAULT_WEIGHT: u32 = 100;

// =============================================================================
// Cache Options
// =============================================================================

/// Per-node cache behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Base TTL for cached values (jittered on write)
    #[serde(default = "default_expiry", with = "duration_str")]
    pub expiry: Duration,

    /// Base TTL for not-found placeholders (jittered on write)
    #[serde(default = "default_not_found_expiry", with = "duration_str")]
    pub not_found_expiry: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            expiry: DEFAULT_EXPIRY,
            not_found_expiry: DEFAULT_NOT_FOUND_EXPIRY,
        }
    }
}

impl CacheOptions {
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_not_found_expiry(mut self, expiry: Duration) -> Self {
        self.not_found_expiry = expiry;
        self
    }
}

fn default_expiry() -> Duration {
    DEFAULT_EXPIRY
}

fn default_not_found_expiry() -> Duration {
    DEFAULT_NOT_FOUND_EXPIRY
}

// =============================================================================
// Cluster Configuration
// =============================================================================

/// One cache node of a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConf {
    /// Node name, also used as its identity on the hash ring
    pub name: String,

    /// Relative share of the key space (1-100)
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl NodeConf {
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Cluster configuration
pub type ClusterConf = Vec<NodeConf>;

fn default_weight() -> u32 {
    DEFAULT_WEIGHT
}

/// Sum of all node weights
pub fn total_weights(confs: &[NodeConf]) -> u64 {
    confs.iter().map(|c| u64::from(c.weight)).sum()
}

// =============================================================================
// Cleaner Configuration
// =============================================================================

/// Settings for the deferred-invalidation retry scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanerConfig {
    /// Timing wheel tick
    #[serde(default = "default_tick_interval", with = "duration_str")]
    pub tick_interval: Duration,

    /// Number of wheel slots
    #[serde(default = "default_slots")]
    pub slots: usize,

    /// Maximum concurrent retries
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            slots: default_slots(),
            workers: default_workers(),
        }
    }
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_slots() -> usize {
    300
}

fn default_workers() -> usize {
    5
}

// =============================================================================
// Top-level Configuration
// =============================================================================

/// Complete configuration as loaded from a file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheOptions,

    #[serde(default)]
    pub cleaner: CleanerConfig,

    #[serde(default)]
    pub nodes: ClusterConf,
}

impl Config {
    /// Parse a YAML document
    pub fn from_yaml(input: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(input)?)
    }

    /// Read and parse a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a Go-style duration string (e.g., "500ms", "30s", "1h30m", "7d")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total = Duration::ZERO;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let unit = match c {
            'm' | 'M' if chars.peek() == Some(&'s') => {
                chars.next();
                Duration::from_millis(1)
            }
            'h' | 'H' => Duration::from_secs(3600),
            'm' | 'M' => Duration::from_secs(60),
            's' | 'S' => Duration::from_secs(1),
            'd' | 'D' => Duration::from_secs(86400),
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };

        let component = u32::try_from(num)
            .ok()
            .and_then(|n| unit.checked_mul(n))
            .ok_or_else(|| Error::DurationParse(format!("duration component too large: {}", s)))?;
        total = total
            .checked_add(component)
            .ok_or_else(|| Error::DurationParse(format!("duration too large: {}", s)))?;
    }

    // Trailing bare number means seconds
    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total = total
            .checked_add(Duration::from_secs(num))
            .ok_or_else(|| Error::DurationParse(format!("duration too large: {}", s)))?;
    }

    if total.is_zero() {
        return Err(Error::DurationParse(
            "duration must be greater than 0".to_string(),
        ));
    }

    Ok(total)
}

/// Render a duration in the format accepted by [`parse_duration`]
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        return format!("{}ms", millis);
    }

    let mut secs = d.as_secs();
    let mut out = String::new();
    for (unit, size) in [("d", 86400), ("h", 3600), ("m", 60), ("s", 1)] {
        if secs >= size {
            out.push_str(&format!("{}{}", secs / size, unit));
            secs %= size;
        }
    }
    if out.is_empty() {
        out.push_str("0s");
    }
    out
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
