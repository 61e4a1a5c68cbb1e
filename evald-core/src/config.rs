use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};
use thiserror::Error;

use crate::codec::Protocol;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default)]
    pub codec: CodecConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodecConfig {
    /// Upper bound for the summed payload lengths of one request frame.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_frame_len: default_max_frame_len(),
        }
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, strum::EnumString, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Script,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub kind: EngineKind,

    /// Statements evaluated once in every new session. `None` keeps the
    /// engine's own prelude.
    #[serde(default)]
    pub prelude: Option<Vec<String>>,
}

/// What happens to the accumulated pending source when an evaluation times out.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, strum::EnumString, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TimeoutPolicy {
    #[default]
    Discard,
    Preserve,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorConfig {
    /// How long to wait for a cancelled evaluation before abandoning it.
    #[serde(default = "default_cancel_grace", with = "duration_ms")]
    pub cancel_grace: Duration,

    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,

    /// Hard upper bound for every request deadline, including "no deadline" (0).
    #[serde(default, with = "duration_ms_opt")]
    pub timeout_cap: Option<Duration>,

    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            cancel_grace: default_cancel_grace(),
            timeout_policy: TimeoutPolicy::default(),
            timeout_cap: None,
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryConfig {
    /// Least-recently-used sessions are evicted above this count.
    #[serde(default)]
    pub max_sessions: Option<usize>,

    /// Sessions unused for this long are evicted by the sweeper.
    #[serde(default, with = "duration_ms_opt")]
    pub idle_ttl: Option<Duration>,

    #[serde(default = "default_sweep_interval", with = "duration_ms")]
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: None,
            idle_ttl: None,
            sweep_interval: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to open config file: {0}")]
    Open(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl DaemonConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.codec.max_frame_len == 0 {
            return Err(ConfigError::Invalid(
                "codec.max_frame_len must be positive".to_string(),
            ));
        }
        if self.registry.max_sessions == Some(0) {
            return Err(ConfigError::Invalid(
                "registry.max_sessions must be positive when set".to_string(),
            ));
        }
        if self.registry.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "registry.sweep_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> Result<T, ConfigError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, ConfigError> {
    let config = serde_json::from_str(s)?;
    Ok(config)
}

fn default_max_frame_len() -> usize {
    1024 * 1024
}
fn default_cancel_grace() -> Duration {
    Duration::from_millis(500)
}
fn default_max_output_bytes() -> usize {
    1024 * 1024
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

pub mod duration_ms_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
