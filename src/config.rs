use std::{fs::File, io::BufReader, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{Error, MusubiResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameworkConfig {
    /// Name of the event loop thread.
    #[serde(default = "default_event_loop_name")]
    pub event_loop_name: String,
    /// Capacity of the framework event broadcast channel.
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
    #[serde(default = "default_shutdown_timeout", with = "duration_ms")]
    pub shutdown_timeout: Duration,
    /// Default timeout for synchronous waits, `None` waits forever.
    #[serde(default, with = "option_duration_ms")]
    pub wait_timeout: Option<Duration>,
    /// Scheduled event callbacks running longer than this are logged.
    #[serde(default = "default_scheduled_event_warn_threshold", with = "duration_ms")]
    pub scheduled_event_warn_threshold: Duration,
    #[serde(default)]
    pub log_component_transitions: bool,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            event_loop_name: default_event_loop_name(),
            event_buffer_size: default_event_buffer_size(),
            shutdown_timeout: default_shutdown_timeout(),
            wait_timeout: None,
            scheduled_event_warn_threshold: default_scheduled_event_warn_threshold(),
            log_component_transitions: false,
        }
    }
}

impl FrameworkConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> MusubiResult<Self> {
        from_file(path)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> MusubiResult<Self> {
        from_str(s)
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> MusubiResult<T> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("Failed to open config file: {}", e)))?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> MusubiResult<T> {
    let config = serde_json::from_str(s)
        .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
    Ok(config)
}

fn default_event_loop_name() -> String {
    "musubi-event-loop".to_string()
}
fn default_event_buffer_size() -> usize {
    1000
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_scheduled_event_warn_threshold() -> Duration {
    Duration::from_secs(2)
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

pub mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
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
