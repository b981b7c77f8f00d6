//! Configuration document and its validated run-time form.
//!
//! The on-disk document (JSON, or YAML for `.yaml`/`.yml` files) holds an
//! optional `beacons` section for the RSSI controller and an optional
//! `temperature` section for the receiver's own CPU temperature reporter.
//! [`ConfigDocument::validate`] turns it into [`RunConfiguration`] and
//! [`TemperatureConfig`]; nothing downstream sees unvalidated input.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregator::Mode;
use crate::error::ConfigError;
use crate::mapping::{MappingEntry, SensorMapping};

/// Default MQTT port when the broker address leaves it out.
pub const DEFAULT_BROKER_PORT: u16 = 1883;

/// Default topic root; topics are `<prefix>/<path>/<channel>`.
pub const DEFAULT_TOPIC_PREFIX: &str = "sdw";

// ---------------------------------------------------------------------------
// Raw document
// ---------------------------------------------------------------------------

/// The configuration document exactly as written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Receiver name announced at startup check-in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Network interface whose IPv4 address is announced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// URL the check-in is posted to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beacons: Option<BeaconSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<TemperatureSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeaconSection {
    pub name: String,
    pub mode: String,
    pub namespace: String,
    #[serde(alias = "frequency")]
    pub frequency_ms: u64,
    #[serde(alias = "mqtt")]
    pub publish_target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_prefix: Option<String>,
    #[serde(default)]
    pub mappings: Vec<MappingEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemperatureSection {
    #[serde(alias = "mqtt")]
    pub publish_target: String,
    pub sensor: String,
    pub field: String,
    #[serde(alias = "frequency")]
    pub frequency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<String>,
}

impl ConfigDocument {
    /// Read a document from disk. Files ending in `.yaml`/`.yml` are parsed
    /// as YAML, everything else as JSON.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml_str(&text),
            _ => Self::from_json_str(&text),
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Write the document as pretty JSON.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate every present section.
    pub fn validate(&self) -> Result<LoadedConfig, ConfigError> {
        Ok(LoadedConfig {
            version: self.version.clone(),
            beacons: self
                .beacons
                .as_ref()
                .map(RunConfiguration::from_section)
                .transpose()?,
            temperature: self
                .temperature
                .as_ref()
                .map(TemperatureConfig::from_section)
                .transpose()?,
        })
    }
}

/// Validated configuration, ready to hand to the controllers.
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub version: Option<String>,
    pub beacons: Option<RunConfiguration>,
    pub temperature: Option<TemperatureConfig>,
}

// ---------------------------------------------------------------------------
// Broker address
// ---------------------------------------------------------------------------

/// `host:port` of the publish target, parsed from `scheme://host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for BrokerAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidAddress {
            address: s.to_string(),
            reason: reason.to_string(),
        };
        let rest = s.trim();
        let rest = rest.split_once("://").map_or(rest, |(_, r)| r);
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port.parse().map_err(|_| invalid("port is not a number"))?;
                (host, port)
            }
            None => (rest, DEFAULT_BROKER_PORT),
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        if port == 0 {
            return Err(invalid("port must be nonzero"));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

// ---------------------------------------------------------------------------
// Validated sections
// ---------------------------------------------------------------------------

/// Everything one beacon run needs. Fixed for the lifetime of the run.
#[derive(Debug, Clone)]
pub struct RunConfiguration {
    pub name: String,
    pub mode: Mode,
    pub frequency: Duration,
    pub publish_target: BrokerAddress,
    pub topic_prefix: String,
    pub mapping: SensorMapping,
}

impl RunConfiguration {
    pub fn from_section(section: &BeaconSection) -> Result<Self, ConfigError> {
        let mode: Mode = section.mode.parse()?;
        if section.frequency_ms == 0 {
            return Err(ConfigError::InvalidFrequency);
        }
        Ok(Self {
            name: section.name.clone(),
            mode,
            frequency: Duration::from_millis(section.frequency_ms),
            publish_target: section.publish_target.parse()?,
            topic_prefix: topic_prefix(section.topic_prefix.as_deref()),
            mapping: SensorMapping::new(&section.namespace, &section.mappings)?,
        })
    }

    /// Load a document and require its `beacons` section.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        ConfigDocument::from_path(path)?
            .validate()?
            .beacons
            .ok_or(ConfigError::MissingSection("beacons"))
    }

    /// Normalized namespace the scanner filters on.
    pub fn namespace(&self) -> &str {
        self.mapping.namespace()
    }
}

/// Where the receiver reads its own temperature from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Linux `/sys/class/thermal/thermal_zone0/temp`.
    ThermalZone,
    /// Raspberry Pi `vcgencmd measure_temp`.
    Vcgencmd,
}

impl FromStr for ProbeKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thermal_zone" | "thermal" => Ok(Self::ThermalZone),
            "vcgencmd" => Ok(Self::Vcgencmd),
            other => Err(ConfigError::UnknownProbe(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TemperatureConfig {
    pub path: String,
    pub field: String,
    pub frequency: Duration,
    pub publish_target: BrokerAddress,
    pub topic_prefix: String,
    pub probe: ProbeKind,
}

impl TemperatureConfig {
    pub fn from_section(section: &TemperatureSection) -> Result<Self, ConfigError> {
        if section.frequency_ms == 0 {
            return Err(ConfigError::InvalidFrequency);
        }
        if section.sensor.trim().is_empty() || section.field.trim().is_empty() {
            return Err(ConfigError::MissingSection("temperature.sensor/field"));
        }
        Ok(Self {
            path: section.sensor.trim().to_string(),
            field: section.field.trim().to_string(),
            frequency: Duration::from_millis(section.frequency_ms),
            publish_target: section.publish_target.parse()?,
            topic_prefix: topic_prefix(section.topic_prefix.as_deref()),
            probe: section
                .probe
                .as_deref()
                .map_or(Ok(ProbeKind::ThermalZone), str::parse)?,
        })
    }
}

fn topic_prefix(raw: Option<&str>) -> String {
    raw.map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_TOPIC_PREFIX)
        .to_string()
}
