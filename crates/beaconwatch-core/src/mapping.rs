//! Beacon id → sensor path resolution.
//!
//! A [`SensorMapping`] is built once per configuration load and never
//! mutated; a reload replaces it wholesale.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One `{sensor, path, field}` row of the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub sensor: String,
    pub path: String,
    pub field: String,
}

/// Where a beacon's statistic is published.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SensorTarget {
    pub path: String,
    pub field: String,
}

/// A configured beacon and its target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedSensor {
    pub source_id: String,
    pub target: SensorTarget,
}

/// Lookup key: the scanner's namespace plus the beacon instance id, both
/// normalized with [`normalize_id`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub namespace: String,
    pub instance: String,
}

impl SourceKey {
    pub fn new(namespace: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            instance: instance.into(),
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.instance)
    }
}

/// Canonical form of a hex beacon id: lower-case with a `0x` prefix.
///
/// Accepts ids with or without the prefix and in any case, so `ABCDEF`,
/// `0xabcdef` and ` 0XAbCdEf ` all normalize to `0xabcdef`.
pub fn normalize_id(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ConfigError::InvalidId(raw.to_string()));
    }
    Ok(format!("0x{}", digits.to_ascii_lowercase()))
}

/// Immutable id → target table for one namespace.
#[derive(Debug, Clone, Default)]
pub struct SensorMapping {
    namespace: String,
    sensors: Vec<TrackedSensor>,
    index: HashMap<SourceKey, usize>,
}

impl SensorMapping {
    /// Validate `entries` and index them under `namespace`.
    pub fn new(namespace: &str, entries: &[MappingEntry]) -> Result<Self, ConfigError> {
        let namespace = normalize_id(namespace)?;
        let mut sensors = Vec::with_capacity(entries.len());
        let mut index = HashMap::with_capacity(entries.len());

        for (i, entry) in entries.iter().enumerate() {
            let malformed = |reason: &str| ConfigError::InvalidMapping {
                index: i,
                reason: reason.to_string(),
            };
            if entry.path.trim().is_empty() {
                return Err(malformed("empty path"));
            }
            if entry.field.trim().is_empty() {
                return Err(malformed("empty field"));
            }
            let source_id =
                normalize_id(&entry.sensor).map_err(|_| malformed("sensor is not a hex id"))?;
            let key = SourceKey::new(namespace.clone(), source_id.clone());
            if index.insert(key, sensors.len()).is_some() {
                return Err(ConfigError::DuplicateSensor(source_id));
            }
            sensors.push(TrackedSensor {
                source_id,
                target: SensorTarget {
                    path: entry.path.trim().to_string(),
                    field: entry.field.trim().to_string(),
                },
            });
        }

        Ok(Self {
            namespace,
            sensors,
            index,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Configured sensors, in configuration order.
    pub fn tracked(&self) -> &[TrackedSensor] {
        &self.sensors
    }

    pub fn resolve(&self, key: &SourceKey) -> Option<&TrackedSensor> {
        self.index.get(key).map(|&i| &self.sensors[i])
    }

    /// Distinct target paths, in configuration order.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = Vec::with_capacity(self.sensors.len());
        for s in &self.sensors {
            if !paths.contains(&s.target.path) {
                paths.push(s.target.path.clone());
            }
        }
        paths
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}
