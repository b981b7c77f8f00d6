//! Error types for every failure class the receiver distinguishes.
//!
//! Only [`ConfigError`] is fatal: it keeps a [`Controller`](crate::Controller)
//! from ever entering its report loop. Everything else is logged where it
//! happens and the loop carries on.

use std::path::PathBuf;

use thiserror::Error;

/// Invalid or unreadable configuration. Fatal at load/start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("configuration has no `{0}` section")]
    MissingSection(&'static str),

    #[error("unrecognized mode: {0} (expected last, mean, min or max)")]
    UnknownMode(String),

    #[error("frequency must be greater than zero")]
    InvalidFrequency,

    #[error("mapping #{index} is malformed: {reason}")]
    InvalidMapping { index: usize, reason: String },

    #[error("sensor {0} is mapped more than once")]
    DuplicateSensor(String),

    #[error("invalid broker address `{address}`: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("unknown temperature probe `{0}` (expected thermal_zone or vcgencmd)")]
    UnknownProbe(String),

    #[error("invalid beacon id `{0}`: expected hex digits")]
    InvalidId(String),
}

/// Building or shipping a payload failed. Recoverable; the cycle continues.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("cannot encode payload for {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("value {value} for {path}:{field} is not a finite number")]
    NonFiniteValue {
        path: String,
        field: String,
        value: f64,
    },

    #[error("transport failure on {path}: {reason}")]
    Transport { path: String, reason: String },

    #[error("no gateway registered for path {0}")]
    NoGateway(String),
}

/// A read targeted a path the aggregator never registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sensor path not found: {path}")]
pub struct LookupError {
    pub path: String,
}

/// Starting or stopping a scanning capability failed.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scanner is already running")]
    AlreadyRunning,

    #[error("cannot open detection source {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("scanner worker could not be spawned: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Reading the receiver's own temperature failed.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected probe output `{0}`")]
    Parse(String),
}

/// Eddystone service data or a replay record could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid hex: {0}")]
    Hex(String),

    #[error("frame too short: {len} bytes, need at least {need}")]
    TooShort { len: usize, need: usize },

    #[error("unsupported Eddystone frame type 0x{0:02x}")]
    UnsupportedFrame(u8),

    #[error("record carries neither a frame nor an instance id")]
    MissingIdentity,
}

/// Lifecycle transitions the controller refuses.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("no configuration loaded, can't start scanner")]
    NotConfigured,

    #[error("controller is already running")]
    AlreadyRunning,

    #[error("configuration can only be reloaded while idle")]
    ReloadWhileRunning,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("report loop could not be spawned: {0}")]
    Spawn(#[source] std::io::Error),
}
