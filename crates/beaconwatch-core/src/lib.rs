//! # beaconwatch-core
//!
//! Windowed RSSI aggregation for Eddystone beacons.
//!
//! A scanner pushes detections into a [`SampleIngester`], which resolves each
//! beacon's instance id to a sensor path and folds the RSSI into that path's
//! [`WindowedStat`]. The [`Controller`]'s report loop closes a window every
//! `frequency` and publishes one statistic (`last`, `mean`, `min` or `max`)
//! per tracked beacon through a [`PublishGateway`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use beaconwatch_core::{Controller, MqttConnector, ReplayScanner, ReplaySource, RunConfiguration};
//!
//! let config = RunConfiguration::load("beacons.json").unwrap();
//! let scanner = ReplayScanner::new(ReplaySource::Stdin);
//! let mut controller =
//!     Controller::with_configuration(Box::new(scanner), Arc::new(MqttConnector::new()), config)
//!         .unwrap();
//! controller.start().unwrap();
//! // ...
//! controller.stop();
//! ```
//!
//! ## Architecture
//!
//! Scanner → SampleIngester → Aggregator ← report loop → PublisherSet → broker

pub mod aggregator;
pub mod config;
pub mod controller;
pub mod eddystone;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod mapping;
pub mod mqtt;
pub mod replay;
pub mod scanner;
pub mod signal;
pub mod temperature;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use aggregator::{Aggregator, Mode, WindowedStat};
pub use config::{
    BrokerAddress, ConfigDocument, LoadedConfig, ProbeKind, RunConfiguration, TemperatureConfig,
};
pub use controller::{
    Controller, ControllerStatus, CycleSnapshot, LifecycleState, PreparedConfiguration,
};
pub use eddystone::{NamespaceFilter, UidFrame};
pub use error::{
    ConfigError, ControllerError, DecodeError, LookupError, ProbeError, PublishError, ScanError,
};
pub use gateway::{Channel, GatewayConnector, PublishGateway, PublisherSet, RunStatus};
pub use ingest::{IngestSnapshot, SampleIngester};
pub use mapping::{MappingEntry, SensorMapping, SensorTarget, SourceKey, normalize_id};
pub use mqtt::MqttConnector;
pub use replay::{ReplayScanner, ReplaySource};
pub use scanner::{BeaconMetadata, Detection, DetectionSink, ScanningCapability};
pub use signal::StopSignal;
pub use temperature::{PreparedTemperature, TemperatureProbe, TemperatureReporter};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
