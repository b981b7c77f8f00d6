//! Detection → aggregator bridge.
//!
//! Runs on the scanner's delivery thread: resolves each detection's
//! instance id against the active [`SensorMapping`], folds the RSSI into
//! the [`Aggregator`] and drops everything else. Never blocks on I/O.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{trace, warn};
use serde::Serialize;

use crate::aggregator::Aggregator;
use crate::mapping::{SensorMapping, SourceKey, normalize_id};
use crate::scanner::{BeaconMetadata, Detection, DetectionSink};

/// Unknown ids remembered per run before warnings are suppressed.
pub const DEFAULT_UNKNOWN_CAPACITY: usize = 1024;

/// Counters for one run's ingestion path.
#[derive(Debug, Default)]
pub struct IngestStats {
    accepted: AtomicU64,
    dropped_unknown: AtomicU64,
    dropped_invalid: AtomicU64,
    unknown_warnings: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub accepted: u64,
    pub dropped_unknown: u64,
    pub dropped_invalid: u64,
    pub unknown_warnings: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped_unknown: self.dropped_unknown.load(Ordering::Relaxed),
            dropped_invalid: self.dropped_invalid.load(Ordering::Relaxed),
            unknown_warnings: self.unknown_warnings.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct UnknownIds {
    seen: HashSet<String>,
    saturated: bool,
}

/// Per-run sample ingester. A new one is built on every controller start so
/// the unknown-id memory lives exactly as long as the run.
#[derive(Debug)]
pub struct SampleIngester {
    mapping: Arc<SensorMapping>,
    aggregator: Arc<Aggregator>,
    unknown: Mutex<UnknownIds>,
    capacity: usize,
    stats: IngestStats,
}

impl SampleIngester {
    pub fn new(mapping: Arc<SensorMapping>, aggregator: Arc<Aggregator>) -> Self {
        Self::with_capacity(mapping, aggregator, DEFAULT_UNKNOWN_CAPACITY)
    }

    /// `capacity` bounds how many distinct unknown ids get their own warning.
    pub fn with_capacity(
        mapping: Arc<SensorMapping>,
        aggregator: Arc<Aggregator>,
        capacity: usize,
    ) -> Self {
        Self {
            mapping,
            aggregator,
            unknown: Mutex::new(UnknownIds::default()),
            capacity,
            stats: IngestStats::default(),
        }
    }

    /// Handle one advertisement. Returns whether the sample was aggregated.
    pub fn on_event(&self, address: &str, rssi: f64, metadata: &BeaconMetadata) -> bool {
        // A non-hex id can never be in the mapping; it is remembered raw.
        let Ok(instance) = normalize_id(&metadata.instance) else {
            self.stats.dropped_unknown.fetch_add(1, Ordering::Relaxed);
            self.note_unknown(address, metadata.instance.trim());
            return false;
        };
        let key = SourceKey::new(self.mapping.namespace(), instance);

        let Some(sensor) = self.mapping.resolve(&key) else {
            self.stats.dropped_unknown.fetch_add(1, Ordering::Relaxed);
            self.note_unknown(address, &key.instance);
            return false;
        };

        if self.aggregator.update(&sensor.target.path, rssi) {
            self.stats.accepted.fetch_add(1, Ordering::Relaxed);
            trace!("{} <- {rssi} from {address}", sensor.target.path);
            true
        } else {
            self.stats.dropped_invalid.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn stats(&self) -> IngestSnapshot {
        self.stats.snapshot()
    }

    /// Distinct unknown ids seen this run (capped at the capacity).
    pub fn unknown_count(&self) -> usize {
        self.unknown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .seen
            .len()
    }

    fn note_unknown(&self, address: &str, instance: &str) {
        let mut unknown = self.unknown.lock().unwrap_or_else(PoisonError::into_inner);
        if unknown.seen.contains(instance) {
            return;
        }
        if unknown.seen.len() >= self.capacity {
            if !unknown.saturated {
                unknown.saturated = true;
                self.stats.unknown_warnings.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "{} unrecognized beacons seen this run, further ones are not reported",
                    unknown.seen.len()
                );
            }
            return;
        }
        unknown.seen.insert(instance.to_string());
        self.stats.unknown_warnings.fetch_add(1, Ordering::Relaxed);
        warn!(
            "unrecognized beacon {}/{instance} at {address}, ignoring",
            self.mapping.namespace()
        );
    }
}

impl DetectionSink for SampleIngester {
    fn on_detection(&self, detection: &Detection) {
        self.on_event(
            &detection.address,
            f64::from(detection.rssi),
            &detection.metadata,
        );
    }
}
