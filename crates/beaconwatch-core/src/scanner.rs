//! Scanning-capability abstraction.
//!
//! The radio itself lives outside this crate. Anything that can produce
//! namespace-filtered Eddystone detections implements
//! [`ScanningCapability`] and pushes them into a [`DetectionSink`] from its
//! own thread. Tests drive the same seam with synthetic events.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use log::error;
use serde::Serialize;

use crate::eddystone::NamespaceFilter;
use crate::error::ScanError;

/// Identity fields decoded from the advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BeaconMetadata {
    pub namespace: String,
    pub instance: String,
}

/// One received advertisement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    /// Bluetooth address of the advertiser (`aa:bb:cc:dd:ee:ff`).
    pub address: String,
    pub rssi: i16,
    pub metadata: BeaconMetadata,
}

/// Receives detections on the scanner's delivery thread.
///
/// Implementations must not block on I/O.
pub trait DetectionSink: Send + Sync {
    fn on_detection(&self, detection: &Detection);
}

/// A source of detections with its own start/stop lifecycle.
pub trait ScanningCapability: Send {
    /// Begin delivering detections whose namespace passes `filter` to `sink`.
    fn start(
        &mut self,
        filter: NamespaceFilter,
        sink: Arc<dyn DetectionSink>,
    ) -> Result<(), ScanError>;

    /// Stop delivery. Once this returns the sink receives no more calls.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Hand `detection` to `sink`, containing any panic so one bad packet cannot
/// take the delivery thread down. Returns `false` if the sink panicked.
pub fn deliver(sink: &dyn DetectionSink, detection: &Detection) -> bool {
    match catch_unwind(AssertUnwindSafe(|| sink.on_detection(detection))) {
        Ok(()) => true,
        Err(_) => {
            error!(
                "detection handler panicked on {} (instance {}, rssi {})",
                detection.address, detection.metadata.instance, detection.rssi
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Collect(Mutex<Vec<i16>>);

    impl DetectionSink for Collect {
        fn on_detection(&self, detection: &Detection) {
            self.0.lock().unwrap().push(detection.rssi);
        }
    }

    struct Explode;

    impl DetectionSink for Explode {
        fn on_detection(&self, _detection: &Detection) {
            panic!("malformed packet");
        }
    }

    fn detection(rssi: i16) -> Detection {
        Detection {
            address: "aa:bb:cc:dd:ee:ff".to_string(),
            rssi,
            metadata: BeaconMetadata {
                namespace: "0x01".to_string(),
                instance: "0xa1".to_string(),
            },
        }
    }

    #[test]
    fn deliver_forwards_to_sink() {
        let sink = Collect(Mutex::new(Vec::new()));
        assert!(deliver(&sink, &detection(-60)));
        assert!(deliver(&sink, &detection(-61)));
        assert_eq!(*sink.0.lock().unwrap(), vec![-60, -61]);
    }

    #[test]
    fn deliver_contains_sink_panics() {
        assert!(!deliver(&Explode, &detection(-60)));
        assert!(!deliver(&Explode, &detection(-61)));
    }
}
