//! In-memory stand-ins for the radio and the broker.
//!
//! [`ManualScanner`] lets a harness inject detections without a radio, and
//! [`RecordingConnector`] captures every payload instead of shipping it.
//! Both are cheap clones over shared state, so a test can keep a handle
//! while the controller owns another.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::BrokerAddress;
use crate::eddystone::NamespaceFilter;
use crate::error::{PublishError, ScanError};
use crate::gateway::{Channel, GatewayConnector, PublishGateway};
use crate::scanner::{BeaconMetadata, Detection, DetectionSink, ScanningCapability, deliver};

// ---------------------------------------------------------------------------
// Scanner double
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScannerState {
    active: Option<(NamespaceFilter, Arc<dyn DetectionSink>)>,
    starts: usize,
    stops: usize,
}

/// Scanner driven by explicit [`emit`](Self::emit) calls.
#[derive(Clone, Default)]
pub struct ManualScanner {
    state: Arc<Mutex<ScannerState>>,
}

impl ManualScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `detection` if the scanner is running and its namespace passes
    /// the filter. Returns whether the sink was called.
    pub fn emit(&self, detection: Detection) -> bool {
        let sink = {
            let state = self.lock();
            match &state.active {
                Some((filter, sink)) if filter.matches(&detection.metadata.namespace) => {
                    Arc::clone(sink)
                }
                _ => return false,
            }
        };
        deliver(sink.as_ref(), &detection)
    }

    /// Shorthand for emitting a detection of `instance` in `namespace`.
    pub fn emit_beacon(&self, namespace: &str, instance: &str, rssi: i16) -> bool {
        self.emit(detection(namespace, instance, rssi))
    }

    pub fn starts(&self) -> usize {
        self.lock().starts
    }

    pub fn stops(&self) -> usize {
        self.lock().stops
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScannerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ScanningCapability for ManualScanner {
    fn start(
        &mut self,
        filter: NamespaceFilter,
        sink: Arc<dyn DetectionSink>,
    ) -> Result<(), ScanError> {
        let mut state = self.lock();
        if state.active.is_some() {
            return Err(ScanError::AlreadyRunning);
        }
        state.active = Some((filter, sink));
        state.starts += 1;
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.lock();
        if state.active.take().is_some() {
            state.stops += 1;
        }
    }

    fn is_running(&self) -> bool {
        self.lock().active.is_some()
    }
}

/// A detection with a fixed placeholder address.
pub fn detection(namespace: &str, instance: &str, rssi: i16) -> Detection {
    Detection {
        address: "00:11:22:33:44:55".to_string(),
        rssi,
        metadata: BeaconMetadata {
            namespace: namespace.to_string(),
            instance: instance.to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Broker double
// ---------------------------------------------------------------------------

/// One captured payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub path: String,
    pub channel: Channel,
    pub body: serde_json::Value,
}

#[derive(Default)]
struct BrokerState {
    published: Vec<Published>,
    failing: HashSet<String>,
    refused: HashSet<String>,
    connections: usize,
}

/// Connector whose gateways append to a shared log.
#[derive(Clone, Default)]
pub struct RecordingConnector {
    state: Arc<Mutex<BrokerState>>,
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send on `path` fail with a transport error.
    pub fn fail_path(&self, path: &str) {
        self.lock().failing.insert(path.to_string());
    }

    pub fn heal_path(&self, path: &str) {
        self.lock().failing.remove(path);
    }

    /// Make every future `connect` for `path` fail.
    pub fn refuse_path(&self, path: &str) {
        self.lock().refused.insert(path.to_string());
    }

    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    /// Captured payloads on `channel` for `path`.
    pub fn published_on(&self, path: &str, channel: Channel) -> Vec<Published> {
        self.lock()
            .published
            .iter()
            .filter(|p| p.path == path && p.channel == channel)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.lock().published.clear();
    }

    /// Gateways handed out so far.
    pub fn connections(&self) -> usize {
        self.lock().connections
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl GatewayConnector for RecordingConnector {
    fn connect(
        &self,
        _target: &BrokerAddress,
        topic_prefix: &str,
        path: &str,
    ) -> Result<Box<dyn PublishGateway>, PublishError> {
        let mut state = self.lock();
        if state.refused.contains(path) {
            return Err(PublishError::Transport {
                path: path.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        state.connections += 1;
        Ok(Box::new(RecordingGateway {
            path: path.to_string(),
            topic_base: format!("{topic_prefix}/{path}"),
            state: Arc::clone(&self.state),
        }))
    }
}

struct RecordingGateway {
    path: String,
    topic_base: String,
    state: Arc<Mutex<BrokerState>>,
}

impl PublishGateway for RecordingGateway {
    fn path(&self) -> &str {
        &self.path
    }

    fn send(&self, channel: Channel, body: Vec<u8>) -> Result<(), PublishError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.failing.contains(&self.path) {
            return Err(PublishError::Transport {
                path: self.path.clone(),
                reason: "broker unreachable".to_string(),
            });
        }
        let body = serde_json::from_slice(&body).map_err(|source| PublishError::Encode {
            path: self.path.clone(),
            source,
        })?;
        state.published.push(Published {
            topic: format!("{}/{}", self.topic_base, channel.as_str()),
            path: self.path.clone(),
            channel,
            body,
        });
        Ok(())
    }
}
