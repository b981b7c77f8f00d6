//! Publish-side abstraction: payloads, per-path gateways and the
//! [`PublisherSet`] that fans status and readings out to them.
//!
//! Wire format (JSON):
//!
//! - value channel: `{"datetime": …, "values": [{"field": …, "amount": …, "attributes": {"receiver": …, "beacon": …}}]}`
//! - status channel: `{"datetime": …, "status": "RUNNING", "message": "", "attributes": {"receiver": …}}`

use std::collections::BTreeMap;
use std::fmt;

use chrono::{SecondsFormat, Utc};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use crate::config::BrokerAddress;
use crate::error::PublishError;
use crate::mapping::SensorTarget;

/// Run status reported on every tracked path's status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    NotRunning,
    Error,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::NotRunning => write!(f, "NOT_RUNNING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Sub-topic a payload is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Value,
    Status,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::Status => "status",
        }
    }
}

/// One published measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuePayload {
    pub field: String,
    pub amount: f64,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueEnvelope {
    pub datetime: String,
    pub values: Vec<ValuePayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub datetime: String,
    pub status: RunStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Transport bound to one sensor path.
///
/// Implementors supply [`path`](Self::path) and [`send`](Self::send); the
/// payload builders and encoders are shared.
pub trait PublishGateway: Send + Sync {
    fn path(&self) -> &str;

    /// Ship an encoded payload on `channel`. Must not block on the network.
    fn send(&self, channel: Channel, body: Vec<u8>) -> Result<(), PublishError>;

    fn create_value(&self, field: &str, value: f64) -> Result<ValuePayload, PublishError> {
        if !value.is_finite() {
            return Err(PublishError::NonFiniteValue {
                path: self.path().to_string(),
                field: field.to_string(),
                value,
            });
        }
        Ok(ValuePayload {
            field: field.to_string(),
            amount: value,
            attributes: BTreeMap::new(),
        })
    }

    fn create_status_payload(&self, status: RunStatus) -> StatusPayload {
        StatusPayload {
            datetime: now_rfc3339(),
            status,
            message: String::new(),
            attributes: BTreeMap::new(),
        }
    }

    fn publish_status(&self, payload: &StatusPayload) -> Result<(), PublishError> {
        let body = serde_json::to_vec(payload).map_err(|source| PublishError::Encode {
            path: self.path().to_string(),
            source,
        })?;
        self.send(Channel::Status, body)
    }

    fn publish_values(&self, values: Vec<ValuePayload>) -> Result<(), PublishError> {
        let envelope = ValueEnvelope {
            datetime: now_rfc3339(),
            values,
        };
        let body = serde_json::to_vec(&envelope).map_err(|source| PublishError::Encode {
            path: self.path().to_string(),
            source,
        })?;
        self.send(Channel::Value, body)
    }
}

/// Builds a gateway for one path on a remote target.
pub trait GatewayConnector: Send + Sync {
    fn connect(
        &self,
        target: &BrokerAddress,
        topic_prefix: &str,
        path: &str,
    ) -> Result<Box<dyn PublishGateway>, PublishError>;
}

/// Gateways for every tracked path of one receiver.
pub struct PublisherSet {
    receiver: String,
    gateways: BTreeMap<String, Box<dyn PublishGateway>>,
}

impl PublisherSet {
    /// Connect one gateway per distinct path.
    pub fn connect(
        receiver: &str,
        connector: &dyn GatewayConnector,
        target: &BrokerAddress,
        topic_prefix: &str,
        paths: &[String],
    ) -> Result<Self, PublishError> {
        let mut gateways = BTreeMap::new();
        for path in paths {
            if !gateways.contains_key(path) {
                gateways.insert(path.clone(), connector.connect(target, topic_prefix, path)?);
            }
        }
        Ok(Self {
            receiver: receiver.to_string(),
            gateways,
        })
    }

    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.gateways.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }

    /// Publish `status` to one path, tagged with the receiver name.
    pub fn publish_status(&self, path: &str, status: RunStatus) -> Result<(), PublishError> {
        let gateway = self.gateway(path)?;
        let mut payload = gateway.create_status_payload(status);
        payload
            .attributes
            .insert("receiver".to_string(), self.receiver.clone());
        gateway.publish_status(&payload)
    }

    /// Publish `status` to every path. Returns how many succeeded; failures
    /// are logged and do not stop the remaining paths.
    pub fn publish_status_all(&self, status: RunStatus) -> usize {
        let mut ok = 0;
        for path in self.gateways.keys() {
            match self.publish_status(path, status) {
                Ok(()) => ok += 1,
                Err(e) => error!("status {status} not published on {path}: {e}"),
            }
        }
        info!(
            "status {status} published to {ok}/{} sensor paths",
            self.gateways.len()
        );
        ok
    }

    /// Publish one beacon's statistic on its target.
    pub fn publish_reading(
        &self,
        beacon: &str,
        target: &SensorTarget,
        value: f64,
    ) -> Result<(), PublishError> {
        let gateway = self.gateway(&target.path)?;
        let mut payload = gateway.create_value(&target.field, value)?;
        payload
            .attributes
            .insert("receiver".to_string(), self.receiver.clone());
        payload
            .attributes
            .insert("beacon".to_string(), beacon.to_string());
        gateway.publish_values(vec![payload])?;
        debug!("published {value} to {}:{}", target.path, target.field);
        Ok(())
    }

    fn gateway(&self, path: &str) -> Result<&dyn PublishGateway, PublishError> {
        self.gateways
            .get(path)
            .map(|g| &**g)
            .ok_or_else(|| PublishError::NoGateway(path.to_string()))
    }
}

impl fmt::Debug for PublisherSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublisherSet")
            .field("receiver", &self.receiver)
            .field("paths", &self.gateways.keys().collect::<Vec<_>>())
            .finish()
    }
}
