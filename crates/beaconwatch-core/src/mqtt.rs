//! MQTT transport for [`PublishGateway`].
//!
//! One `rumqttc` client is opened per broker and shared by every path on
//! it. Its event loop runs on a background thread that reconnects on its
//! own; gateways only enqueue with `try_publish`, so a slow or unreachable
//! broker shows up as a transport error instead of a stalled report loop.
//! When the last gateway on a broker is dropped the client disconnects and
//! its event loop thread exits.
//!
//! Topics are `<prefix>/<path>/value` and `<prefix>/<path>/status`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use rumqttc::{Client, Event, MqttOptions, Outgoing, Packet, QoS};

use crate::config::BrokerAddress;
use crate::error::PublishError;
use crate::gateway::{Channel, GatewayConnector, PublishGateway};
use crate::signal::StopSignal;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const QUEUE_CAPACITY: usize = 64;

type Registry = Mutex<HashMap<BrokerAddress, Weak<BrokerClient>>>;

/// Opens one MQTT client per broker and shares it while gateways use it.
#[derive(Default)]
pub struct MqttConnector {
    clients: Arc<Registry>,
}

impl MqttConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Brokers with at least one live gateway.
    pub fn broker_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| c.strong_count() > 0)
            .count()
    }

    fn client_for(&self, target: &BrokerAddress) -> Result<Arc<BrokerClient>, PublishError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(target).and_then(Weak::upgrade) {
            return Ok(client);
        }

        let client_id = format!("beaconwatch-{}", uuid::Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id.clone(), target.host.clone(), target.port);
        options.set_keep_alive(KEEP_ALIVE);
        let (client, mut connection) = Client::new(options, QUEUE_CAPACITY);

        let closed = StopSignal::new();
        let loop_closed = closed.clone();
        let broker = target.to_string();
        thread::Builder::new()
            .name(format!("mqtt-{}", target.host))
            .spawn(move || {
                for notification in connection.iter() {
                    match notification {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("connected to {broker} as {client_id}");
                        }
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                        Ok(event) => debug!("{broker}: {event:?}"),
                        Err(e) => {
                            if loop_closed.is_stopped() {
                                break;
                            }
                            warn!("{broker}: connection error: {e}, retrying");
                            if loop_closed.wait_timeout(RECONNECT_DELAY) {
                                break;
                            }
                        }
                    }
                }
                debug!("{broker}: event loop finished");
            })
            .map_err(|e| PublishError::Transport {
                path: target.to_string(),
                reason: format!("event loop thread: {e}"),
            })?;

        let shared = Arc::new(BrokerClient {
            target: target.clone(),
            client,
            closed,
            registry: Arc::downgrade(&self.clients),
        });
        clients.insert(target.clone(), Arc::downgrade(&shared));
        Ok(shared)
    }
}

impl GatewayConnector for MqttConnector {
    fn connect(
        &self,
        target: &BrokerAddress,
        topic_prefix: &str,
        path: &str,
    ) -> Result<Box<dyn PublishGateway>, PublishError> {
        let broker = self.client_for(target)?;
        Ok(Box::new(MqttGateway {
            path: path.to_string(),
            topic_base: topic_base(topic_prefix, path),
            broker,
        }))
    }
}

/// A broker connection shared by every gateway on it.
struct BrokerClient {
    target: BrokerAddress,
    client: Client,
    closed: StopSignal,
    registry: Weak<Registry>,
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        self.closed.stop();
        if let Err(e) = self.client.try_disconnect() {
            debug!("{}: disconnect not queued: {e}", self.target);
        }
        if let Some(registry) = self.registry.upgrade() {
            let mut clients = registry.lock().unwrap_or_else(PoisonError::into_inner);
            // a newer client may already be registered for this broker
            if clients.get(&self.target).is_some_and(|c| c.strong_count() == 0) {
                clients.remove(&self.target);
            }
        }
        info!("closed connection to {}", self.target);
    }
}

/// Gateway for one sensor path on a shared client.
pub struct MqttGateway {
    path: String,
    topic_base: String,
    broker: Arc<BrokerClient>,
}

impl MqttGateway {
    pub fn topic(&self, channel: Channel) -> String {
        format!("{}/{}", self.topic_base, channel.as_str())
    }
}

impl PublishGateway for MqttGateway {
    fn path(&self) -> &str {
        &self.path
    }

    fn send(&self, channel: Channel, body: Vec<u8>) -> Result<(), PublishError> {
        let topic = self.topic(channel);
        self.broker
            .client
            .try_publish(topic.as_str(), QoS::AtLeastOnce, false, body)
            .map_err(|e| PublishError::Transport {
                path: self.path.clone(),
                reason: format!("{topic}: {e}"),
            })
    }
}

fn topic_base(prefix: &str, path: &str) -> String {
    let path = path.trim_matches('/');
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{prefix}/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_layout() {
        assert_eq!(topic_base("sdw", "lab/door"), "sdw/lab/door");
        assert_eq!(topic_base("sdw", "/lab/door/"), "sdw/lab/door");
        assert_eq!(topic_base("", "lab"), "lab");
    }

    fn broker(port: u16) -> BrokerAddress {
        format!("tcp://127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn clients_are_shared_per_broker() {
        let connector = MqttConnector::new();
        let a = connector.connect(&broker(1), "sdw", "a").unwrap();
        let b = connector.connect(&broker(1), "sdw", "b").unwrap();
        assert_eq!(a.path(), "a");
        assert_eq!(b.path(), "b");
        assert_eq!(connector.broker_count(), 1);
        assert_eq!(connector.clients.lock().unwrap().len(), 1);
    }

    #[test]
    fn client_outlives_all_but_the_last_gateway() {
        let connector = MqttConnector::new();
        let a = connector.connect(&broker(1), "sdw", "a").unwrap();
        let b = connector.connect(&broker(1), "sdw", "b").unwrap();
        drop(a);
        assert_eq!(connector.broker_count(), 1);
        drop(b);
        assert_eq!(connector.broker_count(), 0);
    }

    #[test]
    fn dropping_every_gateway_empties_the_cache() {
        let connector = MqttConnector::new();
        let gateways: Vec<_> = (1..=5)
            .map(|port| connector.connect(&broker(port), "sdw", "lab").unwrap())
            .collect();
        assert_eq!(connector.broker_count(), 5);

        drop(gateways);
        assert_eq!(connector.broker_count(), 0);
        assert!(connector.clients.lock().unwrap().is_empty());
    }

    #[test]
    fn reconnect_after_close_opens_a_new_client() {
        let connector = MqttConnector::new();
        drop(connector.connect(&broker(1), "sdw", "a").unwrap());
        let again = connector.connect(&broker(1), "sdw", "a").unwrap();
        assert_eq!(again.path(), "a");
        assert_eq!(connector.clients.lock().unwrap().len(), 1);
    }
}
