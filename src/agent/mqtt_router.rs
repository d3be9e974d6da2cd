//! Synchronous MQTT session and topic-tree dispatch.
//!
//! The router owns one `paho_mqtt::Client`, subscribes to `{base}/#` on
//! connect, and fans incoming messages out to whichever subscriber list
//! matches the message's fully-qualified topic. Subscribers are plain
//! closures so module code never has to touch `paho_mqtt` types directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

extern crate paho_mqtt as mqtt;

use serde_json::Value;

use super::errors::{Error, Result};

pub type Subscriber = Box<dyn Fn(Value) + Send + 'static>;

struct Inner {
    client: mqtt::Client,
    base_topic: String,
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
}

#[derive(Clone)]
pub struct MqttRouter {
    inner: Arc<Inner>,
}

impl MqttRouter {
    pub fn connect(uri: &str, client_id: &str, username: &str, password: &str, base_topic: impl Into<String>) -> Result<MqttRouter> {
        let client = mqtt::Client::new(mqtt::CreateOptionsBuilder::new().server_uri(uri).client_id(client_id).finalize())
            .map_err(|_| Error::io_init("mqtt-client"))?;

        let base_topic = base_topic.into();
        let availability_topic = format!("{base_topic}/availability");

        let connect_opts = mqtt::ConnectOptionsBuilder::new()
            .mqtt_version(mqtt::MQTT_VERSION_3_1_1)
            .user_name(username)
            .password(password)
            .clean_session(true)
            .keep_alive_interval(Duration::from_secs(30))
            .will_message(mqtt::Message::new_retained(&availability_topic, "offline", 0))
            .finalize();

        client.connect(connect_opts).map_err(|_| Error::io_init("mqtt-connect"))?;
        client
            .publish(mqtt::Message::new_retained(&availability_topic, "online", 0))
            .map_err(|_| Error::io_init("mqtt-connect"))?;

        client.subscribe(&format!("{base_topic}/#"), 0).map_err(|_| Error::io_init("mqtt-subscribe"))?;

        Ok(MqttRouter { inner: Arc::new(Inner { client, base_topic, subscribers: Mutex::new(HashMap::new()) }) })
    }

    /// Registers `callback` for `topic` (relative to the router's base
    /// topic, e.g. `"config"` matches `{base}/config`). Later subscribers
    /// on the same topic run after earlier ones, in registration order.
    pub fn subscribe(&self, topic: impl Into<String>, callback: Subscriber) {
        let full_topic = format!("{}/{}", self.inner.base_topic, topic.into());
        self.inner.subscribers.lock().unwrap().entry(full_topic).or_default().push(callback);
    }

    pub fn unsubscribe_all(&self, topic: &str) {
        let full_topic = format!("{}/{}", self.inner.base_topic, topic);
        self.inner.subscribers.lock().unwrap().remove(&full_topic);
    }

    pub fn publish(&self, topic: &str, payload: &Value) -> Result<()> {
        let full_topic = format!("{}/{}", self.inner.base_topic, topic);
        let body = serde_json::to_vec(payload).map_err(|_| Error::io_init("mqtt-publish"))?;
        self.inner.client.publish(mqtt::Message::new(full_topic, body, 0)).map_err(|_| Error::io_init("mqtt-publish"))?;
        Ok(())
    }

    /// Drains pending messages from the client's receiver and dispatches
    /// each to its topic's subscriber list. Non-blocking: intended to be
    /// called once per tick from the main loop.
    pub fn poll(&self, receiver: &mqtt::Receiver<Option<mqtt::Message>>) {
        while let Ok(Some(message)) = receiver.try_recv() {
            let topic = message.topic().to_string();
            let subscribers = self.inner.subscribers.lock().unwrap();
            let handlers = match subscribers.get(&topic) {
                Some(h) => h,
                None => continue,
            };

            let payload: Value = match serde_json::from_slice(message.payload()) {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(%topic, %err, "dropping malformed MQTT payload");
                    continue;
                }
            };

            for handler in handlers {
                handler(payload.clone());
            }
        }
    }

    pub fn make_receiver(&self) -> mqtt::Receiver<Option<mqtt::Message>> {
        self.inner.client.start_consuming()
    }

    pub fn disconnect(&self) {
        let availability_topic = format!("{}/availability", self.inner.base_topic);
        let _ = self.inner.client.publish(mqtt::Message::new_retained(&availability_topic, "offline", 0));
        let _ = self.inner.client.disconnect(None);
    }
}

/// Builds a router around a client that was never actually connected.
/// `subscribe`/`unsubscribe_all` and the subscriber map work identically;
/// only `connect`'s handshake and `publish`'s wire I/O are skipped. Used by
/// other modules' tests that need a `MqttRouter` to satisfy `construct`'s
/// signature without a live broker.
#[cfg(test)]
pub fn unconnected_for_test(base_topic: impl Into<String>) -> MqttRouter {
    let client = mqtt::Client::new(mqtt::CreateOptionsBuilder::new().server_uri("tcp://127.0.0.1:1").finalize()).unwrap();
    MqttRouter { inner: Arc::new(Inner { client, base_topic: base_topic.into(), subscribers: Mutex::new(HashMap::new()) }) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_registers_under_the_fully_qualified_topic() {
        // `MqttRouter::connect` needs a live broker, so this exercises the
        // subscriber map directly via a bare `Inner` rather than the full
        // connect path.
        let inner = Inner {
            client: mqtt::Client::new(mqtt::CreateOptionsBuilder::new().server_uri("tcp://127.0.0.1:1").finalize()).unwrap(),
            base_topic: "devices/node-1".to_string(),
            subscribers: Mutex::new(HashMap::new()),
        };
        let router = MqttRouter { inner: Arc::new(inner) };

        router.subscribe("config", Box::new(|_| {}));
        assert!(router.inner.subscribers.lock().unwrap().contains_key("devices/node-1/config"));
    }

    #[test]
    fn unsubscribe_all_removes_the_topic_entry() {
        let inner = Inner {
            client: mqtt::Client::new(mqtt::CreateOptionsBuilder::new().server_uri("tcp://127.0.0.1:1").finalize()).unwrap(),
            base_topic: "devices/node-1".to_string(),
            subscribers: Mutex::new(HashMap::new()),
        };
        let router = MqttRouter { inner: Arc::new(inner) };

        router.subscribe("restart", Box::new(|_| {}));
        router.unsubscribe_all("restart");
        assert!(!router.inner.subscribers.lock().unwrap().contains_key("devices/node-1/restart"));
    }
}
