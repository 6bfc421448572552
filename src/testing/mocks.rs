//! Mock MQTT client for exercising the transport handler without a broker.
//!
//! Records every adapter call, lets tests script connect/subscribe/publish
//! outcomes, and injects inbound publishes and disconnects through the same
//! event stream the real adapter uses. Acknowledgements land in a shared
//! operation log so tests can assert ordering against listener activity.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::QosLevel;
use crate::error::{ErrorKind, IotHubError, IotHubResult};
use crate::transport::mqtt::adapter::{
    AckHandle, IncomingPublish, MessageAck, MqttClient, MqttClientEvent, MqttConnectOptions,
};

/// One recorded publish.
#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QosLevel,
}

type ScriptedResult = Result<(), (ErrorKind, String)>;

/// Scriptable, recording [`MqttClient`] double.
#[derive(Default)]
pub struct MockMqttClient {
    connect_results: Mutex<VecDeque<ScriptedResult>>,
    subscribe_results: Mutex<VecDeque<ScriptedResult>>,
    publish_failure: Mutex<Option<String>>,
    disconnect_failure: Mutex<Option<String>>,

    connect_options: Mutex<Vec<MqttConnectOptions>>,
    published: Mutex<Vec<PublishRecord>>,
    subscribed: Mutex<Vec<String>>,
    unsubscribed: Mutex<Vec<String>>,
    disconnect_calls: AtomicU32,

    events_tx: Mutex<Option<mpsc::Sender<MqttClientEvent>>>,
    events_rx: Mutex<Option<mpsc::Receiver<MqttClientEvent>>>,

    /// Interleaved record of acknowledgements (`ack:{topic}`); tests push
    /// their own listener entries to assert ordering.
    ops_log: Arc<Mutex<Vec<String>>>,
}

impl MockMqttClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_connect(&self, kind: ErrorKind, message: &str) {
        self.connect_results
            .lock()
            .push_back(Err((kind, message.to_string())));
    }

    pub fn fail_next_subscribe(&self, kind: ErrorKind, message: &str) {
        self.subscribe_results
            .lock()
            .push_back(Err((kind, message.to_string())));
    }

    /// Make every publish fail, carrying `reason` in the error message.
    pub fn fail_publishes(&self, reason: &str) {
        *self.publish_failure.lock() = Some(reason.to_string());
    }

    pub fn fail_disconnect(&self, message: &str) {
        *self.disconnect_failure.lock() = Some(message.to_string());
    }

    pub fn connect_count(&self) -> usize {
        self.connect_options.lock().len()
    }

    pub fn last_connect_options(&self) -> Option<MqttConnectOptions> {
        self.connect_options.lock().last().cloned()
    }

    pub fn published(&self) -> Vec<PublishRecord> {
        self.published.lock().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscribed.lock().clone()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        self.unsubscribed.lock().clone()
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn ops_log(&self) -> Arc<Mutex<Vec<String>>> {
        self.ops_log.clone()
    }

    pub fn acked_topics(&self) -> Vec<String> {
        self.ops_log
            .lock()
            .iter()
            .filter_map(|entry| entry.strip_prefix("ack:").map(str::to_string))
            .collect()
    }

    /// Deliver an inbound publish through the event stream.
    pub async fn inject_publish(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let sender = self
            .events_tx
            .lock()
            .clone()
            .expect("inject_publish requires a connected mock");
        let ack = MessageAck::new(Box::new(RecordingAck {
            topic: topic.to_string(),
            log: self.ops_log.clone(),
        }));
        sender
            .send(MqttClientEvent::Message(IncomingPublish {
                topic: topic.to_string(),
                payload: payload.into(),
                ack,
            }))
            .await
            .expect("handler dispatch stopped");
    }

    /// Report a perceived disconnect through the event stream.
    pub async fn inject_disconnect(&self, reason: &str) {
        let sender = self
            .events_tx
            .lock()
            .clone()
            .expect("inject_disconnect requires a connected mock");
        sender
            .send(MqttClientEvent::Disconnected {
                reason: reason.to_string(),
            })
            .await
            .expect("handler dispatch stopped");
    }
}

struct RecordingAck {
    topic: String,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl AckHandle for RecordingAck {
    async fn complete(self: Box<Self>) -> IotHubResult<()> {
        self.log.lock().push(format!("ack:{}", self.topic));
        Ok(())
    }
}

#[async_trait]
impl MqttClient for MockMqttClient {
    async fn connect(
        &self,
        options: &MqttConnectOptions,
        _cancel: &CancellationToken,
    ) -> IotHubResult<()> {
        self.connect_options.lock().push(options.clone());
        if let Some(Err((kind, message))) = self.connect_results.lock().pop_front() {
            return Err(IotHubError::new(kind, message));
        }

        let (tx, rx) = mpsc::channel(32);
        *self.events_tx.lock() = Some(tx);
        *self.events_rx.lock() = Some(rx);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        _cancel: &CancellationToken,
    ) -> IotHubResult<()> {
        if let Some(reason) = self.publish_failure.lock().clone() {
            return Err(IotHubError::network(format!(
                "Publish to '{topic}' failed with reason code {reason}"
            )));
        }
        self.published.lock().push(PublishRecord {
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        _qos: QosLevel,
        _cancel: &CancellationToken,
    ) -> IotHubResult<()> {
        if let Some(Err((kind, message))) = self.subscribe_results.lock().pop_front() {
            return Err(IotHubError::new(kind, message));
        }
        self.subscribed.lock().push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, _cancel: &CancellationToken) -> IotHubResult<()> {
        self.unsubscribed.lock().push(topic.to_string());
        Ok(())
    }

    async fn disconnect(&self, cancel: &CancellationToken) -> IotHubResult<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(IotHubError::cancelled());
        }
        if let Some(message) = self.disconnect_failure.lock().clone() {
            return Err(IotHubError::network(message));
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<MqttClientEvent>> {
        self.events_rx.lock().take()
    }
}
