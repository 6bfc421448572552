//! Library-agnostic MQTT client seam and its rumqttc implementation.
//!
//! The transport handler only ever talks to the [`MqttClient`] trait:
//! connect/publish/subscribe/unsubscribe/disconnect with typed errors, plus
//! an event stream for inbound publishes and perceived disconnects. The
//! rumqttc implementation owns the library event loop on a background task
//! and confirms connects against the actual CONNACK, never the first event.

use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill, MqttOptions,
    Packet, SubscribeReasonCode, Transport,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{
    ConnectionCredentials, MqttTransportSettings, QosLevel, TransportProtocol, WillMessage,
    MQTT_TCP_PORT, MQTT_WEBSOCKET_PATH,
};
use crate::error::{ErrorKind, IotHubError, IotHubResult};
use crate::protocol::topics;

/// Service REST/protocol api-version stamped into the CONNECT username.
pub const API_VERSION: &str = "2020-09-30";

/// Characters left literal in username query-string values.
const USERNAME_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Default product identifier advertised in the username.
pub fn default_product_info() -> String {
    format!("iothub-device/{}", env!("CARGO_PKG_VERSION"))
}

/// Everything needed for one CONNECT attempt.
#[derive(Clone)]
pub struct MqttConnectOptions {
    pub client_id: String,
    pub host_name: String,
    pub port: u16,
    pub username: String,
    /// Absent for X509 authentication.
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub protocol: TransportProtocol,
    /// Will topic plus message, registered at connect.
    pub will: Option<(String, WillMessage)>,
}

impl std::fmt::Debug for MqttConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Password never reaches logs.
        f.debug_struct("MqttConnectOptions")
            .field("client_id", &self.client_id)
            .field("host_name", &self.host_name)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .finish_non_exhaustive()
    }
}

/// Build CONNECT options from credentials and settings.
///
/// The username is the literal service shape
/// `{host}/{clientId}/?api-version={v}&DeviceClientType={product}` with
/// optional `model-id` and `auth-chain` query parameters; the query string
/// is case-sensitive.
pub fn build_connect_options(
    credentials: &ConnectionCredentials,
    settings: &MqttTransportSettings,
    password: Option<String>,
    product_info: &str,
) -> MqttConnectOptions {
    let client_id = credentials.client_id();
    let mut username = format!(
        "{}/{}/?api-version={}&DeviceClientType={}",
        credentials.host_name,
        client_id,
        API_VERSION,
        utf8_percent_encode(product_info, USERNAME_SET),
    );
    if let Some(model_id) = &settings.model_id {
        username.push_str("&model-id=");
        username.push_str(&utf8_percent_encode(model_id, USERNAME_SET).to_string());
    }
    if let Some(auth_chain) = &settings.auth_chain {
        username.push_str("&auth-chain=");
        username.push_str(&utf8_percent_encode(auth_chain, USERNAME_SET).to_string());
    }

    let will = settings.will.clone().map(|will| {
        let topic = topics::device_event_topic(&credentials.device_id);
        (topic, will)
    });

    MqttConnectOptions {
        client_id,
        host_name: credentials.host_name.clone(),
        port: MQTT_TCP_PORT,
        username,
        password,
        keep_alive: settings.keep_alive,
        clean_session: settings.clean_session,
        protocol: settings.protocol,
        will,
    }
}

/// Map a broker CONNECT refusal to an error kind.
pub fn map_connect_return_code(code: ConnectReturnCode) -> ErrorKind {
    match code {
        ConnectReturnCode::BadUserNamePassword
        | ConnectReturnCode::NotAuthorized
        | ConnectReturnCode::BadClientId => ErrorKind::Unauthorized,
        // The protocol version is pinned to 3.1.1; a refusal here means the
        // endpoint is not the service we think it is.
        ConnectReturnCode::RefusedProtocolVersion => ErrorKind::NetworkErrors,
        ConnectReturnCode::ServiceUnavailable => ErrorKind::ServerBusy,
        ConnectReturnCode::Success => ErrorKind::Unknown,
    }
}

fn map_connection_error(error: &ConnectionError) -> IotHubError {
    match error {
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => IotHubError::new(
            ErrorKind::Timeout,
            "Timed out waiting for the server response.",
        ),
        ConnectionError::ConnectionRefused(code) => IotHubError::new(
            map_connect_return_code(*code),
            format!("Connection refused by server: {code:?}"),
        ),
        ConnectionError::Tls(e) => IotHubError::new(
            ErrorKind::TlsAuthenticationError,
            format!("TLS handshake failed: {e}"),
        ),
        other => IotHubError::network(format!("Connection error: {other}")),
    }
}

/// Validate one subscription grant: the result must contain exactly one
/// entry and that entry must be a success at some QoS.
pub fn validate_suback(topic: &str, return_codes: &[SubscribeReasonCode]) -> IotHubResult<()> {
    if return_codes.len() != 1 {
        return Err(IotHubError::network(format!(
            "Subscription to '{topic}' returned {} grants instead of one",
            return_codes.len()
        )));
    }
    match return_codes[0] {
        SubscribeReasonCode::Success(_) => Ok(()),
        SubscribeReasonCode::Failure => Err(IotHubError::network(format!(
            "Subscription to '{topic}' was rejected by the server"
        ))),
    }
}

/// Acknowledgement handle carried by every inbound publish. Dropping it
/// without calling [`complete`](MessageAck::complete) leaves the message
/// unacknowledged and subject to redelivery at QoS 1.
pub struct MessageAck(Option<Box<dyn AckHandle>>);

#[async_trait]
pub trait AckHandle: Send {
    async fn complete(self: Box<Self>) -> IotHubResult<()>;
}

impl MessageAck {
    pub fn new(handle: Box<dyn AckHandle>) -> Self {
        Self(Some(handle))
    }

    /// An ack that does nothing; used at QoS 0 and in tests.
    pub fn noop() -> Self {
        Self(None)
    }

    pub async fn complete(mut self) -> IotHubResult<()> {
        match self.0.take() {
            Some(handle) => handle.complete().await,
            None => Ok(()),
        }
    }
}

/// One inbound publish, not yet acknowledged.
pub struct IncomingPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub ack: MessageAck,
}

/// What the adapter reports upward.
pub enum MqttClientEvent {
    Message(IncomingPublish),
    Disconnected { reason: String },
}

/// Thin, library-agnostic MQTT client surface the transport handler
/// programs against.
#[async_trait]
pub trait MqttClient: Send + Sync {
    async fn connect(
        &self,
        options: &MqttConnectOptions,
        cancel: &CancellationToken,
    ) -> IotHubResult<()>;

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        cancel: &CancellationToken,
    ) -> IotHubResult<()>;

    async fn subscribe(
        &self,
        topic: &str,
        qos: QosLevel,
        cancel: &CancellationToken,
    ) -> IotHubResult<()>;

    async fn unsubscribe(&self, topic: &str, cancel: &CancellationToken) -> IotHubResult<()>;

    async fn disconnect(&self, cancel: &CancellationToken) -> IotHubResult<()>;

    /// Take the event stream for the current connection. Yields `None` if
    /// the stream was already taken or no connection was made yet.
    fn take_events(&self) -> Option<mpsc::Receiver<MqttClientEvent>>;
}

#[derive(Clone, Debug, PartialEq)]
enum ConnectOutcome {
    Pending,
    Connected,
    Failed(ErrorKind, String),
}

struct RumqttcAck {
    client: AsyncClient,
    publish: rumqttc::Publish,
}

#[async_trait]
impl AckHandle for RumqttcAck {
    async fn complete(self: Box<Self>) -> IotHubResult<()> {
        self.client.ack(&self.publish).await.map_err(|e| {
            IotHubError::with_source(ErrorKind::NetworkErrors, "Failed to acknowledge message", e)
        })
    }
}

#[derive(Default)]
struct RumqttcState {
    client: Option<AsyncClient>,
    loop_task: Option<JoinHandle<()>>,
    events_rx: Option<mpsc::Receiver<MqttClientEvent>>,
}

/// [`MqttClient`] backed by rumqttc's `AsyncClient`/`EventLoop`.
#[derive(Default)]
pub struct RumqttcMqttClient {
    state: parking_lot::Mutex<RumqttcState>,
    // Subscribes are serialized so each SubAck correlates to the one
    // in-flight request.
    suback: tokio::sync::Mutex<Option<mpsc::Receiver<Vec<SubscribeReasonCode>>>>,
}

impl RumqttcMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn mqtt_options(options: &MqttConnectOptions) -> MqttOptions {
        let (host, port) = match options.protocol {
            TransportProtocol::MqttWebSocket => (
                format!(
                    "wss://{}:443{}?iothub-no-client-cert=true",
                    options.host_name, MQTT_WEBSOCKET_PATH
                ),
                443,
            ),
            _ => (options.host_name.clone(), options.port),
        };

        let mut mqtt_options = MqttOptions::new(&options.client_id, host, port);
        match options.protocol {
            TransportProtocol::MqttWebSocket => {
                mqtt_options.set_transport(Transport::wss_with_default_config());
            }
            _ => {
                mqtt_options.set_transport(Transport::tls_with_default_config());
            }
        }

        match &options.password {
            Some(password) => {
                mqtt_options.set_credentials(&options.username, password);
            }
            None => {
                mqtt_options.set_credentials(&options.username, "");
            }
        }

        mqtt_options.set_keep_alive(options.keep_alive);
        mqtt_options.set_clean_session(options.clean_session);
        mqtt_options.set_manual_acks(true);
        // Twin documents can be large; the default packet limit is too small.
        mqtt_options.set_max_packet_size(256 * 1024, 256 * 1024);

        if let Some((topic, will)) = &options.will {
            mqtt_options.set_last_will(LastWill::new(
                topic,
                will.payload.clone(),
                will.qos.into(),
                false,
            ));
        }

        mqtt_options
    }

    fn client(&self) -> IotHubResult<AsyncClient> {
        self.state
            .lock()
            .client
            .clone()
            .ok_or_else(|| IotHubError::network("The MQTT connection is not open."))
    }

    async fn run_event_loop(
        mut event_loop: EventLoop,
        client: AsyncClient,
        events_tx: mpsc::Sender<MqttClientEvent>,
        suback_tx: mpsc::Sender<Vec<SubscribeReasonCode>>,
        connack_tx: watch::Sender<ConnectOutcome>,
    ) {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => match ack.code {
                    ConnectReturnCode::Success => {
                        debug!("CONNACK accepted");
                        let _ = connack_tx.send(ConnectOutcome::Connected);
                    }
                    code => {
                        let _ = connack_tx.send(ConnectOutcome::Failed(
                            map_connect_return_code(code),
                            format!("Connection refused by server: {code:?}"),
                        ));
                        break;
                    }
                },
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let ack = MessageAck::new(Box::new(RumqttcAck {
                        client: client.clone(),
                        publish: publish.clone(),
                    }));
                    let event = MqttClientEvent::Message(IncomingPublish {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                        ack,
                    });
                    if events_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(suback))) => {
                    let _ = suback_tx.send(suback.return_codes).await;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    let _ = events_tx
                        .send(MqttClientEvent::Disconnected {
                            reason: "Server closed the connection".to_string(),
                        })
                        .await;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    let mapped = map_connection_error(&e);
                    let reason = mapped.to_string();
                    let _ = connack_tx.send(ConnectOutcome::Failed(
                        mapped.kind(),
                        mapped.message().to_string(),
                    ));
                    let _ = events_tx
                        .send(MqttClientEvent::Disconnected { reason })
                        .await;
                    // Reconnecting is an upper-layer decision; this loop
                    // only reports what it saw.
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl MqttClient for RumqttcMqttClient {
    async fn connect(
        &self,
        options: &MqttConnectOptions,
        cancel: &CancellationToken,
    ) -> IotHubResult<()> {
        let mqtt_options = Self::mqtt_options(options);
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, 16);
        // Network waits are bounded by cancellation, not by the library.
        let mut network_options = rumqttc::NetworkOptions::new();
        network_options.set_connection_timeout(60 * 60 * 24);
        event_loop.set_network_options(network_options);

        let (events_tx, events_rx) = mpsc::channel(128);
        let (suback_tx, suback_rx) = mpsc::channel(16);
        let (connack_tx, mut connack_rx) = watch::channel(ConnectOutcome::Pending);

        let loop_client = client.clone();
        let task = tokio::spawn(Self::run_event_loop(
            event_loop,
            loop_client,
            events_tx,
            suback_tx,
            connack_tx,
        ));

        {
            let mut state = self.state.lock();
            if let Some(stale) = state.loop_task.take() {
                stale.abort();
            }
            state.client = Some(client);
            state.loop_task = Some(task);
            state.events_rx = Some(events_rx);
        }
        *self.suback.lock().await = Some(suback_rx);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(IotHubError::cancelled()),
                changed = connack_rx.changed() => {
                    if changed.is_err() {
                        return Err(IotHubError::network("The connection task ended before CONNACK."));
                    }
                    let outcome = connack_rx.borrow().clone();
                    match outcome {
                        ConnectOutcome::Pending => continue,
                        ConnectOutcome::Connected => return Ok(()),
                        ConnectOutcome::Failed(kind, message) => {
                            // Cancellation wins over a concurrent library
                            // timeout.
                            if kind == ErrorKind::Timeout && cancel.is_cancelled() {
                                return Err(IotHubError::cancelled());
                            }
                            return Err(IotHubError::new(kind, message));
                        }
                    }
                }
            }
        }
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        cancel: &CancellationToken,
    ) -> IotHubResult<()> {
        let client = self.client()?;
        tokio::select! {
            _ = cancel.cancelled() => Err(IotHubError::cancelled()),
            result = client.publish(topic, qos.into(), false, payload) => {
                result.map_err(|e| {
                    IotHubError::with_source(
                        ErrorKind::NetworkErrors,
                        format!("Publish to '{topic}' was not accepted: {e}"),
                        e,
                    )
                })
            }
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        qos: QosLevel,
        cancel: &CancellationToken,
    ) -> IotHubResult<()> {
        let client = self.client()?;
        let mut suback_guard = self.suback.lock().await;
        let suback_rx = suback_guard
            .as_mut()
            .ok_or_else(|| IotHubError::network("The MQTT connection is not open."))?;

        client.subscribe(topic, qos.into()).await.map_err(|e| {
            IotHubError::with_source(
                ErrorKind::NetworkErrors,
                format!("Subscribe to '{topic}' was not accepted: {e}"),
                e,
            )
        })?;

        tokio::select! {
            _ = cancel.cancelled() => Err(IotHubError::cancelled()),
            grant = suback_rx.recv() => match grant {
                Some(return_codes) => validate_suback(topic, &return_codes),
                None => Err(IotHubError::network(format!(
                    "Connection dropped before the subscription to '{topic}' was granted"
                ))),
            }
        }
    }

    async fn unsubscribe(&self, topic: &str, cancel: &CancellationToken) -> IotHubResult<()> {
        let client = self.client()?;
        tokio::select! {
            _ = cancel.cancelled() => Err(IotHubError::cancelled()),
            result = client.unsubscribe(topic) => {
                result.map_err(|e| {
                    IotHubError::with_source(
                        ErrorKind::NetworkErrors,
                        format!("Unsubscribe from '{topic}' was not accepted: {e}"),
                        e,
                    )
                })
            }
        }
    }

    async fn disconnect(&self, cancel: &CancellationToken) -> IotHubResult<()> {
        let (client, task) = {
            let mut state = self.state.lock();
            (state.client.take(), state.loop_task.take())
        };
        *self.suback.lock().await = None;

        let result = match client {
            Some(client) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(IotHubError::cancelled()),
                    outcome = client.disconnect() => {
                        outcome.map_err(|e| {
                            IotHubError::with_source(
                                ErrorKind::NetworkErrors,
                                "Disconnect request was not accepted",
                                e,
                            )
                        })
                    }
                }
            }
            None => Ok(()),
        };

        // Local resources go regardless of how the network wait ended.
        if let Some(task) = task {
            task.abort();
        }
        result
    }

    fn take_events(&self) -> Option<mpsc::Receiver<MqttClientEvent>> {
        self.state.lock().events_rx.take()
    }
}

impl Drop for RumqttcMqttClient {
    fn drop(&mut self) {
        if let Some(task) = self.state.lock().loop_task.take() {
            task.abort();
        }
    }
}
