//! MQTT transport handler: connection lifecycle, subscription management,
//! and request/response plumbing for the device↔service control plane.
//!
//! The handler owns the adapter, the correlation registry, the age sweeper,
//! and (for shared-key auth) the token refresher. It classifies every
//! inbound publish by topic prefix and demultiplexes into message delivery,
//! desired-property pushes, twin responses, and direct method calls.
//! Reconnecting after a perceived disconnect is an upper-layer decision;
//! this layer fails pending work fast and signals the status bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::sas::SharedAccessKeySigner;
use crate::auth::TokenRefresher;
use crate::config::{AuthenticationMethod, ConnectionCredentials, MqttTransportSettings};
use crate::error::{ErrorKind, IotHubError, IotHubResult};
use crate::protocol::messages::{
    DirectMethodRequest, DirectMethodResponse, ErrorResponseBody, MessageDisposition,
    TelemetryMessage, TwinCollection, TwinDocument, TwinProperties,
};
use crate::protocol::status::{
    ConnectionStatus, ConnectionStatusBus, ConnectionStatusChange, ConnectionStatusChangeReason,
};
use crate::protocol::topics;
use crate::transport::mqtt::adapter::{
    build_connect_options, default_product_info, IncomingPublish, MqttClient, MqttClientEvent,
};
use crate::transport::mqtt::correlation::{
    CorrelationRegistry, PendingOperation, TwinResponse,
};
use crate::transport::{DesiredPropertyListener, DeviceTransport, MessageListener, MethodListener};

const TWIN_TIMEOUT_MESSAGE: &str = "Did not receive twin response from service.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerState {
    Created,
    Opening,
    Open,
    /// Connection lost; reopening is allowed.
    Disconnected,
    Closing,
    /// Terminal.
    Closed,
}

#[derive(Default)]
struct Listeners {
    message: RwLock<Option<Arc<dyn MessageListener>>>,
    method: RwLock<Option<Arc<dyn MethodListener>>>,
    desired: RwLock<Option<Arc<dyn DesiredPropertyListener>>>,
}

/// Everything the inbound dispatch task needs, detached from the handler so
/// the task owns plain `Arc`s.
struct DispatchContext {
    registry: Arc<CorrelationRegistry>,
    listeners: Arc<Listeners>,
    twin_subscribed: Arc<AtomicBool>,
    status_bus: Arc<ConnectionStatusBus>,
    state: Arc<Mutex<HandlerState>>,
    device_bound_prefix: String,
    module_input_prefix: Option<String>,
    module_prefix: Option<String>,
}

/// MQTT implementation of the device transport.
pub struct MqttTransportHandler {
    credentials: ConnectionCredentials,
    settings: MqttTransportSettings,
    client: Arc<dyn MqttClient>,
    registry: Arc<CorrelationRegistry>,
    state: Arc<Mutex<HandlerState>>,
    twin_subscribed: Arc<AtomicBool>,
    // Serializes the one-time twin response subscription per session.
    twin_subscribe_guard: tokio::sync::Mutex<()>,
    status_bus: Arc<ConnectionStatusBus>,
    listeners: Arc<Listeners>,
    refresher: Mutex<Option<TokenRefresher>>,
    sweeper_task: Mutex<Option<JoinHandle<()>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    product_info: String,
}

impl MqttTransportHandler {
    pub fn new(
        credentials: ConnectionCredentials,
        settings: MqttTransportSettings,
        client: Arc<dyn MqttClient>,
    ) -> Self {
        Self {
            credentials,
            settings,
            client,
            registry: Arc::new(CorrelationRegistry::new()),
            state: Arc::new(Mutex::new(HandlerState::Created)),
            twin_subscribed: Arc::new(AtomicBool::new(false)),
            twin_subscribe_guard: tokio::sync::Mutex::new(()),
            status_bus: Arc::new(ConnectionStatusBus::new()),
            listeners: Arc::new(Listeners::default()),
            refresher: Mutex::new(None),
            sweeper_task: Mutex::new(None),
            dispatch_task: Mutex::new(None),
            product_info: default_product_info(),
        }
    }

    pub fn set_message_listener(&self, listener: Arc<dyn MessageListener>) {
        *self.listeners.message.write() = Some(listener);
    }

    pub fn set_method_listener(&self, listener: Arc<dyn MethodListener>) {
        *self.listeners.method.write() = Some(listener);
    }

    pub fn set_desired_property_listener(&self, listener: Arc<dyn DesiredPropertyListener>) {
        *self.listeners.desired.write() = Some(listener);
    }

    pub fn set_connection_status_callback<F>(&self, callback: F)
    where
        F: Fn(ConnectionStatusChange) + Send + Sync + 'static,
    {
        self.status_bus.set_callback(callback);
    }

    pub fn connection_status(&self) -> Option<ConnectionStatusChange> {
        self.status_bus.current()
    }

    fn ensure_open(&self) -> IotHubResult<()> {
        match *self.state.lock() {
            HandlerState::Open => Ok(()),
            HandlerState::Disconnected => Err(IotHubError::network(
                "The connection was lost; reopen the transport and retry.",
            )),
            HandlerState::Closing | HandlerState::Closed => Err(IotHubError::new(
                ErrorKind::Unknown,
                "The transport handler has been closed.",
            )),
            HandlerState::Created | HandlerState::Opening => Err(IotHubError::new(
                ErrorKind::Unknown,
                "The transport is not open.",
            )),
        }
    }

    fn connect_password(&self) -> IotHubResult<Option<String>> {
        match &self.credentials.auth {
            AuthenticationMethod::X509 { .. } => Ok(None),
            AuthenticationMethod::SharedAccessSignature(token) => Ok(Some(token.clone())),
            AuthenticationMethod::SharedAccessKey { key, policy_name } => {
                let mut refresher = self.refresher.lock();
                if refresher.is_none() {
                    let signer = Arc::new(SharedAccessKeySigner::new(
                        key.clone(),
                        policy_name.clone(),
                    ));
                    *refresher = Some(TokenRefresher::start(
                        signer,
                        self.credentials.audience(),
                    )?);
                }
                Ok(refresher.as_ref().map(|r| r.current_password()))
            }
        }
    }

    fn spawn_dispatch(&self, events: mpsc::Receiver<MqttClientEvent>) {
        let context = DispatchContext {
            registry: self.registry.clone(),
            listeners: self.listeners.clone(),
            twin_subscribed: self.twin_subscribed.clone(),
            status_bus: self.status_bus.clone(),
            state: self.state.clone(),
            device_bound_prefix: topics::device_bound_topic(&self.credentials.device_id),
            module_input_prefix: self
                .credentials
                .module_id
                .as_ref()
                .map(|m| topics::module_input_topic(&self.credentials.device_id, m)),
            module_prefix: self
                .credentials
                .module_id
                .as_ref()
                .map(|m| topics::module_topic(&self.credentials.device_id, m)),
        };

        let task = tokio::spawn(Self::run_dispatch(events, context));
        if let Some(stale) = self.dispatch_task.lock().replace(task) {
            stale.abort();
        }
    }

    fn spawn_sweeper(&self) {
        let registry = self.registry.clone();
        let period = self.settings.twin_response_timeout;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of an interval fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let swept = registry.sweep(period, || {
                    IotHubError::network(TWIN_TIMEOUT_MESSAGE)
                });
                if swept > 0 {
                    warn!(count = swept, "Timed out pending twin operations");
                }
            }
        });
        if let Some(stale) = self.sweeper_task.lock().replace(task) {
            stale.abort();
        }
    }

    async fn run_dispatch(mut events: mpsc::Receiver<MqttClientEvent>, context: DispatchContext) {
        while let Some(event) = events.recv().await {
            match event {
                MqttClientEvent::Message(publish) => {
                    Self::dispatch_publish(publish, &context).await;
                }
                MqttClientEvent::Disconnected { reason } => {
                    Self::handle_disconnect(&context, &reason);
                    break;
                }
            }
        }
        debug!("Inbound dispatch stopped");
    }

    fn handle_disconnect(context: &DispatchContext, reason: &str) {
        warn!(reason = %reason, "Connection to the service was lost");

        // Fail fast so callers can retry after the next open.
        context.registry.sweep(Duration::ZERO, || {
            IotHubError::network("The connection was lost while the operation was pending.")
        });
        context.twin_subscribed.store(false, Ordering::SeqCst);

        let emitted = {
            let mut state = context.state.lock();
            if *state == HandlerState::Open {
                *state = HandlerState::Disconnected;
                true
            } else {
                false
            }
        };
        if emitted {
            context.status_bus.notify(
                ConnectionStatus::DisconnectedRetrying,
                ConnectionStatusChangeReason::CommunicationError,
            );
        }
    }

    async fn dispatch_publish(publish: IncomingPublish, context: &DispatchContext) {
        let IncomingPublish {
            topic,
            payload,
            ack,
        } = publish;

        if topic.starts_with(&context.device_bound_prefix) {
            // Cloud-to-device delivery: acknowledge only after the listener
            // resolves, and only with the complete semantic.
            match topics::decode_incoming_message(&topic, payload) {
                Ok(message) => {
                    let listener = context.listeners.message.read().clone();
                    match listener {
                        Some(listener) => {
                            let disposition = listener.on_message_received(message).await;
                            if disposition != MessageDisposition::Complete {
                                warn!(
                                    ?disposition,
                                    "Abandon and Reject are not supported over MQTT; completing"
                                );
                            }
                        }
                        None => {
                            warn!(topic = %topic, "No message listener registered; completing undelivered message");
                        }
                    }
                    if let Err(e) = ack.complete().await {
                        warn!(error = %e, "Failed to acknowledge device-bound message");
                    }
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Dropping malformed device-bound message");
                    let _ = ack.complete().await;
                }
            }
        } else if topic.starts_with(topics::TWIN_DESIRED_PATCH_PREFIX) {
            let _ = ack.complete().await;
            match serde_json::from_slice(&payload) {
                Ok(value) => {
                    let listener = context.listeners.desired.read().clone();
                    match listener {
                        Some(listener) => listener.on_desired_properties(TwinCollection(value)),
                        None => debug!("Desired property patch arrived with no listener"),
                    }
                }
                Err(e) => warn!(error = %e, "Dropping undecodable desired property patch"),
            }
        } else if topic.starts_with(topics::TWIN_RESPONSE_PREFIX) {
            let _ = ack.complete().await;
            match topics::parse_twin_response_topic(&topic) {
                Some(parsed) => {
                    let delivered = context.registry.complete(
                        &parsed.request_id,
                        TwinResponse {
                            status: parsed.status,
                            version: parsed.version,
                            body: payload,
                        },
                    );
                    if !delivered {
                        debug!(request_id = %parsed.request_id, "Discarding twin response with unknown request id");
                    }
                }
                None => warn!(topic = %topic, "Dropping malformed twin response topic"),
            }
        } else if topic.starts_with(topics::METHOD_REQUEST_PREFIX) {
            let _ = ack.complete().await;
            match topics::parse_method_request_topic(&topic) {
                Some(parsed) => {
                    let request = DirectMethodRequest {
                        name: parsed.method_name,
                        request_id: parsed.request_id,
                        payload,
                    };
                    let listener = context.listeners.method.read().clone();
                    match listener {
                        // Fire-and-forget: the listener answers later via
                        // send_method_response.
                        Some(listener) => {
                            tokio::spawn(async move {
                                listener.on_method_invoked(request).await;
                            });
                        }
                        None => {
                            warn!(method = %request.name, "Direct method arrived with no listener")
                        }
                    }
                }
                None => warn!(topic = %topic, "Dropping malformed method request topic"),
            }
        } else if Self::is_module_delivery(&topic, context) {
            let _ = ack.complete().await;
            match topics::decode_incoming_message(&topic, payload) {
                Ok(mut message) => {
                    let parts: Vec<&str> = topic.split('/').collect();
                    if parts.len() >= 6 {
                        message.system_properties.input_name = Some(parts[5].to_string());
                    }
                    let listener = context.listeners.message.read().clone();
                    match listener {
                        Some(listener) => {
                            tokio::spawn(async move {
                                let disposition = listener.on_message_received(message).await;
                                if disposition != MessageDisposition::Complete {
                                    warn!(
                                        ?disposition,
                                        "Abandon and Reject are not supported over MQTT"
                                    );
                                }
                            });
                        }
                        None => warn!(topic = %topic, "No message listener registered for module delivery"),
                    }
                }
                Err(e) => warn!(topic = %topic, error = %e, "Dropping malformed module delivery"),
            }
        } else {
            debug!(topic = %topic, "Discarding message on unrecognized topic");
        }
    }

    fn is_module_delivery(topic: &str, context: &DispatchContext) -> bool {
        let input = context
            .module_input_prefix
            .as_ref()
            .is_some_and(|p| topic.starts_with(p.as_str()));
        let module = context
            .module_prefix
            .as_ref()
            .is_some_and(|p| topic.starts_with(p.as_str()));
        input || module
    }

    async fn ensure_twin_response_subscription(
        &self,
        cancel: &CancellationToken,
    ) -> IotHubResult<()> {
        if self.twin_subscribed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.twin_subscribe_guard.lock().await;
        if self.twin_subscribed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let filter = topics::subscription_filter(topics::TWIN_RESPONSE_PREFIX);
        self.client
            .subscribe(&filter, self.settings.subscribe_qos, cancel)
            .await?;
        self.twin_subscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn await_twin_response(
        &self,
        receiver: oneshot::Receiver<IotHubResult<TwinResponse>>,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> IotHubResult<TwinResponse> {
        tokio::select! {
            _ = cancel.cancelled() => {
                // The entry must go even if the service answers later.
                self.registry.cancel(request_id);
                Err(IotHubError::cancelled())
            }
            outcome = receiver => match outcome {
                Ok(result) => result,
                Err(_) => Err(IotHubError::network(
                    "The operation was abandoned before a response arrived.",
                )),
            }
        }
    }

    /// Map a non-success twin response body onto the error taxonomy.
    fn service_error(status: i32, body: &[u8]) -> IotHubError {
        let body = ErrorResponseBody::from_payload(body);
        let message = if body.message.is_empty() {
            format!("The service returned status {status}.")
        } else {
            body.message
        };
        let kind = ErrorKind::from_error_code(body.error_code)
            .or_else(|| ErrorKind::from_error_code(i64::from(status)))
            .unwrap_or(ErrorKind::Unknown);
        IotHubError::new(kind, message).with_tracking_id(body.tracking_id)
    }

    fn receive_filter(&self) -> String {
        let prefix = match &self.credentials.module_id {
            Some(module_id) => topics::module_topic(&self.credentials.device_id, module_id),
            None => topics::device_bound_topic(&self.credentials.device_id),
        };
        topics::subscription_filter(&prefix)
    }

    fn telemetry_base_topic(&self) -> String {
        match &self.credentials.module_id {
            Some(module_id) => {
                topics::module_event_topic(&self.credentials.device_id, module_id)
            }
            None => topics::device_event_topic(&self.credentials.device_id),
        }
    }

    async fn open_impl(&self, cancel: &CancellationToken) -> IotHubResult<()> {
        let rollback = {
            let mut state = self.state.lock();
            match *state {
                HandlerState::Created | HandlerState::Disconnected => {
                    let prior = *state;
                    *state = HandlerState::Opening;
                    prior
                }
                // Open is idempotent within a session.
                HandlerState::Opening | HandlerState::Open => return Ok(()),
                HandlerState::Closing | HandlerState::Closed => {
                    return Err(IotHubError::new(
                        ErrorKind::Unknown,
                        "The transport handler has been closed.",
                    ))
                }
            }
        };

        let result = self.open_connection(cancel).await;
        match result {
            Ok(()) => {
                *self.state.lock() = HandlerState::Open;
                self.status_bus.notify(
                    ConnectionStatus::Connected,
                    ConnectionStatusChangeReason::ClientOpen,
                );
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = rollback;
                Err(e)
            }
        }
    }

    async fn open_connection(&self, cancel: &CancellationToken) -> IotHubResult<()> {
        let password = self.connect_password()?;
        let options = build_connect_options(
            &self.credentials,
            &self.settings,
            password,
            &self.product_info,
        );

        self.client.connect(&options, cancel).await?;
        let events = self.client.take_events().ok_or_else(|| {
            IotHubError::network("The adapter did not expose an event stream after connect.")
        })?;

        self.spawn_dispatch(events);
        self.spawn_sweeper();
        Ok(())
    }

    async fn close_impl(&self, cancel: &CancellationToken) -> IotHubResult<()> {
        {
            let mut state = self.state.lock();
            if *state == HandlerState::Closed {
                return Ok(());
            }
            *state = HandlerState::Closing;
        }

        // Release order: refresh loop, sweeper, dispatch, adapter.
        let refresher = self.refresher.lock().take();
        if let Some(mut refresher) = refresher {
            refresher.stop().await;
        }
        if let Some(sweeper) = self.sweeper_task.lock().take() {
            sweeper.abort();
        }
        if let Some(dispatch) = self.dispatch_task.lock().take() {
            dispatch.abort();
        }

        // Best effort: the server times out a dead client on its own.
        if let Err(e) = self.client.disconnect(cancel).await {
            warn!(error = %e, "Disconnect failed; releasing local resources anyway");
        }

        self.registry.sweep(Duration::ZERO, || {
            IotHubError::network("The connection was closed while the operation was pending.")
        });
        self.twin_subscribed.store(false, Ordering::SeqCst);

        *self.state.lock() = HandlerState::Closed;
        self.status_bus.notify(
            ConnectionStatus::Closed,
            ConnectionStatusChangeReason::ClientClose,
        );
        Ok(())
    }

    async fn send_telemetry_impl(
        &self,
        message: TelemetryMessage,
        cancel: &CancellationToken,
    ) -> IotHubResult<()> {
        self.ensure_open()?;
        let topic = topics::telemetry_publish_topic(&self.telemetry_base_topic(), &message);
        self.client
            .publish(&topic, message.payload, self.settings.publish_qos, cancel)
            .await
    }

    async fn get_twin_impl(&self, cancel: &CancellationToken) -> IotHubResult<TwinProperties> {
        self.ensure_open()?;
        self.ensure_twin_response_subscription(cancel).await?;

        let request_id = Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        self.registry
            .insert(&request_id, PendingOperation::get_twin(sender))?;

        let topic = topics::twin_get_topic(&request_id);
        if let Err(e) = self
            .client
            .publish(&topic, Vec::new(), self.settings.publish_qos, cancel)
            .await
        {
            self.registry.cancel(&request_id);
            return Err(e);
        }

        let response = self
            .await_twin_response(receiver, &request_id, cancel)
            .await?;
        match response.status {
            200 => {
                let document: TwinDocument =
                    serde_json::from_slice(&response.body).map_err(|e| {
                        IotHubError::with_source(
                            ErrorKind::Unknown,
                            "Failed to parse the twin document returned by the service",
                            e,
                        )
                    })?;
                Ok(document.into())
            }
            status => Err(Self::service_error(status, &response.body)),
        }
    }

    async fn update_reported_properties_impl(
        &self,
        reported: &TwinCollection,
        cancel: &CancellationToken,
    ) -> IotHubResult<i64> {
        self.ensure_open()?;
        self.ensure_twin_response_subscription(cancel).await?;

        let body = serde_json::to_vec(reported).map_err(|e| {
            IotHubError::with_source(
                ErrorKind::ArgumentInvalid,
                "Failed to serialize reported properties",
                e,
            )
        })?;

        let request_id = Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        self.registry
            .insert(&request_id, PendingOperation::patch_twin(sender))?;

        let topic = topics::twin_patch_reported_topic(&request_id);
        if let Err(e) = self
            .client
            .publish(&topic, body, self.settings.publish_qos, cancel)
            .await
        {
            self.registry.cancel(&request_id);
            return Err(e);
        }

        let response = self
            .await_twin_response(receiver, &request_id, cancel)
            .await?;
        match response.status {
            204 => response.version.ok_or_else(|| {
                IotHubError::new(
                    ErrorKind::Unknown,
                    "The service accepted the reported update but returned no version.",
                )
            }),
            status => Err(Self::service_error(status, &response.body)),
        }
    }

    async fn send_method_response_impl(
        &self,
        response: DirectMethodResponse,
        cancel: &CancellationToken,
    ) -> IotHubResult<()> {
        self.ensure_open()?;
        let topic = topics::method_response_topic(response.status, &response.request_id);
        self.client
            .publish(&topic, response.payload, self.settings.publish_qos, cancel)
            .await
    }
}

#[async_trait]
impl DeviceTransport for MqttTransportHandler {
    async fn open(&self, cancel: &CancellationToken) -> IotHubResult<()> {
        self.open_impl(cancel).await
    }

    async fn close(&self, cancel: &CancellationToken) -> IotHubResult<()> {
        self.close_impl(cancel).await
    }

    async fn send_telemetry(
        &self,
        message: TelemetryMessage,
        cancel: &CancellationToken,
    ) -> IotHubResult<()> {
        self.send_telemetry_impl(message, cancel).await
    }

    async fn enable_receive_message(&self, cancel: &CancellationToken) -> IotHubResult<()> {
        self.ensure_open()?;
        self.client
            .subscribe(&self.receive_filter(), self.settings.subscribe_qos, cancel)
            .await
    }

    async fn disable_receive_message(&self, cancel: &CancellationToken) -> IotHubResult<()> {
        self.ensure_open()?;
        self.client
            .unsubscribe(&self.receive_filter(), cancel)
            .await
    }

    async fn enable_methods(&self, cancel: &CancellationToken) -> IotHubResult<()> {
        self.ensure_open()?;
        let filter = topics::subscription_filter(topics::METHOD_REQUEST_PREFIX);
        self.client
            .subscribe(&filter, self.settings.subscribe_qos, cancel)
            .await
    }

    async fn disable_methods(&self, cancel: &CancellationToken) -> IotHubResult<()> {
        self.ensure_open()?;
        let filter = topics::subscription_filter(topics::METHOD_REQUEST_PREFIX);
        self.client.unsubscribe(&filter, cancel).await
    }

    async fn send_method_response(
        &self,
        response: DirectMethodResponse,
        cancel: &CancellationToken,
    ) -> IotHubResult<()> {
        self.send_method_response_impl(response, cancel).await
    }

    async fn enable_twin_patch(&self, cancel: &CancellationToken) -> IotHubResult<()> {
        self.ensure_open()?;
        let filter = topics::subscription_filter(topics::TWIN_DESIRED_PATCH_PREFIX);
        self.client
            .subscribe(&filter, self.settings.subscribe_qos, cancel)
            .await
    }

    async fn disable_twin_patch(&self, cancel: &CancellationToken) -> IotHubResult<()> {
        self.ensure_open()?;
        let filter = topics::subscription_filter(topics::TWIN_DESIRED_PATCH_PREFIX);
        self.client.unsubscribe(&filter, cancel).await
    }

    async fn get_twin(&self, cancel: &CancellationToken) -> IotHubResult<TwinProperties> {
        self.get_twin_impl(cancel).await
    }

    async fn update_reported_properties(
        &self,
        reported: &TwinCollection,
        cancel: &CancellationToken,
    ) -> IotHubResult<i64> {
        self.update_reported_properties_impl(reported, cancel).await
    }
}

impl Drop for MqttTransportHandler {
    fn drop(&mut self) {
        // Background tasks must not outlive their owner. A graceful close
        // is the caller's job; this only reclaims the tasks.
        if let Some(task) = self.sweeper_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.dispatch_task.lock().take() {
            task.abort();
        }
    }
}
