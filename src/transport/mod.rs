//! Transport abstraction for the device↔service control plane.
//!
//! The trait mirrors the operations every transport must serve so the
//! device-client layer can be written against an abstraction and tested
//! with mocks. The MQTT implementation lives in [`mqtt`].

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::IotHubResult;
use crate::protocol::messages::{
    DirectMethodRequest, DirectMethodResponse, IncomingMessage, MessageDisposition,
    TelemetryMessage, TwinCollection, TwinProperties,
};

pub mod mqtt;

/// Receives inbound cloud-to-device and module-input messages. The returned
/// disposition drives acknowledgement; over MQTT only
/// [`MessageDisposition::Complete`] is honored.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message_received(&self, message: IncomingMessage) -> MessageDisposition;
}

/// Receives direct method invocations. Delivery is fire-and-forget; the
/// listener responds later via `send_method_response`.
#[async_trait]
pub trait MethodListener: Send + Sync {
    async fn on_method_invoked(&self, request: DirectMethodRequest);
}

/// Receives desired-property pushes, delivered synchronously on the
/// handler's dispatch task; implementations must not block.
pub trait DesiredPropertyListener: Send + Sync {
    fn on_desired_properties(&self, patch: TwinCollection);
}

/// Device-facing transport operations.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn open(&self, cancel: &CancellationToken) -> IotHubResult<()>;

    async fn close(&self, cancel: &CancellationToken) -> IotHubResult<()>;

    async fn send_telemetry(
        &self,
        message: TelemetryMessage,
        cancel: &CancellationToken,
    ) -> IotHubResult<()>;

    async fn enable_receive_message(&self, cancel: &CancellationToken) -> IotHubResult<()>;
    async fn disable_receive_message(&self, cancel: &CancellationToken) -> IotHubResult<()>;

    async fn enable_methods(&self, cancel: &CancellationToken) -> IotHubResult<()>;
    async fn disable_methods(&self, cancel: &CancellationToken) -> IotHubResult<()>;

    async fn send_method_response(
        &self,
        response: DirectMethodResponse,
        cancel: &CancellationToken,
    ) -> IotHubResult<()>;

    async fn enable_twin_patch(&self, cancel: &CancellationToken) -> IotHubResult<()>;
    async fn disable_twin_patch(&self, cancel: &CancellationToken) -> IotHubResult<()>;

    async fn get_twin(&self, cancel: &CancellationToken) -> IotHubResult<TwinProperties>;

    /// Returns the new reported-section version assigned by the service.
    async fn update_reported_properties(
        &self,
        reported: &TwinCollection,
        cancel: &CancellationToken,
    ) -> IotHubResult<i64>;
}
