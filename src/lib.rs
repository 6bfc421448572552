//! Device-side IoT Hub client transport.
//!
//! This crate implements the device↔service control plane over MQTT 3.1.1:
//! telemetry egress, cloud-to-device delivery, device-twin synchronization,
//! direct method invocation, and shared-access-signature authentication
//! with background token refresh.
//!
//! # Overview
//!
//! - [`protocol`]: topic codec, message/twin data model, connection status
//! - [`transport`]: the transport trait and its MQTT implementation
//! - [`auth`]: SAS signing and the token refresh loop
//! - [`retry`]: retry policies for the layer above the transport
//! - [`error`]: the typed error taxonomy
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use iothub_device::config::{
//!     AuthenticationMethod, ConnectionCredentials, MqttTransportSettings,
//! };
//! use iothub_device::protocol::TelemetryMessage;
//! use iothub_device::transport::mqtt::{MqttTransportHandler, RumqttcMqttClient};
//! use iothub_device::transport::DeviceTransport;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let credentials = ConnectionCredentials::new(
//!     "contoso.azure-devices.net",
//!     "device-1",
//!     AuthenticationMethod::SharedAccessKey {
//!         key: "bXktZGV2aWNlLWtleQ==".to_string(),
//!         policy_name: None,
//!     },
//! )?;
//!
//! let handler = MqttTransportHandler::new(
//!     credentials,
//!     MqttTransportSettings::default(),
//!     Arc::new(RumqttcMqttClient::new()),
//! );
//!
//! let cancel = CancellationToken::new();
//! handler.open(&cancel).await?;
//!
//! let message = TelemetryMessage::new(br#"{"temperature":21.5}"#.to_vec())
//!     .with_message_id("m-1");
//! handler.send_telemetry(message, &cancel).await?;
//!
//! let twin = handler.get_twin(&cancel).await?;
//! println!("desired version: {:?}", twin.desired.version());
//!
//! handler.close(&cancel).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod retry;
pub mod testing;
pub mod transport;

pub use config::{
    AuthenticationMethod, ConnectionCredentials, MqttTransportSettings, QosLevel,
    TransportProtocol,
};
pub use error::{ErrorKind, IotHubError, IotHubResult};
pub use protocol::{
    ConnectionStatus, ConnectionStatusChange, ConnectionStatusChangeReason, DirectMethodRequest,
    DirectMethodResponse, IncomingMessage, MessageDisposition, TelemetryMessage, TwinCollection,
    TwinProperties,
};
pub use retry::{
    ExponentialBackoffRetryPolicy, FixedDelayRetryPolicy, IncrementalDelayRetryPolicy, RetryPolicy,
};
pub use transport::mqtt::MqttTransportHandler;
pub use transport::{DesiredPropertyListener, DeviceTransport, MessageListener, MethodListener};
