//! MQTT transport: adapter seam, correlation registry, and the transport
//! handler.

pub mod adapter;
pub mod correlation;
pub mod handler;

pub use adapter::{
    build_connect_options, default_product_info, AckHandle, IncomingPublish, MessageAck,
    MqttClient, MqttClientEvent, MqttConnectOptions, RumqttcMqttClient, API_VERSION,
};
pub use correlation::{CorrelationRegistry, PendingKind, PendingOperation, TwinResponse};
pub use handler::MqttTransportHandler;
