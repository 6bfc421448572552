//! Wire-level protocol model: message shapes, topic codec, and connection
//! status types shared by all transports.

pub mod messages;
pub mod status;
pub mod topics;

pub use messages::{
    DirectMethodRequest, DirectMethodResponse, ErrorResponseBody, IncomingMessage,
    MessageDisposition, SystemProperties, TelemetryMessage, TwinCollection, TwinDocument,
    TwinProperties, SECURITY_MESSAGE_INTERFACE_ID,
};
pub use status::{
    ConnectionStatus, ConnectionStatusBus, ConnectionStatusChange, ConnectionStatusChangeReason,
    RecommendedAction,
};
