//! Message and twin data model shared by all transports.
//!
//! Telemetry messages pair an opaque payload with a bounded set of
//! server-recognised system properties and a free-form user property map.
//! Twin documents are arbitrary JSON trees with a reserved `$version` at the
//! root of each section.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Interface id stamped on telemetry flagged as a security message, routing
/// it to the security pipeline instead of regular telemetry ingestion.
pub const SECURITY_MESSAGE_INTERFACE_ID: &str = "urn:azureiot:Security:SecurityAgent:1";

/// Server-recognised message annotations. Every slot is optional; unset
/// slots are simply absent from the encoded property block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub user_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub expiry_time_utc: Option<DateTime<Utc>>,
    pub creation_time_utc: Option<DateTime<Utc>>,
    pub to: Option<String>,
    pub output_name: Option<String>,
    /// Inbound only: the module input the message arrived on.
    pub input_name: Option<String>,
    pub interface_id: Option<String>,
    pub diagnostic_id: Option<String>,
    pub diagnostic_correlation_context: Option<String>,
}

/// Outbound device- or module-to-cloud message.
#[derive(Debug, Clone, Default)]
pub struct TelemetryMessage {
    pub payload: Vec<u8>,
    pub system_properties: SystemProperties,
    pub properties: HashMap<String, String>,
}

impl TelemetryMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.system_properties.message_id = Some(message_id.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Mark this message for the security pipeline by pinning the interface
    /// id to the well-known security value.
    pub fn set_as_security_message(&mut self) {
        self.system_properties.interface_id = Some(SECURITY_MESSAGE_INTERFACE_ID.to_string());
    }

    pub fn is_security_message(&self) -> bool {
        self.system_properties.interface_id.as_deref() == Some(SECURITY_MESSAGE_INTERFACE_ID)
    }
}

/// Inbound cloud-to-device or module-input message.
#[derive(Debug, Clone, Default)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub system_properties: SystemProperties,
    pub properties: HashMap<String, String>,
}

/// What a message listener wants done with a delivered message. MQTT can
/// only ever complete; abandon and reject are accepted from listeners for
/// API symmetry and logged away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    Complete,
    Abandon,
    Reject,
}

/// Service-to-device method invocation.
#[derive(Debug, Clone)]
pub struct DirectMethodRequest {
    pub name: String,
    pub request_id: String,
    pub payload: Vec<u8>,
}

/// Device reply to a method invocation.
#[derive(Debug, Clone)]
pub struct DirectMethodResponse {
    pub status: i32,
    pub request_id: String,
    pub payload: Vec<u8>,
}

impl DirectMethodResponse {
    pub fn new(request: &DirectMethodRequest, status: i32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            request_id: request.request_id.clone(),
            payload: payload.into(),
        }
    }
}

/// One section of a twin: an arbitrary JSON object tree with a reserved
/// `$version` number at the root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TwinCollection(pub Value);

impl TwinCollection {
    /// Server-assigned monotonic version of this section, if present.
    pub fn version(&self) -> Option<i64> {
        self.0.get("$version").and_then(Value::as_i64)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

/// Full twin body as returned by a twin GET: `{ "desired": …, "reported": … }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TwinDocument {
    #[serde(default)]
    pub desired: TwinCollection,
    #[serde(default)]
    pub reported: TwinCollection,
}

/// Twin state handed back to the caller of a twin GET.
#[derive(Debug, Clone)]
pub struct TwinProperties {
    pub desired: TwinCollection,
    pub reported: TwinCollection,
}

impl From<TwinDocument> for TwinProperties {
    fn from(doc: TwinDocument) -> Self {
        Self {
            desired: doc.desired,
            reported: doc.reported,
        }
    }
}

/// Error body the service attaches to failed twin operations. Missing
/// fields default to empty/zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ErrorResponseBody {
    pub error_code: i64,
    pub tracking_id: String,
    pub message: String,
    pub info: HashMap<String, String>,
    pub timestamp_utc: String,
}

impl ErrorResponseBody {
    /// Decode a service error body, tolerating malformed payloads by
    /// falling back to an all-default body.
    pub fn from_payload(payload: &[u8]) -> Self {
        serde_json::from_slice(payload).unwrap_or_default()
    }
}
