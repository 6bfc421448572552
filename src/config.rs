//! Connection identity and transport settings.
//!
//! Credentials and settings are built once by the embedding application and
//! handed to a transport handler at construction. The audience string, MQTT
//! client id, and ports are derived from the identity rather than configured
//! separately.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ErrorKind, IotHubError, IotHubResult};

/// TCP port for MQTT over TLS.
pub const MQTT_TCP_PORT: u16 = 8883;
/// WebSocket endpoint path when tunneling MQTT over HTTPS.
pub const MQTT_WEBSOCKET_PATH: &str = "/$iothub/websocket";

/// How the device proves its identity to the service.
#[derive(Clone)]
pub enum AuthenticationMethod {
    /// Client certificate presented during the TLS handshake. No password is
    /// sent in the CONNECT packet.
    X509 {
        cert_pem_path: String,
        key_pem_path: String,
    },
    /// Base64 shared key; a refresher derives short-lived SAS passwords.
    SharedAccessKey {
        key: String,
        policy_name: Option<String>,
    },
    /// Pre-computed SAS string supplied by the caller; used as-is, never
    /// refreshed by this layer.
    SharedAccessSignature(String),
}

impl std::fmt::Debug for AuthenticationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        match self {
            AuthenticationMethod::X509 { cert_pem_path, .. } => f
                .debug_struct("X509")
                .field("cert_pem_path", cert_pem_path)
                .finish_non_exhaustive(),
            AuthenticationMethod::SharedAccessKey { policy_name, .. } => f
                .debug_struct("SharedAccessKey")
                .field("policy_name", policy_name)
                .finish_non_exhaustive(),
            AuthenticationMethod::SharedAccessSignature(_) => {
                f.write_str("SharedAccessSignature(..)")
            }
        }
    }
}

/// Identity of one device or module connection.
#[derive(Debug, Clone)]
pub struct ConnectionCredentials {
    pub host_name: String,
    pub device_id: String,
    pub module_id: Option<String>,
    pub auth: AuthenticationMethod,
}

impl ConnectionCredentials {
    pub fn new(
        host_name: impl Into<String>,
        device_id: impl Into<String>,
        auth: AuthenticationMethod,
    ) -> IotHubResult<Self> {
        let host_name = host_name.into();
        let device_id = device_id.into();
        if host_name.is_empty() {
            return Err(IotHubError::new(
                ErrorKind::ArgumentInvalid,
                "Host name must not be empty.",
            ));
        }
        if device_id.is_empty() {
            return Err(IotHubError::new(
                ErrorKind::ArgumentInvalid,
                "Device id must not be empty.",
            ));
        }
        Ok(Self {
            host_name,
            device_id,
            module_id: None,
            auth,
        })
    }

    pub fn with_module_id(mut self, module_id: impl Into<String>) -> Self {
        self.module_id = Some(module_id.into());
        self
    }

    /// MQTT client id: `deviceId` for devices, `deviceId/moduleId` for
    /// modules.
    pub fn client_id(&self) -> String {
        match &self.module_id {
            Some(module_id) => format!("{}/{}", self.device_id, module_id),
            None => self.device_id.clone(),
        }
    }

    /// Token audience the SAS signature is scoped to.
    pub fn audience(&self) -> String {
        match &self.module_id {
            Some(module_id) => format!(
                "{}/devices/{}/modules/{}",
                self.host_name, self.device_id, module_id
            ),
            None => format!("{}/devices/{}", self.host_name, self.device_id),
        }
    }
}

/// Wire protocol selector. Only the MQTT variants are served by this crate;
/// the enum itself is shared with settings builders so an application can
/// express its choice uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportProtocol {
    MqttTcp,
    MqttWebSocket,
    AmqpTcp,
    AmqpWebSocket,
    Http,
}

/// Delivery guarantee for a single publish or subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum QosLevel {
    /// Fire-and-forget; no PUBACK expected.
    AtMostOnce = 0,
    /// Redelivered until acknowledged.
    AtLeastOnce = 1,
}

impl Default for QosLevel {
    fn default() -> Self {
        Self::AtLeastOnce
    }
}

impl From<QosLevel> for rumqttc::QoS {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QosLevel::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        }
    }
}

/// Minimum TLS protocol version offered during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

/// TLS parameters for the broker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    pub min_protocol: TlsVersion,
    pub check_certificate_revocation: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            min_protocol: TlsVersion::Tls12,
            check_certificate_revocation: false,
        }
    }
}

/// Optional HTTP proxy for WebSocket transports.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub address: Url,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Last-will message registered at connect; the broker publishes it on the
/// device events topic if the session dies without a clean disconnect.
#[derive(Debug, Clone)]
pub struct WillMessage {
    pub payload: Vec<u8>,
    pub qos: QosLevel,
}

/// MQTT-specific transport tuning.
#[derive(Debug, Clone)]
pub struct MqttTransportSettings {
    pub protocol: TransportProtocol,
    pub publish_qos: QosLevel,
    pub subscribe_qos: QosLevel,
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub idle_timeout: Duration,
    /// Period of the pending-operation age sweeper, and the maximum age a
    /// twin request may wait for its response.
    pub twin_response_timeout: Duration,
    pub proxy: Option<ProxySettings>,
    pub will: Option<WillMessage>,
    pub tls: TlsSettings,
    pub auth_chain: Option<String>,
    pub model_id: Option<String>,
}

impl Default for MqttTransportSettings {
    fn default() -> Self {
        Self {
            protocol: TransportProtocol::MqttTcp,
            publish_qos: QosLevel::AtLeastOnce,
            subscribe_qos: QosLevel::AtLeastOnce,
            clean_session: false,
            keep_alive: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(60),
            twin_response_timeout: Duration::from_secs(60),
            proxy: None,
            will: None,
            tls: TlsSettings::default(),
            auth_chain: None,
            model_id: None,
        }
    }
}
