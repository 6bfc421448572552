//! Topic string formation and parsing for the MQTT control plane.
//!
//! Every topic family the service recognises is formed and parsed here, as
//! is the URL-encoded `k=v&k=v` property block that rides as the final
//! segment of message topics. Keeping the codec pure keeps the transport
//! handler free of string surgery and makes the round-trip laws testable in
//! isolation.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;

use crate::error::{ErrorKind, IotHubError, IotHubResult};
use crate::protocol::messages::{IncomingMessage, SystemProperties, TelemetryMessage};

/// Service-to-client twin response topic prefix.
pub const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
/// Service-to-client desired-property patch topic prefix.
pub const TWIN_DESIRED_PATCH_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";
/// Service-to-client direct method request topic prefix.
pub const METHOD_REQUEST_PREFIX: &str = "$iothub/methods/POST/";

// Wire names the service recognises for system properties.
const MESSAGE_ID: &str = "$.mid";
const CORRELATION_ID: &str = "$.cid";
const USER_ID: &str = "$.uid";
const CONTENT_TYPE: &str = "$.ct";
const CONTENT_ENCODING: &str = "$.ce";
const EXPIRY_TIME_UTC: &str = "$.exp";
const CREATION_TIME_UTC: &str = "iothub-creation-time-utc";
const TO: &str = "$.to";
const OUTPUT_NAME: &str = "$.on";
const INTERFACE_ID: &str = "$.ifid";
const DIAGNOSTIC_ID: &str = "$.diagid";
const DIAGNOSTIC_CONTEXT: &str = "$.diagctx";

/// Characters left literal in the property block. The service expects the
/// `$.` wire-name prefixes unescaped, so `$` and `.` stay out of the set
/// alongside the RFC 3986 unreserved marks.
const PROPERTY_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'$')
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~');

static TWIN_RESPONSE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\$iothub/twin/res/(\d+)/\?\$rid=([^&]+)(?:&\$version=(-?\d+))?$")
        .expect("twin response pattern is valid")
});

/// Device-to-cloud telemetry base topic.
pub fn device_event_topic(device_id: &str) -> String {
    format!("devices/{device_id}/messages/events/")
}

/// Module-to-cloud telemetry base topic.
pub fn module_event_topic(device_id: &str, module_id: &str) -> String {
    format!("devices/{device_id}/modules/{module_id}/messages/events/")
}

/// Cloud-to-device delivery topic prefix.
pub fn device_bound_topic(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/")
}

/// Edge module input topic prefix.
pub fn module_input_topic(device_id: &str, module_id: &str) -> String {
    format!("devices/{device_id}/modules/{module_id}/inputs/")
}

/// Module event delivery topic prefix.
pub fn module_topic(device_id: &str, module_id: &str) -> String {
    format!("devices/{device_id}/modules/{module_id}/")
}

/// Twin GET request topic for one request id.
pub fn twin_get_topic(request_id: &str) -> String {
    format!("$iothub/twin/GET/?$rid={request_id}")
}

/// Reported-property PATCH request topic for one request id.
pub fn twin_patch_reported_topic(request_id: &str) -> String {
    format!("$iothub/twin/PATCH/properties/reported/?$rid={request_id}")
}

/// Twin response topic as published by the service.
pub fn twin_response_topic(status: i32, request_id: &str, version: Option<i64>) -> String {
    match version {
        Some(v) => format!("$iothub/twin/res/{status}/?$rid={request_id}&$version={v}"),
        None => format!("$iothub/twin/res/{status}/?$rid={request_id}"),
    }
}

/// Direct method request topic as published by the service.
pub fn method_request_topic(method_name: &str, request_id: &str) -> String {
    format!("$iothub/methods/POST/{method_name}/?$rid={request_id}")
}

/// Direct method response topic for one status and request id.
pub fn method_response_topic(status: i32, request_id: &str) -> String {
    format!("$iothub/methods/res/{status}/?$rid={request_id}")
}

/// Append the multi-level wildcard marker to a topic prefix, exactly once.
pub fn subscription_filter(prefix: &str) -> String {
    if prefix.ends_with('#') {
        prefix.to_string()
    } else {
        format!("{prefix}#")
    }
}

/// Serialise a UTC instant in ISO-8601 round-trip form.
pub fn format_utc(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_utc(value: &str) -> IotHubResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            IotHubError::with_source(
                ErrorKind::ArgumentInvalid,
                format!("Invalid ISO-8601 property value '{value}'"),
                e,
            )
        })
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, PROPERTY_SET).to_string()
}

fn decode(value: &str) -> IotHubResult<String> {
    percent_decode_str(value)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| {
            IotHubError::with_source(
                ErrorKind::ArgumentInvalid,
                "Property segment is not valid UTF-8",
                e,
            )
        })
}

fn system_property_pairs(sys: &SystemProperties) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut push = |name: &str, value: Option<String>| {
        if let Some(v) = value {
            pairs.push((name.to_string(), v));
        }
    };
    push(MESSAGE_ID, sys.message_id.clone());
    push(CORRELATION_ID, sys.correlation_id.clone());
    push(USER_ID, sys.user_id.clone());
    push(CONTENT_TYPE, sys.content_type.clone());
    push(CONTENT_ENCODING, sys.content_encoding.clone());
    push(EXPIRY_TIME_UTC, sys.expiry_time_utc.as_ref().map(format_utc));
    push(
        CREATION_TIME_UTC,
        sys.creation_time_utc.as_ref().map(format_utc),
    );
    push(TO, sys.to.clone());
    push(OUTPUT_NAME, sys.output_name.clone());
    push(INTERFACE_ID, sys.interface_id.clone());
    push(DIAGNOSTIC_ID, sys.diagnostic_id.clone());
    push(DIAGNOSTIC_CONTEXT, sys.diagnostic_correlation_context.clone());
    pairs
}

/// Encode the merged property block of an outbound message. System
/// properties are laid down first; user properties overwrite on key
/// collision (last write wins). Returns an empty string when the message
/// carries no properties.
pub fn encode_properties(message: &TelemetryMessage) -> String {
    let mut pairs = system_property_pairs(&message.system_properties);
    for (key, value) in &message.properties {
        match pairs.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = value.clone(),
            None => pairs.push((key.clone(), value.clone())),
        }
    }

    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Full publish topic for an outbound message: base topic plus the encoded
/// property block, with a trailing `/` appended if missing.
pub fn telemetry_publish_topic(base: &str, message: &TelemetryMessage) -> String {
    let block = encode_properties(message);
    let mut topic = format!("{base}{block}");
    if !topic.ends_with('/') {
        topic.push('/');
    }
    topic
}

/// Decode a `k=v&k=v` property segment into typed system slots and the
/// user property map. Unrecognised names land in the user map.
pub fn decode_properties(
    segment: &str,
) -> IotHubResult<(SystemProperties, HashMap<String, String>)> {
    let mut sys = SystemProperties::default();
    let mut user = HashMap::new();

    for pair in segment.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (raw_key, raw_value) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        let key = decode(raw_key)?;
        let value = decode(raw_value)?;
        match key.as_str() {
            MESSAGE_ID => sys.message_id = Some(value),
            CORRELATION_ID => sys.correlation_id = Some(value),
            USER_ID => sys.user_id = Some(value),
            CONTENT_TYPE => sys.content_type = Some(value),
            CONTENT_ENCODING => sys.content_encoding = Some(value),
            EXPIRY_TIME_UTC => sys.expiry_time_utc = Some(parse_utc(&value)?),
            CREATION_TIME_UTC => sys.creation_time_utc = Some(parse_utc(&value)?),
            TO => sys.to = Some(value),
            OUTPUT_NAME => sys.output_name = Some(value),
            INTERFACE_ID => sys.interface_id = Some(value),
            DIAGNOSTIC_ID => sys.diagnostic_id = Some(value),
            DIAGNOSTIC_CONTEXT => sys.diagnostic_correlation_context = Some(value),
            _ => {
                user.insert(key, value);
            }
        }
    }

    Ok((sys, user))
}

/// Decode an inbound delivery topic plus payload into an [`IncomingMessage`].
///
/// The property segment sits at path index 4 for the device-bound form and
/// at index 6 for the module endpoint form; the segment count decides which.
pub fn decode_incoming_message(topic: &str, payload: Vec<u8>) -> IotHubResult<IncomingMessage> {
    let parts: Vec<&str> = topic.split('/').collect();
    let index = if parts.len() > 6 { 6 } else { 4 };
    let segment = parts.get(index).copied().unwrap_or("");
    let (system_properties, properties) = decode_properties(segment)?;
    Ok(IncomingMessage {
        payload,
        system_properties,
        properties,
    })
}

/// Parsed twin response topic.
#[derive(Debug, Clone, PartialEq)]
pub struct TwinResponseTopic {
    pub status: i32,
    pub request_id: String,
    /// Present only on status-204 reported-patch responses.
    pub version: Option<i64>,
}

/// Parse a twin response topic. Returns `None` for topics that are not in
/// the twin response family or do not match the fixed shape.
pub fn parse_twin_response_topic(topic: &str) -> Option<TwinResponseTopic> {
    let captures = TWIN_RESPONSE_RE.captures(topic)?;
    let status = captures.get(1)?.as_str().parse().ok()?;
    let request_id = captures.get(2)?.as_str().to_string();
    let version = captures.get(3).and_then(|m| m.as_str().parse().ok());
    Some(TwinResponseTopic {
        status,
        request_id,
        version,
    })
}

/// Parsed direct method request topic.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodRequestTopic {
    pub method_name: String,
    pub request_id: String,
}

/// Parse a direct method request topic. The method name sits at path index
/// 3 and the request id in the index-4 query string; topics with extra
/// segments are malformed and yield `None`.
pub fn parse_method_request_topic(topic: &str) -> Option<MethodRequestTopic> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 5 || !topic.starts_with(METHOD_REQUEST_PREFIX) {
        return None;
    }
    let method_name = parts[3];
    if method_name.is_empty() {
        return None;
    }
    let query = parts[4].strip_prefix('?')?;
    let request_id = query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == "$rid").then(|| v.to_string())
    })?;
    Some(MethodRequestTopic {
        method_name: method_name.to_string(),
        request_id,
    })
}
