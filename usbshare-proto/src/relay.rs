use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::device::DeviceEntry;

/// Every message type the relay understands, in both directions.
///
/// The wire form is a JSON object discriminated by a `type` field,
/// e.g. `{"type":"share_device","key":"abc123","device_id":"1-1"}`.
/// Senders may attach extra fields; the relay ignores them and, for the
/// forwarded message kinds, passes the original text through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Host -> Relay: register under a pairing key.
    HostConnect { key: String },

    /// Client -> Relay: join the session held by `key`.
    ClientConnect { key: String },

    /// Host/Client -> Relay: opaque payload forwarded to the paired side.
    #[serde(rename = "relay_message")]
    Relay {
        #[serde(default)]
        payload: Value,
    },

    /// Host -> Relay: full replacement of the device catalog. Also
    /// broadcast verbatim by the relay to every client in the session.
    DeviceListUpdate { devices: Vec<DeviceEntry> },

    /// Host -> Relay: mark a device as shared.
    ShareDevice { key: String, device_id: String },

    /// Host -> Relay: withdraw a previously shared device.
    UnshareDevice { key: String, device_id: String },

    /// Client -> Relay: opaque request forwarded to the session's host.
    RequestDevice {
        #[serde(default)]
        payload: Value,
    },

    /// Client -> Relay: start forwarding `device_id` to this client. The
    /// session is named explicitly by `key` rather than by registration.
    ConnectDevice { key: String, device_id: String },

    /// Any -> Relay: stop forwarding for this connection.
    DisconnectDevice {
        #[serde(default)]
        device_id: Option<String>,
    },

    /// Host/Client -> Relay: low-latency opaque device traffic.
    UsbData { device_id: String, data: String },

    /// Client -> Relay: forwarded to the session's host.
    StopSharing {
        #[serde(default)]
        payload: Value,
    },

    // Relay-originated notifications.
    /// Registration acknowledgment. For hosts this may carry the device
    /// list freshly queried from the host machine's tooling.
    RegistrationSuccess {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        devices: Option<Vec<DeviceEntry>>,
    },

    /// Domain error reply; the connection stays open.
    Error { message: String },

    /// Sent to every client when their session's host goes away.
    HostDisconnected,

    /// A device was shared into the session.
    DeviceAvailable { device_id: String },

    /// A shared device was withdrawn.
    DeviceUnavailable { device_id: String },

    /// Current catalog, sent to a client joining a non-empty session.
    DeviceList { devices: Vec<DeviceEntry> },

    /// Outcome of a `connect_device` request.
    DeviceConnectionStatus { success: bool },

    /// Outcome of a `disconnect_device` request.
    DeviceDisconnected { success: bool },
}

/// Why an inbound message could not be turned into a [`RelayMessage`].
///
/// The relay recovers from all of these locally: the offending message is
/// logged and dropped, the connection stays open.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("message has no type field")]
    MissingType,

    #[error("message type {tag:?} is missing required fields: {source}")]
    MissingField {
        tag: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unrecognized message type {0:?}")]
    UnknownType(String),
}

/// The closed set of recognized `type` tags. Anything else is rejected
/// explicitly instead of falling through silently.
const KNOWN_TYPES: &[&str] = &[
    "host_connect",
    "client_connect",
    "relay_message",
    "device_list_update",
    "share_device",
    "unshare_device",
    "request_device",
    "connect_device",
    "disconnect_device",
    "usb_data",
    "stop_sharing",
    "registration_success",
    "error",
    "host_disconnected",
    "device_available",
    "device_unavailable",
    "device_list",
    "device_connection_status",
    "device_disconnected",
];

impl RelayMessage {
    /// Parse one wire record, distinguishing the failure modes the relay
    /// handles differently: unparsable JSON, a missing discriminator, a
    /// recognized type with missing required fields, and an unknown type.
    pub fn from_json(text: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(text).map_err(ParseError::Malformed)?;
        let tag = match value.get("type").and_then(Value::as_str) {
            Some(tag) => tag.to_string(),
            None => return Err(ParseError::MissingType),
        };
        if !KNOWN_TYPES.contains(&tag.as_str()) {
            return Err(ParseError::UnknownType(tag));
        }
        serde_json::from_value(value).map_err(|source| ParseError::MissingField { tag, source })
    }

    /// Serialize for the wire. Infallible for this type.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("RelayMessage serializes to JSON")
    }
}
