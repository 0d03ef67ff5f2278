//! # HYPERDESK Protocol
//!
//! Codec for the control-plane message bus.
//!
//! Every frame is a JSON envelope:
//!
//! ```text
//! {
//!   "version": "0.1",
//!   "type": "PAIRING_REQUEST",
//!   "request_id": null,
//!   "timestamp": "2026-01-01T00:00:00+00:00",
//!   "payload": { ... }
//! }
//! ```
//!
//! The codec validates the envelope shape and a static required-field table
//! per message type. Extra payload fields are accepted and forwarded so that
//! newer peers can ride additional data through older daemons. The codec is
//! pure: no I/O, no connection state.

#![warn(missing_docs)]
#![warn(clippy::all)]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Wire protocol version carried in every envelope.
pub const PROTOCOL_VERSION: &str = "0.1";

/// Protocol-level errors.
///
/// Any of these on the inbound path means the offending frame is dropped;
/// the connection itself stays up.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The outer JSON failed to parse
    #[error("invalid JSON payload")]
    InvalidJson(#[from] serde_json::Error),

    /// A required envelope field is absent
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// The `type` field names no known message
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// The `payload` field is not a JSON object
    #[error("payload must be an object")]
    PayloadNotObject,

    /// The payload is missing fields the schema requires
    #[error("payload missing fields for {message_type}: {}", fields.join(", "))]
    MissingPayloadFields {
        /// Message type whose schema was violated
        message_type: MessageType,
        /// The absent required fields
        fields: Vec<&'static str>,
    },
}

/// Control-plane message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Presence probe from a device
    DiscoveryPing,
    /// Presence answer carrying the responder's address
    DiscoveryOffer,
    /// Peer asks to redeem a pairing code
    PairingRequest,
    /// Host advertises a session offer with its policy
    PairingOffer,
    /// Peer confirms a pairing offer
    PairingConfirm,
    /// Peer declines a pairing offer
    PairingDecline,
    /// Host accepts the pairing and mints a session token
    PairingAccept,
    /// Session status or policy changed
    SessionUpdate,
    /// Ask the session peer for a file
    TransferRequest,
    /// Announce a bulk TCP endpoint for a job
    TransferOffer,
    /// Progress/terminal report for a job
    TransferStatus,
}

impl MessageType {
    /// All message types, in wire-table order.
    pub const ALL: [Self; 11] = [
        Self::DiscoveryPing,
        Self::DiscoveryOffer,
        Self::PairingRequest,
        Self::PairingOffer,
        Self::PairingConfirm,
        Self::PairingDecline,
        Self::PairingAccept,
        Self::SessionUpdate,
        Self::TransferRequest,
        Self::TransferOffer,
        Self::TransferStatus,
    ];

    /// The canonical wire name of this type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DiscoveryPing => "DISCOVERY_PING",
            Self::DiscoveryOffer => "DISCOVERY_OFFER",
            Self::PairingRequest => "PAIRING_REQUEST",
            Self::PairingOffer => "PAIRING_OFFER",
            Self::PairingConfirm => "PAIRING_CONFIRM",
            Self::PairingDecline => "PAIRING_DECLINE",
            Self::PairingAccept => "PAIRING_ACCEPT",
            Self::SessionUpdate => "SESSION_UPDATE",
            Self::TransferRequest => "TRANSFER_REQUEST",
            Self::TransferOffer => "TRANSFER_OFFER",
            Self::TransferStatus => "TRANSFER_STATUS",
        }
    }

    /// Resolve a wire name, or `None` for an unknown type.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == name)
    }

    /// The payload fields the schema requires for this type.
    #[must_use]
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            Self::DiscoveryPing => &["device_id", "name", "capabilities"],
            Self::DiscoveryOffer => &["device_id", "name", "ip", "capabilities"],
            Self::PairingRequest => &["device_id", "pair_code"],
            Self::PairingOffer => &[
                "session_id",
                "host_id",
                "host_name",
                "host_ip",
                "mode",
                "approval_required",
                "conflict_rule",
                "allow_browse",
                "allow_requests",
                "allow_edits",
                "edit_mode",
                "allow_client_share",
            ],
            Self::PairingConfirm | Self::PairingDecline => &["session_id", "device_id"],
            Self::PairingAccept => &["session_id", "device_id", "session_token"],
            Self::SessionUpdate => &[
                "session_id",
                "status",
                "mode",
                "approval_required",
                "conflict_rule",
                "allow_browse",
                "allow_requests",
                "allow_edits",
                "edit_mode",
                "allow_client_share",
            ],
            Self::TransferRequest => &["session_id", "path", "direction", "size"],
            Self::TransferOffer => &["session_id", "job_id", "filename", "size", "host", "port"],
            Self::TransferStatus => &["job_id", "status", "progress", "checksum"],
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded control-plane envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Protocol version as received
    pub version: String,
    /// Decoded message type
    pub message_type: MessageType,
    /// Optional correlation id
    pub request_id: Option<String>,
    /// ISO-8601 UTC timestamp as received
    pub timestamp: String,
    /// Payload object, extra fields preserved
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Fetch a payload field as a string slice, if present and textual.
    #[must_use]
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Encode a message into a wire frame.
///
/// The envelope is stamped with [`PROTOCOL_VERSION`] and the current UTC
/// time. Unknown types are unrepresentable here; the payload is still checked
/// against the required-field table so a daemon can never emit a frame its
/// own decoder would reject.
///
/// # Errors
///
/// Returns [`ProtocolError::MissingPayloadFields`] when the payload lacks a
/// required field.
pub fn encode_message(
    message_type: MessageType,
    payload: Map<String, Value>,
    request_id: Option<&str>,
) -> Result<String, ProtocolError> {
    validate_payload(message_type, &payload)?;
    let envelope = serde_json::json!({
        "version": PROTOCOL_VERSION,
        "type": message_type.as_str(),
        "request_id": request_id,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "payload": Value::Object(payload),
    });
    Ok(envelope.to_string())
}

/// Decode and validate a wire frame.
///
/// # Errors
///
/// Fails when the outer JSON is malformed, any of `version`, `type`,
/// `timestamp`, or `payload` is absent, the type is unknown, the payload is
/// not an object, or a required payload field is missing.
pub fn decode_message(raw: &str) -> Result<Envelope, ProtocolError> {
    let data: Value = serde_json::from_str(raw)?;

    let version = envelope_field(&data, "version")?;
    let type_name = envelope_field(&data, "type")?;
    let timestamp = envelope_field(&data, "timestamp")?;
    let payload_value = data
        .get("payload")
        .ok_or(ProtocolError::MissingField("payload"))?;

    let message_type = MessageType::parse(&type_name)
        .ok_or_else(|| ProtocolError::UnknownType(type_name.clone()))?;
    let payload = payload_value
        .as_object()
        .cloned()
        .ok_or(ProtocolError::PayloadNotObject)?;
    validate_payload(message_type, &payload)?;

    let request_id = data
        .get("request_id")
        .and_then(Value::as_str)
        .map(str::to_owned);

    Ok(Envelope {
        version,
        message_type,
        request_id,
        timestamp,
        payload,
    })
}

fn envelope_field(data: &Value, key: &'static str) -> Result<String, ProtocolError> {
    data.get(key)
        .ok_or(ProtocolError::MissingField(key))
        .map(|v| match v.as_str() {
            Some(s) => s.to_owned(),
            None => v.to_string(),
        })
}

fn validate_payload(
    message_type: MessageType,
    payload: &Map<String, Value>,
) -> Result<(), ProtocolError> {
    let missing: Vec<&'static str> = message_type
        .required_fields()
        .iter()
        .copied()
        .filter(|field| !payload.contains_key(*field))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::MissingPayloadFields {
            message_type,
            fields: missing,
        })
    }
}
