//! Gateway events published on the event bus.
//!
//! Provisioning changes, uplink outcomes and connection state transitions are
//! all surfaced here so that a log or metric collaborator can observe every
//! dropped frame.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an uplink frame was dropped instead of reaching the context broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    UnknownApplication,
    UnknownDevice,
    UnsupportedCodec,
    MalformedPayload,
    DownstreamUnavailable,
    QueueFull,
    Internal,
}

impl DropReason {
    /// All reasons, in counter order.
    pub const ALL: [DropReason; 7] = [
        DropReason::UnknownApplication,
        DropReason::UnknownDevice,
        DropReason::UnsupportedCodec,
        DropReason::MalformedPayload,
        DropReason::DownstreamUnavailable,
        DropReason::QueueFull,
        DropReason::Internal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::UnknownApplication => "unknown_application",
            DropReason::UnknownDevice => "unknown_device",
            DropReason::UnsupportedCodec => "unsupported_codec",
            DropReason::MalformedPayload => "malformed_payload",
            DropReason::DownstreamUnavailable => "downstream_unavailable",
            DropReason::QueueFull => "queue_full",
            DropReason::Internal => "internal",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            DropReason::UnknownApplication => 0,
            DropReason::UnknownDevice => 1,
            DropReason::UnsupportedCodec => 2,
            DropReason::MalformedPayload => 3,
            DropReason::DownstreamUnavailable => 4,
            DropReason::QueueFull => 5,
            DropReason::Internal => 6,
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a single transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconciling,
}

/// Unified event type for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayEvent {
    // ========== Provisioning Events ==========
    GroupProvisioned {
        service: String,
        subservice: String,
        application_id: String,
        timestamp: i64,
    },

    GroupRemoved {
        service: String,
        subservice: String,
        application_id: String,
        timestamp: i64,
    },

    /// A device record was created, either explicitly or on first uplink.
    DeviceProvisioned {
        service: String,
        subservice: String,
        device_id: String,
        autoprovisioned: bool,
        timestamp: i64,
    },

    // ========== Uplink Events ==========
    FrameProcessed {
        application_id: String,
        device_id: String,
        entity_id: String,
        attributes: usize,
        timestamp: i64,
    },

    FrameDropped {
        topic: String,
        reason: DropReason,
        detail: String,
        timestamp: i64,
    },

    // ========== Transport Events ==========
    ConnectionStateChanged {
        broker: String,
        state: ConnectionState,
        timestamp: i64,
    },
}

impl GatewayEvent {
    /// Event type name, used for filtering and logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            GatewayEvent::GroupProvisioned { .. } => "GroupProvisioned",
            GatewayEvent::GroupRemoved { .. } => "GroupRemoved",
            GatewayEvent::DeviceProvisioned { .. } => "DeviceProvisioned",
            GatewayEvent::FrameProcessed { .. } => "FrameProcessed",
            GatewayEvent::FrameDropped { .. } => "FrameDropped",
            GatewayEvent::ConnectionStateChanged { .. } => "ConnectionStateChanged",
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            GatewayEvent::GroupProvisioned { timestamp, .. }
            | GatewayEvent::GroupRemoved { timestamp, .. }
            | GatewayEvent::DeviceProvisioned { timestamp, .. }
            | GatewayEvent::FrameProcessed { timestamp, .. }
            | GatewayEvent::FrameDropped { timestamp, .. }
            | GatewayEvent::ConnectionStateChanged { timestamp, .. } => *timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = GatewayEvent::FrameDropped {
            topic: "app9/devices/d1/up".to_string(),
            reason: DropReason::UnknownApplication,
            detail: "no live group".to_string(),
            timestamp: 1_700_000_000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "FrameDropped");
        assert_eq!(json["reason"], "unknown_application");
        assert_eq!(event.type_name(), "FrameDropped");
        assert_eq!(event.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_drop_reason_indices_are_dense() {
        for (i, reason) in DropReason::ALL.iter().enumerate() {
            assert_eq!(reason.index(), i);
        }
    }
}
