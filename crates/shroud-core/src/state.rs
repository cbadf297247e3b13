//! Connection lifecycle states and the transition table.
//!
//! | From | Event | To |
//! |------|-------|----|
//! | Disconnected | connect | Connecting |
//! | Connecting | driver up / driver failed | Connected / Error |
//! | Connected | disconnect / drop / rotate | Disconnecting / Reconnecting / Connecting |
//! | Connecting | rotation failed | Connected (old tunnel kept) |
//! | Connecting, Reconnecting, Error | disconnect | Disconnecting |
//! | Reconnecting | driver up / retries exhausted | Connected / Error |
//! | Disconnecting | driver down | Disconnected |
//! | Error | reset / connect | Disconnected / Connecting |
//!
//! Anything not listed in [`VpnStatus::on`] is rejected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the single active connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// Tunnel dropped, trying to bring it back
    Reconnecting,
    /// Last attempt failed; reset or retry
    Error,
}

impl VpnStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, VpnStatus::Connected)
    }

    /// A tunnel may exist or be in the making
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            VpnStatus::Connecting | VpnStatus::Connected | VpnStatus::Reconnecting
        )
    }

    /// States a fresh connect may start from
    pub fn accepts_connect(&self) -> bool {
        matches!(self, VpnStatus::Disconnected | VpnStatus::Error)
    }

    pub fn description(&self) -> &'static str {
        match self {
            VpnStatus::Disconnected => "Disconnected",
            VpnStatus::Connecting => "Connecting...",
            VpnStatus::Connected => "Connected",
            VpnStatus::Disconnecting => "Disconnecting...",
            VpnStatus::Reconnecting => "Reconnecting...",
            VpnStatus::Error => "Error",
        }
    }

    /// Apply `event`, or reject it if the table has no such edge.
    pub fn on(self, event: ConnectionEvent) -> Result<VpnStatus, TransitionError> {
        use ConnectionEvent as E;
        use VpnStatus as S;

        let next = match (self, event) {
            (S::Disconnected, E::Connect) => S::Connecting,
            (S::Disconnected, E::Disconnect) => S::Disconnected,

            (S::Connecting, E::DriverUp) => S::Connected,
            (S::Connecting, E::DriverFailed) => S::Error,
            (S::Connecting, E::Disconnect) => S::Disconnecting,
            (S::Connecting, E::RotationFailed) => S::Connected,

            (S::Connected, E::Disconnect) => S::Disconnecting,
            (S::Connected, E::DriverDropped) => S::Reconnecting,
            (S::Connected, E::Rotate) => S::Connecting,

            (S::Reconnecting, E::DriverUp) => S::Connected,
            (S::Reconnecting, E::RetriesExhausted) => S::Error,
            (S::Reconnecting, E::Disconnect) => S::Disconnecting,

            (S::Disconnecting, E::DriverDown) => S::Disconnected,

            (S::Error, E::Reset) => S::Disconnected,
            (S::Error, E::Connect) => S::Connecting,
            (S::Error, E::Disconnect) => S::Disconnecting,

            (from, event) => return Err(TransitionError::InvalidStateTransition { from, event }),
        };

        Ok(next)
    }
}

impl fmt::Display for VpnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Inputs to the lifecycle table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    /// Caller asked to connect
    Connect,
    /// Driver acknowledged a tunnel
    DriverUp,
    /// Driver could not establish the tunnel
    DriverFailed,
    /// Caller asked to disconnect
    Disconnect,
    /// Driver reported the tunnel went away
    DriverDropped,
    /// Rotation started
    Rotate,
    /// Rotation's new chain failed; the old tunnel is still up
    RotationFailed,
    /// Reconnect gave up
    RetriesExhausted,
    /// Driver acknowledged teardown
    DriverDown,
    /// Clear an error
    Reset,
}

impl ConnectionEvent {
    pub fn all() -> &'static [ConnectionEvent] {
        &[
            ConnectionEvent::Connect,
            ConnectionEvent::DriverUp,
            ConnectionEvent::DriverFailed,
            ConnectionEvent::Disconnect,
            ConnectionEvent::DriverDropped,
            ConnectionEvent::Rotate,
            ConnectionEvent::RotationFailed,
            ConnectionEvent::RetriesExhausted,
            ConnectionEvent::DriverDown,
            ConnectionEvent::Reset,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("Invalid state transition: {event:?} while {from:?}")]
    InvalidStateTransition {
        from: VpnStatus,
        event: ConnectionEvent,
    },
}
