//! Tunnel driver boundary.
//!
//! The platform driver owns the OS tunnel. This crate only hands it a
//! finished [`TunnelRequest`] and listens to its [`DriverEvent`] stream.

use crate::chain::{ChainMode, ProxyHop};
use crate::config::TunnelConfig;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Everything the driver needs to bring one chain up
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub chain_id: String,
    pub mode: ChainMode,
    /// Relays in traversal order
    pub hops: Vec<ProxyHop>,
    /// WireGuard leg for the VPN exit, if the chain has one
    pub config: Option<TunnelConfig>,
    /// `config` rendered as wg-quick text
    pub rendered_config: Option<String>,
}

/// Telemetry pushed by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    Up { chain_id: String },
    Dropped { chain_id: String, reason: String },
    /// Byte deltas since the previous report
    Traffic {
        chain_id: String,
        bytes_sent: u64,
        bytes_received: u64,
    },
}

#[async_trait]
pub trait TunnelDriver: Send + Sync {
    async fn initialize(&self) -> Result<(), DriverError>;

    /// Bring up the tunnel for `request`. Returns once the driver has
    /// acknowledged it.
    async fn connect(&self, request: &TunnelRequest) -> Result<(), DriverError>;

    /// Tear down the tunnel of `chain_id`. Unknown ids are not an error.
    async fn disconnect(&self, chain_id: &str) -> Result<(), DriverError>;

    async fn is_connected(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<DriverEvent>;
}

/// Cumulative traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl TrafficStats {
    pub fn add(&mut self, sent: u64, received: u64) {
        self.bytes_sent = self.bytes_sent.saturating_add(sent);
        self.bytes_received = self.bytes_received.saturating_add(received);
    }

    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "TX: {:.2}MB, RX: {:.2}MB",
            self.bytes_sent as f64 / (1024.0 * 1024.0),
            self.bytes_received as f64 / (1024.0 * 1024.0),
        )
    }
}

/// Driver errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("Driver not initialized")]
    NotInitialized,

    #[error("Driver timed out")]
    Timeout,

    #[error("Driver rejected tunnel: {0}")]
    Rejected(String),

    #[error("Driver I/O error: {0}")]
    Io(String),
}
