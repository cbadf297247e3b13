//! Shroud - connection orchestration for a multi-hop VPN client
//!
//! Turns a "connect with mode M" request into a validated chain of relays
//! (optionally ending in a WireGuard exit), drives it through a strict
//! lifecycle, rotates it on a schedule and tracks the security posture.
//!
//! # Architecture
//!
//! ```text
//!  caller ──connect(mode)──▶ ChainComposer ◀── ServerCatalog / Selector
//!                                │
//!                                ▼ AnonymityChain
//!                      ConfigCodec (render + validate)
//!                                │
//!                                ▼ TunnelRequest
//!  RotationScheduler ──▶ ConnectionStateMachine ──▶ TunnelDriver (platform)
//!                                │       ▲                │
//!                 ConnectionStatus│       └── DriverEvent ─┘
//!                                ▼
//!                     SecurityPostureTracker ──▶ SecurityAlert stream
//! ```
//!
//! # Guarantees
//!
//! - One active chain at a time; all transitions go through one lock
//! - Config errors are rejected before the driver is touched
//! - Rotation keeps the old tunnel until the new one is acknowledged
//! - A connect that completes after a disconnect is torn down, not adopted

pub mod config;

mod alerts;
mod catalog;
mod chain;
mod driver;
mod keys;
mod kill_switch;
mod manager;
mod posture;
mod scheduler;
mod settings;
mod state;

pub use alerts::{AlertLog, AlertSeverity, SecurityAlert, DEFAULT_ALERT_CAPACITY};
pub use catalog::{
    distance_km, is_directly_usable, CatalogError, GeoPoint, KeyProvisioner, Locatable,
    ProxyDescriptor, Selector, ServerCatalog, ServerDescriptor, DEFAULT_DISTANCE_TOLERANCE_KM,
    EARTH_RADIUS_KM,
};
pub use chain::{
    validate_topology, AnonymityChain, ChainComposer, ChainError, ChainMode, ChainRequest,
    ChainStatus, Credentials, HopRole, ProxyHop, ProxyProtocol,
};
pub use config::{ConfigError, TunnelConfig};
pub use driver::{DriverError, DriverEvent, TrafficStats, TunnelDriver, TunnelRequest};
pub use keys::{is_key_text, KeyPair, PrivateKey, PublicKey, KEY_TEXT_LEN};
pub use kill_switch::{KillSwitch, KillSwitchError, KillSwitchState};
pub use manager::{ConnectionError, ConnectionStateMachine, ConnectionStatus, RotationOutcome};
pub use posture::{Protection, ProtectionFlags, ProtectionProber, SecurityPostureTracker, TestResult};
pub use scheduler::{needs_rotation, RotationScheduler, SchedulerHandle};
pub use settings::{
    ClientSettings, ConnectionSettings, RotationSettings, SelectorSettings, SettingsError,
    SettingsFormat,
};
pub use state::{ConnectionEvent, TransitionError, VpnStatus};
