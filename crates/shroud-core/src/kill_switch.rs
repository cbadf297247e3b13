//! Kill Switch
//!
//! A soft kill switch: while the protection is enabled and no tunnel is
//! up, [`KillSwitch::check_traffic`] refuses traffic.
//!
//! | Enabled | Tunnel | State |
//! |---------|--------|-------|
//! | no | any | `Disabled` |
//! | yes | up | `Armed` |
//! | yes | down | `Blocking` |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSwitchState {
    /// Protection turned off; traffic always flows
    Disabled,
    /// Tunnel up; traffic flows
    Armed,
    /// Tunnel down; traffic blocked
    Blocking,
}

impl KillSwitchState {
    pub fn allows_traffic(&self) -> bool {
        !self.is_blocking()
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, KillSwitchState::Blocking)
    }
}

/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    enabled: Arc<AtomicBool>,
    tunnel_up: Arc<AtomicBool>,
}

impl KillSwitch {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
            tunnel_up: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> KillSwitchState {
        if !self.enabled.load(Ordering::Acquire) {
            KillSwitchState::Disabled
        } else if self.tunnel_up.load(Ordering::Acquire) {
            KillSwitchState::Armed
        } else {
            KillSwitchState::Blocking
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            debug!("Kill switch {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    pub fn on_tunnel_up(&self) {
        debug!("Kill switch: tunnel up, traffic allowed");
        self.tunnel_up.store(true, Ordering::Release);
    }

    pub fn on_tunnel_down(&self) {
        let was_up = self.tunnel_up.swap(false, Ordering::AcqRel);
        if was_up && self.is_enabled() {
            warn!("Kill switch: tunnel down, blocking traffic");
        }
    }

    /// Call before letting traffic out
    pub fn check_traffic(&self) -> Result<(), KillSwitchError> {
        if self.state().is_blocking() {
            Err(KillSwitchError::TrafficBlocked)
        } else {
            Ok(())
        }
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KillSwitchError {
    #[error("Traffic blocked: tunnel is down (kill switch active)")]
    TrafficBlocked,
}
