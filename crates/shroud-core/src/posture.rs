//! Security posture: which protections are on, a score, and alerts when
//! one is lost while connected.
//!
//! | Protection | Regression while connected |
//! |------------|----------------------------|
//! | Kill switch | critical |
//! | DNS leak protection | critical |
//! | IPv6 blocking | warning |
//! | WebRTC blocking | warning |

use crate::alerts::{AlertLog, AlertSeverity, SecurityAlert};
use crate::manager::ConnectionStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protection {
    KillSwitch,
    DnsLeakProtection,
    Ipv6Blocking,
    WebRtcBlocking,
}

impl Protection {
    pub fn all() -> &'static [Protection] {
        &[
            Protection::KillSwitch,
            Protection::DnsLeakProtection,
            Protection::Ipv6Blocking,
            Protection::WebRtcBlocking,
        ]
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Protection::KillSwitch => "Kill switch",
            Protection::DnsLeakProtection => "DNS leak protection",
            Protection::Ipv6Blocking => "IPv6 blocking",
            Protection::WebRtcBlocking => "WebRTC blocking",
        }
    }

    /// Losing it while connected exposes real traffic
    pub fn is_critical(&self) -> bool {
        matches!(self, Protection::KillSwitch | Protection::DnsLeakProtection)
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

fn enabled() -> bool {
    true
}

/// Protective feature flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionFlags {
    #[serde(default = "enabled")]
    pub kill_switch: bool,
    #[serde(default = "enabled")]
    pub dns_leak_protection: bool,
    #[serde(default = "enabled")]
    pub ipv6_blocking: bool,
    #[serde(default = "enabled")]
    pub webrtc_blocking: bool,
}

impl ProtectionFlags {
    pub fn get(&self, feature: Protection) -> bool {
        match feature {
            Protection::KillSwitch => self.kill_switch,
            Protection::DnsLeakProtection => self.dns_leak_protection,
            Protection::Ipv6Blocking => self.ipv6_blocking,
            Protection::WebRtcBlocking => self.webrtc_blocking,
        }
    }

    pub fn set(&mut self, feature: Protection, on: bool) {
        let slot = match feature {
            Protection::KillSwitch => &mut self.kill_switch,
            Protection::DnsLeakProtection => &mut self.dns_leak_protection,
            Protection::Ipv6Blocking => &mut self.ipv6_blocking,
            Protection::WebRtcBlocking => &mut self.webrtc_blocking,
        };
        *slot = on;
    }

    pub fn enabled_count(&self) -> usize {
        Protection::all().iter().filter(|p| self.get(**p)).count()
    }

    /// Fraction of protections enabled, 0.0 to 1.0
    pub fn score(&self) -> f64 {
        self.enabled_count() as f64 / Protection::all().len() as f64
    }
}

impl Default for ProtectionFlags {
    fn default() -> Self {
        Self {
            kill_switch: true,
            dns_leak_protection: true,
            ipv6_blocking: true,
            webrtc_blocking: true,
        }
    }
}

/// Checks whether a protection is actually in force (leak tests and the like)
#[async_trait]
pub trait ProtectionProber: Send + Sync {
    async fn probe(&self, feature: Protection) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    pub passed: bool,
    pub results: BTreeMap<Protection, bool>,
    pub score: f64,
}

pub struct SecurityPostureTracker {
    flags: Mutex<ProtectionFlags>,
    connected: AtomicBool,
    prober: Arc<dyn ProtectionProber>,
    alerts: Arc<AlertLog>,
    flags_tx: watch::Sender<ProtectionFlags>,
}

impl SecurityPostureTracker {
    pub fn new(prober: Arc<dyn ProtectionProber>, alerts: Arc<AlertLog>, initial: ProtectionFlags) -> Self {
        let (flags_tx, _) = watch::channel(initial);
        Self {
            flags: Mutex::new(initial),
            connected: AtomicBool::new(false),
            prober,
            alerts,
            flags_tx,
        }
    }

    pub fn flags(&self) -> ProtectionFlags {
        *self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn score(&self) -> f64 {
        self.flags().score()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Current flags, updated on every change
    pub fn watch_flags(&self) -> watch::Receiver<ProtectionFlags> {
        self.flags_tx.subscribe()
    }

    /// Record a flag change. Returns the alert raised, if any.
    pub fn set_protection(&self, feature: Protection, on: bool) -> Option<SecurityAlert> {
        let (was, flags) = {
            let mut flags = self.flags.lock().unwrap_or_else(PoisonError::into_inner);
            let was = flags.get(feature);
            flags.set(feature, on);
            (was, *flags)
        };

        if was == on {
            return None;
        }

        debug!("{} {}", feature, if on { "enabled" } else { "disabled" });
        self.flags_tx.send_replace(flags);

        if was && !on && self.is_connected() {
            let severity = if feature.is_critical() {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            };
            return Some(self.alerts.raise(
                severity,
                format!("{} disabled", feature),
                format!("{} was turned off while connected", feature),
            ));
        }

        None
    }

    /// Re-probe every protection and fold the results into the flags.
    pub async fn run_test(&self) -> TestResult {
        let mut results = BTreeMap::new();
        for feature in Protection::all() {
            let ok = self.prober.probe(*feature).await;
            results.insert(*feature, ok);
        }

        for (feature, ok) in &results {
            self.set_protection(*feature, *ok);
        }

        let passed = results.values().all(|ok| *ok);
        let score = self.score();
        info!("Security test {}: score {:.2}", if passed { "passed" } else { "failed" }, score);

        TestResult { passed, results, score }
    }

    /// Track connectivity from a state machine snapshot
    pub fn observe(&self, status: &ConnectionStatus) {
        self.connected.store(status.vpn_status.is_connected(), Ordering::Release);
    }

    /// Follow a status stream until its sender goes away
    pub fn spawn_status_follower(
        self: &Arc<Self>,
        mut status_rx: watch::Receiver<ConnectionStatus>,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            tracker.observe(&status_rx.borrow_and_update());
            while status_rx.changed().await.is_ok() {
                let status = status_rx.borrow_and_update().clone();
                tracker.observe(&status);
            }
            debug!("Status stream closed, posture follower exiting");
        })
    }
}
