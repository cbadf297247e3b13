//! Security alerts: a capped, append-only log plus a live broadcast.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Entries kept by default
pub const DEFAULT_ALERT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityAlert {
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub timestamp: SystemTime,
}

impl SecurityAlert {
    pub fn new(severity: AlertSeverity, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            message: message.into(),
            timestamp: SystemTime::now(),
        }
    }
}

/// Ring buffer of recent alerts. The oldest entry is evicted when full.
pub struct AlertLog {
    capacity: usize,
    entries: Mutex<VecDeque<SecurityAlert>>,
    tx: broadcast::Sender<SecurityAlert>,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            tx,
        }
    }

    /// Record and broadcast an alert
    pub fn raise(
        &self,
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> SecurityAlert {
        let alert = SecurityAlert::new(severity, title, message);
        self.push(alert.clone());
        alert
    }

    pub fn push(&self, alert: SecurityAlert) {
        match alert.severity {
            AlertSeverity::Info => info!("[alert] {}: {}", alert.title, alert.message),
            AlertSeverity::Warning => warn!("[alert] {}: {}", alert.title, alert.message),
            AlertSeverity::Critical => error!("[alert] {}: {}", alert.title, alert.message),
        }

        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(alert.clone());
        }

        // No subscribers is fine
        let _ = self.tx.send(alert);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SecurityAlert> {
        self.tx.subscribe()
    }

    /// Oldest first
    pub fn recent(&self) -> Vec<SecurityAlert> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_CAPACITY)
    }
}
