//! Stand-ins for the platform driver and leak probes.
//!
//! They accept everything and only log, so a chain can be walked through
//! its whole lifecycle without touching the OS.

use async_trait::async_trait;
use shroud_core::{
    DriverError, DriverEvent, Protection, ProtectionFlags, ProtectionProber, TunnelDriver,
    TunnelRequest,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::info;

pub struct DryRunDriver {
    initialized: AtomicBool,
    up: Mutex<BTreeSet<String>>,
    events: broadcast::Sender<DriverEvent>,
}

impl DryRunDriver {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            initialized: AtomicBool::new(false),
            up: Mutex::new(BTreeSet::new()),
            events,
        }
    }
}

#[async_trait]
impl TunnelDriver for DryRunDriver {
    async fn initialize(&self) -> Result<(), DriverError> {
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn connect(&self, request: &TunnelRequest) -> Result<(), DriverError> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(DriverError::NotInitialized);
        }

        info!("[dry-run] up {} ({} relays)", request.chain_id, request.hops.len());
        for hop in &request.hops {
            info!("[dry-run]   {:?} {}", hop.role(), hop.url());
        }
        if let Some(text) = &request.rendered_config {
            for line in text.lines().filter(|l| !l.starts_with("PrivateKey")) {
                info!("[dry-run]   {}", line);
            }
        }

        self.up
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request.chain_id.clone());
        let _ = self.events.send(DriverEvent::Up {
            chain_id: request.chain_id.clone(),
        });
        Ok(())
    }

    async fn disconnect(&self, chain_id: &str) -> Result<(), DriverError> {
        let removed = self
            .up
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(chain_id);
        if removed {
            info!("[dry-run] down {}", chain_id);
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        !self.up.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }
}

/// Reports the configured flags back as probe results
pub struct DryRunProber(pub ProtectionFlags);

#[async_trait]
impl ProtectionProber for DryRunProber {
    async fn probe(&self, feature: Protection) -> bool {
        self.0.get(feature)
    }
}
