//! Connection State Machine
//!
//! Owns the one active chain and its lifecycle. Every transition goes
//! through [`ConnectionStateMachine`]; its lock is never held across a
//! driver call.
//!
//! # Usage
//!
//! ```rust,ignore
//! let machine = Arc::new(ConnectionStateMachine::new(driver, catalog, user, settings.connection));
//! machine.spawn_driver_monitor();
//!
//! machine.connect_mode(ChainMode::Ghost).await?;
//!
//! // Swap relays without dropping the tunnel
//! machine.rotate().await?;
//!
//! machine.disconnect().await?;
//! ```

use crate::alerts::{AlertLog, AlertSeverity, SecurityAlert};
use crate::catalog::{CatalogError, GeoPoint, KeyProvisioner, Selector, ServerCatalog, ServerDescriptor};
use crate::chain::{AnonymityChain, ChainComposer, ChainError, ChainMode, ChainRequest, ChainStatus};
use crate::config::{self, ConfigError, TunnelConfig};
use crate::driver::{DriverError, DriverEvent, TrafficStats, TunnelDriver, TunnelRequest};
use crate::kill_switch::{KillSwitch, KillSwitchError, KillSwitchState};
use crate::posture::ProtectionFlags;
use crate::scheduler;
use crate::settings::ConnectionSettings;
use crate::state::{ConnectionEvent, TransitionError, VpnStatus};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Snapshot published on every transition
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub vpn_status: VpnStatus,
    pub active_chain: Option<AnonymityChain>,
    /// WireGuard leg of the active chain, if it has a VPN exit
    pub active_config: Option<TunnelConfig>,
    pub connected_at: Option<SystemTime>,
    pub last_rotation: Option<SystemTime>,
    pub next_rotation: Option<SystemTime>,
    pub traffic: TrafficStats,
    pub last_error: Option<String>,
    pub kill_switch: bool,
    pub dns_leak_protection: bool,
    pub ipv6_blocking: bool,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.vpn_status.is_connected()
    }

    /// Is the active chain due for rotation at `now`?
    pub fn needs_rotation(&self, now: SystemTime) -> bool {
        if !self.vpn_status.is_connected() {
            return false;
        }
        match (&self.active_chain, self.last_rotation) {
            (Some(chain), Some(last)) => {
                scheduler::needs_rotation(chain.auto_rotate, chain.rotation_interval, last, now)
            }
            _ => false,
        }
    }

    fn set_protections(&mut self, flags: ProtectionFlags) {
        self.kill_switch = flags.kill_switch;
        self.dns_leak_protection = flags.dns_leak_protection;
        self.ipv6_blocking = flags.ipv6_blocking;
    }

    fn clear_session(&mut self) {
        self.active_chain = None;
        self.active_config = None;
        self.connected_at = None;
        self.last_rotation = None;
        self.next_rotation = None;
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        let mut status = Self {
            vpn_status: VpnStatus::Disconnected,
            active_chain: None,
            active_config: None,
            connected_at: None,
            last_rotation: None,
            next_rotation: None,
            traffic: TrafficStats::default(),
            last_error: None,
            kill_switch: false,
            dns_leak_protection: false,
            ipv6_blocking: false,
        };
        status.set_protections(ProtectionFlags::default());
        status
    }
}

/// Result of a rotation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// Not connected, or another operation got there first
    Skipped,
    Rotated { from: String, to: String },
}

/// Connection errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Already connecting")]
    AlreadyConnecting,

    #[error("Already disconnecting")]
    AlreadyDisconnecting,

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Rotation failed: {0}")]
    RotationFailed(String),

    #[error("Connect cancelled by disconnect")]
    Cancelled,
}

struct Inner {
    status: ConnectionStatus,
    /// Bumped whenever in-flight work must not be adopted any more
    generation: u64,
    active_request: Option<TunnelRequest>,
    /// Chain handed to the driver but not (yet) adopted
    pending_chain: Option<String>,
    /// The active tunnel dropped while a rotation was in flight
    dropped_during_rotation: bool,
}

impl Inner {
    fn apply(&mut self, event: ConnectionEvent) -> Result<VpnStatus, TransitionError> {
        let from = self.status.vpn_status;
        let to = from.on(event)?;
        debug!("{} --{:?}--> {}", from, event, to);
        self.status.vpn_status = to;
        Ok(to)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    fn active_chain_id(&self) -> Option<&str> {
        self.status.active_chain.as_ref().map(|c| c.id.as_str())
    }
}

pub struct ConnectionStateMachine {
    driver: Arc<dyn TunnelDriver>,
    composer: ChainComposer,
    catalog: RwLock<ServerCatalog>,
    user_location: RwLock<GeoPoint>,
    settings: ConnectionSettings,
    inner: Mutex<Inner>,
    status_tx: watch::Sender<ConnectionStatus>,
    alerts: Arc<AlertLog>,
    kill_switch: KillSwitch,
}

impl ConnectionStateMachine {
    pub fn new(
        driver: Arc<dyn TunnelDriver>,
        catalog: ServerCatalog,
        user_location: GeoPoint,
        settings: ConnectionSettings,
    ) -> Self {
        let status = ConnectionStatus::default();
        let (status_tx, _) = watch::channel(status.clone());

        Self {
            driver,
            composer: ChainComposer::default(),
            catalog: RwLock::new(catalog),
            user_location: RwLock::new(user_location),
            settings,
            kill_switch: KillSwitch::new(status.kill_switch),
            inner: Mutex::new(Inner {
                status,
                generation: 0,
                active_request: None,
                pending_chain: None,
                dropped_during_rotation: false,
            }),
            status_tx,
            alerts: Arc::new(AlertLog::default()),
        }
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.composer = ChainComposer::new(selector);
        self
    }

    /// Share an alert log with other components
    pub fn with_alert_log(mut self, alerts: Arc<AlertLog>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_protections(mut self, flags: ProtectionFlags) -> Self {
        let inner = self.inner.get_mut();
        inner.status.set_protections(flags);
        self.kill_switch.set_enabled(flags.kill_switch);
        self.status_tx.send_replace(inner.status.clone());
        self
    }

    pub async fn initialize(&self) -> Result<(), ConnectionError> {
        self.driver.initialize().await?;
        info!("Tunnel driver initialized");
        Ok(())
    }

    /// Latest snapshot
    pub fn status(&self) -> ConnectionStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn alerts(&self) -> broadcast::Receiver<SecurityAlert> {
        self.alerts.subscribe()
    }

    pub fn alert_log(&self) -> Arc<AlertLog> {
        Arc::clone(&self.alerts)
    }

    pub fn composer(&self) -> &ChainComposer {
        &self.composer
    }

    pub fn kill_switch_state(&self) -> KillSwitchState {
        self.kill_switch.state()
    }

    /// Ask before letting traffic out
    pub fn check_traffic(&self) -> Result<(), KillSwitchError> {
        self.kill_switch.check_traffic()
    }

    pub async fn set_catalog(&self, catalog: ServerCatalog) {
        *self.catalog.write().await = catalog;
    }

    pub async fn set_user_location(&self, location: GeoPoint) {
        *self.user_location.write().await = location;
    }

    /// Provision keys for a template server in the catalog
    pub async fn provision_server(
        &self,
        id: &str,
        provisioner: &dyn KeyProvisioner,
    ) -> Result<ServerDescriptor, CatalogError> {
        self.catalog.write().await.provision(id, provisioner).await
    }

    pub async fn set_protections(&self, flags: ProtectionFlags) {
        let mut inner = self.inner.lock().await;
        inner.status.set_protections(flags);
        self.kill_switch.set_enabled(flags.kill_switch);
        self.publish(&inner);
    }

    /// Keep the protective-flag snapshot in step with a posture tracker
    pub fn spawn_protection_sync(
        self: &Arc<Self>,
        mut flags_rx: watch::Receiver<ProtectionFlags>,
    ) -> JoinHandle<()> {
        let machine = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let flags = *flags_rx.borrow_and_update();
                let Some(machine) = machine.upgrade() else { break };
                machine.set_protections(flags).await;
                drop(machine);

                if flags_rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Compose a chain for `mode` and connect it
    pub async fn connect_mode(&self, mode: ChainMode) -> Result<(), ConnectionError> {
        self.connect_request(&ChainRequest::Preset(mode)).await
    }

    pub async fn connect_request(&self, request: &ChainRequest) -> Result<(), ConnectionError> {
        check_can_connect(self.status().vpn_status)?;

        let chain = {
            let catalog = self.catalog.read().await;
            let user = *self.user_location.read().await;
            self.composer.compose_request(request, &catalog, user, None)?
        };
        self.connect(chain).await
    }

    /// Validate `chain`, hand it to the driver and wait for the ack.
    ///
    /// Validation failures are returned before any state change. Driver
    /// failures leave the machine in `Error` with `last_error` set.
    pub async fn connect(&self, chain: AnonymityChain) -> Result<(), ConnectionError> {
        let (request, generation, stale) = {
            let mut inner = self.inner.lock().await;
            check_can_connect(inner.status.vpn_status)?;
            let request = prepare(&chain)?;

            inner.apply(ConnectionEvent::Connect)?;
            inner.generation += 1;
            let stale = inner.pending_chain.replace(chain.id.clone());
            inner.status.last_error = None;
            self.publish(&inner);
            (request, inner.generation, stale)
        };

        // Leftover from a failed session; nothing is up in Error
        if let Some(stale) = stale.filter(|id| *id != chain.id) {
            debug!("Tearing down stale chain {}", stale);
            if let Err(e) = self.teardown(&stale).await {
                warn!("Teardown of stale chain {} failed: {}", stale, e);
            }
        }

        info!("Connecting {} ({})", chain.name, chain.route_summary());

        match self.bring_up(&request, generation).await {
            Ok(()) => self.adopt(chain, request, generation).await,
            Err(e) => Err(self.fail_connect(e, generation).await),
        }
    }

    /// Tear everything down. Calling it while disconnected does nothing.
    ///
    /// The driver is asked to drop both the active and any pending chain.
    /// A failed teardown still ends in `Disconnected`, with `last_error`
    /// set and a warning raised.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        let chain_ids = {
            let mut inner = self.inner.lock().await;
            match inner.status.vpn_status {
                VpnStatus::Disconnected => {
                    debug!("Already disconnected");
                    return Ok(());
                }
                VpnStatus::Disconnecting => return Err(ConnectionError::AlreadyDisconnecting),
                _ => {}
            }

            inner.apply(ConnectionEvent::Disconnect)?;
            inner.generation += 1;
            self.kill_switch.on_tunnel_down();
            self.publish(&inner);

            let mut ids: Vec<String> = inner.active_chain_id().map(str::to_string).into_iter().collect();
            if let Some(pending) = inner.pending_chain.take() {
                if !ids.contains(&pending) {
                    ids.push(pending);
                }
            }
            ids
        };

        info!("Disconnecting");

        let mut failures = Vec::new();
        for id in &chain_ids {
            if let Err(e) = self.teardown(id).await {
                warn!("Teardown of {} failed: {}", id, e);
                failures.push(format!("{}: {}", id, e));
            }
        }

        let mut inner = self.inner.lock().await;
        inner.apply(ConnectionEvent::DriverDown)?;
        if let Some(mut chain) = inner.status.active_chain.take() {
            chain.status = ChainStatus::Retired;
            debug!("Retired chain {}", chain.id);
        }
        inner.status.clear_session();
        inner.active_request = None;
        inner.dropped_during_rotation = false;

        if !failures.is_empty() {
            let message = format!("teardown incomplete ({})", failures.join(", "));
            self.alerts.raise(AlertSeverity::Warning, "Teardown incomplete", message.clone());
            inner.status.last_error = Some(message);
        }

        self.publish(&inner);
        info!("Disconnected");
        Ok(())
    }

    /// Clear an `Error` state back to `Disconnected`
    pub async fn reset(&self) -> Result<(), ConnectionError> {
        let stale = {
            let mut inner = self.inner.lock().await;
            inner.apply(ConnectionEvent::Reset)?;
            inner.generation += 1;
            inner.status.clear_session();
            inner.status.last_error = None;
            inner.active_request = None;
            self.publish(&inner);
            inner.pending_chain.take()
        };

        if let Some(id) = stale {
            if let Err(e) = self.teardown(&id).await {
                warn!("Teardown of stale chain {} failed: {}", id, e);
            }
        }
        Ok(())
    }

    /// Replace the active chain with a fresh one for the same mode.
    ///
    /// The old tunnel stays up until the new one is acknowledged. If the
    /// new chain fails, the old one is kept and a warning alert is raised.
    pub async fn rotate(&self) -> Result<RotationOutcome, ConnectionError> {
        let (previous, generation) = {
            let inner = self.inner.lock().await;
            match (&inner.status.active_chain, inner.status.vpn_status) {
                (Some(chain), VpnStatus::Connected) => (chain.clone(), inner.generation),
                _ => {
                    debug!("Not connected, rotation skipped");
                    return Ok(RotationOutcome::Skipped);
                }
            }
        };

        let (chain, request) = match self.compose_rotation(&previous).await {
            Ok(next) => next,
            Err(e) => return Err(self.rotation_failed(&previous, e.to_string(), None).await),
        };

        let generation = {
            let mut inner = self.inner.lock().await;
            if !inner.is_current(generation) || !inner.status.vpn_status.is_connected() {
                debug!("State changed while composing, rotation skipped");
                return Ok(RotationOutcome::Skipped);
            }
            inner.apply(ConnectionEvent::Rotate)?;
            inner.generation += 1;
            inner.pending_chain = Some(chain.id.clone());
            inner.dropped_during_rotation = false;
            self.publish(&inner);
            inner.generation
        };

        info!("Rotating {} -> {} ({})", previous.id, chain.id, chain.route_summary());

        match self.bring_up(&request, generation).await {
            Ok(()) => {}
            Err(ConnectionError::Cancelled) => return Err(ConnectionError::Cancelled),
            Err(e) => return Err(self.rotation_failed(&previous, e.to_string(), Some(generation)).await),
        }

        let next_id = chain.id.clone();
        {
            let mut inner = self.inner.lock().await;
            if !inner.is_current(generation) || inner.status.vpn_status != VpnStatus::Connecting {
                drop(inner);
                info!("Rotation to {} finished after cancellation, tearing down", next_id);
                if let Err(e) = self.teardown(&next_id).await {
                    warn!("Teardown of {} failed: {}", next_id, e);
                }
                return Err(ConnectionError::Cancelled);
            }

            inner.apply(ConnectionEvent::DriverUp)?;
            let now = SystemTime::now();
            let mut chain = chain;
            chain.status = ChainStatus::Active;
            chain.connected_at = Some(now);

            inner.status.last_rotation = Some(now);
            inner.status.next_rotation = chain.auto_rotate.then(|| now + chain.rotation_interval);
            inner.status.active_config = request.config.clone();
            inner.status.active_chain = Some(chain);
            inner.active_request = Some(request);
            inner.pending_chain = None;
            inner.dropped_during_rotation = false;
            self.kill_switch.on_tunnel_up();
            self.publish(&inner);
        }

        // Old tunnel goes only once the new one carries traffic
        if let Err(e) = self.teardown(&previous.id).await {
            warn!("Teardown of rotated-out chain {} failed: {}", previous.id, e);
        }

        info!("Rotated {} -> {}", previous.id, next_id);
        Ok(RotationOutcome::Rotated {
            from: previous.id,
            to: next_id,
        })
    }

    /// Watch the driver's event stream for drops and traffic.
    ///
    /// Drops are handled on their own task so a long reconnect does not
    /// stall the stream.
    pub fn spawn_driver_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.driver.subscribe();
        let machine = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event @ DriverEvent::Dropped { .. }) => {
                        let Some(machine) = machine.upgrade() else { break };
                        tokio::spawn(async move { machine.handle_driver_event(event).await });
                    }
                    Ok(event) => {
                        let Some(machine) = machine.upgrade() else { break };
                        machine.handle_driver_event(event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Driver monitor lagged, {} events skipped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Driver event stream closed");
        })
    }

    pub async fn handle_driver_event(&self, event: DriverEvent) {
        match event {
            DriverEvent::Traffic {
                chain_id,
                bytes_sent,
                bytes_received,
            } => {
                let mut inner = self.inner.lock().await;
                if inner.active_chain_id() == Some(chain_id.as_str()) {
                    inner.status.traffic.add(bytes_sent, bytes_received);
                    self.publish(&inner);
                }
            }
            DriverEvent::Up { chain_id } => {
                debug!("Driver reports {} up", chain_id);
            }
            DriverEvent::Dropped { chain_id, reason } => {
                let reconnect = {
                    let mut inner = self.inner.lock().await;
                    let is_active = inner.active_chain_id() == Some(chain_id.as_str());
                    match inner.status.vpn_status {
                        VpnStatus::Connected if is_active => {
                            warn!("Tunnel {} dropped: {}", chain_id, reason);
                            self.begin_reconnect(&mut inner, &reason)
                        }
                        VpnStatus::Connecting if is_active => {
                            warn!("Tunnel {} dropped during rotation: {}", chain_id, reason);
                            inner.dropped_during_rotation = true;
                            None
                        }
                        _ => {
                            debug!("Ignoring drop of inactive chain {}", chain_id);
                            None
                        }
                    }
                };

                if let Some((generation, request)) = reconnect {
                    self.reconnect(generation, request).await;
                }
            }
        }
    }

    fn publish(&self, inner: &Inner) {
        self.status_tx.send_replace(inner.status.clone());
    }

    async fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().await.is_current(generation)
    }

    async fn teardown(&self, chain_id: &str) -> Result<(), DriverError> {
        match timeout(self.settings.disconnect_timeout(), self.driver.disconnect(chain_id)).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout),
        }
    }

    /// Driver connect with timeout and retry. Stops early once
    /// `generation` is superseded.
    async fn bring_up(&self, request: &TunnelRequest, generation: u64) -> Result<(), ConnectionError> {
        let attempts = self.settings.max_connect_retries.saturating_add(1);
        let mut last = DriverError::Timeout;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.settings.backoff(attempt - 1);
                debug!("Retrying {} in {:?}", request.chain_id, delay);
                tokio::time::sleep(delay).await;
            }
            if !self.is_current(generation).await {
                return Err(ConnectionError::Cancelled);
            }

            match timeout(self.settings.connect_timeout(), self.driver.connect(request)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    warn!("Connect attempt {}/{} for {} failed: {}", attempt + 1, attempts, request.chain_id, e);
                    last = e;
                }
                Err(_) => {
                    warn!("Connect attempt {}/{} for {} timed out", attempt + 1, attempts, request.chain_id);
                    if let Err(e) = self.teardown(&request.chain_id).await {
                        debug!("Cleanup after timeout failed: {}", e);
                    }
                    last = DriverError::Timeout;
                }
            }
        }

        Err(ConnectionError::Driver(last))
    }

    async fn adopt(
        &self,
        mut chain: AnonymityChain,
        request: TunnelRequest,
        generation: u64,
    ) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock().await;
        if !inner.is_current(generation) || inner.status.vpn_status != VpnStatus::Connecting {
            drop(inner);
            info!("Connect for {} finished after cancellation, tearing down", chain.id);
            if let Err(e) = self.teardown(&chain.id).await {
                warn!("Teardown of {} failed: {}", chain.id, e);
            }
            return Err(ConnectionError::Cancelled);
        }

        inner.apply(ConnectionEvent::DriverUp)?;
        let now = SystemTime::now();
        chain.status = ChainStatus::Active;
        chain.connected_at = Some(now);

        info!("Connected: {} ({} hops)", chain.name, chain.hop_count());

        inner.status.connected_at = Some(now);
        inner.status.last_rotation = Some(now);
        inner.status.next_rotation = chain.auto_rotate.then(|| now + chain.rotation_interval);
        inner.status.active_config = request.config.clone();
        inner.status.active_chain = Some(chain);
        inner.status.traffic = TrafficStats::default();
        inner.active_request = Some(request);
        inner.pending_chain = None;
        self.kill_switch.on_tunnel_up();
        self.publish(&inner);
        Ok(())
    }

    async fn fail_connect(&self, e: ConnectionError, generation: u64) -> ConnectionError {
        if e == ConnectionError::Cancelled {
            return e;
        }

        let mut inner = self.inner.lock().await;
        if !inner.is_current(generation) {
            return ConnectionError::Cancelled;
        }
        if let Err(t) = inner.apply(ConnectionEvent::DriverFailed) {
            return t.into();
        }

        error!("Connect failed: {}", e);
        inner.status.last_error = Some(e.to_string());
        self.kill_switch.on_tunnel_down();
        self.publish(&inner);
        e
    }

    async fn compose_rotation(
        &self,
        previous: &AnonymityChain,
    ) -> Result<(AnonymityChain, TunnelRequest), ConnectionError> {
        let request = rotation_request(previous);
        let chain = {
            let catalog = self.catalog.read().await;
            let user = *self.user_location.read().await;
            self.composer.compose_request(&request, &catalog, user, Some(previous))?
        };
        let tunnel = prepare(&chain)?;
        Ok((chain, tunnel))
    }

    /// Roll a failed rotation back to the old chain and raise the alert
    async fn rotation_failed(
        &self,
        previous: &AnonymityChain,
        reason: String,
        generation: Option<u64>,
    ) -> ConnectionError {
        let mut reconnect = None;

        if let Some(generation) = generation {
            let mut inner = self.inner.lock().await;
            if !inner.is_current(generation) || inner.status.vpn_status != VpnStatus::Connecting {
                return ConnectionError::Cancelled;
            }
            if let Err(e) = inner.apply(ConnectionEvent::RotationFailed) {
                return e.into();
            }
            inner.pending_chain = None;

            if std::mem::take(&mut inner.dropped_during_rotation) {
                reconnect = self.begin_reconnect(&mut inner, "tunnel dropped during rotation");
            } else {
                self.publish(&inner);
            }
        }

        self.alerts.raise(
            AlertSeverity::Warning,
            "Rotation failed",
            format!("Keeping {}: {}", previous.name, reason),
        );

        if let Some((generation, request)) = reconnect {
            self.reconnect(generation, request).await;
        }

        ConnectionError::RotationFailed(reason)
    }

    /// Connected -> Reconnecting. Returns what to reconnect, if anything.
    fn begin_reconnect(&self, inner: &mut Inner, reason: &str) -> Option<(u64, TunnelRequest)> {
        if let Err(e) = inner.apply(ConnectionEvent::DriverDropped) {
            warn!("Cannot start reconnect: {}", e);
            return None;
        }
        inner.generation += 1;
        self.kill_switch.on_tunnel_down();
        self.alerts.raise(
            AlertSeverity::Warning,
            "Connection dropped",
            format!("{}; reconnecting", reason),
        );

        match inner.active_request.clone() {
            Some(request) => {
                self.publish(inner);
                Some((inner.generation, request))
            }
            None => {
                self.give_up(inner, "no tunnel to restore".to_string());
                None
            }
        }
    }

    async fn reconnect(&self, generation: u64, request: TunnelRequest) {
        let attempts = self.settings.max_reconnect_attempts;

        for attempt in 1..=attempts {
            tokio::time::sleep(self.settings.reconnect_delay()).await;
            if !self.is_current(generation).await {
                debug!("Reconnect of {} superseded", request.chain_id);
                return;
            }

            info!("Reconnect attempt {}/{} for {}", attempt, attempts, request.chain_id);
            match timeout(self.settings.connect_timeout(), self.driver.connect(&request)).await {
                Ok(Ok(())) => {
                    let mut inner = self.inner.lock().await;
                    if !inner.is_current(generation) || inner.status.vpn_status != VpnStatus::Reconnecting {
                        drop(inner);
                        if let Err(e) = self.teardown(&request.chain_id).await {
                            warn!("Teardown of {} failed: {}", request.chain_id, e);
                        }
                        return;
                    }
                    if inner.apply(ConnectionEvent::DriverUp).is_ok() {
                        inner.status.last_error = None;
                        self.kill_switch.on_tunnel_up();
                        self.publish(&inner);
                        info!("Reconnected {}", request.chain_id);
                    }
                    return;
                }
                Ok(Err(e)) => warn!("Reconnect attempt {} failed: {}", attempt, e),
                Err(_) => warn!("Reconnect attempt {} timed out", attempt),
            }
        }

        let mut inner = self.inner.lock().await;
        if inner.is_current(generation) && inner.status.vpn_status == VpnStatus::Reconnecting {
            self.give_up(&mut inner, format!("reconnect failed after {} attempts", attempts));
        }
    }

    /// Reconnecting -> Error. The dropped chain is kept for teardown.
    fn give_up(&self, inner: &mut Inner, reason: String) {
        if let Err(e) = inner.apply(ConnectionEvent::RetriesExhausted) {
            warn!("Cannot leave reconnect: {}", e);
            return;
        }

        inner.pending_chain = inner.active_chain_id().map(str::to_string);
        inner.status.clear_session();
        inner.active_request = None;
        inner.status.last_error = Some(reason.clone());
        self.kill_switch.on_tunnel_down();
        self.alerts.raise(AlertSeverity::Critical, "Connection lost", reason);
        self.publish(inner);
    }
}

fn check_can_connect(status: VpnStatus) -> Result<(), ConnectionError> {
    match status {
        s if s.accepts_connect() => Ok(()),
        VpnStatus::Disconnecting => Err(ConnectionError::AlreadyDisconnecting),
        _ => Err(ConnectionError::AlreadyConnecting),
    }
}

/// Everything that can be checked before touching the driver
fn prepare(chain: &AnonymityChain) -> Result<TunnelRequest, ConnectionError> {
    chain.validate()?;

    for hop in &chain.proxy_chain {
        if hop.host().trim().is_empty() || hop.port() == 0 {
            return Err(ConfigError::InvalidEndpoint(hop.url()).into());
        }
    }

    let config = chain.vpn_exit.as_ref().map(TunnelConfig::from_server).transpose()?;
    if let Some(config) = &config {
        config::validate(config)?;
    }
    let rendered_config = config.as_ref().map(config::render);

    Ok(TunnelRequest {
        chain_id: chain.id.clone(),
        mode: chain.mode,
        hops: chain.proxy_chain.clone(),
        config,
        rendered_config,
    })
}

fn rotation_request(chain: &AnonymityChain) -> ChainRequest {
    match chain.mode {
        ChainMode::Custom => ChainRequest::Custom {
            hops: chain.proxy_chain.clone(),
            vpn_exit: chain.vpn_exit.clone(),
        },
        mode => ChainRequest::Preset(mode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{HopRole, ProxyHop, ProxyProtocol};
    use std::time::Duration;

    fn key(c: char) -> String {
        format!("{}=", c.to_string().repeat(43))
    }

    fn server() -> ServerDescriptor {
        ServerDescriptor {
            id: "de-1".into(),
            name: "Frankfurt".into(),
            country: "DE".into(),
            city: "Frankfurt".into(),
            address: "de1.example.net".into(),
            port: 51820,
            latitude: 50.11,
            longitude: 8.68,
            is_free: true,
            max_speed_mbps: 1000,
            load: 10,
            public_key: Some(key('S')),
            client_private_key: Some(key('C')),
            client_address: Some("10.8.0.2/32".into()),
            preshared_key: None,
        }
    }

    #[test]
    fn test_check_can_connect() {
        assert!(check_can_connect(VpnStatus::Disconnected).is_ok());
        assert!(check_can_connect(VpnStatus::Error).is_ok());
        assert_eq!(check_can_connect(VpnStatus::Connecting), Err(ConnectionError::AlreadyConnecting));
        assert_eq!(check_can_connect(VpnStatus::Reconnecting), Err(ConnectionError::AlreadyConnecting));
        assert_eq!(check_can_connect(VpnStatus::Connected), Err(ConnectionError::AlreadyConnecting));
        assert_eq!(check_can_connect(VpnStatus::Disconnecting), Err(ConnectionError::AlreadyDisconnecting));
    }

    #[test]
    fn test_prepare_vpn_exit() {
        let chain = ChainComposer::default().compose_custom(Vec::new(), Some(server())).unwrap();
        let request = prepare(&chain).unwrap();

        let config = request.config.unwrap();
        assert_eq!(config.server_address, "de1.example.net");
        assert!(request.rendered_config.unwrap().contains("Endpoint = de1.example.net:51820"));
        assert!(request.hops.is_empty());
    }

    #[test]
    fn test_prepare_rejects_template_exit() {
        let mut template = server();
        template.public_key = Some("REPLACE_WITH_REAL_PUBLIC_KEY".into());
        let chain = ChainComposer::default().compose_custom(Vec::new(), Some(template)).unwrap();

        assert!(matches!(
            prepare(&chain),
            Err(ConnectionError::Config(ConfigError::MissingKeyMaterial(_)))
        ));
    }

    #[test]
    fn test_prepare_rejects_bad_hop() {
        let hop = ProxyHop::new("p1", ProxyProtocol::Socks5, HopRole::Entry, "p1.example.net", 0);
        let chain = ChainComposer::default().compose_custom(vec![hop], None).unwrap();

        assert!(matches!(
            prepare(&chain),
            Err(ConnectionError::Config(ConfigError::InvalidEndpoint(_)))
        ));
    }

    #[test]
    fn test_rotation_request_keeps_mode() {
        let chain = ChainComposer::default().compose_custom(Vec::new(), Some(server())).unwrap();
        assert!(matches!(rotation_request(&chain), ChainRequest::Custom { .. }));

        let mut preset = chain.clone();
        preset.mode = ChainMode::Ghost;
        assert!(matches!(rotation_request(&preset), ChainRequest::Preset(ChainMode::Ghost)));
    }

    #[test]
    fn test_status_needs_rotation() {
        let now = SystemTime::now();
        let mut chain = ChainComposer::default().compose_custom(Vec::new(), Some(server())).unwrap();
        chain.auto_rotate = true;
        chain.rotation_interval = Duration::from_secs(600);

        let mut status = ConnectionStatus {
            vpn_status: VpnStatus::Connected,
            active_chain: Some(chain),
            last_rotation: Some(now - Duration::from_secs(660)),
            ..ConnectionStatus::default()
        };
        assert!(status.needs_rotation(now));

        status.vpn_status = VpnStatus::Connecting;
        assert!(!status.needs_rotation(now));
    }

    #[test]
    fn test_default_status() {
        let status = ConnectionStatus::default();
        assert_eq!(status.vpn_status, VpnStatus::Disconnected);
        assert!(status.kill_switch && status.dns_leak_protection && status.ipv6_blocking);
        assert!(status.active_chain.is_none());
    }
}
