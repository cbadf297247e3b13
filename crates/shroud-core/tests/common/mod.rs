//! Shared fixtures: a scripted in-memory driver and a small catalog.

#![allow(dead_code)]

use async_trait::async_trait;
use shroud_core::{
    ConnectionSettings, ConnectionStateMachine, DriverError, DriverEvent, GeoPoint,
    ProxyDescriptor, ProxyProtocol, ServerCatalog, ServerDescriptor, TunnelDriver, TunnelRequest,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

pub const USER: GeoPoint = GeoPoint {
    latitude: 52.52,
    longitude: 13.40,
};

/// Driver whose behaviour is set by the test
pub struct ScriptedDriver {
    up: Mutex<BTreeSet<String>>,
    requests: Mutex<Vec<TunnelRequest>>,
    disconnects: Mutex<Vec<String>>,
    connects: AtomicUsize,
    fail_next: AtomicUsize,
    fail_all: AtomicBool,
    delay_ms: AtomicU64,
    events: broadcast::Sender<DriverEvent>,
}

impl ScriptedDriver {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            up: Mutex::new(BTreeSet::new()),
            requests: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            fail_all: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            events,
        })
    }

    /// Fail the next `n` connect calls
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// How long each connect takes
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn up_chains(&self) -> Vec<String> {
        self.up.lock().unwrap().iter().cloned().collect()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> Vec<String> {
        self.disconnects.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Option<TunnelRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    pub fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl TunnelDriver for ScriptedDriver {
    async fn initialize(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn connect(&self, request: &TunnelRequest) -> Result<(), DriverError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let scripted_failure = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure || self.fail_all.load(Ordering::SeqCst) {
            return Err(DriverError::Rejected("scripted failure".into()));
        }

        self.up.lock().unwrap().insert(request.chain_id.clone());
        Ok(())
    }

    async fn disconnect(&self, chain_id: &str) -> Result<(), DriverError> {
        self.disconnects.lock().unwrap().push(chain_id.to_string());
        self.up.lock().unwrap().remove(chain_id);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        !self.up.lock().unwrap().is_empty()
    }

    fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }
}

pub fn key(c: char) -> String {
    format!("{}=", c.to_string().repeat(43))
}

pub fn server(id: &str, lat: f64, lon: f64, load: u8) -> ServerDescriptor {
    ServerDescriptor {
        id: id.into(),
        name: format!("Server {}", id),
        country: "DE".into(),
        city: String::new(),
        address: format!("{}.vpn.example.net", id),
        port: 51820,
        latitude: lat,
        longitude: lon,
        is_free: false,
        max_speed_mbps: 1000,
        load,
        public_key: Some(key('S')),
        client_private_key: Some(key('C')),
        client_address: Some("10.8.0.2/32".into()),
        preshared_key: None,
    }
}

pub fn relay(id: &str, country: &str, lat: f64, lon: f64, obfuscated: bool) -> ProxyDescriptor {
    ProxyDescriptor {
        id: id.into(),
        protocol: if obfuscated {
            ProxyProtocol::Shadowsocks
        } else {
            ProxyProtocol::Socks5
        },
        host: format!("{}.relay.example.net", id),
        port: 1080,
        username: None,
        password: None,
        obfuscated,
        country: country.into(),
        latitude: lat,
        longitude: lon,
        load: 10,
    }
}

/// Two usable servers and eight relays in eight countries
pub fn catalog() -> ServerCatalog {
    ServerCatalog::new(
        vec![server("s1", 50.11, 8.68, 20), server("s2", 48.85, 2.35, 5)],
        vec![
            relay("r1", "DE", 52.5, 13.4, true),
            relay("r2", "PL", 52.2, 21.0, true),
            relay("r3", "CZ", 50.1, 14.4, false),
            relay("r4", "AT", 48.2, 16.4, true),
            relay("r5", "NL", 52.4, 4.9, false),
            relay("r6", "CH", 47.4, 8.5, true),
            relay("r7", "SE", 59.3, 18.1, true),
            relay("r8", "FR", 48.9, 2.4, false),
        ],
    )
}

pub fn fast_settings() -> ConnectionSettings {
    ConnectionSettings {
        connect_timeout_ms: 1_000,
        disconnect_timeout_ms: 500,
        max_connect_retries: 0,
        retry_backoff_ms: 5,
        max_reconnect_attempts: 2,
        reconnect_delay_ms: 10,
    }
}

pub fn machine(driver: &Arc<ScriptedDriver>, settings: ConnectionSettings) -> Arc<ConnectionStateMachine> {
    Arc::new(ConnectionStateMachine::new(
        Arc::clone(driver) as Arc<dyn TunnelDriver>,
        catalog(),
        USER,
        settings,
    ))
}
