//! Server Catalog & Selector
//!
//! Holds the known VPN servers and proxy relays and ranks them for a
//! user location.
//!
//! # Ranking
//!
//! | Key | Order |
//! |-----|-------|
//! | Great-circle distance (bucketed by tolerance) | ascending |
//! | Reported load | ascending |
//! | Id | ascending |
//!
//! # Template servers
//!
//! A server without complete key material is a *template*: it cannot be
//! tunnelled to directly and has to go through a [`KeyProvisioner`]
//! exchange first.

use crate::chain::ProxyProtocol;
use crate::keys::{is_key_text, KeyPair, PublicKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::Path;
use tracing::{debug, info, warn};

/// Mean Earth radius used by the Haversine formula
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Distances closer than this are treated as a tie by default
pub const DEFAULT_DISTANCE_TOLERANCE_KM: f64 = 1.0;

/// A point on the globe in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// Great-circle distance in kilometres (Haversine)
pub fn distance_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    // Clamp guards asin against rounding just above 1.0 for antipodes
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

fn default_wg_port() -> u16 {
    51820
}

/// VPN server entry (read-only to the client)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub id: String,
    pub name: String,
    pub country: String,
    #[serde(default)]
    pub city: String,
    /// Endpoint host
    pub address: String,
    #[serde(default = "default_wg_port")]
    pub port: u16,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub is_free: bool,
    /// Advertised capacity (Mbps)
    #[serde(default)]
    pub max_speed_mbps: u32,
    /// Reported load percentage (0-100)
    #[serde(default)]
    pub load: u8,
    /// Server public key (base64)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Pre-provisioned client private key (base64)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_private_key: Option<String>,
    /// Pre-provisioned client tunnel address (CIDR)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
}

impl ServerDescriptor {
    pub fn location(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    /// Does the entry carry any key field at all?
    pub fn has_key_material(&self) -> bool {
        [
            &self.public_key,
            &self.client_private_key,
            &self.client_address,
            &self.preshared_key,
        ]
        .iter()
        .any(|field| field.as_deref().is_some_and(|v| !v.is_empty()))
    }

    /// Can a tunnel be built from this entry without provisioning?
    ///
    /// Requires a syntactically valid server public key and client private
    /// key plus a client address. Placeholder strings fail the key check.
    pub fn is_directly_usable(&self) -> bool {
        let key_ok = |k: &Option<String>| k.as_deref().is_some_and(is_key_text);
        key_ok(&self.public_key)
            && key_ok(&self.client_private_key)
            && self.client_address.as_deref().is_some_and(|a| !a.trim().is_empty())
    }
}

/// Free function form of [`ServerDescriptor::is_directly_usable`]
pub fn is_directly_usable(server: &ServerDescriptor) -> bool {
    server.is_directly_usable()
}

/// Proxy relay entry; the composer turns these into chain hops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyDescriptor {
    pub id: String,
    pub protocol: ProxyProtocol,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Relay supports traffic obfuscation
    #[serde(default)]
    pub obfuscated: bool,
    #[serde(default)]
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub load: u8,
}

/// Anything the [`Selector`] can rank
pub trait Locatable {
    fn id(&self) -> &str;
    fn location(&self) -> GeoPoint;
    fn load(&self) -> u8;
}

impl Locatable for ServerDescriptor {
    fn id(&self) -> &str {
        &self.id
    }

    fn location(&self) -> GeoPoint {
        ServerDescriptor::location(self)
    }

    fn load(&self) -> u8 {
        self.load
    }
}

impl Locatable for ProxyDescriptor {
    fn id(&self) -> &str {
        &self.id
    }

    fn location(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    fn load(&self) -> u8 {
        self.load
    }
}

/// Ranks candidates by distance, then load, then id
#[derive(Debug, Clone, Copy)]
pub struct Selector {
    /// Distances in the same bucket of this width compare equal.
    /// Zero compares exact distances.
    pub distance_tolerance_km: f64,
}

impl Default for Selector {
    fn default() -> Self {
        Self {
            distance_tolerance_km: DEFAULT_DISTANCE_TOLERANCE_KM,
        }
    }
}

impl Selector {
    pub fn new(distance_tolerance_km: f64) -> Self {
        Self {
            distance_tolerance_km: distance_tolerance_km.max(0.0),
        }
    }

    /// Selector that never treats different distances as a tie
    pub fn exact() -> Self {
        Self::new(0.0)
    }

    fn distance_key(&self, d: f64) -> f64 {
        if self.distance_tolerance_km > 0.0 {
            (d / self.distance_tolerance_km).floor()
        } else {
            d
        }
    }

    fn compare<T: Locatable>(&self, a: &(f64, &T), b: &(f64, &T)) -> Ordering {
        self.distance_key(a.0)
            .total_cmp(&self.distance_key(b.0))
            .then_with(|| a.1.load().cmp(&b.1.load()))
            .then_with(|| a.1.id().cmp(b.1.id()))
    }

    /// Order candidates best-first for `user`. Stable and deterministic.
    pub fn rank<'a, T: Locatable>(&self, candidates: &'a [T], user: GeoPoint) -> Vec<&'a T> {
        let mut scored: Vec<(f64, &T)> = candidates
            .iter()
            .map(|c| (distance_km(user, c.location()), c))
            .collect();

        scored.sort_by(|a, b| self.compare(a, b));
        scored.into_iter().map(|(_, c)| c).collect()
    }

    /// Head of [`Selector::rank`]
    pub fn best<'a, T: Locatable>(&self, candidates: &'a [T], user: GeoPoint) -> Result<&'a T, CatalogError> {
        candidates
            .iter()
            .map(|c| (distance_km(user, c.location()), c))
            .min_by(|a, b| self.compare(a, b))
            .map(|(_, c)| c)
            .ok_or(CatalogError::NoServerAvailable)
    }
}

/// External key-generation exchange for template servers
#[async_trait]
pub trait KeyProvisioner: Send + Sync {
    /// Register `client_public_key` with the server and return the keyed
    /// descriptor. The client private key never leaves this process.
    async fn provision(
        &self,
        server: &ServerDescriptor,
        client_public_key: &PublicKey,
    ) -> Result<ServerDescriptor, CatalogError>;
}

/// Catalog of servers and proxy relays
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCatalog {
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
    #[serde(default)]
    pub proxies: Vec<ProxyDescriptor>,
}

impl ServerCatalog {
    pub fn new(servers: Vec<ServerDescriptor>, proxies: Vec<ProxyDescriptor>) -> Self {
        Self { servers, proxies }
    }

    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, CatalogError> {
        toml::from_str(content)
            .map_err(|e| CatalogError::Parse(e.to_string()))
    }

    pub fn from_json(content: &str) -> Result<Self, CatalogError> {
        serde_json::from_str(content)
            .map_err(|e| CatalogError::Parse(e.to_string()))
    }

    pub fn find(&self, id: &str) -> Option<&ServerDescriptor> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Servers that can be tunnelled to right away
    pub fn usable_servers(&self) -> Vec<ServerDescriptor> {
        self.servers.iter().filter(|s| s.is_directly_usable()).cloned().collect()
    }

    /// Servers that need key provisioning
    pub fn template_servers(&self) -> Vec<&ServerDescriptor> {
        self.servers.iter().filter(|s| !s.is_directly_usable()).collect()
    }

    pub fn free_servers(&self) -> Vec<&ServerDescriptor> {
        self.servers.iter().filter(|s| s.is_free).collect()
    }

    pub fn by_country(&self, country: &str) -> Vec<&ServerDescriptor> {
        self.servers
            .iter()
            .filter(|s| s.country.eq_ignore_ascii_case(country))
            .collect()
    }

    /// Best directly-usable server for `user`
    pub fn best_server(&self, selector: &Selector, user: GeoPoint) -> Result<ServerDescriptor, CatalogError> {
        let usable = self.usable_servers();
        selector.best(&usable, user).cloned()
    }

    /// Run the key exchange for a template server and store the result.
    pub async fn provision(
        &mut self,
        id: &str,
        provisioner: &dyn KeyProvisioner,
    ) -> Result<ServerDescriptor, CatalogError> {
        let index = self.servers
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| CatalogError::UnknownServer(id.to_string()))?;

        if self.servers[index].is_directly_usable() {
            debug!("Server {} already has key material", id);
            return Ok(self.servers[index].clone());
        }

        info!("Provisioning keys for template server {}", id);
        let keypair = KeyPair::generate();
        let mut keyed = provisioner.provision(&self.servers[index], &keypair.public).await?;

        if keyed.client_private_key.as_deref().is_none_or(str::is_empty) {
            keyed.client_private_key = Some(keypair.private.to_base64());
        }
        if keyed.id != id || !keyed.is_directly_usable() {
            warn!("Provisioning for {} returned incomplete key material", id);
            return Err(CatalogError::Provisioning(format!(
                "incomplete key material for {}",
                id
            )));
        }

        self.servers[index] = keyed.clone();
        Ok(keyed)
    }
}

/// Catalog errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("No server available")]
    NoServerAvailable,

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Provisioning failed: {0}")]
    Provisioning(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(c: char) -> String {
        format!("{}=", c.to_string().repeat(43))
    }

    fn server(id: &str, lat: f64, lon: f64, load: u8) -> ServerDescriptor {
        ServerDescriptor {
            id: id.to_string(),
            name: id.to_uppercase(),
            country: "DE".to_string(),
            city: String::new(),
            address: format!("{id}.example.net"),
            port: 51820,
            latitude: lat,
            longitude: lon,
            is_free: false,
            max_speed_mbps: 1000,
            load,
            public_key: None,
            client_private_key: None,
            client_address: None,
            preshared_key: None,
        }
    }

    fn keyed(mut s: ServerDescriptor) -> ServerDescriptor {
        s.public_key = Some(key('S'));
        s.client_private_key = Some(key('C'));
        s.client_address = Some("10.8.0.2/32".into());
        s
    }

    #[test]
    fn test_distance_known_value() {
        // Frankfurt -> London is roughly 640 km
        let fra = GeoPoint::new(50.1109, 8.6821);
        let lon = GeoPoint::new(51.5074, -0.1278);
        let d = distance_km(fra, lon);
        assert!((d - 638.0).abs() < 10.0, "got {d}");
    }

    #[test]
    fn test_distance_identity_and_symmetry() {
        let a = GeoPoint::new(35.68, 139.69);
        let b = GeoPoint::new(-33.87, 151.21);
        assert_eq!(distance_km(a, a), 0.0);
        assert_eq!(distance_km(a, b), distance_km(b, a));
    }

    #[test]
    fn test_distance_antipodes() {
        let d = distance_km(GeoPoint::new(0.0, 0.0), GeoPoint::new(0.0, 180.0));
        assert!((d - std::f64::consts::PI * EARTH_RADIUS_KM).abs() < 1e-6);
    }

    #[test]
    fn test_best_prefers_load_within_tolerance() {
        let candidates = vec![server("a", 1.0, 1.0, 80), server("b", 1.0, 1.001, 10)];
        let user = GeoPoint::new(1.0, 1.0);

        // ~0.11 km apart: same 1 km bucket, so load decides
        let best = Selector::default().best(&candidates, user).unwrap();
        assert_eq!(best.id, "b");
    }

    #[test]
    fn test_best_prefers_distance_outside_tolerance() {
        let candidates = vec![server("a", 1.0, 1.0, 80), server("b", 1.0, 1.001, 10)];
        let user = GeoPoint::new(1.0, 1.0);

        let best = Selector::exact().best(&candidates, user).unwrap();
        assert_eq!(best.id, "a");
    }

    #[test]
    fn test_rank_tie_breaks_on_id() {
        let candidates = vec![
            server("c", 10.0, 10.0, 5),
            server("a", 10.0, 10.0, 5),
            server("b", 10.0, 10.0, 5),
            server("far", 40.0, 40.0, 0),
        ];

        let ranked: Vec<_> = Selector::exact()
            .rank(&candidates, GeoPoint::new(10.0, 10.0))
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(ranked, vec!["a", "b", "c", "far"]);
    }

    #[test]
    fn test_best_empty() {
        let empty: Vec<ServerDescriptor> = Vec::new();
        assert_eq!(
            Selector::default().best(&empty, GeoPoint::new(0.0, 0.0)).unwrap_err(),
            CatalogError::NoServerAvailable
        );
    }

    #[test]
    fn test_directly_usable() {
        let template = server("t", 0.0, 0.0, 0);
        assert!(!template.is_directly_usable());
        assert!(!template.has_key_material());

        let ready = keyed(server("r", 0.0, 0.0, 0));
        assert!(is_directly_usable(&ready));

        let mut partial = ready.clone();
        partial.client_address = Some(String::new());
        assert!(partial.has_key_material());
        assert!(!partial.is_directly_usable());

        let mut placeholder = ready;
        placeholder.public_key = Some("REPLACE_WITH_REAL_PUBLIC_KEY".into());
        assert!(!placeholder.is_directly_usable());
    }

    #[test]
    fn test_catalog_filters() {
        let mut free = server("free", 0.0, 0.0, 0);
        free.is_free = true;
        free.country = "JP".into();
        let catalog = ServerCatalog::new(vec![free, keyed(server("paid", 1.0, 1.0, 0))], vec![]);

        assert_eq!(catalog.usable_servers().len(), 1);
        assert_eq!(catalog.template_servers()[0].id, "free");
        assert_eq!(catalog.free_servers()[0].id, "free");
        assert_eq!(catalog.by_country("jp").len(), 1);
        assert!(catalog.find("paid").is_some());
        assert_eq!(
            catalog.best_server(&Selector::default(), GeoPoint::new(0.0, 0.0)).unwrap().id,
            "paid"
        );
    }

    #[test]
    fn test_catalog_toml() {
        let text = r#"
            [[servers]]
            id = "de-fra-1"
            name = "Frankfurt 1"
            country = "DE"
            address = "fra1.example.net"
            latitude = 50.11
            longitude = 8.68
            load = 35

            [[proxies]]
            id = "p1"
            protocol = "shadowsocks"
            host = "198.51.100.7"
            port = 8388
            obfuscated = true
            latitude = 48.85
            longitude = 2.35
        "#;

        let catalog = ServerCatalog::from_toml(text).unwrap();
        assert_eq!(catalog.servers[0].port, 51820);
        assert_eq!(catalog.proxies[0].protocol, ProxyProtocol::Shadowsocks);
        assert!(catalog.template_servers().len() == 1);
    }

    struct FixedProvisioner;

    #[async_trait]
    impl KeyProvisioner for FixedProvisioner {
        async fn provision(
            &self,
            server: &ServerDescriptor,
            _client_public_key: &PublicKey,
        ) -> Result<ServerDescriptor, CatalogError> {
            let mut keyed = server.clone();
            keyed.public_key = Some(key('K'));
            keyed.client_address = Some("10.9.0.4/32".into());
            Ok(keyed)
        }
    }

    struct BrokenProvisioner;

    #[async_trait]
    impl KeyProvisioner for BrokenProvisioner {
        async fn provision(
            &self,
            server: &ServerDescriptor,
            _client_public_key: &PublicKey,
        ) -> Result<ServerDescriptor, CatalogError> {
            Ok(server.clone())
        }
    }

    #[tokio::test]
    async fn test_provision_template() {
        let mut catalog = ServerCatalog::new(vec![server("t", 0.0, 0.0, 0)], vec![]);

        let keyed = catalog.provision("t", &FixedProvisioner).await.unwrap();
        assert!(keyed.is_directly_usable());
        assert!(catalog.find("t").unwrap().is_directly_usable());
    }

    #[tokio::test]
    async fn test_provision_rejects_incomplete() {
        let mut catalog = ServerCatalog::new(vec![server("t", 0.0, 0.0, 0)], vec![]);

        let err = catalog.provision("t", &BrokenProvisioner).await.unwrap_err();
        assert!(matches!(err, CatalogError::Provisioning(_)));
        assert!(!catalog.find("t").unwrap().is_directly_usable());

        assert_eq!(
            catalog.provision("missing", &FixedProvisioner).await.unwrap_err(),
            CatalogError::UnknownServer("missing".into())
        );
    }
}
