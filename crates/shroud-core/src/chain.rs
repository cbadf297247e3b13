//! Anonymity Chains
//!
//! A chain is an ordered list of proxy hops (entry → middles → exit),
//! optionally followed by a WireGuard VPN exit.
//!
//! # Topologies
//!
//! | Mode | Relays | VPN exit | Relay filter |
//! |------|--------|----------|--------------|
//! | turbo | entry | - | any |
//! | stealth | entry, exit | - | obfuscated |
//! | ghost | entry, 2 middles, exit | best usable server, if any | any, distinct countries |
//! | tor | entry, middle, exit | - | any, distinct countries |
//! | paranoid | entry, 2 middles, exit | best usable server, if any | obfuscated, distinct countries |
//! | custom | caller supplied | caller supplied | - |
//!
//! Composition is deterministic: the same catalog, location and mode
//! always give the same hops.

use crate::catalog::{CatalogError, GeoPoint, ProxyDescriptor, Selector, ServerCatalog, ServerDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Proxy protocol spoken by a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Socks5,
    Shadowsocks,
    Http,
    Https,
    Trojan,
    V2ray,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Socks5 => "socks5",
            ProxyProtocol::Shadowsocks => "shadowsocks",
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Trojan => "trojan",
            ProxyProtocol::V2ray => "v2ray",
        }
    }

    /// Protocols whose traffic is hard to fingerprint
    pub fn is_obfuscating(&self) -> bool {
        matches!(
            self,
            ProxyProtocol::Shadowsocks | ProxyProtocol::Trojan | ProxyProtocol::V2ray
        )
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a hop in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HopRole {
    Entry,
    Middle,
    Exit,
    Bridge,
}

/// Proxy login
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .finish()
    }
}

/// One relay in a chain. Immutable once built; identity is the id.
#[derive(Debug, Clone)]
pub struct ProxyHop {
    id: String,
    protocol: ProxyProtocol,
    role: HopRole,
    host: String,
    port: u16,
    credentials: Option<Credentials>,
    obfuscated: bool,
    priority: u32,
    created_at: SystemTime,
}

impl ProxyHop {
    pub fn new(
        id: impl Into<String>,
        protocol: ProxyProtocol,
        role: HopRole,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            protocol,
            role,
            host: host.into(),
            port,
            credentials: None,
            obfuscated: false,
            priority: 0,
            created_at: SystemTime::now(),
        }
    }

    /// Build a hop from a catalog relay
    pub fn from_descriptor(desc: &ProxyDescriptor, role: HopRole, priority: u32) -> Self {
        let credentials = match (&desc.username, &desc.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        };

        Self {
            credentials,
            obfuscated: desc.obfuscated,
            priority,
            ..Self::new(desc.id.clone(), desc.protocol, role, desc.host.clone(), desc.port)
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_obfuscation(mut self, obfuscated: bool) -> Self {
        self.obfuscated = obfuscated;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn protocol(&self) -> ProxyProtocol {
        self.protocol
    }

    pub fn role(&self) -> HopRole {
        self.role
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn is_obfuscated(&self) -> bool {
        self.obfuscated
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// `protocol://host:port`
    pub fn url(&self) -> String {
        if self.host.contains(':') {
            format!("{}://[{}]:{}", self.protocol, self.host, self.port)
        } else {
            format!("{}://{}:{}", self.protocol, self.host, self.port)
        }
    }
}

impl PartialEq for ProxyHop {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ProxyHop {}

/// Named anonymity presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainMode {
    Turbo,
    Stealth,
    Ghost,
    Tor,
    Paranoid,
    Custom,
}

impl ChainMode {
    pub fn all() -> &'static [ChainMode] {
        &[
            ChainMode::Turbo,
            ChainMode::Stealth,
            ChainMode::Ghost,
            ChainMode::Tor,
            ChainMode::Paranoid,
            ChainMode::Custom,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainMode::Turbo => "turbo",
            ChainMode::Stealth => "stealth",
            ChainMode::Ghost => "ghost",
            ChainMode::Tor => "tor",
            ChainMode::Paranoid => "paranoid",
            ChainMode::Custom => "custom",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ChainMode::Turbo => "Turbo",
            ChainMode::Stealth => "Stealth",
            ChainMode::Ghost => "Ghost",
            ChainMode::Tor => "Onion",
            ChainMode::Paranoid => "Paranoid",
            ChainMode::Custom => "Custom",
        }
    }

    /// Default time between rotations
    pub fn rotation_interval(&self) -> Duration {
        let minutes = match self {
            ChainMode::Turbo | ChainMode::Custom => 30,
            ChainMode::Stealth => 15,
            ChainMode::Ghost | ChainMode::Tor => 10,
            ChainMode::Paranoid => 5,
        };
        Duration::from_secs(minutes * 60)
    }

    pub fn auto_rotate(&self) -> bool {
        !matches!(self, ChainMode::Turbo | ChainMode::Custom)
    }

    pub fn obfuscation(&self) -> bool {
        matches!(self, ChainMode::Stealth | ChainMode::Ghost | ChainMode::Paranoid)
    }

    pub fn dpi_bypass(&self) -> bool {
        matches!(self, ChainMode::Stealth | ChainMode::Paranoid)
    }
}

impl fmt::Display for ChainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChainMode {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChainMode::all()
            .iter()
            .copied()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ChainError::UnknownMode(s.to_string()))
    }
}

/// What the caller asked to connect with. Rotation re-runs the same request.
#[derive(Debug, Clone)]
pub enum ChainRequest {
    Preset(ChainMode),
    Custom {
        hops: Vec<ProxyHop>,
        vpn_exit: Option<ServerDescriptor>,
    },
}

impl ChainRequest {
    pub fn mode(&self) -> ChainMode {
        match self {
            ChainRequest::Preset(mode) => *mode,
            ChainRequest::Custom { .. } => ChainMode::Custom,
        }
    }
}

impl From<ChainMode> for ChainRequest {
    fn from(mode: ChainMode) -> Self {
        ChainRequest::Preset(mode)
    }
}

/// Lifecycle of a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainStatus {
    /// Built, not yet tunnelled
    Composed,
    /// Carrying traffic
    Active,
    /// Replaced or torn down
    Retired,
}

/// An ordered route of relays with an optional VPN exit
#[derive(Debug, Clone)]
pub struct AnonymityChain {
    pub id: String,
    pub name: String,
    pub mode: ChainMode,
    /// Traversal order: entry first, exit last
    pub proxy_chain: Vec<ProxyHop>,
    pub vpn_exit: Option<ServerDescriptor>,
    pub status: ChainStatus,
    pub connected_at: Option<SystemTime>,
    pub rotation_interval: Duration,
    pub auto_rotate: bool,
    pub obfuscation: bool,
    pub dpi_bypass: bool,
    pub security_settings: BTreeMap<String, String>,
}

impl AnonymityChain {
    /// Relays plus the VPN exit
    pub fn hop_count(&self) -> usize {
        self.proxy_chain.len() + usize::from(self.vpn_exit.is_some())
    }

    pub fn is_connectable(&self) -> bool {
        self.hop_count() >= 1
    }

    pub fn entry(&self) -> Option<&ProxyHop> {
        self.proxy_chain.first()
    }

    pub fn hop_ids(&self) -> Vec<&str> {
        self.proxy_chain.iter().map(ProxyHop::id).collect()
    }

    /// Check the ordering rules; see [`validate_topology`]
    pub fn validate(&self) -> Result<(), ChainError> {
        validate_topology(&self.proxy_chain, self.vpn_exit.as_ref())
    }

    /// `entry → ... → exit ⇒ vpn`
    pub fn route_summary(&self) -> String {
        let mut route = self
            .proxy_chain
            .iter()
            .map(|h| h.host().to_string())
            .collect::<Vec<_>>()
            .join(" → ");
        if let Some(exit) = &self.vpn_exit {
            if !route.is_empty() {
                route.push_str(" ⇒ ");
            }
            route.push_str(&exit.name);
        }
        route
    }
}

/// Exactly one entry hop, placed first; an exit hop, if any, is last.
///
/// A chain without relays is accepted only when it has a VPN exit
/// (plain single-hop VPN).
pub fn validate_topology(hops: &[ProxyHop], vpn_exit: Option<&ServerDescriptor>) -> Result<(), ChainError> {
    if hops.is_empty() {
        return if vpn_exit.is_some() {
            Ok(())
        } else {
            Err(ChainError::InvalidTopology("chain has no hops".into()))
        };
    }

    let entries = hops.iter().filter(|h| h.role == HopRole::Entry).count();
    if entries != 1 || hops[0].role != HopRole::Entry {
        return Err(ChainError::InvalidTopology(format!(
            "expected exactly one entry hop in first position, found {}",
            entries
        )));
    }

    let exits = hops.iter().filter(|h| h.role == HopRole::Exit).count();
    if exits > 1 || (exits == 1 && hops[hops.len() - 1].role != HopRole::Exit) {
        return Err(ChainError::InvalidTopology("exit hop must be last".into()));
    }

    let mut seen = HashSet::new();
    for hop in hops {
        if !seen.insert(hop.id.as_str()) {
            return Err(ChainError::InvalidTopology(format!("hop {} appears twice", hop.id)));
        }
    }

    Ok(())
}

/// Builds chains from the catalog
#[derive(Debug, Default)]
pub struct ChainComposer {
    selector: Selector,
    next_id: AtomicU64,
}

impl ChainComposer {
    pub fn new(selector: Selector) -> Self {
        Self {
            selector,
            next_id: AtomicU64::new(0),
        }
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Build the canonical chain for a preset mode.
    ///
    /// `ChainMode::Custom` has no canonical topology; use
    /// [`ChainComposer::compose_custom`].
    pub fn compose(
        &self,
        mode: ChainMode,
        catalog: &ServerCatalog,
        user: GeoPoint,
    ) -> Result<AnonymityChain, ChainError> {
        self.compose_request(&ChainRequest::Preset(mode), catalog, user, None)
    }

    /// Pass caller hops through unmodified, after the topology check
    pub fn compose_custom(
        &self,
        hops: Vec<ProxyHop>,
        vpn_exit: Option<ServerDescriptor>,
    ) -> Result<AnonymityChain, ChainError> {
        if hops.is_empty() && vpn_exit.is_none() {
            return Err(ChainError::EmptyCustomChain);
        }
        self.finish(ChainMode::Custom, hops, vpn_exit)
    }

    /// Build a chain for `request`, preferring relays not used by `previous`.
    pub fn compose_request(
        &self,
        request: &ChainRequest,
        catalog: &ServerCatalog,
        user: GeoPoint,
        previous: Option<&AnonymityChain>,
    ) -> Result<AnonymityChain, ChainError> {
        let mode = match request {
            ChainRequest::Custom { hops, vpn_exit } => {
                return self.compose_custom(hops.clone(), vpn_exit.clone());
            }
            ChainRequest::Preset(mode) => *mode,
        };

        let avoid: HashSet<&str> = previous
            .map(|c| c.proxy_chain.iter().map(ProxyHop::id).collect())
            .unwrap_or_default();

        let (count, obfuscated_only, distinct_countries, with_vpn_exit) = match mode {
            ChainMode::Turbo => (1, false, false, false),
            ChainMode::Stealth => (2, true, false, false),
            ChainMode::Ghost => (4, false, true, true),
            ChainMode::Tor => (3, false, true, false),
            ChainMode::Paranoid => (4, true, true, true),
            ChainMode::Custom => return Err(ChainError::EmptyCustomChain),
        };

        let candidates: Vec<ProxyDescriptor> = catalog
            .proxies
            .iter()
            .filter(|p| !obfuscated_only || p.obfuscated || p.protocol.is_obfuscating())
            .cloned()
            .collect();

        let picked = self.pick(&candidates, user, count, &avoid, distinct_countries, mode)?;
        let hops = picked
            .iter()
            .enumerate()
            .map(|(i, desc)| {
                let role = if i == 0 {
                    HopRole::Entry
                } else if i == count - 1 {
                    HopRole::Exit
                } else {
                    HopRole::Middle
                };
                let hop = ProxyHop::from_descriptor(desc, role, i as u32);
                if mode.obfuscation() { hop.with_obfuscation(true) } else { hop }
            })
            .collect();

        let vpn_exit = if with_vpn_exit {
            match catalog.best_server(&self.selector, user) {
                Ok(server) => Some(server),
                Err(CatalogError::NoServerAvailable) => {
                    debug!("No usable VPN exit for {} chain, relays only", mode);
                    None
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };

        self.finish(mode, hops, vpn_exit)
    }

    /// Replace (or attach) the VPN exit of a chain
    pub fn rebuild_exit(&self, chain: &AnonymityChain, server: ServerDescriptor) -> AnonymityChain {
        let mut rebuilt = chain.clone();
        rebuilt.id = self.next_chain_id(chain.mode);
        rebuilt.status = ChainStatus::Composed;
        rebuilt.connected_at = None;
        rebuilt.vpn_exit = Some(server);
        rebuilt.name = chain_name(rebuilt.mode, rebuilt.hop_count());
        rebuilt
    }

    /// Choose `count` relays best-first. Relays in `avoid` go last; with
    /// `distinct_countries`, unseen countries are taken before repeats.
    fn pick<'a>(
        &self,
        candidates: &'a [ProxyDescriptor],
        user: GeoPoint,
        count: usize,
        avoid: &HashSet<&str>,
        distinct_countries: bool,
        mode: ChainMode,
    ) -> Result<Vec<&'a ProxyDescriptor>, ChainError> {
        if candidates.is_empty() {
            return Err(CatalogError::NoServerAvailable.into());
        }
        if candidates.len() < count {
            return Err(ChainError::NotEnoughRelays {
                mode,
                needed: count,
                available: candidates.len(),
            });
        }

        let ranked = self.selector.rank(candidates, user);
        let rank_of: HashMap<String, usize> = ranked
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.clone(), i))
            .collect();
        let (fresh, used): (Vec<_>, Vec<_>) = ranked
            .into_iter()
            .partition(|p| !avoid.contains(p.id.as_str()));
        let ordered: Vec<&ProxyDescriptor> = fresh.into_iter().chain(used).collect();

        let mut picked: Vec<&ProxyDescriptor> = Vec::with_capacity(count);
        if distinct_countries {
            let mut countries = HashSet::new();
            for p in ordered.iter().copied() {
                if picked.len() == count {
                    break;
                }
                if countries.insert(p.country.as_str()) {
                    picked.push(p);
                }
            }
        }
        for p in ordered.iter().copied() {
            if picked.len() == count {
                break;
            }
            if !picked.iter().any(|q| q.id == p.id) {
                picked.push(p);
            }
        }

        // Entry nearest the user, exit farthest
        picked.sort_by_key(|p| rank_of.get(&p.id).copied().unwrap_or(usize::MAX));

        Ok(picked)
    }

    fn finish(
        &self,
        mode: ChainMode,
        hops: Vec<ProxyHop>,
        vpn_exit: Option<ServerDescriptor>,
    ) -> Result<AnonymityChain, ChainError> {
        validate_topology(&hops, vpn_exit.as_ref())?;

        let chain = AnonymityChain {
            id: self.next_chain_id(mode),
            name: chain_name(mode, hops.len() + usize::from(vpn_exit.is_some())),
            mode,
            proxy_chain: hops,
            vpn_exit,
            status: ChainStatus::Composed,
            connected_at: None,
            rotation_interval: mode.rotation_interval(),
            auto_rotate: mode.auto_rotate(),
            obfuscation: mode.obfuscation(),
            dpi_bypass: mode.dpi_bypass(),
            security_settings: security_settings(mode),
        };

        debug!(
            "Composed {} chain {} ({} hops): {}",
            mode,
            chain.id,
            chain.hop_count(),
            chain.route_summary()
        );
        Ok(chain)
    }

    fn next_chain_id(&self, mode: ChainMode) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{:04}", mode, n)
    }
}

fn chain_name(mode: ChainMode, hops: usize) -> String {
    format!("{} ({} hops)", mode.display_name(), hops)
}

fn security_settings(mode: ChainMode) -> BTreeMap<String, String> {
    let mut settings = BTreeMap::new();
    settings.insert("dns".to_string(), "tunnel".to_string());
    match mode {
        ChainMode::Tor => {
            settings.insert("onion_routing".to_string(), "true".to_string());
        }
        ChainMode::Paranoid => {
            settings.insert("traffic_padding".to_string(), "true".to_string());
            settings.insert("timing_jitter".to_string(), "true".to_string());
        }
        ChainMode::Stealth | ChainMode::Ghost => {
            settings.insert("protocol_mimicry".to_string(), "https".to_string());
        }
        ChainMode::Turbo | ChainMode::Custom => {}
    }
    settings
}

/// Chain errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChainError {
    #[error("Invalid chain topology: {0}")]
    InvalidTopology(String),

    #[error("Not enough relays for {mode}: need {needed}, have {available}")]
    NotEnoughRelays {
        mode: ChainMode,
        needed: usize,
        available: usize,
    },

    #[error("Custom chain needs at least one hop or a VPN exit")]
    EmptyCustomChain,

    #[error("Unknown chain mode: {0}")]
    UnknownMode(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(id: &str, country: &str, lon: f64, obfuscated: bool) -> ProxyDescriptor {
        ProxyDescriptor {
            id: id.to_string(),
            protocol: if obfuscated { ProxyProtocol::Shadowsocks } else { ProxyProtocol::Socks5 },
            host: format!("{id}.relay.net"),
            port: 1080,
            username: None,
            password: None,
            obfuscated,
            country: country.to_string(),
            latitude: 0.0,
            longitude: lon,
            load: 10,
        }
    }

    fn catalog() -> ServerCatalog {
        ServerCatalog::new(
            vec![],
            vec![
                relay("r1", "DE", 1.0, false),
                relay("r2", "DE", 2.0, true),
                relay("r3", "NL", 3.0, true),
                relay("r4", "SE", 4.0, false),
                relay("r5", "CH", 5.0, true),
                relay("r6", "IS", 6.0, false),
            ],
        )
    }

    fn user() -> GeoPoint {
        GeoPoint::new(0.0, 0.0)
    }

    #[test]
    fn test_turbo_single_entry() {
        let composer = ChainComposer::default();
        let chain = composer.compose(ChainMode::Turbo, &catalog(), user()).unwrap();

        assert_eq!(chain.hop_count(), 1);
        assert_eq!(chain.proxy_chain[0].role(), HopRole::Entry);
        assert_eq!(chain.proxy_chain[0].id(), "r1");
        assert!(!chain.auto_rotate);
    }

    #[test]
    fn test_stealth_uses_distinct_obfuscated_relays() {
        let composer = ChainComposer::default();
        let chain = composer.compose(ChainMode::Stealth, &catalog(), user()).unwrap();

        assert_eq!(chain.hop_ids(), vec!["r2", "r3"]);
        assert_eq!(chain.proxy_chain[1].role(), HopRole::Exit);
        assert!(chain.proxy_chain.iter().all(ProxyHop::is_obfuscated));
        assert!(chain.dpi_bypass);
    }

    #[test]
    fn test_ghost_topology() {
        let composer = ChainComposer::default();
        let chain = composer.compose(ChainMode::Ghost, &catalog(), user()).unwrap();

        assert!(chain.hop_count() >= 4);
        assert_eq!(chain.proxy_chain[0].role(), HopRole::Entry);
        assert_eq!(chain.proxy_chain.last().unwrap().role(), HopRole::Exit);
        // One relay per country first: DE, NL, SE, CH
        assert_eq!(chain.hop_ids(), vec!["r1", "r3", "r4", "r5"]);
        assert!(chain.validate().is_ok());
    }

    #[test]
    fn test_tor_three_relays() {
        let composer = ChainComposer::default();
        let chain = composer.compose(ChainMode::Tor, &catalog(), user()).unwrap();

        let roles: Vec<_> = chain.proxy_chain.iter().map(ProxyHop::role).collect();
        assert_eq!(roles, vec![HopRole::Entry, HopRole::Middle, HopRole::Exit]);
        assert!(chain.vpn_exit.is_none());
        assert_eq!(chain.security_settings.get("onion_routing").map(String::as_str), Some("true"));
    }

    #[test]
    fn test_paranoid_needs_obfuscated_relays() {
        let composer = ChainComposer::default();
        let err = composer.compose(ChainMode::Paranoid, &catalog(), user()).unwrap_err();

        assert_eq!(
            err,
            ChainError::NotEnoughRelays { mode: ChainMode::Paranoid, needed: 4, available: 3 }
        );
    }

    #[test]
    fn test_empty_catalog() {
        let composer = ChainComposer::default();
        let err = composer.compose(ChainMode::Turbo, &ServerCatalog::default(), user()).unwrap_err();
        assert_eq!(err, ChainError::Catalog(CatalogError::NoServerAvailable));
    }

    #[test]
    fn test_composition_is_deterministic() {
        let composer = ChainComposer::default();
        let a = composer.compose(ChainMode::Ghost, &catalog(), user()).unwrap();
        let b = composer.compose(ChainMode::Ghost, &catalog(), user()).unwrap();

        assert_eq!(a.hop_ids(), b.hop_ids());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_rotation_avoids_previous_relays() {
        let composer = ChainComposer::default();
        let first = composer.compose(ChainMode::Stealth, &catalog(), user()).unwrap();
        let second = composer
            .compose_request(&ChainMode::Stealth.into(), &catalog(), user(), Some(&first))
            .unwrap();

        // r5 is the only fresh obfuscated relay; r2 fills the other slot
        assert_eq!(second.hop_ids(), vec!["r2", "r5"]);
    }

    #[test]
    fn test_custom_passthrough() {
        let composer = ChainComposer::default();
        let hops = vec![
            ProxyHop::new("a", ProxyProtocol::Trojan, HopRole::Entry, "a.net", 443),
            ProxyHop::new("b", ProxyProtocol::Http, HopRole::Bridge, "b.net", 8080),
            ProxyHop::new("c", ProxyProtocol::V2ray, HopRole::Exit, "c.net", 443),
        ];

        let chain = composer.compose_custom(hops, None).unwrap();
        assert_eq!(chain.mode, ChainMode::Custom);
        assert_eq!(chain.hop_ids(), vec!["a", "b", "c"]);
        assert_eq!(chain.proxy_chain[1].role(), HopRole::Bridge);
    }

    #[test]
    fn test_custom_bad_topology() {
        let composer = ChainComposer::default();

        let exit_first = vec![
            ProxyHop::new("x", ProxyProtocol::Socks5, HopRole::Exit, "x.net", 1080),
            ProxyHop::new("e", ProxyProtocol::Socks5, HopRole::Entry, "e.net", 1080),
        ];
        assert!(matches!(
            composer.compose_custom(exit_first, None),
            Err(ChainError::InvalidTopology(_))
        ));

        let two_entries = vec![
            ProxyHop::new("e1", ProxyProtocol::Socks5, HopRole::Entry, "e1.net", 1080),
            ProxyHop::new("e2", ProxyProtocol::Socks5, HopRole::Entry, "e2.net", 1080),
        ];
        assert!(matches!(
            composer.compose_custom(two_entries, None),
            Err(ChainError::InvalidTopology(_))
        ));

        let duplicate = vec![
            ProxyHop::new("e", ProxyProtocol::Socks5, HopRole::Entry, "e.net", 1080),
            ProxyHop::new("e", ProxyProtocol::Socks5, HopRole::Exit, "e.net", 1080),
        ];
        assert!(matches!(
            composer.compose_custom(duplicate, None),
            Err(ChainError::InvalidTopology(_))
        ));

        assert_eq!(
            composer.compose_custom(vec![], None).unwrap_err(),
            ChainError::EmptyCustomChain
        );
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("Ghost".parse::<ChainMode>().unwrap(), ChainMode::Ghost);
        assert!("warp".parse::<ChainMode>().is_err());
    }

    #[test]
    fn test_hop_credentials_redacted() {
        let hop = ProxyHop::new("a", ProxyProtocol::Socks5, HopRole::Entry, "a.net", 1080)
            .with_credentials("user", "hunter2");
        assert!(!format!("{:?}", hop).contains("hunter2"));
        assert_eq!(hop.url(), "socks5://a.net:1080");
    }
}
