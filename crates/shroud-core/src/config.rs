//! WireGuard Configuration Codec
//!
//! Parses, renders and validates the `wg-quick` style text format:
//!
//! ```text
//! [Interface]
//! PrivateKey = <base64>
//! Address = 10.0.0.2/32
//! DNS = 1.1.1.1, 1.0.0.1
//! MTU = 1420
//!
//! [Peer]
//! PublicKey = <base64>
//! PresharedKey = <base64>
//! Endpoint = vpn.example.com:51820
//! AllowedIPs = 0.0.0.0/0, ::/0
//! PersistentKeepalive = 25
//! ```
//!
//! All functions here are pure. Nothing touches the network or the driver.

use crate::catalog::ServerDescriptor;
use crate::keys::is_key_text;
use std::fmt::Write as _;
use std::time::SystemTime;

/// Standard WireGuard MTU
pub const DEFAULT_MTU: u16 = 1420;

/// Smallest MTU accepted by [`validate`] (IPv4 minimum datagram size)
pub const MIN_MTU: u16 = 576;

/// Largest MTU accepted by [`validate`]
pub const MAX_MTU: u16 = 1500;

/// Keepalive used for configs derived from catalog servers (seconds)
pub const DEFAULT_KEEPALIVE: u16 = 25;

pub fn default_allowed_ips() -> Vec<String> {
    vec!["0.0.0.0/0".to_string(), "::/0".to_string()]
}

pub fn default_dns() -> Vec<String> {
    vec!["1.1.1.1".to_string(), "1.0.0.1".to_string()]
}

/// One WireGuard tunnel leg, ready to hand to the tunnel driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Client private key (base64)
    pub private_key: String,
    /// Server public key (base64)
    pub public_key: String,
    /// Optional preshared key (base64)
    pub preshared_key: Option<String>,
    /// Client tunnel address (CIDR), if the server assigned one
    pub address: Option<String>,
    /// Endpoint host (DNS name or IP literal, no brackets)
    pub server_address: String,
    /// Endpoint UDP port
    pub port: u16,
    /// Routed ranges (CIDR)
    pub allowed_ips: Vec<String>,
    /// DNS servers used inside the tunnel
    pub dns: Vec<String>,
    pub mtu: u16,
    /// Keepalive interval in seconds; `None` disables it
    pub persistent_keepalive: Option<u16>,
    /// Configs handed out by a provisioning service may expire
    pub expires_at: Option<SystemTime>,
}

impl TunnelConfig {
    /// Create a config with default routing, DNS and MTU
    pub fn new(
        private_key: impl Into<String>,
        public_key: impl Into<String>,
        server_address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            private_key: private_key.into(),
            public_key: public_key.into(),
            preshared_key: None,
            address: None,
            server_address: server_address.into(),
            port,
            allowed_ips: default_allowed_ips(),
            dns: default_dns(),
            mtu: DEFAULT_MTU,
            persistent_keepalive: None,
            expires_at: None,
        }
    }

    /// Derive the tunnel leg for a catalog server.
    ///
    /// Only servers with complete key material qualify; template servers
    /// have to go through key provisioning first.
    pub fn from_server(server: &ServerDescriptor) -> Result<Self, ConfigError> {
        if !server.is_directly_usable() {
            return Err(ConfigError::MissingKeyMaterial(server.id.clone()));
        }

        // is_directly_usable() guarantees these are present
        let public_key = server.public_key.clone().unwrap_or_default();
        let private_key = server.client_private_key.clone().unwrap_or_default();

        let mut config = Self::new(private_key, public_key, server.address.clone(), server.port);
        config.address = server.client_address.clone();
        config.preshared_key = server.preshared_key.clone().filter(|k| !k.is_empty());
        config.persistent_keepalive = Some(DEFAULT_KEEPALIVE);
        Ok(config)
    }

    /// `host:port`, with IPv6 literals in brackets
    pub fn endpoint(&self) -> String {
        if self.server_address.contains(':') {
            format!("[{}]:{}", self.server_address, self.port)
        } else {
            format!("{}:{}", self.server_address, self.port)
        }
    }

    pub fn keepalive_enabled(&self) -> bool {
        matches!(self.persistent_keepalive, Some(k) if k > 0)
    }
}

/// Parse configuration text.
///
/// `PrivateKey`, `PublicKey` and `Endpoint` are required. Section headers
/// only structure the text; keys are recognised wherever they appear.
pub fn parse(text: &str) -> Result<TunnelConfig, ConfigError> {
    let mut private_key = None;
    let mut public_key = None;
    let mut preshared_key = None;
    let mut address = None;
    let mut endpoint = None;
    let mut allowed_ips = None;
    let mut dns = None;
    let mut mtu = None;
    let mut keepalive = None;

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') || line.starts_with('[') {
            continue;
        }

        // Split at the first '=' so base64 padding stays in the value
        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::Malformed(format!(
                "line {}: expected `Key = Value`",
                lineno + 1
            )));
        };
        let key = key.trim();
        let value = value.trim();

        match key.to_ascii_lowercase().as_str() {
            "privatekey" => private_key = Some(value.to_string()),
            "publickey" => public_key = Some(value.to_string()),
            "presharedkey" => preshared_key = Some(value.to_string()),
            "address" => address = Some(value.to_string()),
            "endpoint" => endpoint = Some(value.to_string()),
            "allowedips" => allowed_ips = Some(split_list(value)),
            "dns" => dns = Some(split_list(value)),
            "mtu" => {
                let parsed = value.parse::<u16>().map_err(|_| {
                    ConfigError::Malformed(format!("line {}: MTU `{}` is not a number", lineno + 1, value))
                })?;
                mtu = Some(parsed);
            }
            "persistentkeepalive" => {
                let parsed = value.parse::<u16>().map_err(|_| {
                    ConfigError::Malformed(format!(
                        "line {}: PersistentKeepalive `{}` is not a number",
                        lineno + 1,
                        value
                    ))
                })?;
                keepalive = Some(parsed).filter(|k| *k > 0);
            }
            _ => {}
        }
    }

    let private_key = private_key.ok_or_else(|| ConfigError::Malformed("missing PrivateKey".into()))?;
    let public_key = public_key.ok_or_else(|| ConfigError::Malformed("missing PublicKey".into()))?;
    let endpoint = endpoint.ok_or_else(|| ConfigError::Malformed("missing Endpoint".into()))?;
    let (server_address, port) = split_endpoint(&endpoint)?;

    Ok(TunnelConfig {
        private_key,
        public_key,
        preshared_key: preshared_key.filter(|k| !k.is_empty()),
        address: address.filter(|a| !a.is_empty()),
        server_address,
        port,
        allowed_ips: allowed_ips.filter(|v| !v.is_empty()).unwrap_or_else(default_allowed_ips),
        dns: dns.filter(|v| !v.is_empty()).unwrap_or_else(default_dns),
        mtu: mtu.unwrap_or(DEFAULT_MTU),
        persistent_keepalive: keepalive,
        expires_at: None,
    })
}

/// Render a config as `[Interface]`/`[Peer]` text. Deterministic.
pub fn render(config: &TunnelConfig) -> String {
    let mut out = String::with_capacity(512);

    // Writing into a String cannot fail
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "PrivateKey = {}", config.private_key);
    if let Some(address) = &config.address {
        let _ = writeln!(out, "Address = {}", address);
    }
    if !config.dns.is_empty() {
        let _ = writeln!(out, "DNS = {}", config.dns.join(", "));
    }
    let _ = writeln!(out, "MTU = {}", config.mtu);
    out.push('\n');

    let _ = writeln!(out, "[Peer]");
    let _ = writeln!(out, "PublicKey = {}", config.public_key);
    if let Some(psk) = &config.preshared_key {
        let _ = writeln!(out, "PresharedKey = {}", psk);
    }
    let _ = writeln!(out, "Endpoint = {}", config.endpoint());
    if !config.allowed_ips.is_empty() {
        let _ = writeln!(out, "AllowedIPs = {}", config.allowed_ips.join(", "));
    }
    if let Some(keepalive) = config.persistent_keepalive.filter(|k| *k > 0) {
        let _ = writeln!(out, "PersistentKeepalive = {}", keepalive);
    }

    out
}

/// Validate against the current wall clock. See [`validate_at`].
pub fn validate(config: &TunnelConfig) -> Result<(), ConfigError> {
    validate_at(config, SystemTime::now())
}

/// Check every rule in order and return the first violation.
pub fn validate_at(config: &TunnelConfig, now: SystemTime) -> Result<(), ConfigError> {
    if !is_key_text(&config.private_key) {
        return Err(ConfigError::InvalidKey { field: "PrivateKey" });
    }
    if !is_key_text(&config.public_key) {
        return Err(ConfigError::InvalidKey { field: "PublicKey" });
    }
    if let Some(psk) = &config.preshared_key {
        if !is_key_text(psk) {
            return Err(ConfigError::InvalidKey { field: "PresharedKey" });
        }
    }

    let host = config.server_address.trim();
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(ConfigError::InvalidEndpoint(config.endpoint()));
    }
    if config.port == 0 {
        return Err(ConfigError::InvalidEndpoint(config.endpoint()));
    }

    if !(MIN_MTU..=MAX_MTU).contains(&config.mtu) {
        return Err(ConfigError::MtuOutOfRange(config.mtu));
    }

    if let Some(expires_at) = config.expires_at {
        if expires_at <= now {
            return Err(ConfigError::Expired);
        }
    }

    Ok(())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split `host:port` or `[v6]:port`.
fn split_endpoint(endpoint: &str) -> Result<(String, u16), ConfigError> {
    let malformed = || ConfigError::Malformed(format!("Endpoint `{}` is not host:port", endpoint));

    let (host, port) = if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, port) = rest.split_once("]:").ok_or_else(malformed)?;
        (host, port)
    } else {
        let mut parts = endpoint.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(port), None) => (host, port),
            _ => return Err(malformed()),
        }
    };

    let host = host.trim();
    if host.is_empty() {
        return Err(malformed());
    }
    let port = port.trim().parse::<u16>().map_err(|_| malformed())?;

    Ok((host.to_string(), port))
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Malformed config: {0}")]
    Malformed(String),

    #[error("Invalid {field}: expected a 32-byte base64 key")]
    InvalidKey { field: &'static str },

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("MTU {0} out of range (576-1500)")]
    MtuOutOfRange(u16),

    #[error("Config has expired")]
    Expired,

    #[error("Server {0} has no key material (needs provisioning)")]
    MissingKeyMaterial(String),
}

impl ConfigError {
    /// Everything except text that could not be parsed at all
    pub fn is_validation(&self) -> bool {
        !matches!(self, ConfigError::Malformed(_))
    }
}
