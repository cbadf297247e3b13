//! Client settings, stored as TOML or JSON.
//!
//! ```toml
//! user_location = { latitude = 52.52, longitude = 13.40 }
//!
//! [connection]
//! connect_timeout_ms = 15000
//! max_connect_retries = 2
//!
//! [rotation]
//! tick_secs = 30
//!
//! [[servers]]
//! id = "de-1"
//! name = "Frankfurt"
//! country = "DE"
//! address = "de1.example.net"
//! latitude = 50.11
//! longitude = 8.68
//! ```

use crate::catalog::{GeoPoint, ProxyDescriptor, Selector, ServerCatalog, ServerDescriptor, DEFAULT_DISTANCE_TOLERANCE_KM};
use crate::posture::ProtectionFlags;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Timeouts and retry policy for the state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub connect_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,
    /// Retries after the first failed attempt
    pub max_connect_retries: u32,
    /// Delay before the first retry; doubled for each further one
    pub retry_backoff_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Backoff before retry number `retry` (0-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.min(16)).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            disconnect_timeout_ms: 5_000,
            max_connect_retries: 2,
            retry_backoff_ms: 1_000,
            max_reconnect_attempts: 3,
            reconnect_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationSettings {
    pub tick_secs: u64,
}

impl RotationSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self { tick_secs: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorSettings {
    pub distance_tolerance_km: f64,
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self {
            distance_tolerance_km: DEFAULT_DISTANCE_TOLERANCE_KM,
        }
    }
}

/// Everything the client reads at startup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_location: Option<GeoPoint>,
    pub connection: ConnectionSettings,
    pub rotation: RotationSettings,
    pub protections: ProtectionFlags,
    pub selector: SelectorSettings,
    pub servers: Vec<ServerDescriptor>,
    pub proxies: Vec<ProxyDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsFormat {
    Toml,
    Json,
}

impl SettingsFormat {
    /// Guess from the file extension
    pub fn from_path(path: &Path) -> Result<Self, SettingsError> {
        match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
            Some("toml") => Ok(SettingsFormat::Toml),
            Some("json") => Ok(SettingsFormat::Json),
            _ => Err(SettingsError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

impl ClientSettings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let format = SettingsFormat::from_path(path)?;
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::Io(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content, format)
    }

    pub fn parse(content: &str, format: SettingsFormat) -> Result<Self, SettingsError> {
        match format {
            SettingsFormat::Toml => Self::from_toml(content),
            SettingsFormat::Json => Self::from_json(content),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        toml::from_str(content)
            .map_err(|e| SettingsError::Parse(e.to_string()))
    }

    pub fn from_json(content: &str) -> Result<Self, SettingsError> {
        serde_json::from_str(content)
            .map_err(|e| SettingsError::Parse(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self)
            .map_err(|e| SettingsError::Parse(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, SettingsError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SettingsError::Parse(e.to_string()))
    }

    pub fn catalog(&self) -> ServerCatalog {
        ServerCatalog::new(self.servers.clone(), self.proxies.clone())
    }

    pub fn selector(&self) -> Selector {
        Selector::new(self.selector.distance_tolerance_km)
    }
}

/// Settings errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported settings format: {0}")]
    UnsupportedFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
user_location = { latitude = 52.52, longitude = 13.40 }

[connection]
connect_timeout_ms = 3000
max_connect_retries = 0

[protections]
webrtc_blocking = false

[[servers]]
id = "de-1"
name = "Frankfurt"
country = "DE"
address = "de1.example.net"
latitude = 50.11
longitude = 8.68
load = 20

[[proxies]]
id = "p1"
protocol = "shadowsocks"
host = "p1.example.net"
port = 8388
obfuscated = true
country = "NL"
latitude = 52.37
longitude = 4.90
"#;

    #[test]
    fn test_defaults() {
        let settings = ClientSettings::default();
        assert_eq!(settings.connection.connect_timeout(), Duration::from_secs(15));
        assert_eq!(settings.connection.max_connect_retries, 2);
        assert_eq!(settings.rotation.tick(), Duration::from_secs(30));
        assert_eq!(settings.protections, ProtectionFlags::default());
        assert!(settings.user_location.is_none());
    }

    #[test]
    fn test_parse_toml() {
        let settings = ClientSettings::from_toml(SAMPLE).unwrap();
        assert_eq!(settings.connection.connect_timeout_ms, 3000);
        assert_eq!(settings.connection.max_connect_retries, 0);
        // Unset fields keep defaults
        assert_eq!(settings.connection.reconnect_delay_ms, 2000);
        assert!(!settings.protections.webrtc_blocking);
        assert!(settings.protections.kill_switch);
        assert_eq!(settings.user_location, Some(GeoPoint::new(52.52, 13.40)));

        let catalog = settings.catalog();
        assert_eq!(catalog.servers[0].port, 51820);
        assert_eq!(catalog.proxies[0].id, "p1");
        assert!(catalog.usable_servers().is_empty());
    }

    #[test]
    fn test_toml_json_agree() {
        let settings = ClientSettings::from_toml(SAMPLE).unwrap();
        let json = settings.to_json().unwrap();
        assert_eq!(ClientSettings::from_json(&json).unwrap(), settings);

        let toml = settings.to_toml().unwrap();
        assert_eq!(ClientSettings::from_toml(&toml).unwrap(), settings);
    }

    #[test]
    fn test_backoff_doubles() {
        let c = ConnectionSettings {
            retry_backoff_ms: 100,
            ..Default::default()
        };
        assert_eq!(c.backoff(0), Duration::from_millis(100));
        assert_eq!(c.backoff(1), Duration::from_millis(200));
        assert_eq!(c.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(SettingsFormat::from_path(Path::new("a/b.toml")).unwrap(), SettingsFormat::Toml);
        assert_eq!(SettingsFormat::from_path(Path::new("b.JSON")).unwrap(), SettingsFormat::Json);
        assert!(matches!(
            SettingsFormat::from_path(Path::new("b.yaml")),
            Err(SettingsError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            ClientSettings::from_toml("connection = 5"),
            Err(SettingsError::Parse(_))
        ));
    }
}
