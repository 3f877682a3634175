// Client configuration: `~/.annosync/config.toml`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::{Host, Url};

/// Root directory for annosync state: `~/.annosync/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".annosync"))
}

/// Path to the config file: `~/.annosync/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

/// Default location of the annotation index: `~/.annosync/index.db`.
pub fn default_index_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("index.db"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Request endpoint of the annotation store (e.g. `https://annotations.example.com/api`).
    pub endpoint_url: Option<String>,
    /// Change feed endpoint (e.g. `wss://annotations.example.com/feed`).
    pub subscription_url: Option<String>,
    /// Overrides `~/.annosync/index.db`.
    pub index_path: Option<PathBuf>,
    pub display_name: Option<String>,
}

impl ClientConfig {
    /// Load from `~/.annosync/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = global_config_path().ok_or_else(|| {
            ConfigError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "could not determine home directory",
            ))
        })?;
        self.save_to(&path)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(endpoint_url) = &self.endpoint_url {
            validate_endpoint_url(endpoint_url)?;
        }
        if let Some(subscription_url) = &self.subscription_url {
            validate_subscription_url(subscription_url)?;
        }
        Ok(())
    }

    /// The configured index path, or the default under the home directory.
    pub fn resolved_index_path(&self) -> Option<PathBuf> {
        self.index_path.clone().or_else(default_index_path)
    }
}

fn validate_endpoint_url(value: &str) -> Result<(), ConfigError> {
    let parsed = parse_url("endpoint_url", value)?;
    match parsed.scheme() {
        "https" => Ok(()),
        "http" if is_loopback_host(parsed.host()) => Ok(()),
        _ => Err(ConfigError::InvalidUrl {
            field: "endpoint_url",
            reason: "must use https (http is allowed only for localhost testing)".into(),
        }),
    }
}

fn validate_subscription_url(value: &str) -> Result<(), ConfigError> {
    let parsed = parse_url("subscription_url", value)?;
    match parsed.scheme() {
        "wss" => Ok(()),
        "ws" if is_loopback_host(parsed.host()) => Ok(()),
        _ => Err(ConfigError::InvalidUrl {
            field: "subscription_url",
            reason: "must use wss (ws is allowed only for localhost testing)".into(),
        }),
    }
}

fn parse_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value)
        .map_err(|error| ConfigError::InvalidUrl { field, reason: format!("`{value}`: {error}") })
}

fn is_loopback_host(host: Option<Host<&str>>) -> bool {
    match host {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(addr)) => addr.is_loopback(),
        Some(Host::Ipv6(addr)) => addr.is_loopback(),
        None => false,
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
    InvalidUrl { field: &'static str, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
            Self::InvalidUrl { field, reason } => write!(f, "invalid {field}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_empty() {
        let cfg = ClientConfig::default();
        assert!(cfg.endpoint_url.is_none());
        assert!(cfg.subscription_url.is_none());
        assert!(cfg.index_path.is_none());
        assert!(cfg.display_name.is_none());
    }

    #[test]
    fn roundtrip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let cfg = ClientConfig {
            endpoint_url: Some("https://annotations.example.com/api".into()),
            subscription_url: Some("wss://annotations.example.com/feed".into()),
            index_path: Some(dir.path().join("index.db")),
            display_name: Some("Ann".into()),
        };
        cfg.save_to(&path).unwrap();
        assert_eq!(ClientConfig::load_from(&path).unwrap(), cfg);
    }

    #[test]
    fn parse_from_toml() {
        let toml_str = r#"
endpoint_url = "http://localhost:4000/api"
subscription_url = "ws://127.0.0.1:4000/feed"
display_name = "Bob"
"#;
        let cfg: ClientConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.endpoint_url.as_deref(), Some("http://localhost:4000/api"));
        assert_eq!(cfg.display_name.as_deref(), Some("Bob"));
        cfg.validate().expect("loopback plaintext urls are allowed");
    }

    #[test]
    fn missing_fields_use_defaults() {
        let cfg: ClientConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, ClientConfig::default());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let error =
            toml::from_str::<ClientConfig>("api_key = \"secret\"").expect_err("parse should fail");
        assert!(error.to_string().contains("unknown field `api_key`"));
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(ClientConfig::load_from(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn plaintext_remote_endpoints_are_rejected() {
        let cfg = ClientConfig {
            endpoint_url: Some("http://annotations.example.com/api".into()),
            ..ClientConfig::default()
        };
        let error = cfg.validate().expect_err("http to a remote host must fail");
        assert!(error.to_string().starts_with("invalid endpoint_url"));

        let cfg = ClientConfig {
            subscription_url: Some("ws://annotations.example.com/feed".into()),
            ..ClientConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ipv6_loopback_is_allowed() {
        let cfg = ClientConfig {
            endpoint_url: Some("http://[::1]:4000/api".into()),
            subscription_url: Some("ws://[::1]:4000/feed".into()),
            ..ClientConfig::default()
        };
        cfg.validate().expect("ipv6 loopback should be allowed");
    }

    #[test]
    fn malformed_url_is_rejected() {
        let cfg =
            ClientConfig { endpoint_url: Some("not a url".into()), ..ClientConfig::default() };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidUrl { field: "endpoint_url", .. })
        ));
    }

    #[test]
    fn save_refuses_invalid_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let cfg = ClientConfig {
            subscription_url: Some("https://annotations.example.com/feed".into()),
            ..ClientConfig::default()
        };
        assert!(cfg.save_to(&path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn explicit_index_path_wins() {
        let cfg =
            ClientConfig { index_path: Some("/tmp/annosync.db".into()), ..ClientConfig::default() };
        assert_eq!(cfg.resolved_index_path(), Some(PathBuf::from("/tmp/annosync.db")));
    }

    #[test]
    fn global_dir_is_under_home() {
        if let Some(dir) = global_dir() {
            assert!(dir.ends_with(".annosync"));
        }
    }
}
