//! Configuration schema definitions.
//!
//! Every scalar is optional in a file so that a later layer overrides an
//! earlier one only where it says something. The accessors fill in the
//! defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;
use crate::net::UpstreamProxy;

/// Default listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:2876";

/// Data directory name under the platform data dir.
pub const DATA_DIR_NAME: &str = "vantage";

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Proxy front end and interception switches.
    #[serde(default)]
    pub proxy: ProxySection,

    /// Connect and query timeouts.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Fingerprint cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Notary storage and refresh.
    #[serde(default)]
    pub notaries: NotariesConfig,

    /// Local trust anchors and CA.
    #[serde(default)]
    pub trust: TrustConfig,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Lists are merged (appended). Scalars are overridden when set.
    pub fn merge(&mut self, other: Config) {
        self.proxy.merge(other.proxy);
        self.timeouts.merge(other.timeouts);
        self.cache.merge(other.cache);
        self.notaries.merge(other.notaries);
        self.trust.merge(other.trust);
    }
}

fn override_with<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn data_dir() -> Result<PathBuf, ConfigError> {
    dirs::data_dir()
        .map(|p| p.join(DATA_DIR_NAME))
        .ok_or(ConfigError::NoDataDirectory)
}

/// `[proxy]`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProxySection {
    /// Listen address.
    #[serde(default)]
    pub listen: Option<String>,

    /// Deadline before relaying, in seconds.
    #[serde(default)]
    pub connection_timeout_secs: Option<u64>,

    /// Trust certificates chaining to a local anchor without notaries.
    #[serde(default)]
    pub private_pki_exempt: Option<bool>,

    /// Pass private IPv4 destinations through untouched.
    #[serde(default)]
    pub private_ip_exempt: Option<bool>,

    /// Hosts passed through untouched.
    ///
    /// Case-insensitive regular expressions, one per line; `#` lines are
    /// comments. `*.example.com` is shorthand for any subdomain.
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// `none`, `http://host:port` or `socks5://host:port`.
    #[serde(default)]
    pub upstream: Option<String>,
}

impl ProxySection {
    fn merge(&mut self, other: ProxySection) {
        override_with(&mut self.listen, other.listen);
        override_with(&mut self.connection_timeout_secs, other.connection_timeout_secs);
        override_with(&mut self.private_pki_exempt, other.private_pki_exempt);
        override_with(&mut self.private_ip_exempt, other.private_ip_exempt);
        override_with(&mut self.upstream, other.upstream);
        self.whitelist.extend(other.whitelist);
    }

    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = self.listen.as_deref().unwrap_or(DEFAULT_LISTEN);
        raw.parse().map_err(|e| ConfigError::InvalidValue {
            field: "proxy.listen".to_string(),
            message: format!("'{}': {}", raw, e),
        })
    }

    /// Deadline before relaying.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs.unwrap_or(30))
    }

    /// Whether the local PKI exemption is on.
    pub fn private_pki_exempt(&self) -> bool {
        self.private_pki_exempt.unwrap_or(true)
    }

    /// Whether private IPv4 destinations are passed through.
    pub fn private_ip_exempt(&self) -> bool {
        self.private_ip_exempt.unwrap_or(true)
    }

    /// Parsed upstream proxy. `none` or unset means direct.
    pub fn upstream_proxy(&self) -> Result<Option<UpstreamProxy>, ConfigError> {
        match self.upstream.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) if s.eq_ignore_ascii_case("none") => Ok(None),
            Some(s) => s.parse().map(Some).map_err(|e| ConfigError::InvalidValue {
                field: "proxy.upstream".to_string(),
                message: format!("{}", e),
            }),
        }
    }
}

/// `[timeouts]`, all in milliseconds.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutsConfig {
    /// Direct target connect.
    #[serde(default)]
    pub direct_connect_ms: Option<u64>,
    /// Target connect through an upstream proxy.
    #[serde(default)]
    pub proxied_connect_ms: Option<u64>,
    /// One notary query.
    #[serde(default)]
    pub notary_query_ms: Option<u64>,
    /// Racing resolved addresses.
    #[serde(default)]
    pub race_budget_ms: Option<u64>,
}

impl TimeoutsConfig {
    fn merge(&mut self, other: TimeoutsConfig) {
        override_with(&mut self.direct_connect_ms, other.direct_connect_ms);
        override_with(&mut self.proxied_connect_ms, other.proxied_connect_ms);
        override_with(&mut self.notary_query_ms, other.notary_query_ms);
        override_with(&mut self.race_budget_ms, other.race_budget_ms);
    }

    /// Direct connect budget.
    pub fn direct_connect(&self) -> Duration {
        Duration::from_millis(self.direct_connect_ms.unwrap_or(5000))
    }

    /// Proxied connect budget.
    pub fn proxied_connect(&self) -> Duration {
        Duration::from_millis(self.proxied_connect_ms.unwrap_or(10000))
    }

    /// Per-notary query timeout.
    pub fn notary_query(&self) -> Duration {
        Duration::from_millis(self.notary_query_ms.unwrap_or(10000))
    }

    /// Racer budget.
    pub fn race_budget(&self) -> Duration {
        Duration::from_millis(self.race_budget_ms.unwrap_or(5000))
    }
}

/// `[cache]`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Whether trusted fingerprints are remembered.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// SQLite file.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl CacheConfig {
    fn merge(&mut self, other: CacheConfig) {
        override_with(&mut self.enabled, other.enabled);
        override_with(&mut self.path, other.path);
    }

    /// Whether the cache is enabled.
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Cache database location.
    pub fn path(&self) -> Result<PathBuf, ConfigError> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("cache.sqlite")),
        }
    }
}

/// `[notaries]`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct NotariesConfig {
    /// Directory holding one JSON record per notary.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Seconds between bundle refresh passes. 0 disables refresh.
    #[serde(default)]
    pub refresh_interval_secs: Option<u64>,
}

impl NotariesConfig {
    fn merge(&mut self, other: NotariesConfig) {
        override_with(&mut self.directory, other.directory);
        override_with(&mut self.refresh_interval_secs, other.refresh_interval_secs);
    }

    /// Notary record directory.
    pub fn directory(&self) -> Result<PathBuf, ConfigError> {
        match &self.directory {
            Some(dir) => Ok(dir.clone()),
            None => Ok(data_dir()?.join("notaries")),
        }
    }

    /// Refresh interval, `None` when refresh is disabled.
    pub fn refresh_interval(&self) -> Option<Duration> {
        match self.refresh_interval_secs.unwrap_or(86_400) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// `[trust]`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TrustConfig {
    /// PEM files with local trust anchors.
    #[serde(default)]
    pub local_pki_anchors: Vec<PathBuf>,
    /// Where the local CA lives.
    #[serde(default)]
    pub ca_dir: Option<PathBuf>,
}

impl TrustConfig {
    fn merge(&mut self, other: TrustConfig) {
        self.local_pki_anchors.extend(other.local_pki_anchors);
        override_with(&mut self.ca_dir, other.ca_dir);
    }

    /// Local CA directory.
    pub fn ca_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.ca_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(data_dir()?.join("ca")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(
            config.proxy.listen_addr().unwrap(),
            "127.0.0.1:2876".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.proxy.connection_timeout(), Duration::from_secs(30));
        assert!(config.proxy.private_pki_exempt());
        assert!(config.proxy.private_ip_exempt());
        assert!(config.proxy.upstream_proxy().unwrap().is_none());
        assert_eq!(config.timeouts.direct_connect(), Duration::from_millis(5000));
        assert_eq!(config.timeouts.proxied_connect(), Duration::from_millis(10000));
        assert_eq!(config.timeouts.notary_query(), Duration::from_millis(10000));
        assert!(config.cache.enabled());
        assert_eq!(
            config.notaries.refresh_interval(),
            Some(Duration::from_secs(86_400))
        );
    }

    #[test]
    fn test_merge_overrides_scalars_and_appends_lists() {
        let mut base: Config = toml::from_str(
            r#"
            [proxy]
            listen = "127.0.0.1:1000"
            whitelist = ["a.example"]
            private_ip_exempt = false
            "#,
        )
        .unwrap();
        let other: Config = toml::from_str(
            r#"
            [proxy]
            whitelist = ["*.b.example"]

            [cache]
            enabled = false
            "#,
        )
        .unwrap();

        base.merge(other);

        assert_eq!(base.proxy.listen.as_deref(), Some("127.0.0.1:1000"));
        assert_eq!(base.proxy.whitelist, vec!["a.example", "*.b.example"]);
        assert!(!base.proxy.private_ip_exempt());
        assert!(!base.cache.enabled());
    }

    #[test]
    fn test_upstream_parsing() {
        let mut proxy = ProxySection {
            upstream: Some("none".to_string()),
            ..Default::default()
        };
        assert!(proxy.upstream_proxy().unwrap().is_none());

        proxy.upstream = Some("socks5://127.0.0.1:1080".to_string());
        assert!(matches!(
            proxy.upstream_proxy().unwrap(),
            Some(UpstreamProxy::Socks5(_))
        ));

        proxy.upstream = Some("ftp://x:1".to_string());
        assert!(matches!(
            proxy.upstream_proxy(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_invalid_listen() {
        let proxy = ProxySection {
            listen: Some("not an address".to_string()),
            ..Default::default()
        };
        assert!(proxy.listen_addr().is_err());
    }

    #[test]
    fn test_zero_refresh_disables() {
        let notaries = NotariesConfig {
            refresh_interval_secs: Some(0),
            ..Default::default()
        };
        assert_eq!(notaries.refresh_interval(), None);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(toml::from_str::<Config>("[proxy]\nlisten_port = 1").is_err());
    }
}
