//! Resolver settings and configuration loading
//!
//! Settings can be built in code, starting from `ResolverSettings::default()`,
//! or read from a TOML document:
//!
//! ```toml
//! [settings]
//! qretr_delay_ms = 500
//! good_ns_ttl = 300
//!
//! [[nameservers]]
//! host = "192.0.2.53"
//!
//! [[nameservers]]
//! host = "2001:db8::53"
//! port = 5353
//! ```

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use derive_more::{Display, Error, From};
use serde_derive::{Deserialize, Serialize};

/// Most nameservers a single resolver will accept
pub const MAX_NAMESERVERS: usize = 16;

#[derive(Debug, Display, From, Error)]
pub enum SettingsError {
    Io(std::io::Error),
    Toml(toml::de::Error),
    #[display(fmt = "invalid setting: {}", _0)]
    #[from(ignore)]
    Invalid(#[error(not(source))] String),
}

type Result<T> = std::result::Result<T, SettingsError>;

/// Tunables of a resolver instance
///
/// Changing settings on a live resolver only affects queries created after
/// the change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverSettings {
    /// Milliseconds between retransmissions to one nameserver
    pub qretr_delay_ms: u64,
    /// Transmissions per nameserver per query, the first one included
    pub qretr_count: u32,
    /// Upper bound for the lifetime of a cache entry, in seconds
    pub cache_max_ttl: u32,
    /// Lifetime of negative answers in the cache, in seconds. Zero disables
    /// negative caching.
    pub invalid_ttl: u32,
    /// Seconds a promoted nameserver stays exclusively active
    pub good_ns_ttl: u32,
    /// Seconds a failed nameserver stays marked as bad
    pub bad_ns_ttl: u32,
    /// Size bound of the response cache
    pub max_cache_entries: usize,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            qretr_delay_ms: 2000,
            qretr_count: 5,
            cache_max_ttl: 5 * 60,
            invalid_ttl: 0,
            good_ns_ttl: 10 * 60,
            bad_ns_ttl: 60,
            max_cache_entries: 1024,
        }
    }
}

impl ResolverSettings {
    pub fn qretr_delay(&self) -> Duration {
        Duration::from_millis(self.qretr_delay_ms)
    }

    pub fn good_ns_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.good_ns_ttl))
    }

    pub fn bad_ns_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.bad_ns_ttl))
    }

    pub fn validate(&self) -> Result<()> {
        if self.qretr_count == 0 {
            return Err(SettingsError::Invalid("qretr_count must be at least 1".into()));
        }
        if self.qretr_delay_ms == 0 {
            return Err(SettingsError::Invalid("qretr_delay_ms must be at least 1".into()));
        }

        Ok(())
    }
}

fn default_dns_port() -> u16 {
    53
}

/// A nameserver as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameserverConfig {
    pub host: String,
    #[serde(default = "default_dns_port")]
    pub port: u16,
}

impl NameserverConfig {
    pub fn new(host: &str, port: u16) -> NameserverConfig {
        NameserverConfig {
            host: host.to_string(),
            port,
        }
    }

    /// Parse `host`, `host:port`, `[v6]:port` or a bare IPv6 address
    pub fn parse(spec: &str) -> Result<NameserverConfig> {
        if let Ok(addr) = spec.parse::<SocketAddr>() {
            return Ok(NameserverConfig::new(&addr.ip().to_string(), addr.port()));
        }
        if let Ok(ip) = spec.parse::<IpAddr>() {
            return Ok(NameserverConfig::new(&ip.to_string(), default_dns_port()));
        }

        Err(SettingsError::Invalid(format!("bad nameserver address `{}`", spec)))
    }

    /// Nameservers must be IP literals, a stub resolver cannot look up its
    /// own nameservers.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip = self
            .host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map_err(|_| SettingsError::Invalid(format!("nameserver `{}` is not an IP address", self.host)))?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Complete resolver configuration, usually read from a TOML file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default)]
    pub settings: ResolverSettings,
    #[serde(default)]
    pub nameservers: Vec<NameserverConfig>,
}

impl ResolverConfig {
    pub fn from_toml_str(data: &str) -> Result<ResolverConfig> {
        let config: ResolverConfig = toml::from_str(data)?;
        config.settings.validate()?;

        if config.nameservers.len() > MAX_NAMESERVERS {
            return Err(SettingsError::Invalid(format!(
                "at most {} nameservers are supported",
                MAX_NAMESERVERS
            )));
        }

        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<ResolverConfig> {
        let data = fs::read_to_string(path.as_ref())?;
        log::debug!("loading resolver config from {}", path.as_ref().display());

        ResolverConfig::from_toml_str(&data)
    }

    pub fn nameserver_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.nameservers.iter().map(NameserverConfig::socket_addr).collect()
    }
}
