//! Node Configuration
//!
//! A single JSON document describes the local host, the initial node list, the
//! replica factor, the shard width and which membership/broadcast variant to run.
//! Every field has a default so a bare `{}` is a valid single-node static config.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::shard::{DEFAULT_SHARD_WIDTH, ShardWidth};

pub const DEFAULT_HOST: &str = "localhost:10101";
pub const DEFAULT_PORT: u16 = 10101;
pub const DEFAULT_GOSSIP_PORT: u16 = 14000;

/// Which NodeSet/Broadcaster pair a node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipKind {
    Static,
    Http,
    Gossip,
}

impl FromStr for MembershipKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "http" => Ok(Self::Http),
            "gossip" => Ok(Self::Gossip),
            _ => Err(ConfigError::UnknownVariant(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Address other nodes use to reach this one (`host:port`).
    pub host: String,
    /// Initial node list. The local host is added if missing.
    pub nodes: Vec<String>,
    pub replicas: usize,
    pub shard_width: u32,
    /// One of `static`, `http`, `gossip`. Kept as a string so an unknown value is
    /// reported by [`ClusterConfig::validate`] rather than by the parser.
    pub membership: String,
    pub http: HttpConfig,
    pub gossip: GossipConfig,
    pub anti_entropy: AntiEntropyConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            nodes: Vec::new(),
            replicas: 1,
            shard_width: DEFAULT_SHARD_WIDTH,
            membership: "static".to_string(),
            http: HttpConfig::default(),
            gossip: GossipConfig::default(),
            anti_entropy: AntiEntropyConfig::default(),
        }
    }
}

/// Outgoing HTTP calls: joins, broadcasts and repair RPCs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_ms: u64,
    pub retries: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 500,
            retries: 3,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Gossip transport and failure-detector tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub port: u16,
    /// Gossip address (`host:port`) of a node to join through.
    pub seed: Option<String>,
    pub interval_ms: u64,
    /// Silence after which a live member becomes suspect.
    pub suspect_timeout_ms: u64,
    /// Silence after which a suspect member is declared dead.
    pub dead_timeout_ms: u64,
    /// How long a dead member stays in the table before it is forgotten.
    pub reap_timeout_ms: u64,
    pub join_timeout_ms: u64,
    /// Piggyback retransmissions per event, scaled by `log2(cluster size)`.
    pub retransmit_mult: u32,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_GOSSIP_PORT,
            seed: None,
            interval_ms: 500,
            suspect_timeout_ms: 5_000,
            dead_timeout_ms: 10_000,
            reap_timeout_ms: 30_000,
            join_timeout_ms: 2_000,
            retransmit_mult: 3,
        }
    }
}

impl GossipConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn suspect_timeout(&self) -> Duration {
        Duration::from_millis(self.suspect_timeout_ms)
    }

    pub fn dead_timeout(&self) -> Duration {
        Duration::from_millis(self.dead_timeout_ms)
    }

    pub fn reap_timeout(&self) -> Duration {
        Duration::from_millis(self.reap_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiEntropyConfig {
    /// Seconds between repair cycles. Zero disables the loop.
    pub interval_secs: u64,
    /// Shards compared and repaired concurrently.
    pub workers: usize,
    pub peer_timeout_ms: u64,
}

impl Default for AntiEntropyConfig {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            workers: 4,
            peer_timeout_ms: 2_000,
        }
    }
}

impl AntiEntropyConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }
}

impl ClusterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn membership_kind(&self) -> Result<MembershipKind, ConfigError> {
        self.membership.parse()
    }

    pub fn shard_width(&self) -> Result<ShardWidth, ConfigError> {
        ShardWidth::new(self.shard_width)
    }

    /// Checks everything that must be fatal at startup. Returns the normalized local
    /// host so callers don't normalize twice.
    pub fn validate(&self) -> Result<String, ConfigError> {
        self.membership_kind()?;
        self.shard_width()?;
        if self.replicas == 0 {
            return Err(ConfigError::ZeroReplicaFactor);
        }
        if self.gossip.interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("gossip.interval_ms"));
        }
        for node in &self.nodes {
            normalize_host(node)?;
        }
        normalize_host(&self.host)
    }

    /// Normalized node list with the local host included.
    pub fn node_hosts(&self) -> Result<Vec<String>, ConfigError> {
        let local = normalize_host(&self.host)?;
        let mut hosts = self
            .nodes
            .iter()
            .map(|node| normalize_host(node))
            .collect::<Result<Vec<_>, _>>()?;
        if !hosts.contains(&local) {
            hosts.push(local);
        }
        Ok(hosts)
    }
}

/// Accepts `host`, `host:port` and `http://host:port`. A missing port becomes
/// [`DEFAULT_PORT`]; any scheme other than `http` is rejected.
pub fn normalize_host(host: &str) -> Result<String, ConfigError> {
    let trimmed = host.trim();
    let bare = if let Some(rest) = trimmed.strip_prefix("http://") {
        rest
    } else if trimmed.contains("://") {
        return Err(ConfigError::InvalidHost(host.to_string()));
    } else {
        trimmed
    };
    let bare = bare.trim_end_matches('/');

    if bare.is_empty() || bare.contains('/') || bare.chars().any(char::is_whitespace) {
        return Err(ConfigError::InvalidHost(host.to_string()));
    }

    match bare.rsplit_once(':') {
        None => Ok(format!("{}:{}", bare, DEFAULT_PORT)),
        Some((name, "")) if !name.is_empty() => Ok(format!("{}:{}", name, DEFAULT_PORT)),
        Some((name, port)) => {
            if name.is_empty() || port.parse::<u16>().is_err() {
                return Err(ConfigError::InvalidHost(host.to_string()));
            }
            Ok(bare.to_string())
        }
    }
}

/// Host part of a `host:port` string, used to bind the gossip socket next to the API.
pub fn host_part(host: &str) -> &str {
    host.rsplit_once(':').map(|(name, _)| name).unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ClusterConfig::default();
        assert_eq!(config.validate().unwrap(), "localhost:10101");
        assert_eq!(config.membership_kind().unwrap(), MembershipKind::Static);
        assert_eq!(config.shard_width().unwrap().exponent(), 24);
    }

    #[test]
    fn test_unknown_variant_is_fatal() {
        let config = ClusterConfig {
            membership: "carrier-pigeon".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownVariant(v)) if v == "carrier-pigeon"
        ));
    }

    #[test]
    fn test_variant_parsing_is_case_insensitive() {
        assert_eq!("Gossip".parse::<MembershipKind>().unwrap(), MembershipKind::Gossip);
        assert_eq!("HTTP".parse::<MembershipKind>().unwrap(), MembershipKind::Http);
    }

    #[test]
    fn test_zero_replicas_is_fatal() {
        let config = ClusterConfig {
            replicas: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroReplicaFactor)));
    }

    #[test]
    fn test_zero_gossip_interval_is_fatal() {
        let config = ClusterConfig {
            gossip: GossipConfig {
                interval_ms: 0,
                ..GossipConfig::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroInterval("gossip.interval_ms"))
        ));
    }

    #[test]
    fn test_bad_shard_width_is_fatal() {
        let config = ClusterConfig {
            shard_width: 12,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ShardWidthOutOfRange(12))
        ));
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("example.com").unwrap(), "example.com:10101");
        assert_eq!(normalize_host("example.com:").unwrap(), "example.com:10101");
        assert_eq!(normalize_host("10.0.0.1:9000").unwrap(), "10.0.0.1:9000");
        assert_eq!(normalize_host("http://10.0.0.1:9000").unwrap(), "10.0.0.1:9000");
        assert_eq!(normalize_host("http://10.0.0.1:9000/").unwrap(), "10.0.0.1:9000");
    }

    #[test]
    fn test_normalize_host_rejects_garbage() {
        assert!(normalize_host("https://10.0.0.1:9000").is_err());
        assert!(normalize_host("10.0.0.1:notaport").is_err());
        assert!(normalize_host(":9000").is_err());
        assert!(normalize_host("").is_err());
        assert!(normalize_host("host/path:1").is_err());
    }

    #[test]
    fn test_node_hosts_includes_local() {
        let config = ClusterConfig {
            host: "a:1".to_string(),
            nodes: vec!["b:1".to_string(), "http://c:1".to_string()],
            ..Default::default()
        };
        assert_eq!(config.node_hosts().unwrap(), vec!["b:1", "c:1", "a:1"]);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ClusterConfig =
            serde_json::from_str(r#"{"replicas": 2, "gossip": {"port": 15000}}"#).unwrap();
        assert_eq!(config.replicas, 2);
        assert_eq!(config.gossip.port, 15000);
        assert_eq!(config.gossip.interval_ms, 500);
        assert_eq!(config.anti_entropy.interval_secs, 600);
    }

    #[test]
    fn test_host_part() {
        assert_eq!(host_part("10.0.0.1:9000"), "10.0.0.1");
        assert_eq!(host_part("localhost"), "localhost");
    }
}
