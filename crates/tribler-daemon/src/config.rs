//! Configuration file management.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use tribler_crypto::x25519::X25519PublicKey;
use tribler_socks::SocksSettings;
use tribler_tunnel::settings::{ExtendPolicy, LengthPolicy, SelectionPolicy};
use tribler_tunnel::{Peer, TunnelSettings};
use tribler_wire::BypassTag;

use crate::cli::{self, Cli};

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub socks: SocksConfig,
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub advanced: AdvancedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// 0 = OS-assigned ephemeral port.
    #[serde(default)]
    pub listen_port: u16,
    /// Hex prefix of every overlay datagram.
    #[serde(default = "default_bypass_tag")]
    pub bypass_tag: String,
    #[serde(default)]
    pub bootstrap: Vec<BootstrapPeer>,
}

/// A peer known up front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapPeer {
    /// `host:port`.
    pub addr: String,
    /// Hex X25519 public key.
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_max_circuits")]
    pub max_circuits: usize,
    #[serde(default = "default_candidates_returned")]
    pub max_candidates_returned: usize,
    #[serde(default)]
    pub allow_zero_hop: bool,
    #[serde(default = "default_true")]
    pub become_exit: bool,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_walk_lifetime")]
    pub walk_lifetime_secs: u64,
    #[serde(default)]
    pub extend: ExtendPolicy,
    #[serde(default)]
    pub length: LengthPolicy,
    #[serde(default)]
    pub selection: SelectionPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocksConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_socks_port")]
    pub port: u16,
    #[serde(default = "default_circuits_per_session")]
    pub circuits_per_session: usize,
    /// How long an association may wait for its circuits.
    #[serde(default = "default_grace")]
    pub grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_crawl_interval")]
    pub interval_secs: u64,
    /// Encoded-size budget of STATS responses we send.
    #[serde(default = "default_stats_budget")]
    pub stats_budget: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedConfig {
    /// Data directory. Empty = platform default.
    #[serde(default)]
    pub data_dir: String,
    /// Log level: "trace" | "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_bypass_tag() -> String {
    hex::encode(tribler_wire::frame::DEFAULT_BYPASS_TAG)
}

fn default_true() -> bool {
    true
}

fn default_max_circuits() -> usize {
    8
}

fn default_candidates_returned() -> usize {
    tribler_wire::candidates::MAX_CANDIDATES
}

fn default_request_timeout() -> u64 {
    tribler_tunnel::REQUEST_TIMEOUT.as_secs()
}

fn default_keepalive() -> u64 {
    tribler_tunnel::KEEPALIVE_INTERVAL.as_secs()
}

fn default_walk_lifetime() -> u64 {
    tribler_tunnel::CANDIDATE_WALK_LIFETIME.as_secs()
}

fn default_socks_port() -> u16 {
    tribler_socks::DEFAULT_PORT
}

fn default_circuits_per_session() -> usize {
    tribler_socks::DEFAULT_CIRCUITS_PER_SESSION
}

fn default_grace() -> u64 {
    tribler_socks::DEFAULT_GRACE.as_secs()
}

fn default_crawl_interval() -> u64 {
    60
}

fn default_stats_budget() -> usize {
    tribler_wire::stats::DEFAULT_STATS_BUDGET
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            bypass_tag: default_bypass_tag(),
            bootstrap: Vec::new(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_circuits: default_max_circuits(),
            max_candidates_returned: default_candidates_returned(),
            allow_zero_hop: false,
            become_exit: true,
            request_timeout_secs: default_request_timeout(),
            keepalive_interval_secs: default_keepalive(),
            walk_lifetime_secs: default_walk_lifetime(),
            extend: ExtendPolicy::default(),
            length: LengthPolicy::default(),
            selection: SelectionPolicy::default(),
        }
    }
}

impl Default for SocksConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_socks_port(),
            circuits_per_session: default_circuits_per_session(),
            grace_secs: default_grace(),
        }
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_crawl_interval(),
            stats_budget: default_stats_budget(),
        }
    }
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
            log_level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from `path`, or from the default location.
    ///
    /// A missing default file falls back to defaults; a missing explicit
    /// file is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (config_path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::config_path(), false),
        };
        if config_path.exists() || explicit {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("reading {}", config_path.display()))?;
            let config: DaemonConfig = toml::from_str(&content)
                .with_context(|| format!("parsing {}", config_path.display()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply command-line overrides.
    pub fn apply(&mut self, cli: &Cli) -> anyhow::Result<()> {
        if let Some(port) = cli.socks5 {
            self.socks.port = port;
        }
        if let Some(extend) = cli.extend_strategy {
            self.tunnel.extend = extend.into();
        }
        if let Some(args) = &cli.length_strategy {
            self.tunnel.length = cli::parse_length(args)?;
        }
        if let Some(args) = &cli.select_strategy {
            self.tunnel.selection = cli::parse_selection(args)?;
        }
        if let Some(max) = cli.max_circuits {
            self.tunnel.max_circuits = max;
        }
        if cli.crawl {
            self.crawler.enabled = true;
        }
        if let Some(port) = cli.listen {
            self.network.listen_port = port;
        }
        Ok(())
    }

    pub fn tunnel_settings(&self) -> anyhow::Result<TunnelSettings> {
        let tag = hex::decode(&self.network.bypass_tag).context("bypass_tag is not hex")?;
        let t = &self.tunnel;
        Ok(TunnelSettings {
            max_circuits: t.max_circuits,
            length: t.length,
            extend: t.extend,
            selection: t.selection,
            walk_lifetime: Duration::from_secs(t.walk_lifetime_secs),
            request_timeout: Duration::from_secs(t.request_timeout_secs),
            keepalive_interval: Duration::from_secs(t.keepalive_interval_secs),
            max_candidates_returned: t.max_candidates_returned,
            allow_zero_hop: t.allow_zero_hop,
            become_exit: t.become_exit,
            stats_budget: self.crawler.stats_budget,
            bypass_tag: BypassTag::new(tag),
            crawl_interval: self
                .crawler
                .enabled
                .then(|| Duration::from_secs(self.crawler.interval_secs)),
            ..TunnelSettings::default()
        })
    }

    pub fn socks_settings(&self) -> SocksSettings {
        SocksSettings {
            port: self.socks.port,
            circuits_per_session: self.socks.circuits_per_session,
            grace: Duration::from_secs(self.socks.grace_secs),
        }
    }

    /// Resolve the bootstrap list into peers.
    pub fn bootstrap_peers(&self) -> anyhow::Result<Vec<Peer>> {
        self.network
            .bootstrap
            .iter()
            .map(|entry| {
                let address: SocketAddr = entry
                    .addr
                    .to_socket_addrs()
                    .with_context(|| format!("resolving {}", entry.addr))?
                    .next()
                    .ok_or_else(|| anyhow!("{} resolved to nothing", entry.addr))?;
                let key = X25519PublicKey::from_hex(&entry.public_key)
                    .with_context(|| format!("public key of {}", entry.addr))?;
                Ok(Peer::new(address, key))
            })
            .collect()
    }

    pub fn data_dir(&self) -> PathBuf {
        if self.advanced.data_dir.is_empty() {
            Self::default_data_dir()
        } else {
            PathBuf::from(&self.advanced.data_dir)
        }
    }

    fn config_path() -> PathBuf {
        Self::default_data_dir().join("config.toml")
    }

    fn default_data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("TRIBLER_DATA_DIR") {
            return PathBuf::from(dir);
        }
        #[cfg(target_os = "macos")]
        {
            dirs_fallback("Library/Application Support/TriblerTunnel")
        }
        #[cfg(target_os = "windows")]
        {
            dirs_fallback("TriblerTunnel")
        }
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            dirs_fallback(".tribler-tunnel")
        }
    }
}

fn dirs_fallback(subpath: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(subpath))
        .unwrap_or_else(|_| PathBuf::from("/tmp/tribler-tunnel"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::ExtendArg;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.network.listen_port, 0);
        assert_eq!(config.network.bypass_tag, "fffffffe");
        assert_eq!(config.socks.port, 1080);
        assert_eq!(config.socks.circuits_per_session, 4);
        assert!(!config.crawler.enabled);

        let settings = config.tunnel_settings().expect("settings");
        assert_eq!(settings.request_timeout, Duration::from_secs(5));
        assert_eq!(settings.max_candidates_returned, 4);
        assert_eq!(settings.bypass_tag.as_bytes(), &[0xFF, 0xFF, 0xFF, 0xFE]);
        assert!(settings.crawl_interval.is_none());
    }

    #[test]
    fn test_config_serialization() {
        let config = DaemonConfig::default();
        let toml_str = toml::to_string(&config).expect("serialize");
        let parsed: DaemonConfig = toml::from_str(&toml_str).expect("parse");
        assert_eq!(parsed.tunnel.length, config.tunnel.length);
    }

    #[test]
    fn test_partial_file() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [network]
            listen_port = 7759
            bootstrap = [{ addr = "127.0.0.1:7760", public_key = "0909090909090909090909090909090909090909090909090909090909090909" }]

            [tunnel]
            extend = "delegate"
            length = { kind = "random", min = 1, max = 2 }
            "#,
        )
        .expect("parse");
        assert_eq!(config.network.listen_port, 7759);
        assert_eq!(config.tunnel.extend, ExtendPolicy::Delegate);
        assert_eq!(config.tunnel.length, LengthPolicy::Random { min: 1, max: 2 });
        assert_eq!(config.tunnel.max_circuits, 8);
        let peers = config.bootstrap_peers().expect("peers");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].address, "127.0.0.1:7760".parse().expect("addr"));
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = DaemonConfig::default();
        let cli = Cli {
            socks5: Some(9050),
            extend_strategy: Some(ExtendArg::Random),
            length_strategy: Some(vec!["constant".into(), "1".into()]),
            max_circuits: Some(2),
            crawl: true,
            listen: Some(7000),
            ..Cli::default()
        };
        config.apply(&cli).expect("apply");
        assert_eq!(config.socks.port, 9050);
        assert_eq!(config.tunnel.extend, ExtendPolicy::Random);
        assert_eq!(config.tunnel.length, LengthPolicy::Constant { hops: 1 });
        assert_eq!(config.network.listen_port, 7000);

        let settings = config.tunnel_settings().expect("settings");
        assert_eq!(settings.max_circuits, 2);
        assert_eq!(settings.crawl_interval, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_bad_bypass_tag() {
        let mut config = DaemonConfig::default();
        config.network.bypass_tag = "zz".into();
        assert!(config.tunnel_settings().is_err());
    }
}
