use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// This host's identity as advertised to peers
    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub rates: RatesConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub sales: SalesConfig,

    #[serde(default)]
    pub license: LicenseConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Local host commands
    #[serde(default)]
    pub host: HostConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub enable_cors: bool,
    /// Directory holding the JSON cache files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub max_instances: Option<u32>,
    #[serde(default)]
    pub lease_amount: Option<f64>,
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Evernode registry endpoint returning a JSON array of hosts
    #[serde(default)]
    pub registry_url: Option<String>,
    /// Domains or addresses always included
    #[serde(default)]
    pub seed_hosts: Vec<SeedHost>,
    /// Path on enhanced peers serving the action API
    #[serde(default = "default_peer_api_path")]
    pub peer_api_path: String,
    #[serde(default = "default_true")]
    pub crawl_peers: bool,
    #[serde(default = "default_max_crawl")]
    pub max_crawl: usize,
    #[serde(default = "default_hosts_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_announce_limit")]
    pub announce_rate_limit: u32,
    #[serde(default = "default_announce_window")]
    pub announce_window_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedHost {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatesConfig {
    #[serde(default = "default_coingecko_url")]
    pub coingecko_url: String,
    /// License price in USD used to derive `amount_for_license`
    #[serde(default = "default_license_price")]
    pub license_price_usd: f64,
    #[serde(default = "default_rates_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_rates_timeout")]
    pub timeout_secs: u64,
    /// USD prices used when neither the API nor a cache is available
    #[serde(default = "default_fallback_prices")]
    pub fallback: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_xahau_rpc")]
    pub xahau_rpc_url: String,
    #[serde(default = "default_xrpl_rpc")]
    pub xrpl_rpc_url: String,
    #[serde(default = "default_evr_issuer")]
    pub evr_issuer: String,
    /// Destination account for license payments
    #[serde(default)]
    pub payment_address: Option<String>,
    /// Accepted shortfall in percent between quoted and delivered amount
    #[serde(default = "default_payment_tolerance")]
    pub payment_tolerance_pct: f64,
    #[serde(default = "default_rpc_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SalesConfig {
    #[serde(default = "default_commission_rate")]
    pub commission_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseConfig {
    /// Program and arguments minting the license NFT; `{owner}` and `{uri}` are substituted
    #[serde(default)]
    pub mint_command: Vec<String>,
    #[serde(default = "default_uri_prefix")]
    pub uri_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_moment_secs")]
    pub moment_secs: u64,
    /// Program and arguments extending one lease; `{host}`, `{instance}`, `{moments}` are substituted
    #[serde(default)]
    pub extend_command: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub prometheus_url: Option<String>,
    /// Named PromQL expressions served by `action=metrics`
    #[serde(default = "default_queries")]
    pub queries: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Command printing the host's instances as a JSON array
    #[serde(default = "default_instance_list_command")]
    pub instance_list_command: Vec<String>,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_peer_api_path() -> String {
    "/api".to_string()
}

fn default_max_crawl() -> usize {
    50
}

fn default_hosts_ttl() -> u64 {
    300
}

fn default_request_timeout() -> u64 {
    10
}

fn default_announce_limit() -> u32 {
    10
}

fn default_announce_window() -> u64 {
    60
}

fn default_coingecko_url() -> String {
    "https://api.coingecko.com/api/v3".to_string()
}

fn default_license_price() -> f64 {
    49.99
}

fn default_rates_ttl() -> u64 {
    300
}

fn default_rates_timeout() -> u64 {
    5
}

fn default_fallback_prices() -> BTreeMap<String, f64> {
    [("EVR", 0.18), ("XAH", 0.06), ("XRP", 0.55)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn default_xahau_rpc() -> String {
    "https://xahau.network".to_string()
}

fn default_xrpl_rpc() -> String {
    "https://xrplcluster.com".to_string()
}

fn default_evr_issuer() -> String {
    "rEvernodee8dJLaFsujS6q1EiXvZYmHXr8".to_string()
}

fn default_payment_tolerance() -> f64 {
    0.5
}

fn default_rpc_timeout() -> u64 {
    15
}

fn default_commission_rate() -> f64 {
    0.20
}

fn default_uri_prefix() -> String {
    "evernode-enhanced:license:".to_string()
}

fn default_moment_secs() -> u64 {
    3600
}

fn default_queries() -> BTreeMap<String, String> {
    [
        ("cpu_usage_pct", "100 - (avg(rate(node_cpu_seconds_total{mode=\"idle\"}[5m])) * 100)"),
        ("memory_used_pct", "(1 - node_memory_MemAvailable_bytes / node_memory_MemTotal_bytes) * 100"),
        ("disk_used_pct", "(1 - node_filesystem_avail_bytes{mountpoint=\"/\"} / node_filesystem_size_bytes{mountpoint=\"/\"}) * 100"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_instance_list_command() -> Vec<String> {
    vec!["sashi".to_string(), "list".to_string()]
}

fn default_command_timeout() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: default_port(),
            enable_cors: true,
            data_dir: default_data_dir(),
            refresh_interval_secs: default_refresh_interval(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            registry_url: None,
            seed_hosts: Vec::new(),
            peer_api_path: default_peer_api_path(),
            crawl_peers: true,
            max_crawl: default_max_crawl(),
            cache_ttl_secs: default_hosts_ttl(),
            request_timeout_secs: default_request_timeout(),
            announce_rate_limit: default_announce_limit(),
            announce_window_secs: default_announce_window(),
        }
    }
}

impl Default for RatesConfig {
    fn default() -> Self {
        Self {
            coingecko_url: default_coingecko_url(),
            license_price_usd: default_license_price(),
            ttl_secs: default_rates_ttl(),
            timeout_secs: default_rates_timeout(),
            fallback: default_fallback_prices(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            xahau_rpc_url: default_xahau_rpc(),
            xrpl_rpc_url: default_xrpl_rpc(),
            evr_issuer: default_evr_issuer(),
            payment_address: None,
            payment_tolerance_pct: default_payment_tolerance(),
            timeout_secs: default_rpc_timeout(),
        }
    }
}

impl Default for SalesConfig {
    fn default() -> Self {
        Self {
            commission_rate: default_commission_rate(),
        }
    }
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            mint_command: Vec::new(),
            uri_prefix: default_uri_prefix(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            moment_secs: default_moment_secs(),
            extend_command: Vec::new(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            instance_list_command: default_instance_list_command(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(
            domain = ?config.identity.domain,
            data_dir = %config.server.data_dir.display(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Path of a cache file inside the data directory
    pub fn data_file(&self, name: &str) -> PathBuf {
        self.server.data_dir.join(name)
    }
}
