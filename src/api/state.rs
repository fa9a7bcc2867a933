//! Application state for the API server

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::cache::JsonCache;
use crate::command::{CommandRunner, ProcessRunner};
use crate::config::Config;
use crate::discovery::{
    AnnouncementStore, DiscoveryService, HostSource, HttpPeerClient, PeerClient, PeerCrawler,
    RegistrySource, SeedSource, SelfSource,
};
use crate::envelope::now_secs;
use crate::ledger::{HttpRpcClient, PaymentVerifier, RpcClient};
use crate::license::{CommandMinter, LicenseService, Minter};
use crate::metrics::Metrics;
use crate::monitoring::PrometheusClient;
use crate::node::NodeService;
use crate::rates::{CoinGeckoSource, PriceSource, RateService};
use crate::ratelimit::RateLimiter;
use crate::sales::SalesService;

/// Cache file names inside the data directory
pub const HOSTS_CACHE_FILE: &str = "discovered-hosts.json";
pub const ANNOUNCED_FILE: &str = "announced-hosts.json";
pub const RATES_CACHE_FILE: &str = "crypto_rates_cache.json";

/// External systems the services talk to; swapped for fakes in tests
pub struct Backends {
    pub prices: Box<dyn PriceSource>,
    pub rpc: Box<dyn RpcClient>,
    pub runner: Arc<dyn CommandRunner>,
    pub peers: Box<dyn PeerClient>,
    pub sources: Vec<Box<dyn HostSource>>,
}

impl Backends {
    /// Real HTTP, RPC and process backends from configuration
    pub fn live(config: &Config) -> Self {
        let d = &config.discovery;
        let mut sources: Vec<Box<dyn HostSource>> = Vec::new();
        if let Some(url) = &d.registry_url {
            sources.push(Box::new(RegistrySource::new(url.clone(), d.request_timeout_secs)));
        }
        if !d.seed_hosts.is_empty() {
            sources.push(Box::new(SeedSource::new(d.seed_hosts.clone())));
        }

        Self {
            prices: Box::new(CoinGeckoSource::new(
                config.rates.coingecko_url.clone(),
                config.rates.timeout_secs,
            )),
            rpc: Box::new(HttpRpcClient::new(config.ledger.timeout_secs)),
            runner: Arc::new(ProcessRunner::new(config.host.command_timeout_secs)),
            peers: Box::new(HttpPeerClient::new(
                d.peer_api_path.clone(),
                d.request_timeout_secs,
            )),
            sources,
        }
    }
}

/// API server state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub node: Arc<NodeService>,
    pub discovery: Arc<DiscoveryService>,
    pub rates: Arc<RateService>,
    pub sales: Arc<SalesService>,
    pub licenses: Arc<LicenseService>,
    pub runner: Arc<dyn CommandRunner>,
    pub prometheus: Option<Arc<PrometheusClient>>,
    pub announce_limiter: RateLimiter,
    pub metrics: Arc<Mutex<Metrics>>,
    /// API version
    pub version: String,
}

impl AppState {
    pub fn new(config: Config, backends: Backends) -> Self {
        let Backends {
            prices,
            rpc,
            runner,
            peers,
            mut sources,
        } = backends;

        let node = Arc::new(NodeService::new(
            config.identity.clone(),
            config.host.clone(),
            Arc::clone(&runner),
        ));
        sources.push(Box::new(SelfSource::new(Arc::clone(&node))));

        let crawler = config.discovery.crawl_peers.then(|| {
            PeerCrawler::new(
                peers,
                config.discovery.max_crawl,
                config.identity.domain.clone(),
            )
        });
        let discovery = Arc::new(DiscoveryService::new(
            sources,
            crawler,
            AnnouncementStore::new(JsonCache::new(config.data_file(ANNOUNCED_FILE), u64::MAX)),
            JsonCache::new(
                config.data_file(HOSTS_CACHE_FILE),
                config.discovery.cache_ttl_secs,
            ),
        ));

        let rates = Arc::new(RateService::new(
            &config.rates,
            prices,
            JsonCache::new(config.data_file(RATES_CACHE_FILE), config.rates.ttl_secs),
        ));

        let sales = Arc::new(SalesService::new(
            Arc::clone(&rates),
            PaymentVerifier::new(config.ledger.clone(), rpc),
            config.sales.commission_rate,
        ));

        let minter: Option<Box<dyn Minter>> = if config.license.mint_command.is_empty() {
            None
        } else {
            Some(Box::new(CommandMinter::new(
                Arc::clone(&runner),
                config.license.mint_command.clone(),
            )))
        };
        let licenses = Arc::new(LicenseService::new(
            Arc::clone(&sales),
            minter,
            config.license.uri_prefix.clone(),
        ));

        let prometheus = config
            .monitoring
            .prometheus_url
            .as_ref()
            .map(|url| Arc::new(PrometheusClient::new(url.clone(), config.discovery.request_timeout_secs)));

        let announce_limiter = RateLimiter::new(
            config.discovery.announce_rate_limit,
            Duration::from_secs(config.discovery.announce_window_secs),
        );

        Self {
            config: Arc::new(config),
            node,
            discovery,
            rates,
            sales,
            licenses,
            runner,
            prometheus,
            announce_limiter,
            metrics: Arc::new(Mutex::new(Metrics::new(now_secs()))),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
