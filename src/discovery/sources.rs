use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::SeedHost;
use crate::hosts::{Host, HostOrigin, HostStatus, InstanceStats};
use crate::node::NodeService;

pub type SourceResult = Result<Vec<Host>, Box<dyn std::error::Error + Send + Sync>>;

/// A place host records come from
#[async_trait]
pub trait HostSource: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self) -> SourceResult;
}

/// One entry of the Evernode registry listing
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryHost {
    pub address: Option<String>,
    pub domain: Option<String>,
    pub country_code: Option<String>,
    pub description: Option<String>,
    pub max_instances: Option<u32>,
    pub active_instances: Option<u32>,
    /// Lease amount as a decimal string or number
    pub lease_amount: Option<serde_json::Value>,
    pub host_reputation: Option<u32>,
    pub active: Option<bool>,
    pub version: Option<String>,
    /// Unix seconds of the last heartbeat
    pub last_heartbeat_time: Option<i64>,
}

impl RegistryHost {
    pub fn into_host(self) -> Host {
        let instances = self.max_instances.map(|total| InstanceStats {
            total,
            available: total.saturating_sub(self.active_instances.unwrap_or(0)),
        });
        let lease_amount = match &self.lease_amount {
            Some(serde_json::Value::String(s)) => s.parse::<f64>().ok(),
            Some(serde_json::Value::Number(n)) => n.as_f64(),
            _ => None,
        };
        let status = match self.active {
            Some(true) => HostStatus::Online,
            Some(false) => HostStatus::Offline,
            None => HostStatus::Unknown,
        };

        Host {
            address: self.address,
            domain: self.domain,
            status,
            instances,
            reputation: self.host_reputation.map(|r| r.min(255) as u8),
            country_code: self.country_code.map(|c| c.to_ascii_uppercase()),
            location: self.description.filter(|d| !d.trim().is_empty()),
            lease_amount,
            version: self.version,
            last_seen: self.last_heartbeat_time,
            ..Host::from_origin(HostOrigin::Registry)
        }
    }
}

/// Registry responses come either as a bare array or wrapped in `{data: [...]}`/`{hosts: [...]}`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RegistryListing {
    Bare(Vec<RegistryHost>),
    Data { data: Vec<RegistryHost> },
    Hosts { hosts: Vec<RegistryHost> },
}

impl RegistryListing {
    fn into_hosts(self) -> Vec<RegistryHost> {
        match self {
            RegistryListing::Bare(h) | RegistryListing::Data { data: h } | RegistryListing::Hosts { hosts: h } => h,
        }
    }
}

pub fn parse_registry(body: &str) -> SourceResult {
    let listing: RegistryListing = serde_json::from_str(body)?;
    Ok(listing
        .into_hosts()
        .into_iter()
        .map(RegistryHost::into_host)
        .collect())
}

/// Evernode registry HTTP listing
pub struct RegistrySource {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl RegistrySource {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl HostSource for RegistrySource {
    fn name(&self) -> &str {
        "registry"
    }

    async fn fetch(&self) -> SourceResult {
        let body = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_registry(&body)
    }
}

/// Hosts pinned in the configuration
pub struct SeedSource {
    seeds: Vec<SeedHost>,
}

impl SeedSource {
    pub fn new(seeds: Vec<SeedHost>) -> Self {
        Self { seeds }
    }
}

#[async_trait]
impl HostSource for SeedSource {
    fn name(&self) -> &str {
        "seed"
    }

    async fn fetch(&self) -> SourceResult {
        Ok(self
            .seeds
            .iter()
            .map(|s| Host {
                address: s.address.clone(),
                domain: s.domain.clone(),
                ..Host::from_origin(HostOrigin::Seed)
            })
            .collect())
    }
}

/// This host itself
pub struct SelfSource {
    node: Arc<NodeService>,
}

impl SelfSource {
    pub fn new(node: Arc<NodeService>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl HostSource for SelfSource {
    fn name(&self) -> &str {
        "self"
    }

    async fn fetch(&self) -> SourceResult {
        let info = self.node.info().await;
        if info.host.key().is_none() {
            return Ok(Vec::new());
        }
        Ok(vec![info.host])
    }
}
