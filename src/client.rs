//! Client for the `discover` subcommand: query a running instance for hosts.

use std::fmt::Write as _;
use std::time::Duration;

use serde::Deserialize;

use crate::envelope::Envelope;
use crate::hosts::{Host, HostFilter, HostStatus};

#[derive(Debug, Deserialize)]
pub struct HostsPage {
    pub count: usize,
    pub hosts: Vec<Host>,
}

pub struct DiscoveryClient {
    client: reqwest::Client,
    api_url: String,
    timeout: Duration,
}

impl DiscoveryClient {
    pub fn new(api_url: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub async fn hosts(
        &self,
        filter: &HostFilter,
    ) -> Result<HostsPage, Box<dyn std::error::Error + Send + Sync>> {
        let envelope: Envelope<HostsPage> = self
            .client
            .get(&self.api_url)
            .query(&query_params(filter))
            .timeout(self.timeout)
            .send()
            .await?
            .json()
            .await?;

        if !envelope.success {
            return Err(envelope
                .error
                .unwrap_or_else(|| "request failed".to_string())
                .into());
        }
        envelope.data.ok_or_else(|| "response carried no data".into())
    }
}

fn query_params(filter: &HostFilter) -> Vec<(&'static str, String)> {
    let mut params = vec![("action", "hosts".to_string())];
    if let Some(loc) = &filter.location {
        params.push(("location", loc.clone()));
    }
    if filter.available_only {
        params.push(("available_only", "1".to_string()));
    }
    if filter.enhanced_only {
        params.push(("enhanced_only", "1".to_string()));
    }
    if let Some(limit) = filter.limit {
        params.push(("limit", limit.to_string()));
    }
    params
}

fn cell(v: Option<&str>) -> &str {
    v.filter(|s| !s.is_empty()).unwrap_or("-")
}

/// Plain-text table of hosts, best first
pub fn render_table(hosts: &[Host]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<36} {:<32} {:<8} {:<4} {:>9} {:<16} {:>7}",
        "ADDRESS", "DOMAIN", "STATUS", "ENH", "AVAILABLE", "LOCATION", "QUALITY"
    );

    for h in hosts {
        let status = match h.status {
            HostStatus::Online => "online",
            HostStatus::Offline => "offline",
            HostStatus::Unknown => "unknown",
        };
        let available = h
            .instances
            .as_ref()
            .map(|i| format!("{}/{}", i.available, i.total))
            .unwrap_or_else(|| "-".to_string());
        let location = h.location.as_deref().or(h.country_code.as_deref());
        let quality = h
            .quality
            .map(|q| q.to_string())
            .unwrap_or_else(|| "-".to_string());

        let _ = writeln!(
            out,
            "{:<36} {:<32} {:<8} {:<4} {:>9} {:<16} {:>7}",
            cell(h.address.as_deref()),
            cell(h.domain.as_deref()),
            status,
            if h.enhanced { "yes" } else { "no" },
            available,
            cell(location),
            quality
        );
    }

    let _ = writeln!(out, "{} host(s)", hosts.len());
    out
}
