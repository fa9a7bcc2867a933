use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::envelope::{now_secs, Envelope};
use crate::hosts::{Host, HostOrigin, HostStatus};
use crate::node::NodeInfo;

/// Body of `action=peers`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeersResponse {
    pub node: NodeInfo,
    pub peers: Vec<Host>,
}

/// Trait for querying an enhanced peer, mockable in tests
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn peers(
        &self,
        domain: &str,
    ) -> Result<PeersResponse, Box<dyn std::error::Error + Send + Sync>>;
}

pub struct HttpPeerClient {
    client: reqwest::Client,
    api_path: String,
    timeout: Duration,
}

impl HttpPeerClient {
    pub fn new(api_path: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_path: api_path.into(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn peers(
        &self,
        domain: &str,
    ) -> Result<PeersResponse, Box<dyn std::error::Error + Send + Sync>> {
        let url = format!("https://{}{}", domain, self.api_path);
        let envelope: Envelope<PeersResponse> = self
            .client
            .get(&url)
            .query(&[("action", "peers")])
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !envelope.success {
            return Err(envelope
                .error
                .unwrap_or_else(|| "peer returned failure".to_string())
                .into());
        }
        envelope.data.ok_or_else(|| "peer returned no data".into())
    }
}

/// Breadth-first walk over enhanced peers, bounded by `max_crawl` requests
pub struct PeerCrawler {
    client: Box<dyn PeerClient>,
    max_crawl: usize,
    self_domain: Option<String>,
}

impl PeerCrawler {
    pub fn new(client: Box<dyn PeerClient>, max_crawl: usize, self_domain: Option<String>) -> Self {
        Self {
            client,
            max_crawl,
            self_domain: self_domain.as_deref().and_then(crate::hosts::normalize_domain),
        }
    }

    fn crawlable(host: &Host) -> bool {
        host.enhanced
            || host.sources.contains(&HostOrigin::Seed)
            || host.sources.contains(&HostOrigin::Announcement)
    }

    /// Query known peers and collect what they report.
    ///
    /// Returns fresh records for queried peers (online + enhanced, or offline when
    /// unreachable) plus every host they advertised, tagged `peer`.
    pub async fn crawl(&self, known: &[Host]) -> Vec<Host> {
        let mut queue: VecDeque<String> = known
            .iter()
            .filter(|h| Self::crawlable(h))
            .filter_map(|h| h.normalized_domain())
            .collect();
        let mut visited: HashSet<String> = self.self_domain.iter().cloned().collect();
        let mut found = Vec::new();
        let mut requests = 0;

        while let Some(domain) = queue.pop_front() {
            if requests >= self.max_crawl {
                break;
            }
            if !visited.insert(domain.clone()) {
                continue;
            }
            requests += 1;

            match self.client.peers(&domain).await {
                Ok(resp) => {
                    let mut node = resp.node.host;
                    node.domain = Some(domain.clone());
                    node.enhanced = true;
                    node.status = HostStatus::Online;
                    node.last_seen = Some(now_secs());
                    node.quality = None;
                    node.sources = vec![HostOrigin::Peer];
                    found.push(node);

                    for mut peer in resp.peers {
                        peer.sources = vec![HostOrigin::Peer];
                        peer.quality = None;
                        if peer.enhanced {
                            if let Some(d) = peer.normalized_domain() {
                                queue.push_back(d);
                            }
                        }
                        found.push(peer);
                    }
                }
                Err(e) => {
                    debug!(domain = %domain, error = %e, "peer unreachable");
                    // Never seen by us, so no last_seen
                    found.push(Host {
                        domain: Some(domain.clone()),
                        status: HostStatus::Offline,
                        ..Host::from_origin(HostOrigin::Peer)
                    });
                }
            }
        }

        info!(queried = requests, records = found.len(), "peer crawl finished");
        found
    }
}
