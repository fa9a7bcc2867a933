//! Host discovery: gather, merge, score and cache the host list.

pub mod announce;
pub mod crawler;
pub mod sources;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::cache::JsonCache;
use crate::envelope::now_secs;
use crate::hosts::{self, Host, HostFilter};

pub use announce::{AnnounceError, AnnouncementStore};
pub use crawler::{HttpPeerClient, PeerClient, PeerCrawler, PeersResponse};
pub use sources::{HostSource, RegistrySource, SeedSource, SelfSource};

#[derive(Debug, Clone)]
struct Snapshot {
    hosts: Arc<Vec<Host>>,
    taken_at: i64,
}

/// Summary returned by a refresh
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub hosts: usize,
    pub enhanced: usize,
    pub failed_sources: Vec<String>,
    pub stale: bool,
}

pub struct DiscoveryService {
    sources: Vec<Box<dyn HostSource>>,
    crawler: Option<PeerCrawler>,
    announcements: AnnouncementStore,
    cache: JsonCache<Vec<Host>>,
    snapshot: RwLock<Option<Snapshot>>,
    refresh_lock: Mutex<()>,
}

impl DiscoveryService {
    pub fn new(
        sources: Vec<Box<dyn HostSource>>,
        crawler: Option<PeerCrawler>,
        announcements: AnnouncementStore,
        cache: JsonCache<Vec<Host>>,
    ) -> Self {
        Self {
            sources,
            crawler,
            announcements,
            cache,
            snapshot: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Rebuild the host list from every source and persist it.
    ///
    /// A failing source is skipped. If nothing at all is found, the previous
    /// cache (of any age) keeps being served.
    pub async fn refresh(&self) -> RefreshReport {
        let _guard = self.refresh_lock.lock().await;

        let mut gathered = Vec::new();
        let mut failed_sources = Vec::new();
        for source in &self.sources {
            match source.fetch().await {
                Ok(hosts) => {
                    info!(source = source.name(), hosts = hosts.len(), "source fetched");
                    gathered.extend(hosts);
                }
                Err(e) => {
                    warn!(source = source.name(), error = %e, "host source failed");
                    failed_sources.push(source.name().to_string());
                }
            }
        }
        gathered.extend(self.announcements.list().await);

        let mut merged = hosts::dedup(gathered);
        if let Some(crawler) = &self.crawler {
            let crawled = crawler.crawl(&merged).await;
            merged = hosts::dedup(merged.into_iter().chain(crawled));
        }

        let now = now_secs();
        if merged.is_empty() {
            if let Some(stale) = self.cache.load().await {
                warn!(age = stale.age_secs, "discovery found nothing, keeping cached hosts");
                let report = RefreshReport {
                    hosts: stale.data.len(),
                    enhanced: stale.data.iter().filter(|h| h.enhanced).count(),
                    failed_sources,
                    stale: true,
                };
                self.set_snapshot(stale.data, now).await;
                return report;
            }
        }

        hosts::rank(&mut merged, now);
        if let Err(e) = self.cache.store(&merged).await {
            warn!(error = %e, "failed to write discovered hosts cache");
        }

        let report = RefreshReport {
            hosts: merged.len(),
            enhanced: merged.iter().filter(|h| h.enhanced).count(),
            failed_sources,
            stale: false,
        };
        info!(hosts = report.hosts, enhanced = report.enhanced, "discovery refreshed");
        self.set_snapshot(merged, now).await;
        report
    }

    async fn set_snapshot(&self, hosts: Vec<Host>, taken_at: i64) {
        *self.snapshot.write().await = Some(Snapshot {
            hosts: Arc::new(hosts),
            taken_at,
        });
    }

    /// Current host list: memory, then the cache file, then a refresh
    pub async fn all(&self) -> Arc<Vec<Host>> {
        let ttl = i64::try_from(self.cache.ttl_secs()).unwrap_or(i64::MAX);
        if let Some(snap) = self.snapshot.read().await.as_ref() {
            if now_secs() - snap.taken_at < ttl {
                return Arc::clone(&snap.hosts);
            }
        }

        if let Some(cached) = self.cache.load().await.filter(|c| c.fresh) {
            let taken_at = now_secs() - cached.age_secs as i64;
            self.set_snapshot(cached.data, taken_at).await;
        } else {
            self.refresh().await;
        }

        self.snapshot
            .read()
            .await
            .as_ref()
            .map(|s| Arc::clone(&s.hosts))
            .unwrap_or_default()
    }

    pub async fn hosts(&self, filter: &HostFilter) -> Vec<Host> {
        filter.apply(self.all().await.iter())
    }

    /// Look up by address or domain
    pub async fn find(&self, address: Option<&str>, domain: Option<&str>) -> Option<Host> {
        let address = address.map(str::trim).filter(|a| !a.is_empty());
        let domain = domain.and_then(hosts::normalize_domain);
        self.all()
            .await
            .iter()
            .find(|h| {
                address.is_some_and(|a| h.normalized_address().as_deref() == Some(a))
                    || domain.is_some() && h.normalized_domain() == domain
            })
            .cloned()
    }

    /// Enhanced hosts, for `action=peers`
    pub async fn enhanced_peers(&self) -> Vec<Host> {
        self.all()
            .await
            .iter()
            .filter(|h| h.enhanced)
            .cloned()
            .collect()
    }

    /// Store an announcement and fold it into the live list
    pub async fn announce(&self, host: Host) -> Result<Host, AnnounceError> {
        let stored = self.announcements.announce(host).await?;

        let mut guard = self.snapshot.write().await;
        if let Some(snap) = guard.as_mut() {
            let now = now_secs();
            let mut merged =
                hosts::dedup(snap.hosts.iter().cloned().chain(std::iter::once(stored.clone())));
            hosts::rank(&mut merged, now);
            snap.hosts = Arc::new(merged);
        }
        Ok(stored)
    }
}
