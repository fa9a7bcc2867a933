use tokio::sync::Mutex;
use tracing::info;

use crate::cache::{CacheError, JsonCache};
use crate::envelope::now_secs;
use crate::hosts::{Host, HostOrigin, HostStatus};

/// Announcements not renewed within a day are dropped
pub const ANNOUNCEMENT_MAX_AGE_SECS: i64 = 86_400;

#[derive(Debug, thiserror::Error)]
pub enum AnnounceError {
    #[error("announcement needs an address or a domain")]
    MissingIdentity,
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Self-announcements from enhanced peers, persisted between restarts
pub struct AnnouncementStore {
    file: JsonCache<Vec<Host>>,
    lock: Mutex<()>,
}

impl AnnouncementStore {
    pub fn new(file: JsonCache<Vec<Host>>) -> Self {
        Self {
            file,
            lock: Mutex::new(()),
        }
    }

    /// Live announcements, expired ones filtered out
    pub async fn list(&self) -> Vec<Host> {
        let cutoff = now_secs() - ANNOUNCEMENT_MAX_AGE_SECS;
        self.file
            .load()
            .await
            .map(|c| c.data)
            .unwrap_or_default()
            .into_iter()
            .filter(|h| h.last_seen.unwrap_or(0) >= cutoff)
            .collect()
    }

    /// Record an announcement, replacing any earlier one for the same host
    pub async fn announce(&self, mut host: Host) -> Result<Host, AnnounceError> {
        let key = host.key().ok_or(AnnounceError::MissingIdentity)?;

        host.enhanced = true;
        host.status = HostStatus::Online;
        host.last_seen = Some(now_secs());
        host.sources = vec![HostOrigin::Announcement];
        host.quality = None;

        let _guard = self.lock.lock().await;
        let mut all = self.list().await;
        all.retain(|h| h.key().as_ref() != Some(&key));
        all.push(host.clone());
        self.file.store(&all).await?;

        info!(key = ?key, total = all.len(), "host announced");
        Ok(host)
    }
}
