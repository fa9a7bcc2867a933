//! Host records gathered from the registry, peers and announcements.
//!
//! Records from different sources describe the same machine with different
//! subsets of fields. They are keyed by address first, then by normalised
//! domain, and merged so that the more detailed record wins while gaps are
//! filled from the other.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostOrigin {
    Registry,
    Announcement,
    Peer,
    Seed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStats {
    pub total: u32,
    pub available: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Host {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default)]
    pub status: HostStatus,
    #[serde(default)]
    pub enhanced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<InstanceStats>,
    #[serde(default)]
    pub features: Vec<String>,
    /// Registry reputation, 0..=255
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reputation: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// EVR per moment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub sources: Vec<HostOrigin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
    /// Filled in when the list is scored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
}

/// Identity of a host for deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HostKey {
    Address(String),
    Domain(String),
}

impl Host {
    pub fn from_origin(origin: HostOrigin) -> Self {
        Self {
            sources: vec![origin],
            ..Self::default()
        }
    }

    pub fn normalized_address(&self) -> Option<String> {
        self.address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
    }

    pub fn normalized_domain(&self) -> Option<String> {
        self.domain.as_deref().and_then(normalize_domain)
    }

    /// Address key if present, otherwise domain key
    pub fn key(&self) -> Option<HostKey> {
        self.normalized_address()
            .map(HostKey::Address)
            .or_else(|| self.normalized_domain().map(HostKey::Domain))
    }

    pub fn available_instances(&self) -> u32 {
        self.instances.map(|i| i.available).unwrap_or(0)
    }

    /// Number of populated descriptive fields
    pub fn detail_score(&self) -> usize {
        [
            self.address.is_some(),
            self.domain.is_some(),
            self.status != HostStatus::Unknown,
            self.enhanced,
            self.instances.is_some(),
            !self.features.is_empty(),
            self.reputation.is_some(),
            self.country_code.is_some(),
            self.location.is_some(),
            self.lease_amount.is_some(),
            self.version.is_some(),
            self.last_seen.is_some(),
        ]
        .iter()
        .filter(|&&b| b)
        .count()
    }
}

/// Lowercase, strip scheme, path, port and trailing dots
pub fn normalize_domain(raw: &str) -> Option<String> {
    let mut d = raw.trim().to_ascii_lowercase();
    for scheme in ["https://", "http://", "wss://", "ws://"] {
        if let Some(rest) = d.strip_prefix(scheme) {
            d = rest.to_string();
            break;
        }
    }
    let d = d.split('/').next().unwrap_or_default();
    let d = d.split(':').next().unwrap_or_default();
    let d = d.trim_end_matches('.');
    if d.is_empty() {
        None
    } else {
        Some(d.to_string())
    }
}

/// Merge two records of the same host
pub fn merge(a: Host, b: Host) -> Host {
    let (mut base, other) = if b.detail_score() > a.detail_score() {
        (b, a)
    } else {
        (a, b)
    };

    let other_newer = match (other.last_seen, base.last_seen) {
        (Some(o), Some(bs)) => o > bs,
        (Some(_), None) => true,
        _ => false,
    };
    if other.status != HostStatus::Unknown && (base.status == HostStatus::Unknown || other_newer)
    {
        base.status = other.status;
    }
    if other_newer && other.instances.is_some() {
        base.instances = other.instances;
    }

    base.address = base.address.or(other.address);
    base.domain = base.domain.or(other.domain);
    base.instances = base.instances.or(other.instances);
    base.reputation = base.reputation.or(other.reputation);
    base.country_code = base.country_code.or(other.country_code);
    base.location = base.location.or(other.location);
    base.lease_amount = base.lease_amount.or(other.lease_amount);
    base.version = base.version.or(other.version);
    base.enhanced |= other.enhanced;
    base.last_seen = base.last_seen.max(other.last_seen);

    let features: BTreeSet<String> = base.features.drain(..).chain(other.features).collect();
    base.features = features.into_iter().collect();
    let sources: BTreeSet<HostOrigin> = base.sources.drain(..).chain(other.sources).collect();
    base.sources = sources.into_iter().collect();

    base
}

/// Collapse records describing the same host, keeping first-seen order.
///
/// Records match on address, or on domain when either side lacks an address.
/// A record carrying both joins an address entry and a domain-only entry
/// into one, so the result does not depend on input order. Records with
/// neither are dropped.
pub fn dedup(hosts: impl IntoIterator<Item = Host>) -> Vec<Host> {
    let mut merged: Vec<Option<Host>> = Vec::new();
    let mut by_address: HashMap<String, usize> = HashMap::new();
    let mut by_domain: HashMap<String, usize> = HashMap::new();

    for host in hosts {
        let address = host.normalized_address();
        let domain = host.normalized_domain();
        if address.is_none() && domain.is_none() {
            continue;
        }

        let by_addr = address.as_ref().and_then(|a| by_address.get(a).copied());
        let by_dom = domain.as_ref().and_then(|d| by_domain.get(d).copied()).filter(|&i| {
            // Two different addresses behind one domain stay separate
            let existing = merged[i].as_ref().and_then(Host::normalized_address);
            match (&address, existing) {
                (Some(a), Some(existing)) => *a == existing,
                _ => true,
            }
        });

        let idx = match (by_addr, by_dom) {
            (Some(i), Some(j)) if i != j => {
                let (keep, gone) = (i.min(j), i.max(j));
                let absorbed = merged[gone].take();
                let existing = merged[keep].take();
                let host = existing.into_iter().chain(absorbed).fold(host, |acc, h| merge(h, acc));
                merged[keep] = Some(host);
                for slot in by_address.values_mut().chain(by_domain.values_mut()) {
                    if *slot == gone {
                        *slot = keep;
                    }
                }
                keep
            }
            (Some(i), _) | (None, Some(i)) => {
                let existing = merged[i].take();
                merged[i] = Some(match existing {
                    Some(existing) => merge(existing, host),
                    None => host,
                });
                i
            }
            (None, None) => {
                merged.push(Some(host));
                merged.len() - 1
            }
        };

        if let Some(entry) = &merged[idx] {
            if let Some(a) = entry.normalized_address() {
                by_address.insert(a, idx);
            }
            if let Some(d) = entry.normalized_domain() {
                by_domain.entry(d).or_insert(idx);
            }
        }
    }

    merged.into_iter().flatten().collect()
}

/// Quality in 0..=100
pub fn quality_score(host: &Host, now: i64) -> u8 {
    let mut score = 0.0;

    if host.status == HostStatus::Online {
        score += 30.0;
    }
    if host.enhanced {
        score += 20.0;
    }
    if let Some(rep) = host.reputation {
        score += f64::from(rep) / 255.0 * 25.0;
    }
    if let Some(i) = host.instances {
        if i.total > 0 {
            score += f64::from(i.available.min(i.total)) / f64::from(i.total) * 15.0;
        }
    }
    if let Some(seen) = host.last_seen {
        let age = now - seen;
        if age <= 3600 {
            score += 10.0;
        } else if age <= 86_400 {
            score += 5.0;
        }
    }

    score.round().clamp(0.0, 100.0) as u8
}

/// Score every host and sort best first, ties broken by key
pub fn rank(hosts: &mut [Host], now: i64) {
    for h in hosts.iter_mut() {
        h.quality = Some(quality_score(h, now));
    }
    hosts.sort_by(|a, b| {
        b.quality
            .cmp(&a.quality)
            .then_with(|| a.key().cmp(&b.key()))
    });
}

/// Query filter for host listings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostFilter {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub available_only: bool,
    #[serde(default)]
    pub enhanced_only: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl HostFilter {
    pub fn matches(&self, host: &Host) -> bool {
        if self.available_only && host.available_instances() == 0 {
            return false;
        }
        if self.enhanced_only && !host.enhanced {
            return false;
        }
        if let Some(loc) = self.location.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
            let loc = loc.to_ascii_lowercase();
            let country = host
                .country_code
                .as_deref()
                .map(|c| c.eq_ignore_ascii_case(&loc))
                .unwrap_or(false);
            let place = host
                .location
                .as_deref()
                .map(|l| l.to_ascii_lowercase().contains(&loc))
                .unwrap_or(false);
            if !country && !place {
                return false;
            }
        }
        true
    }

    pub fn apply<'a>(&self, hosts: impl IntoIterator<Item = &'a Host>) -> Vec<Host> {
        hosts
            .into_iter()
            .filter(|h| self.matches(h))
            .take(self.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}
