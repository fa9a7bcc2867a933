use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::JsonCache;
use crate::config::RatesConfig;

/// Currencies accepted for license payments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Evr,
    Xah,
    Xrp,
}

impl Currency {
    pub const ALL: [Currency; 3] = [Currency::Evr, Currency::Xah, Currency::Xrp];

    pub fn symbol(&self) -> &'static str {
        match self {
            Currency::Evr => "EVR",
            Currency::Xah => "XAH",
            Currency::Xrp => "XRP",
        }
    }

    /// CoinGecko asset id
    pub fn gecko_id(&self) -> &'static str {
        match self {
            Currency::Evr => "evernode",
            Currency::Xah => "xahau",
            Currency::Xrp => "ripple",
        }
    }

    fn from_gecko_id(id: &str) -> Option<Self> {
        Currency::ALL.into_iter().find(|c| c.gecko_id() == id)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EVR" => Ok(Currency::Evr),
            "XAH" => Ok(Currency::Xah),
            "XRP" => Ok(Currency::Xrp),
            other => Err(format!("unsupported currency: {}", other)),
        }
    }
}

/// Where a rate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateSource {
    Coingecko,
    Cache,
    StaleCache,
    Fallback,
}

/// Price of one currency plus what a license costs in it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    /// USD per unit
    pub rate: f64,
    pub amount_for_license: f64,
    pub display: String,
    pub source: RateSource,
}

/// All rates plus the age of the data behind them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateSnapshot {
    pub rates: BTreeMap<Currency, Rate>,
    pub license_price_usd: f64,
    pub age_secs: u64,
}

/// Trait for price lookups, mockable in tests
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_usd(
        &self,
        currencies: &[Currency],
    ) -> Result<HashMap<Currency, f64>, Box<dyn std::error::Error + Send + Sync>>;
}

/// CoinGecko `simple/price` client (free, no key required)
pub struct CoinGeckoSource {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl CoinGeckoSource {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl PriceSource for CoinGeckoSource {
    async fn fetch_usd(
        &self,
        currencies: &[Currency],
    ) -> Result<HashMap<Currency, f64>, Box<dyn std::error::Error + Send + Sync>> {
        let ids: Vec<&str> = currencies.iter().map(|c| c.gecko_id()).collect();
        let url = format!(
            "{}/simple/price?ids={}&vs_currencies=usd",
            self.base_url.trim_end_matches('/'),
            ids.join(",")
        );

        let resp = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;

        let data: HashMap<String, HashMap<String, f64>> = resp.json().await?;

        let mut prices = HashMap::new();
        for (gecko_id, price_map) in &data {
            if let (Some(currency), Some(&usd)) =
                (Currency::from_gecko_id(gecko_id), price_map.get("usd"))
            {
                prices.insert(currency, usd);
            }
        }
        Ok(prices)
    }
}

/// Rates with a file cache, stale-cache fallback, then hardcoded defaults
pub struct RateService {
    source: Box<dyn PriceSource>,
    cache: JsonCache<BTreeMap<Currency, f64>>,
    license_price_usd: f64,
    fallback: BTreeMap<Currency, f64>,
}

impl RateService {
    pub fn new(
        config: &RatesConfig,
        source: Box<dyn PriceSource>,
        cache: JsonCache<BTreeMap<Currency, f64>>,
    ) -> Self {
        let fallback = config
            .fallback
            .iter()
            .filter_map(|(symbol, &price)| match symbol.parse::<Currency>() {
                Ok(c) if price > 0.0 => Some((c, price)),
                Ok(_) => None,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "ignoring fallback price");
                    None
                }
            })
            .collect();

        Self {
            source,
            cache,
            license_price_usd: config.license_price_usd,
            fallback,
        }
    }

    pub fn license_price_usd(&self) -> f64 {
        self.license_price_usd
    }

    /// Current rates for every supported currency
    pub async fn get_rates(&self, force_refresh: bool) -> RateSnapshot {
        let cached = self.cache.load().await;

        if !force_refresh {
            if let Some(c) = cached.as_ref().filter(|c| c.fresh) {
                debug!(age = c.age_secs, "serving rates from cache");
                return self.snapshot(&c.data, RateSource::Cache, c.age_secs);
            }
        }

        match self.source.fetch_usd(&Currency::ALL).await {
            Ok(prices) => {
                let prices: BTreeMap<Currency, f64> = prices
                    .into_iter()
                    .filter(|(_, p)| p.is_finite() && *p > 0.0)
                    .collect();

                if prices.is_empty() {
                    warn!("price source returned no usable prices");
                } else {
                    // Currencies missing from a partial fetch keep their cached price
                    let (mut merged, carried) = match &cached {
                        Some(c) if c.fresh => (c.data.clone(), RateSource::Cache),
                        Some(c) => (c.data.clone(), RateSource::StaleCache),
                        None => (BTreeMap::new(), RateSource::Cache),
                    };
                    merged.extend(prices.iter().map(|(&c, &p)| (c, p)));
                    if let Err(e) = self.cache.store(&merged).await {
                        warn!(error = %e, "failed to write rates cache");
                    }
                    info!(currencies = prices.len(), "rates refreshed");

                    let mut snapshot = self.snapshot(&merged, carried, 0);
                    for (&currency, &price) in &prices {
                        snapshot
                            .rates
                            .insert(currency, self.rate_for(currency, price, RateSource::Coingecko));
                    }
                    return snapshot;
                }
            }
            Err(e) => warn!(error = %e, "failed to fetch rates"),
        }

        match cached {
            Some(c) => self.snapshot(&c.data, RateSource::StaleCache, c.age_secs),
            None => self.snapshot(&BTreeMap::new(), RateSource::Fallback, 0),
        }
    }

    /// Convert a USD amount into `currency`
    pub async fn quote(&self, currency: Currency, usd: f64) -> Option<(f64, Rate)> {
        let snapshot = self.get_rates(false).await;
        let rate = snapshot.rates.get(&currency)?.clone();
        Some((round2(usd / rate.rate), rate))
    }

    fn snapshot(
        &self,
        prices: &BTreeMap<Currency, f64>,
        source: RateSource,
        age_secs: u64,
    ) -> RateSnapshot {
        let mut rates = BTreeMap::new();
        for currency in Currency::ALL {
            let (price, src) = match prices.get(&currency) {
                Some(&p) => (p, source),
                None => match self.fallback.get(&currency) {
                    Some(&p) => (p, RateSource::Fallback),
                    None => continue,
                },
            };
            rates.insert(currency, self.rate_for(currency, price, src));
        }

        RateSnapshot {
            rates,
            license_price_usd: self.license_price_usd,
            age_secs,
        }
    }

    fn rate_for(&self, currency: Currency, price: f64, source: RateSource) -> Rate {
        let amount = round2(self.license_price_usd / price);
        Rate {
            rate: price,
            amount_for_license: amount,
            display: format!("{:.2} {}", amount, currency),
            source,
        }
    }
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct MockPriceSource {
        prices: HashMap<Currency, f64>,
        should_fail: bool,
        calls: Arc<AtomicU32>,
    }

    impl MockPriceSource {
        fn new(prices: &[(Currency, f64)]) -> Self {
            Self {
                prices: prices.iter().copied().collect(),
                should_fail: false,
                calls: Arc::new(AtomicU32::new(0)),
            }
        }

        fn failing() -> Self {
            let mut s = Self::new(&[]);
            s.should_fail = true;
            s
        }
    }

    #[async_trait]
    impl PriceSource for MockPriceSource {
        async fn fetch_usd(
            &self,
            _currencies: &[Currency],
        ) -> Result<HashMap<Currency, f64>, Box<dyn std::error::Error + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.should_fail {
                return Err("coingecko unavailable".into());
            }
            Ok(self.prices.clone())
        }
    }

    fn config() -> RatesConfig {
        RatesConfig {
            license_price_usd: 50.0,
            ..RatesConfig::default()
        }
    }

    fn service(dir: &std::path::Path, source: MockPriceSource, ttl: u64) -> RateService {
        let cache = JsonCache::new(dir.join("crypto_rates_cache.json"), ttl);
        RateService::new(&config(), Box::new(source), cache)
    }

    #[test]
    fn test_currency_parse() {
        assert_eq!("evr".parse::<Currency>().unwrap(), Currency::Evr);
        assert_eq!(" XAH ".parse::<Currency>().unwrap(), Currency::Xah);
        assert!("BTC".parse::<Currency>().is_err());
        assert_eq!(Currency::from_gecko_id("ripple"), Some(Currency::Xrp));
    }

    #[tokio::test]
    async fn test_live_rates_computed_and_cached() {
        let dir = tempdir().unwrap();
        let svc = service(
            dir.path(),
            MockPriceSource::new(&[(Currency::Evr, 0.25), (Currency::Xah, 0.05), (Currency::Xrp, 0.5)]),
            300,
        );

        let snap = svc.get_rates(false).await;
        let evr = &snap.rates[&Currency::Evr];
        assert_eq!(evr.rate, 0.25);
        assert_eq!(evr.amount_for_license, 200.0);
        assert_eq!(evr.display, "200.00 EVR");
        assert_eq!(evr.source, RateSource::Coingecko);
        assert!(dir.path().join("crypto_rates_cache.json").exists());
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_fetch() {
        let dir = tempdir().unwrap();
        let source = MockPriceSource::new(&[(Currency::Evr, 0.25)]);
        let calls = Arc::clone(&source.calls);
        let svc = service(dir.path(), source, 300);

        svc.get_rates(false).await;
        let snap = svc.get_rates(false).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(snap.rates[&Currency::Evr].source, RateSource::Cache);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_cache() {
        let dir = tempdir().unwrap();
        let source = MockPriceSource::new(&[(Currency::Evr, 0.25)]);
        let calls = Arc::clone(&source.calls);
        let svc = service(dir.path(), source, 300);

        svc.get_rates(false).await;
        svc.get_rates(true).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_uses_stale_cache() {
        let dir = tempdir().unwrap();
        let cache: JsonCache<BTreeMap<Currency, f64>> =
            JsonCache::new(dir.path().join("crypto_rates_cache.json"), 0);
        cache
            .store(&[(Currency::Evr, 0.5)].into_iter().collect())
            .await
            .unwrap();

        let svc = service(dir.path(), MockPriceSource::failing(), 0);
        let snap = svc.get_rates(false).await;

        assert_eq!(snap.rates[&Currency::Evr].source, RateSource::StaleCache);
        assert_eq!(snap.rates[&Currency::Evr].amount_for_license, 100.0);
        // XAH was not cached, so it comes from the hardcoded table
        assert_eq!(snap.rates[&Currency::Xah].source, RateSource::Fallback);
    }

    #[tokio::test]
    async fn test_failure_without_cache_uses_fallback() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path(), MockPriceSource::failing(), 300);

        let snap = svc.get_rates(false).await;
        assert_eq!(snap.rates.len(), 3);
        assert!(snap.rates.values().all(|r| r.source == RateSource::Fallback));
        assert_eq!(snap.rates[&Currency::Xrp].rate, 0.55);
    }

    #[tokio::test]
    async fn test_invalid_prices_are_ignored() {
        let dir = tempdir().unwrap();
        let svc = service(
            dir.path(),
            MockPriceSource::new(&[(Currency::Evr, 0.0), (Currency::Xrp, 0.5)]),
            300,
        );

        let snap = svc.get_rates(false).await;
        assert_eq!(snap.rates[&Currency::Evr].source, RateSource::Fallback);
        assert_eq!(snap.rates[&Currency::Xrp].source, RateSource::Coingecko);
    }

    #[tokio::test]
    async fn test_partial_fetch_keeps_cached_prices() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crypto_rates_cache.json");
        let cache: JsonCache<BTreeMap<Currency, f64>> = JsonCache::new(path.clone(), 0);
        cache
            .store(
                &[(Currency::Evr, 0.3), (Currency::Xah, 0.07), (Currency::Xrp, 0.6)]
                    .into_iter()
                    .collect(),
            )
            .await
            .unwrap();

        let svc = service(dir.path(), MockPriceSource::new(&[(Currency::Evr, 0.25)]), 0);
        let snap = svc.get_rates(false).await;
        assert_eq!(snap.rates[&Currency::Evr].rate, 0.25);
        assert_eq!(snap.rates[&Currency::Evr].source, RateSource::Coingecko);
        assert_eq!(snap.rates[&Currency::Xah].rate, 0.07);
        assert_eq!(snap.rates[&Currency::Xah].source, RateSource::StaleCache);

        let stored = JsonCache::<BTreeMap<Currency, f64>>::new(path, 300)
            .load()
            .await
            .unwrap()
            .data;
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[&Currency::Evr], 0.25);
        assert_eq!(stored[&Currency::Xah], 0.07);
        assert_eq!(stored[&Currency::Xrp], 0.6);
    }

    #[tokio::test]
    async fn test_quote() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path(), MockPriceSource::new(&[(Currency::Xah, 0.04)]), 300);

        let (amount, rate) = svc.quote(Currency::Xah, 10.0).await.unwrap();
        assert_eq!(amount, 250.0);
        assert_eq!(rate.rate, 0.04);
    }

    #[test]
    fn test_rate_serialization() {
        let rate = Rate {
            rate: 0.2,
            amount_for_license: 250.0,
            display: "250.00 EVR".to_string(),
            source: RateSource::StaleCache,
        };
        let json = serde_json::to_value(&rate).unwrap();
        assert_eq!(json["source"], "stale-cache");
        assert_eq!(json["amount_for_license"], 250.0);
    }
}
