//! License sales and referral commissions.
//!
//! Sales are kept in process memory only and are lost on restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::ledger::{normalize_tx_hash, PaymentError, PaymentVerifier};
use crate::rates::{round2, Currency, RateService};

#[derive(Debug, thiserror::Error)]
pub enum SalesError {
    #[error("unknown sale: {0}")]
    UnknownSale(String),
    #[error("sale {id} is {status:?}, expected {expected:?}")]
    InvalidState {
        id: String,
        status: SaleStatus,
        expected: SaleStatus,
    },
    #[error("invalid transaction hash: {0}")]
    InvalidTxHash(String),
    #[error("transaction {0} already used for another sale")]
    DuplicateTx(String),
    #[error("no rate available for {0}")]
    NoRate(Currency),
    #[error("invalid buyer address")]
    InvalidBuyer,
    #[error(transparent)]
    Payment(#[from] PaymentError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaleStatus {
    Pending,
    Paid,
    Licensed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sale {
    pub id: String,
    pub buyer: String,
    pub referrer: Option<String>,
    pub currency: Currency,
    pub amount: f64,
    pub amount_usd: f64,
    pub commission_rate: f64,
    pub commission: f64,
    pub status: SaleStatus,
    pub tx_hash: Option<String>,
    pub license_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// Request body for `create_sale`
#[derive(Debug, Clone, Deserialize)]
pub struct NewSale {
    pub buyer: String,
    pub currency: Currency,
    #[serde(default)]
    pub referrer: Option<String>,
}

/// Commission totals for one referring host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferrerSummary {
    pub sales: u64,
    pub paid: u64,
    pub commission_usd: f64,
    pub commission_by_currency: BTreeMap<Currency, f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommissionReport {
    pub total_sales: u64,
    pub total_paid: u64,
    pub revenue_usd: f64,
    pub commission_usd: f64,
    pub referrers: BTreeMap<String, ReferrerSummary>,
}

pub struct SalesService {
    rates: Arc<RateService>,
    verifier: PaymentVerifier,
    commission_rate: f64,
    sales: RwLock<HashMap<String, Sale>>,
}

impl SalesService {
    pub fn new(rates: Arc<RateService>, verifier: PaymentVerifier, commission_rate: f64) -> Self {
        Self {
            rates,
            verifier,
            commission_rate: commission_rate.clamp(0.0, 1.0),
            sales: RwLock::new(HashMap::new()),
        }
    }

    /// Quote the license price in `currency` and open a pending sale
    pub async fn create(&self, req: NewSale) -> Result<Sale, SalesError> {
        let buyer = req.buyer.trim();
        if buyer.is_empty() {
            return Err(SalesError::InvalidBuyer);
        }

        let usd = self.rates.license_price_usd();
        let (amount, _) = self
            .rates
            .quote(req.currency, usd)
            .await
            .ok_or(SalesError::NoRate(req.currency))?;

        let referrer = req
            .referrer
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        let commission_rate = if referrer.is_some() {
            self.commission_rate
        } else {
            0.0
        };

        let sale = Sale {
            id: format!("sale_{}", uuid::Uuid::new_v4().simple()),
            buyer: buyer.to_string(),
            referrer,
            currency: req.currency,
            amount,
            amount_usd: usd,
            commission_rate,
            commission: round2(amount * commission_rate),
            status: SaleStatus::Pending,
            tx_hash: None,
            license_id: None,
            created_at: Utc::now(),
            paid_at: None,
        };

        info!(sale_id = %sale.id, currency = %sale.currency, amount = sale.amount, "sale created");
        self.sales.write().await.insert(sale.id.clone(), sale.clone());
        Ok(sale)
    }

    pub async fn get(&self, id: &str) -> Result<Sale, SalesError> {
        self.sales
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SalesError::UnknownSale(id.to_string()))
    }

    /// Verify the payment on-ledger and mark the sale paid.
    ///
    /// Hashes are compared in their canonical uppercase form, so one payment
    /// cannot be replayed under a different letter case.
    pub async fn confirm_payment(&self, id: &str, tx_hash: &str) -> Result<Sale, SalesError> {
        let canonical = normalize_tx_hash(tx_hash)
            .ok_or_else(|| SalesError::InvalidTxHash(tx_hash.trim().to_string()))?;
        let tx_hash = canonical.as_str();
        let sale = self.get(id).await?;
        if sale.status != SaleStatus::Pending {
            return Err(SalesError::InvalidState {
                id: id.to_string(),
                status: sale.status,
                expected: SaleStatus::Pending,
            });
        }
        self.ensure_unused(id, tx_hash).await?;

        let payment = self
            .verifier
            .verify_payment(tx_hash, sale.currency, sale.amount)
            .await
            .map_err(|e| {
                warn!(sale_id = %id, tx_hash = %tx_hash, error = %e, "payment rejected");
                e
            })?;

        // Re-check under the write lock; another request may have raced us
        let mut sales = self.sales.write().await;
        if let Some(used) = [tx_hash, payment.tx_hash.as_str()]
            .into_iter()
            .find(|h| is_used(&sales, id, h))
        {
            return Err(SalesError::DuplicateTx(used.to_string()));
        }
        let sale = sales
            .get_mut(id)
            .ok_or_else(|| SalesError::UnknownSale(id.to_string()))?;
        if sale.status != SaleStatus::Pending {
            return Err(SalesError::InvalidState {
                id: id.to_string(),
                status: sale.status,
                expected: SaleStatus::Pending,
            });
        }
        sale.status = SaleStatus::Paid;
        sale.tx_hash = Some(payment.tx_hash);
        sale.paid_at = Some(Utc::now());

        info!(sale_id = %id, from = %payment.from, "sale paid");
        Ok(sale.clone())
    }

    async fn ensure_unused(&self, id: &str, tx_hash: &str) -> Result<(), SalesError> {
        if is_used(&*self.sales.read().await, id, tx_hash) {
            return Err(SalesError::DuplicateTx(tx_hash.to_string()));
        }
        Ok(())
    }

    /// Record the license issued for a paid sale
    pub async fn mark_licensed(&self, id: &str, license_id: &str) -> Result<Sale, SalesError> {
        let mut sales = self.sales.write().await;
        let sale = sales
            .get_mut(id)
            .ok_or_else(|| SalesError::UnknownSale(id.to_string()))?;
        if sale.status != SaleStatus::Paid {
            return Err(SalesError::InvalidState {
                id: id.to_string(),
                status: sale.status,
                expected: SaleStatus::Paid,
            });
        }
        sale.status = SaleStatus::Licensed;
        sale.license_id = Some(license_id.to_string());
        Ok(sale.clone())
    }

    /// Commission totals per referrer; only paid or licensed sales earn commission
    pub async fn commissions(&self) -> CommissionReport {
        let sales = self.sales.read().await;
        let mut report = CommissionReport::default();

        for sale in sales.values() {
            report.total_sales += 1;
            let paid = sale.status != SaleStatus::Pending;
            if paid {
                report.total_paid += 1;
                report.revenue_usd += sale.amount_usd;
            }

            let Some(referrer) = &sale.referrer else {
                continue;
            };
            let entry = report.referrers.entry(referrer.clone()).or_default();
            entry.sales += 1;
            if paid {
                let commission_usd = sale.amount_usd * sale.commission_rate;
                entry.paid += 1;
                entry.commission_usd += commission_usd;
                *entry.commission_by_currency.entry(sale.currency).or_default() += sale.commission;
                report.commission_usd += commission_usd;
            }
        }

        report.revenue_usd = round2(report.revenue_usd);
        report.commission_usd = round2(report.commission_usd);
        for summary in report.referrers.values_mut() {
            summary.commission_usd = round2(summary.commission_usd);
        }
        report
    }
}

/// Whether a sale other than `id` was already paid by `tx_hash`
fn is_used(sales: &HashMap<String, Sale>, id: &str, tx_hash: &str) -> bool {
    sales
        .values()
        .any(|s| s.id != id && s.tx_hash.as_deref() == Some(tx_hash))
}
