use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::command::{run_template, CommandError, CommandRunner};
use crate::sales::{SaleStatus, SalesError, SalesService};

#[derive(Debug, thiserror::Error)]
pub enum LicenseError {
    #[error("license minting is not configured")]
    MintingDisabled,
    #[error(transparent)]
    Sale(#[from] SalesError),
    #[error("mint failed: {0}")]
    Mint(#[from] CommandError),
    #[error("minter returned an invalid token id: {0}")]
    BadTokenId(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct License {
    pub license_id: String,
    pub sale_id: String,
    pub owner: String,
    pub nft_token_id: String,
    /// Plain URI; the hex form is what went on-ledger
    pub uri: String,
    pub issued_at: DateTime<Utc>,
}

/// Trait for NFT minting, mockable in tests
#[async_trait]
pub trait Minter: Send + Sync {
    /// Mint an NFT for `owner` carrying the hex-encoded `uri_hex`; returns the NFTokenID
    async fn mint(&self, owner: &str, uri_hex: &str) -> Result<String, LicenseError>;
}

/// Mints by running the configured command and reading the NFTokenID from stdout
pub struct CommandMinter {
    runner: Arc<dyn CommandRunner>,
    template: Vec<String>,
}

impl CommandMinter {
    pub fn new(runner: Arc<dyn CommandRunner>, template: Vec<String>) -> Self {
        Self { runner, template }
    }
}

#[async_trait]
impl Minter for CommandMinter {
    async fn mint(&self, owner: &str, uri_hex: &str) -> Result<String, LicenseError> {
        let vars: HashMap<&str, String> = [
            ("owner", owner.to_string()),
            ("uri", uri_hex.to_string()),
        ]
        .into_iter()
        .collect();

        let output = run_template(self.runner.as_ref(), "license mint", &self.template, &vars).await?;
        let token = output
            .stdout
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .unwrap_or_default()
            .to_ascii_uppercase();

        if token.len() != 64 || !token.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(LicenseError::BadTokenId(token));
        }
        Ok(token)
    }
}

/// Issues one NFT license per paid sale
pub struct LicenseService {
    sales: Arc<SalesService>,
    minter: Option<Box<dyn Minter>>,
    uri_prefix: String,
    licenses: RwLock<HashMap<String, License>>,
    issue_lock: Mutex<()>,
}

impl LicenseService {
    pub fn new(sales: Arc<SalesService>, minter: Option<Box<dyn Minter>>, uri_prefix: String) -> Self {
        Self {
            sales,
            minter,
            uri_prefix,
            licenses: RwLock::new(HashMap::new()),
            issue_lock: Mutex::new(()),
        }
    }

    /// Issue the license for `sale_id`; re-issuing returns the existing license
    pub async fn issue(&self, sale_id: &str) -> Result<License, LicenseError> {
        // One mint at a time so a retried request cannot mint twice
        let _guard = self.issue_lock.lock().await;

        let sale = self.sales.get(sale_id).await?;
        if sale.status == SaleStatus::Licensed {
            if let Some(existing) = self.find_by_sale(sale_id).await {
                return Ok(existing);
            }
        }

        let minter = self.minter.as_ref().ok_or(LicenseError::MintingDisabled)?;
        if sale.status != SaleStatus::Paid {
            return Err(SalesError::InvalidState {
                id: sale_id.to_string(),
                status: sale.status,
                expected: SaleStatus::Paid,
            }
            .into());
        }

        let license_id = uuid::Uuid::new_v4().to_string();
        let uri = format!("{}{}", self.uri_prefix, license_id);
        let token_id = minter.mint(&sale.buyer, &hex::encode_upper(uri.as_bytes())).await?;

        let license = License {
            license_id: license_id.clone(),
            sale_id: sale_id.to_string(),
            owner: sale.buyer.clone(),
            nft_token_id: token_id,
            uri,
            issued_at: Utc::now(),
        };

        self.sales.mark_licensed(sale_id, &license_id).await?;
        self.licenses
            .write()
            .await
            .insert(license_id.clone(), license.clone());

        info!(sale_id = %sale_id, license_id = %license_id, token = %license.nft_token_id, "license issued");
        Ok(license)
    }

    pub async fn get(&self, license_id: &str) -> Option<License> {
        self.licenses.read().await.get(license_id).cloned()
    }

    async fn find_by_sale(&self, sale_id: &str) -> Option<License> {
        self.licenses
            .read()
            .await
            .values()
            .find(|l| l.sale_id == sale_id)
            .cloned()
    }
}
