//! XRPL / Xahau JSON-RPC access and payment verification.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::LedgerConfig;
use crate::rates::Currency;

const DROPS_PER_UNIT: f64 = 1_000_000.0;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc transport error: {0}")]
    Transport(String),
    #[error("rpc error {code}: {message}")]
    Remote { code: String, message: String },
    #[error("rpc response missing result")]
    MissingResult,
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("no payment address configured")]
    NoPaymentAddress,
    #[error("transaction not found: {0}")]
    NotFound(String),
    #[error("transaction is not validated yet")]
    NotValidated,
    #[error("transaction is not a payment: {0}")]
    NotPayment(String),
    #[error("transaction failed: {0}")]
    Failed(String),
    #[error("payment sent to {0}, not the license account")]
    WrongDestination(String),
    #[error("payment currency mismatch: expected {expected}, got {got}")]
    WrongCurrency { expected: String, got: String },
    #[error("payment too small: expected {expected}, delivered {delivered}")]
    Underpaid { expected: f64, delivered: f64 },
    #[error("malformed transaction: {0}")]
    Malformed(String),
}

/// JSON-RPC request in rippled's format
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerRpcRequest {
    method: String,
    params: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct LedgerRpcResponse {
    result: Option<Value>,
}

/// Trait for ledger RPC calls, mockable in tests
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn call(&self, url: &str, method: &str, params: Value) -> Result<Value, RpcError>;
}

/// Default HTTP-based RPC client using reqwest
pub struct HttpRpcClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpRpcClient {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn call(&self, url: &str, method: &str, params: Value) -> Result<Value, RpcError> {
        let request = LedgerRpcRequest {
            method: method.to_string(),
            params: vec![params],
        };

        let resp = self
            .client
            .post(url)
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let rpc_resp: LedgerRpcResponse = resp
            .json()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let result = rpc_resp.result.ok_or(RpcError::MissingResult)?;
        check_status(result)
    }
}

/// rippled reports failures inside `result` with `status: "error"`
fn check_status(result: Value) -> Result<Value, RpcError> {
    if result.get("status").and_then(Value::as_str) == Some("error") {
        let code = result
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let message = result
            .get("error_message")
            .and_then(Value::as_str)
            .unwrap_or(&code)
            .to_string();
        return Err(RpcError::Remote { code, message });
    }
    Ok(result)
}

/// Payment confirmed on-ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedPayment {
    pub tx_hash: String,
    pub from: String,
    pub currency: Currency,
    pub amount: f64,
}

/// Canonical form of a transaction hash: 64 hex digits, uppercase
pub fn normalize_tx_hash(hash: &str) -> Option<String> {
    let hash = hash.trim();
    if hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(hash.to_ascii_uppercase())
    } else {
        None
    }
}

/// Amount field of a transaction, parsed
#[derive(Debug, Clone, PartialEq)]
enum LedgerAmount {
    Native(f64),
    Issued {
        currency: String,
        issuer: String,
        value: f64,
    },
}

fn parse_amount(v: &Value) -> Result<LedgerAmount, PaymentError> {
    match v {
        Value::String(drops) => drops
            .parse::<f64>()
            .map(|d| LedgerAmount::Native(d / DROPS_PER_UNIT))
            .map_err(|_| PaymentError::Malformed(format!("bad drops amount: {}", drops))),
        Value::Object(obj) => {
            let field = |name: &str| {
                obj.get(name)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| PaymentError::Malformed(format!("amount missing {}", name)))
            };
            let value = field("value")?
                .parse::<f64>()
                .map_err(|_| PaymentError::Malformed("bad issued amount".to_string()))?;
            Ok(LedgerAmount::Issued {
                currency: field("currency")?,
                issuer: field("issuer")?,
                value,
            })
        }
        _ => Err(PaymentError::Malformed("unsupported amount".to_string())),
    }
}

/// Verifies license payments against the XRPL and Xahau ledgers
pub struct PaymentVerifier {
    config: LedgerConfig,
    rpc: Box<dyn RpcClient>,
}

impl PaymentVerifier {
    pub fn new(config: LedgerConfig, rpc: Box<dyn RpcClient>) -> Self {
        Self { config, rpc }
    }

    /// EVR and XAH live on Xahau, XRP on the XRPL
    fn rpc_url(&self, currency: Currency) -> &str {
        match currency {
            Currency::Xrp => &self.config.xrpl_rpc_url,
            Currency::Evr | Currency::Xah => &self.config.xahau_rpc_url,
        }
    }

    /// Confirm `tx_hash` paid at least `expected` of `currency` to the license account
    pub async fn verify_payment(
        &self,
        tx_hash: &str,
        currency: Currency,
        expected: f64,
    ) -> Result<VerifiedPayment, PaymentError> {
        let destination = self
            .config
            .payment_address
            .as_deref()
            .ok_or(PaymentError::NoPaymentAddress)?;

        let params = serde_json::json!({"transaction": tx_hash, "binary": false});
        let tx = match self.rpc.call(self.rpc_url(currency), "tx", params).await {
            Ok(tx) => tx,
            Err(RpcError::Remote { code, .. }) if code == "txnNotFound" => {
                return Err(PaymentError::NotFound(tx_hash.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        debug!(tx_hash = %tx_hash, "transaction fetched");

        let tx_type = tx
            .get("TransactionType")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if tx_type != "Payment" {
            return Err(PaymentError::NotPayment(tx_type.to_string()));
        }
        if tx.get("validated").and_then(Value::as_bool) != Some(true) {
            return Err(PaymentError::NotValidated);
        }

        let meta = tx
            .get("meta")
            .ok_or_else(|| PaymentError::Malformed("missing meta".to_string()))?;
        let result = meta
            .get("TransactionResult")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if result != "tesSUCCESS" {
            return Err(PaymentError::Failed(result.to_string()));
        }

        let dest = tx
            .get("Destination")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if dest != destination {
            return Err(PaymentError::WrongDestination(dest.to_string()));
        }

        let amount_field = meta
            .get("delivered_amount")
            .or_else(|| tx.get("Amount"))
            .ok_or_else(|| PaymentError::Malformed("missing amount".to_string()))?;

        let delivered = match (currency, parse_amount(amount_field)?) {
            (Currency::Xah | Currency::Xrp, LedgerAmount::Native(v)) => v,
            (Currency::Evr, LedgerAmount::Issued { currency: c, issuer, value })
                if c == "EVR" && issuer == self.config.evr_issuer =>
            {
                value
            }
            (_, other) => {
                let got = match other {
                    LedgerAmount::Native(_) => "native".to_string(),
                    LedgerAmount::Issued { currency, issuer, .. } => {
                        format!("{}.{}", currency, issuer)
                    }
                };
                return Err(PaymentError::WrongCurrency {
                    expected: currency.to_string(),
                    got,
                });
            }
        };

        let minimum = expected * (1.0 - self.config.payment_tolerance_pct / 100.0);
        if delivered < minimum {
            return Err(PaymentError::Underpaid {
                expected,
                delivered,
            });
        }

        let from = tx
            .get("Account")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        // Prefer the ledger's own spelling of the hash
        let tx_hash = tx
            .get("hash")
            .and_then(Value::as_str)
            .and_then(normalize_tx_hash)
            .unwrap_or_else(|| tx_hash.to_ascii_uppercase());

        info!(tx_hash = %tx_hash, from = %from, amount = delivered, currency = %currency, "payment verified");
        Ok(VerifiedPayment {
            tx_hash,
            from,
            currency,
            amount: delivered,
        })
    }
}
