//! Lease-extension helpers for clusters of leased instances.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::command::{run_template, CommandRunner};
use crate::rates::round2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInstance {
    /// Instance name (public key) on the host
    pub name: String,
    /// Host address
    pub host: String,
    /// EVR per moment
    pub lease_amount: f64,
    /// Lease expiry, Unix seconds
    pub expires_at: i64,
}

/// How far to extend
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionTarget {
    /// Each instance gains N hours from its own expiry
    ExtendHours(u64),
    /// Every instance runs until the latest expiry plus N hours
    AlignHours(u64),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanRequest {
    pub instances: Vec<ClusterInstance>,
    pub target: ExtensionTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceExtension {
    pub name: String,
    pub host: String,
    pub moments: u64,
    pub cost_evr: f64,
    pub current_expiry: i64,
    pub new_expiry: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionPlan {
    pub target_expiry: Option<i64>,
    pub moment_secs: u64,
    pub instances: Vec<InstanceExtension>,
    pub total_moments: u64,
    pub total_evr: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_usd: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionOutcome {
    pub name: String,
    pub host: String,
    pub moments: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("cluster has no instances")]
    Empty,
    #[error("moment length must be positive")]
    ZeroMoment,
    #[error("instance {0} has a negative lease amount")]
    NegativeLease(String),
    #[error("extension for {0} is out of range")]
    TooLarge(String),
}

fn hours_to_secs(hours: u64) -> Option<i64> {
    hours.checked_mul(3600).and_then(|s| i64::try_from(s).ok())
}

/// Compute the moments and EVR needed to reach `target`.
///
/// Instances already past the target need 0 moments.
pub fn plan(
    instances: &[ClusterInstance],
    target: ExtensionTarget,
    moment_secs: u64,
) -> Result<ExtensionPlan, ClusterError> {
    if instances.is_empty() {
        return Err(ClusterError::Empty);
    }
    if moment_secs == 0 {
        return Err(ClusterError::ZeroMoment);
    }
    if let Some(bad) = instances.iter().find(|i| i.lease_amount < 0.0) {
        return Err(ClusterError::NegativeLease(bad.name.clone()));
    }

    let aligned_to = match target {
        ExtensionTarget::AlignHours(h) => {
            let latest = instances.iter().map(|i| i.expires_at).max().unwrap_or_default();
            let aligned = hours_to_secs(h)
                .and_then(|secs| latest.checked_add(secs))
                .ok_or_else(|| ClusterError::TooLarge("cluster".to_string()))?;
            Some(aligned)
        }
        ExtensionTarget::ExtendHours(_) => None,
    };

    let mut extensions = Vec::with_capacity(instances.len());
    for inst in instances {
        let too_large = || ClusterError::TooLarge(inst.name.clone());
        let wanted = match (target, aligned_to) {
            (_, Some(t)) => t,
            (ExtensionTarget::ExtendHours(h), None) => hours_to_secs(h)
                .and_then(|secs| inst.expires_at.checked_add(secs))
                .ok_or_else(too_large)?,
            (ExtensionTarget::AlignHours(_), None) => inst.expires_at,
        };
        let needed = wanted.checked_sub(inst.expires_at).ok_or_else(too_large)?.max(0) as u64;
        let moments = needed.div_ceil(moment_secs);
        let new_expiry = moments
            .checked_mul(moment_secs)
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| inst.expires_at.checked_add(secs))
            .ok_or_else(too_large)?;

        extensions.push(InstanceExtension {
            name: inst.name.clone(),
            host: inst.host.clone(),
            moments,
            cost_evr: round2(moments as f64 * inst.lease_amount),
            current_expiry: inst.expires_at,
            new_expiry,
        });
    }

    let total_moments = extensions
        .iter()
        .try_fold(0u64, |acc, e| acc.checked_add(e.moments))
        .ok_or_else(|| ClusterError::TooLarge("cluster".to_string()))?;
    let total_evr = round2(extensions.iter().map(|e| e.cost_evr).sum());

    Ok(ExtensionPlan {
        target_expiry: aligned_to,
        moment_secs,
        instances: extensions,
        total_moments,
        total_evr,
        total_usd: None,
    })
}

impl ExtensionPlan {
    /// Attach a USD total given the EVR rate
    pub fn with_usd(mut self, evr_usd: Option<f64>) -> Self {
        self.total_usd = evr_usd.map(|r| round2(self.total_evr * r));
        self
    }
}

/// Run the extend command for every instance needing moments.
///
/// Failures are collected per instance; one failure does not stop the rest.
pub async fn execute(
    runner: &dyn CommandRunner,
    template: &[String],
    plan: &ExtensionPlan,
) -> Vec<ExtensionOutcome> {
    let mut outcomes = Vec::new();

    for ext in plan.instances.iter().filter(|e| e.moments > 0) {
        let vars: HashMap<&str, String> = [
            ("host", ext.host.clone()),
            ("instance", ext.name.clone()),
            ("moments", ext.moments.to_string()),
        ]
        .into_iter()
        .collect();

        let result = run_template(runner, "cluster extend", template, &vars).await;
        let outcome = match result {
            Ok(_) => {
                info!(instance = %ext.name, host = %ext.host, moments = ext.moments, "lease extended");
                ExtensionOutcome {
                    name: ext.name.clone(),
                    host: ext.host.clone(),
                    moments: ext.moments,
                    success: true,
                    error: None,
                }
            }
            Err(e) => {
                warn!(instance = %ext.name, host = %ext.host, error = %e, "lease extension failed");
                ExtensionOutcome {
                    name: ext.name.clone(),
                    host: ext.host.clone(),
                    moments: ext.moments,
                    success: false,
                    error: Some(e.to_string()),
                }
            }
        };
        outcomes.push(outcome);
    }

    outcomes
}
