use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::command::{CommandError, CommandRunner};
use crate::config::{HostConfig, IdentityConfig};
use crate::envelope::now_secs;
use crate::hosts::{Host, HostOrigin, HostStatus, InstanceStats};

/// What this host reports about itself to dashboards and peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    #[serde(flatten)]
    pub host: Host,
    pub api_version: String,
}

pub struct NodeService {
    identity: IdentityConfig,
    host_config: HostConfig,
    runner: Arc<dyn CommandRunner>,
}

impl NodeService {
    pub fn new(identity: IdentityConfig, host_config: HostConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            identity,
            host_config,
            runner,
        }
    }

    /// Count leased instances via the instance-list command (a JSON array)
    pub async fn active_instances(&self) -> Result<u32, CommandError> {
        let (program, args) = self
            .host_config
            .instance_list_command
            .split_first()
            .ok_or(CommandError::NotConfigured("instance list"))?;

        let output = self.runner.run(program, args).await?;
        if !output.success() {
            return Err(CommandError::Failed {
                program: program.clone(),
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        match serde_json::from_str::<Value>(output.stdout.trim()) {
            Ok(Value::Array(items)) => Ok(items.len() as u32),
            _ => Err(CommandError::Failed {
                program: program.clone(),
                code: output.exit_code,
                stderr: "output is not a JSON array".to_string(),
            }),
        }
    }

    pub async fn info(&self) -> NodeInfo {
        let instances = match (self.identity.max_instances, self.active_instances().await) {
            (Some(total), Ok(active)) => Some(InstanceStats {
                total,
                available: total.saturating_sub(active),
            }),
            (_, Err(e)) => {
                warn!(error = %e, "could not read instance list");
                None
            }
            (None, Ok(_)) => None,
        };

        let host = Host {
            address: self.identity.address.clone(),
            domain: self.identity.domain.clone(),
            status: HostStatus::Online,
            enhanced: true,
            instances,
            features: self.identity.features.clone(),
            country_code: self.identity.country_code.clone(),
            location: self.identity.location.clone(),
            lease_amount: self.identity.lease_amount,
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            sources: vec![HostOrigin::Seed],
            last_seen: Some(now_secs()),
            ..Host::default()
        };

        NodeInfo {
            host,
            api_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
