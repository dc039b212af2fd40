//! Openflex provider
//!
//! Talks to an Openflex composable-storage fabric over its REST API. The
//! controller only refreshes fabric-side state here; volume provisioning on
//! the fabric is driven by the satellite attached to it. Response payloads
//! carry more fields than the controller needs; unknown fields are ignored.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::layers::StorageVlmData;
use crate::objects::stor_pool::StorPool;
use crate::provider::{
    DeviceProvider, DeviceProviderKind, ReconcileReport, SpaceInfo,
};
use crate::security::{AccessContext, AccessType};

/// Property key naming the fabric-side pool id of an Openflex storage pool
pub const PROP_KEY_OPENFLEX_POOL: &str = "StorDriver/Openflex/PoolId";

#[derive(Debug, Clone)]
pub struct OpenflexConfig {
    /// Base URL of the fabric API, e.g. `http://fabric-1:8081`
    pub api_host: String,
    /// Storage device id within the fabric
    pub device: String,
}

/// Status block of a fabric pool
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenflexStatus {
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "Health", default)]
    pub health: String,
}

/// One storage pool as reported by the fabric API. Capacities are in
/// bytes on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenflexPool {
    #[serde(rename = "Self", default)]
    pub self_link: String,
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Status", default)]
    pub status: OpenflexStatus,
    #[serde(rename = "RemainingCapacity", default)]
    pub remaining_capacity: u64,
    #[serde(rename = "TotalCapacity", default)]
    pub total_capacity: u64,
    #[serde(rename = "UUID", default)]
    pub uuid: String,
}

impl OpenflexPool {
    pub fn space_info(&self) -> SpaceInfo {
        SpaceInfo {
            free_capacity: self.remaining_capacity / 1024,
            total_capacity: self.total_capacity / 1024,
        }
    }
}

/// Parse one fabric pool document
pub(crate) fn pool_from_json(body: &str) -> Result<OpenflexPool> {
    serde_json::from_str(body)
        .map_err(|parse_err| Error::storage(format!("malformed fabric pool document: {parse_err}")))
}

// =============================================================================
// Openflex Provider
// =============================================================================

pub struct OpenflexProvider {
    client: reqwest::Client,
    config: OpenflexConfig,
}

impl OpenflexProvider {
    pub fn new(config: OpenflexConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn pool_url(&self, pool_id: &str) -> String {
        format!(
            "{}/Storage/Devices/{}/Pools/{}",
            self.config.api_host, self.config.device, pool_id
        )
    }

    async fn fetch_pool(&self, pool: &Arc<StorPool>) -> Result<OpenflexPool> {
        let pool_id = require_pool_id(pool)?;
        let url = self.pool_url(&pool_id);
        debug!(%url, "querying fabric pool");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|req_err| Error::storage_cmd(req_err.to_string(), format!("GET {url}")))?;
        if !response.status().is_success() {
            return Err(Error::storage_cmd(
                format!("fabric API returned {}", response.status()),
                format!("GET {url}"),
            ));
        }
        let body = response
            .text()
            .await
            .map_err(|req_err| Error::storage_cmd(req_err.to_string(), format!("GET {url}")))?;
        pool_from_json(&body)
    }
}

fn require_pool_id(pool: &Arc<StorPool>) -> Result<String> {
    pool.props().get(PROP_KEY_OPENFLEX_POOL).ok_or_else(|| {
        Error::Configuration(format!(
            "storage pool {} has no fabric pool id configured",
            pool.key()
        ))
    })
}

#[async_trait]
impl DeviceProvider for OpenflexProvider {
    fn kind(&self) -> DeviceProviderKind {
        DeviceProviderKind::Openflex
    }

    fn clear_cache(&self) {}

    async fn prepare(
        &self,
        _vlms: &[Arc<StorageVlmData>],
        _snap_vlms: &[Arc<StorageVlmData>],
    ) -> Result<()> {
        Ok(())
    }

    /// Provisioning happens on the fabric-attached satellite; a controller
    /// pass only refreshes the fabric-side view of each volume's pool
    async fn process(
        &self,
        vlms: &[Arc<StorageVlmData>],
        snap_vlms: &[Arc<StorageVlmData>],
        report: &mut ReconcileReport,
    ) -> Result<()> {
        for vlm in vlms {
            match self.fetch_pool(&vlm.stor_pool()).await {
                Ok(fabric_pool) => {
                    vlm.stor_pool().free_space().update(fabric_pool.space_info());
                    report.add_ok(
                        vlm.key(),
                        format!("fabric pool state: {}", fabric_pool.status.state),
                    );
                }
                Err(fetch_err) => {
                    report.add_error(vlm.key(), fetch_err.to_string());
                }
            }
        }
        for snap in snap_vlms {
            report.add_error(snap.key(), "snapshots are not supported by the fabric backend");
        }
        Ok(())
    }

    async fn update_gross_size(&self, vlm: &Arc<StorageVlmData>) -> Result<()> {
        vlm.set_gross_size(vlm.desired_size());
        vlm.set_usable_size(vlm.desired_size());
        Ok(())
    }

    async fn update_allocated_size(&self, vlm: &Arc<StorageVlmData>) -> Result<()> {
        vlm.set_allocated_size(vlm.desired_size());
        Ok(())
    }

    async fn get_space_info(
        &self,
        ctx: &AccessContext,
        pool: &Arc<StorPool>,
    ) -> Result<SpaceInfo> {
        pool.require_access(ctx, AccessType::View)?;
        let fabric_pool = self.fetch_pool(pool).await?;
        Ok(fabric_pool.space_info())
    }

    async fn check_config(&self, pool: &Arc<StorPool>) -> Result<()> {
        if self.config.api_host.is_empty() {
            return Err(Error::Configuration(
                "no fabric API host configured".into(),
            ));
        }
        require_pool_id(pool)?;
        Ok(())
    }

    fn changed_stor_pools(&self) -> Vec<Arc<StorPool>> {
        Vec::new()
    }

    async fn update(&self, ctx: &AccessContext, pool: &Arc<StorPool>) -> Result<()> {
        let info = self.get_space_info(ctx, pool).await?;
        pool.free_space().update(info);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_document_parsing_ignores_unknown_fields() {
        let body = r#"{
            "Self": "http://fabric-1:8081/Storage/Devices/d1/Pools/p1",
            "ID": "p1",
            "Status": { "State": "Online", "Health": "OK", "Details": [] },
            "RemainingCapacity": 536870912000,
            "TotalCapacity": 1073741824000,
            "UUID": "8a5f3210-77f0-4bd4-9c29-3b1a65d4d7e1",
            "Name": "pool one",
            "Generation": 4
        }"#;
        let pool = pool_from_json(body).unwrap();
        assert_eq!(pool.id, "p1");
        assert_eq!(pool.status.state, "Online");
        let info = pool.space_info();
        assert_eq!(info.free_capacity, 524_288_000);
        assert_eq!(info.total_capacity, 1_048_576_000);
    }

    #[test]
    fn test_missing_fields_default() {
        let pool = pool_from_json(r#"{ "ID": "p2" }"#).unwrap();
        assert_eq!(pool.remaining_capacity, 0);
        assert_eq!(pool.total_capacity, 0);
        assert_eq!(pool.status.state, "");
    }

    #[test]
    fn test_malformed_document_rejected() {
        assert!(pool_from_json("not json").is_err());
    }
}
