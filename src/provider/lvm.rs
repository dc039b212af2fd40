//! LVM and thin LVM providers
//!
//! Shells out to the LVM user-space tools. All sizes handed to and parsed
//! from the tools are in KiB; list output is requested with a `;` field
//! separator and no headings. Listing output is parsed leniently (lines
//! with an unexpected column count are skipped), while the two-column
//! aggregate tables of `vgs` are parsed strictly because a malformed line
//! there means the capacity numbers cannot be trusted.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::layers::StorageVlmData;
use crate::objects::stor_pool::StorPool;
use crate::provider::ext_cmd::ExtCmd;
use crate::provider::{
    DeviceProvider, DeviceProviderKind, ReconcileReport, SpaceInfo,
};
use crate::security::{AccessContext, AccessType};

/// Field separator requested from the LVM list commands
const LVS_DELIMITER: &str = ";";

/// Default LVM extent size; gross sizes are rounded up to whole extents
const EXTENT_KIB: u64 = 4096;

/// Property key naming the thin pool of a thin-LVM storage pool
pub const PROP_KEY_THIN_POOL: &str = "StorDriver/ThinPool";

/// External tool names, overridable for non-standard installations
#[derive(Debug, Clone)]
pub struct LvmConfig {
    pub lvcreate: String,
    pub lvresize: String,
    pub lvremove: String,
    pub lvs: String,
    pub vgs: String,
}

impl Default for LvmConfig {
    fn default() -> Self {
        Self {
            lvcreate: "lvcreate".into(),
            lvresize: "lvresize".into(),
            lvremove: "lvremove".into(),
            lvs: "lvs".into(),
            vgs: "vgs".into(),
        }
    }
}

/// One logical volume as listed by `lvs`
#[derive(Debug, Clone)]
struct LvsEntry {
    identifier: String,
    vg: String,
    size_kib: u64,
    attributes: String,
    thin_pool: Option<String>,
}

impl LvsEntry {
    /// `lv_attr` position 5 carries the activation state
    fn is_active(&self) -> bool {
        self.attributes.chars().nth(4) == Some('a')
    }
}

// =============================================================================
// Output Parsing
// =============================================================================

/// Parse `lvs` list output. Lines with other than 4 or 5 columns are
/// skipped; an unparsable size column fails the whole listing.
fn parse_lvs(output: &str, command: &str) -> Result<Vec<LvsEntry>> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let fields: Vec<&str> = trimmed.split(LVS_DELIMITER).map(str::trim).collect();
        if fields.len() != 4 && fields.len() != 5 {
            debug!(line = trimmed, "skipping lvs line with unexpected column count");
            continue;
        }
        let size_kib = parse_decimal_size(fields[2]).ok_or_else(|| {
            Error::storage_cmd(
                format!("Unable to parse logical volume size: '{}'", fields[2]),
                command,
            )
        })?;
        entries.push(LvsEntry {
            identifier: fields[0].to_string(),
            vg: fields[1].to_string(),
            size_kib,
            attributes: fields[3].to_string(),
            thin_pool: fields.get(4).filter(|f| !f.is_empty()).map(|f| f.to_string()),
        });
    }
    Ok(entries)
}

/// Parse a strict two-column `vgs` aggregate table into name to KiB
fn parse_vg_table(output: &str, command: &str) -> Result<BTreeMap<String, u64>> {
    let mut table = BTreeMap::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let fields: Vec<&str> = trimmed.split(LVS_DELIMITER).map(str::trim).collect();
        if fields.len() != 2 {
            return Err(Error::storage_cmd(
                format!("Unable to parse volume group table line: '{trimmed}'"),
                command,
            ));
        }
        let size_kib = parse_decimal_size(fields[1]).ok_or_else(|| {
            Error::storage_cmd(
                format!("Unable to parse volume group size: '{}'", fields[1]),
                command,
            )
        })?;
        table.insert(fields[0].to_string(), size_kib);
    }
    Ok(table)
}

/// Parse a decimal size with an optional binary unit suffix into KiB.
/// A bare number is already in KiB.
fn parse_decimal_size(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (number, factor) = match trimmed
        .chars()
        .last()
        .filter(|ch| ch.is_ascii_alphabetic())
    {
        Some(suffix) => {
            let factor = match suffix.to_ascii_lowercase() {
                'k' => 1u64,
                'm' => 1u64 << 10,
                'g' => 1u64 << 20,
                't' => 1u64 << 30,
                'p' => 1u64 << 40,
                _ => return None,
            };
            (&trimmed[..trimmed.len() - 1], factor)
        }
        None => (trimmed, 1u64),
    };
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * factor as f64) as u64)
}

// =============================================================================
// LVM Provider
// =============================================================================

/// Provider for thick and thin LVM pools; the two kinds share listing and
/// capacity logic and differ in how volumes are created
pub struct LvmProvider {
    ext: Arc<dyn ExtCmd>,
    config: LvmConfig,
    thin: bool,
    /// Logical volumes found by the last `prepare`, keyed `vg/lv`
    cache: Mutex<Option<BTreeMap<String, LvsEntry>>>,
    changed: Mutex<BTreeMap<String, Arc<StorPool>>>,
}

impl LvmProvider {
    pub fn new(ext: Arc<dyn ExtCmd>, config: LvmConfig, thin: bool) -> Self {
        Self {
            ext,
            config,
            thin,
            cache: Mutex::new(None),
            changed: Mutex::new(BTreeMap::new()),
        }
    }

    async fn list_volumes(&self, vgs: &[String]) -> Result<BTreeMap<String, LvsEntry>> {
        let mut args = vec![
            "-o",
            "lv_name,vg_name,lv_size,lv_attr,pool_lv",
            "--separator",
            LVS_DELIMITER,
            "--units",
            "k",
            "--noheadings",
            "--nosuffix",
        ];
        args.extend(vgs.iter().map(String::as_str));
        let output = self.ext.exec(&self.config.lvs, &args).await?;
        output.require_ok()?;
        let entries = parse_lvs(&output.stdout, &output.command)?;
        Ok(entries
            .into_iter()
            .map(|entry| (format!("{}/{}", entry.vg, entry.identifier), entry))
            .collect())
    }

    async fn vg_table(&self, column: &str, vg: &str) -> Result<BTreeMap<String, u64>> {
        let fields = format!("vg_name,{column}");
        let args = [
            "-o",
            fields.as_str(),
            "--separator",
            LVS_DELIMITER,
            "--units",
            "k",
            "--noheadings",
            "--nosuffix",
            vg,
        ];
        let output = self.ext.exec(&self.config.vgs, &args).await?;
        output.require_ok()?;
        parse_vg_table(&output.stdout, &output.command)
    }

    async fn create_volume(&self, pool: &Arc<StorPool>, vlm: &StorageVlmData) -> Result<()> {
        let vg = require_volume_group(pool)?;
        let size_arg = format!("{}k", vlm.desired_size());
        let identifier = vlm.identifier();
        let output = if self.thin {
            let thin_pool = pool.props().get(PROP_KEY_THIN_POOL).ok_or_else(|| {
                Error::Configuration(format!(
                    "storage pool {} has no thin pool configured",
                    pool.key()
                ))
            })?;
            self.ext
                .exec(
                    &self.config.lvcreate,
                    &[
                        "-V",
                        &size_arg,
                        "--thinpool",
                        &thin_pool,
                        "-n",
                        &identifier,
                        &vg,
                    ],
                )
                .await?
        } else {
            self.ext
                .exec(
                    &self.config.lvcreate,
                    &["-L", &size_arg, "-n", &identifier, &vg],
                )
                .await?
        };
        output.require_ok()
    }

    async fn resize_volume(&self, vg: &str, vlm: &StorageVlmData) -> Result<()> {
        let size_arg = format!("{}k", vlm.desired_size());
        let target = format!("{vg}/{}", vlm.identifier());
        let output = self
            .ext
            .exec(&self.config.lvresize, &["-L", &size_arg, &target])
            .await?;
        output.require_ok()
    }

    fn mark_changed(&self, pool: &Arc<StorPool>) {
        self.changed.lock().insert(pool.key(), pool.clone());
    }

    fn apply_entry(vlm: &StorageVlmData, vg: &str, entry: &LvsEntry) {
        vlm.set_exists(true);
        vlm.set_allocated_size(entry.size_kib);
        vlm.set_usable_size(entry.size_kib);
        vlm.set_gross_size(entry.size_kib);
        vlm.set_device_path(Some(format!("/dev/{vg}/{}", entry.identifier)));
    }
}

fn require_volume_group(pool: &Arc<StorPool>) -> Result<String> {
    pool.volume_group().ok_or_else(|| {
        Error::Configuration(format!(
            "storage pool {} has no volume group configured",
            pool.key()
        ))
    })
}

#[async_trait]
impl DeviceProvider for LvmProvider {
    fn kind(&self) -> DeviceProviderKind {
        if self.thin {
            DeviceProviderKind::LvmThin
        } else {
            DeviceProviderKind::Lvm
        }
    }

    fn clear_cache(&self) {
        *self.cache.lock() = None;
        self.changed.lock().clear();
    }

    async fn prepare(
        &self,
        vlms: &[Arc<StorageVlmData>],
        snap_vlms: &[Arc<StorageVlmData>],
    ) -> Result<()> {
        let vgs: BTreeSet<String> = vlms
            .iter()
            .chain(snap_vlms)
            .filter_map(|vlm| vlm.stor_pool().volume_group())
            .collect();
        let listing = if vgs.is_empty() {
            BTreeMap::new()
        } else {
            let vgs: Vec<String> = vgs.into_iter().collect();
            self.list_volumes(&vgs).await?
        };
        *self.cache.lock() = Some(listing);
        Ok(())
    }

    async fn process(
        &self,
        vlms: &[Arc<StorageVlmData>],
        snap_vlms: &[Arc<StorageVlmData>],
        report: &mut ReconcileReport,
    ) -> Result<()> {
        for vlm in vlms {
            let pool = vlm.stor_pool();
            let vg = match require_volume_group(&pool) {
                Ok(vg) => vg,
                Err(cfg_err) => {
                    report.add_error(vlm.key(), cfg_err.to_string());
                    continue;
                }
            };
            let cached = self
                .cache
                .lock()
                .as_ref()
                .and_then(|cache| cache.get(&format!("{vg}/{}", vlm.identifier())).cloned());

            match cached {
                Some(entry) => {
                    if !entry.is_active() {
                        report.add_error(vlm.key(), "logical volume exists but is not active");
                        continue;
                    }
                    if self.thin {
                        let expected = pool.props().get(PROP_KEY_THIN_POOL);
                        if entry.thin_pool != expected {
                            report.add_error(
                                vlm.key(),
                                format!(
                                    "logical volume sits in thin pool '{}', pool {} expects '{}'",
                                    entry.thin_pool.as_deref().unwrap_or(""),
                                    pool.key(),
                                    expected.as_deref().unwrap_or("")
                                ),
                            );
                            continue;
                        }
                    }
                    Self::apply_entry(vlm, &vg, &entry);
                    if vlm.desired_size() > entry.size_kib {
                        match self.resize_volume(&vg, vlm).await {
                            Ok(()) => {
                                vlm.set_allocated_size(vlm.desired_size());
                                vlm.set_usable_size(vlm.desired_size());
                                self.mark_changed(&pool);
                                report.add_ok(vlm.key(), "logical volume resized");
                            }
                            Err(resize_err) => {
                                report.add_error(vlm.key(), resize_err.to_string());
                            }
                        }
                    } else {
                        report.add_ok(vlm.key(), "logical volume present");
                    }
                }
                None => match self.create_volume(&pool, vlm).await {
                    Ok(()) => {
                        vlm.set_exists(true);
                        vlm.set_allocated_size(vlm.desired_size());
                        vlm.set_usable_size(vlm.desired_size());
                        vlm.set_gross_size(vlm.desired_size());
                        vlm.set_device_path(Some(format!("/dev/{vg}/{}", vlm.identifier())));
                        self.mark_changed(&pool);
                        report.add_ok(vlm.key(), "logical volume created");
                    }
                    Err(create_err) => {
                        warn!(volume = %vlm.key(), error = %create_err, "volume creation failed");
                        report.add_error(vlm.key(), create_err.to_string());
                    }
                },
            }
        }

        // snapshot content cannot be recreated from the controller side;
        // a missing snapshot volume is reported, never re-provisioned
        for snap in snap_vlms {
            if !self.thin {
                report.add_error(snap.key(), "snapshots require a thin pool");
                continue;
            }
            let pool = snap.stor_pool();
            let vg = match require_volume_group(&pool) {
                Ok(vg) => vg,
                Err(cfg_err) => {
                    report.add_error(snap.key(), cfg_err.to_string());
                    continue;
                }
            };
            let cached = self
                .cache
                .lock()
                .as_ref()
                .and_then(|cache| cache.get(&format!("{vg}/{}", snap.identifier())).cloned());
            match cached {
                Some(entry) => {
                    Self::apply_entry(snap, &vg, &entry);
                    report.add_ok(snap.key(), "snapshot volume present");
                }
                None => {
                    snap.set_exists(false);
                    report.add_error(snap.key(), "snapshot volume missing on the backend");
                }
            }
        }
        Ok(())
    }

    async fn update_gross_size(&self, vlm: &Arc<StorageVlmData>) -> Result<()> {
        let desired = vlm.desired_size();
        let gross = desired.div_ceil(EXTENT_KIB) * EXTENT_KIB;
        vlm.set_gross_size(gross);
        vlm.set_usable_size(gross);
        Ok(())
    }

    async fn update_allocated_size(&self, vlm: &Arc<StorageVlmData>) -> Result<()> {
        let pool = vlm.stor_pool();
        let vg = require_volume_group(&pool)?;
        let listing = self.list_volumes(&[vg.clone()]).await?;
        match listing.get(&format!("{vg}/{}", vlm.identifier())) {
            Some(entry) => {
                vlm.set_allocated_size(entry.size_kib);
                vlm.set_exists(true);
            }
            None => {
                vlm.set_allocated_size(0);
                vlm.set_exists(false);
            }
        }
        Ok(())
    }

    async fn get_space_info(
        &self,
        ctx: &AccessContext,
        pool: &Arc<StorPool>,
    ) -> Result<SpaceInfo> {
        pool.require_access(ctx, AccessType::View)?;
        let vg = require_volume_group(pool)?;
        let free_table = self.vg_table("vg_free", &vg).await?;
        let size_table = self.vg_table("vg_size", &vg).await?;
        let free_capacity = *free_table
            .get(&vg)
            .ok_or_else(|| Error::storage(format!("volume group not listed: {vg}")))?;
        let total_capacity = *size_table
            .get(&vg)
            .ok_or_else(|| Error::storage(format!("volume group not listed: {vg}")))?;
        Ok(SpaceInfo {
            free_capacity,
            total_capacity,
        })
    }

    async fn check_config(&self, pool: &Arc<StorPool>) -> Result<()> {
        if pool.provider_kind() != self.kind() {
            return Err(Error::Configuration(format!(
                "storage pool {} is of kind {}, expected {}",
                pool.key(),
                pool.provider_kind(),
                self.kind()
            )));
        }
        require_volume_group(pool)?;
        if self.thin && pool.props().get(PROP_KEY_THIN_POOL).is_none() {
            return Err(Error::Configuration(format!(
                "storage pool {} has no thin pool configured",
                pool.key()
            )));
        }
        Ok(())
    }

    fn changed_stor_pools(&self) -> Vec<Arc<StorPool>> {
        self.changed.lock().values().cloned().collect()
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
    use crate::drivers::MemoryDriver;
    use crate::objects::name::{NodeName, StorPoolName};
    use crate::objects::node::{Node, NodeFactory, NodeType};
    use crate::objects::registry::CoreRegistry;
    use crate::objects::stor_pool::{StorPoolFactory, PROP_KEY_LVM_VG};
    use crate::provider::ext_cmd::test_support::ScriptedExtCmd;
    use crate::security::{SecurityLevel, SecurityRegistry};
    use crate::transaction::TransactionMgr;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_decimal_size_units() {
        assert_eq!(parse_decimal_size("1024"), Some(1024));
        assert_eq!(parse_decimal_size("1048576.00k"), Some(1_048_576));
        assert_eq!(parse_decimal_size("2m"), Some(2048));
        assert_eq!(parse_decimal_size("1.5g"), Some(1_572_864));
        assert_eq!(parse_decimal_size("1t"), Some(1 << 30));
        assert_eq!(parse_decimal_size("1p"), Some(1 << 40));
        assert_eq!(parse_decimal_size(""), None);
        assert_eq!(parse_decimal_size("12x"), None);
        assert_eq!(parse_decimal_size("abc"), None);
    }

    #[test]
    fn test_parse_lvs_skips_odd_column_counts() {
        let output = "\
            r1_00000;vg0;1048576.00k;-wi-ao----\n\
            \n\
            some;short;line\n\
            r2_00000;vg0;2097152.00k;Vwi-a-tz--;thinpool\n";
        let entries = parse_lvs(output, "lvs").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].identifier, "r1_00000");
        assert_eq!(entries[0].size_kib, 1_048_576);
        assert_eq!(entries[0].thin_pool, None);
        assert_eq!(entries[1].thin_pool.as_deref(), Some("thinpool"));
        assert_eq!(entries[1].attributes, "Vwi-a-tz--");
    }

    #[test]
    fn test_parse_lvs_bad_size_carries_offender_and_command() {
        let output = "r1_00000;vg0;garbage;-wi-ao----\n";
        let err = parse_lvs(output, "lvs --noheadings vg0").unwrap_err();
        match err {
            Error::Storage { details, command } => {
                assert!(details.contains("'garbage'"));
                assert_eq!(command.as_deref(), Some("lvs --noheadings vg0"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_vg_table_strict() {
        let table = parse_vg_table("vg0;524288.00k\nvg1;1048576.00k\n", "vgs").unwrap();
        assert_eq!(table.get("vg0"), Some(&524_288));
        assert_eq!(table.get("vg1"), Some(&1_048_576));

        assert_matches!(
            parse_vg_table("vg0;1;extra\n", "vgs"),
            Err(Error::Storage { .. })
        );
        assert_matches!(
            parse_vg_table("vg0;notanumber\n", "vgs"),
            Err(Error::Storage { .. })
        );
    }

    fn pool_fixture(
        kind: DeviceProviderKind,
    ) -> (Arc<StorPool>, Arc<Node>, crate::security::AccessContext) {
        let security = SecurityRegistry::new(SecurityLevel::Mac);
        let sys = security.system_context();
        let registry = CoreRegistry::new(&sys);
        let driver = Arc::new(MemoryDriver::new());
        let node = NodeFactory::new(driver.clone(), registry.clone())
            .create_and_commit(&sys, NodeName::new("N1").unwrap(), NodeType::Satellite)
            .unwrap();
        let tx = TransactionMgr::new();
        let pool = StorPoolFactory::new(driver, registry)
            .create(
                &sys,
                &tx,
                &node,
                StorPoolName::new("pool-A").unwrap(),
                kind,
            )
            .unwrap();
        pool.set_prop(&sys, &tx, PROP_KEY_LVM_VG, "vg0").unwrap();
        tx.commit().unwrap();
        (pool, node, sys)
    }

    #[tokio::test]
    async fn test_get_space_info_queries_vg_tables() {
        let (pool, _node, sys) = pool_fixture(DeviceProviderKind::Lvm);
        let ext = Arc::new(ScriptedExtCmd::new());
        ext.push_ok("vg0;524288.00k\n");
        ext.push_ok("vg0;1048576.00k\n");

        let provider = LvmProvider::new(ext, LvmConfig::default(), false);
        let info = provider.get_space_info(&sys, &pool).await.unwrap();
        assert_eq!(info.free_capacity, 524_288);
        assert_eq!(info.total_capacity, 1_048_576);
    }

    #[tokio::test]
    async fn test_update_refreshes_pool_tracker() {
        let (pool, _node, sys) = pool_fixture(DeviceProviderKind::Lvm);
        let ext = Arc::new(ScriptedExtCmd::new());
        ext.push_ok("vg0;262144.00k\n");
        ext.push_ok("vg0;1048576.00k\n");

        let provider = LvmProvider::new(ext, LvmConfig::default(), false);
        provider.update(&sys, &pool).await.unwrap();
        assert_eq!(pool.free_space().free_capacity(), Some(262_144));
        assert_eq!(pool.free_space().total_capacity(), Some(1_048_576));
    }

    #[tokio::test]
    async fn test_process_creates_missing_volume() {
        use crate::objects::name::ResourceName;

        let (pool, _node, _sys) = pool_fixture(DeviceProviderKind::Lvm);
        let vlm = StorageVlmData::new(
            ResourceName::new("R1").unwrap(),
            "",
            crate::objects::numbers::VolumeNumber::new(0).unwrap(),
            1_048_576,
            pool.clone(),
        );

        let ext = Arc::new(ScriptedExtCmd::new());
        ext.push_ok(""); // lvs: nothing listed
        ext.push_ok(""); // lvcreate

        let provider = LvmProvider::new(ext.clone(), LvmConfig::default(), false);
        provider
            .prepare(std::slice::from_ref(&vlm), &[])
            .await
            .unwrap();
        let mut report = ReconcileReport::new();
        provider
            .process(std::slice::from_ref(&vlm), &[], &mut report)
            .await
            .unwrap();

        assert!(!report.has_errors());
        assert!(vlm.exists());
        assert_eq!(vlm.device_path().as_deref(), Some("/dev/vg0/R1_00000"));
        assert_eq!(provider.changed_stor_pools().len(), 1);
        let executed = ext.executed.lock();
        assert!(executed[1].starts_with("lvcreate -L 1048576k -n R1_00000 vg0"));
    }

    fn volume_fixture(pool: &Arc<StorPool>) -> Arc<StorageVlmData> {
        use crate::objects::name::ResourceName;
        StorageVlmData::new(
            ResourceName::new("R1").unwrap(),
            "",
            crate::objects::numbers::VolumeNumber::new(0).unwrap(),
            1_048_576,
            pool.clone(),
        )
    }

    #[tokio::test]
    async fn test_inactive_volume_reported_not_applied() {
        let (pool, _node, _sys) = pool_fixture(DeviceProviderKind::Lvm);
        let vlm = volume_fixture(&pool);

        let ext = Arc::new(ScriptedExtCmd::new());
        ext.push_ok("R1_00000;vg0;1048576.00k;-wi-------\n");

        let provider = LvmProvider::new(ext, LvmConfig::default(), false);
        provider
            .prepare(std::slice::from_ref(&vlm), &[])
            .await
            .unwrap();
        let mut report = ReconcileReport::new();
        provider
            .process(std::slice::from_ref(&vlm), &[], &mut report)
            .await
            .unwrap();

        assert!(report.has_errors());
        assert!(!vlm.exists());
    }

    #[tokio::test]
    async fn test_foreign_thin_pool_reported() {
        let (pool, _node, sys) = pool_fixture(DeviceProviderKind::LvmThin);
        let tx = TransactionMgr::new();
        pool.set_prop(&sys, &tx, PROP_KEY_THIN_POOL, "tp0").unwrap();
        tx.commit().unwrap();
        let vlm = volume_fixture(&pool);

        let ext = Arc::new(ScriptedExtCmd::new());
        ext.push_ok("R1_00000;vg0;1048576.00k;Vwi-a-tz--;other\n");

        let provider = LvmProvider::new(ext, LvmConfig::default(), true);
        provider
            .prepare(std::slice::from_ref(&vlm), &[])
            .await
            .unwrap();
        let mut report = ReconcileReport::new();
        provider
            .process(std::slice::from_ref(&vlm), &[], &mut report)
            .await
            .unwrap();

        assert!(report.has_errors());
        assert!(!vlm.exists());
    }

    #[tokio::test]
    async fn test_snapshots_rejected_on_thick_pools() {
        let (pool, _node, _sys) = pool_fixture(DeviceProviderKind::Lvm);
        let snap = {
            use crate::objects::name::ResourceName;
            StorageVlmData::new_snapshot(
                ResourceName::new("R1").unwrap(),
                "",
                crate::objects::numbers::VolumeNumber::new(0).unwrap(),
                1_048_576,
                pool.clone(),
            )
        };

        let ext = Arc::new(ScriptedExtCmd::new());
        ext.push_ok("");

        let provider = LvmProvider::new(ext, LvmConfig::default(), false);
        provider
            .prepare(&[], std::slice::from_ref(&snap))
            .await
            .unwrap();
        let mut report = ReconcileReport::new();
        provider
            .process(&[], std::slice::from_ref(&snap), &mut report)
            .await
            .unwrap();

        assert_eq!(report.error_count(), 1);
        assert!(!snap.exists());
    }

    #[tokio::test]
    async fn test_listed_snapshot_applied() {
        let (pool, _node, sys) = pool_fixture(DeviceProviderKind::LvmThin);
        let tx = TransactionMgr::new();
        pool.set_prop(&sys, &tx, PROP_KEY_THIN_POOL, "tp0").unwrap();
        tx.commit().unwrap();
        let snap = {
            use crate::objects::name::ResourceName;
            StorageVlmData::new_snapshot(
                ResourceName::new("R1").unwrap(),
                "",
                crate::objects::numbers::VolumeNumber::new(0).unwrap(),
                1_048_576,
                pool.clone(),
            )
        };

        let ext = Arc::new(ScriptedExtCmd::new());
        ext.push_ok("R1_00000;vg0;1048576.00k;Vwi---tz-k;tp0\n");

        let provider = LvmProvider::new(ext, LvmConfig::default(), true);
        provider
            .prepare(&[], std::slice::from_ref(&snap))
            .await
            .unwrap();
        let mut report = ReconcileReport::new();
        provider
            .process(&[], std::slice::from_ref(&snap), &mut report)
            .await
            .unwrap();

        assert!(!report.has_errors());
        assert!(snap.exists());
        assert_eq!(snap.allocated_size(), 1_048_576);
    }

    #[tokio::test]
    async fn test_check_config_rejects_missing_thin_pool() {
        let (pool, _node, _sys) = pool_fixture(DeviceProviderKind::LvmThin);
        let ext = Arc::new(ScriptedExtCmd::new());
        let provider = LvmProvider::new(ext, LvmConfig::default(), true);
        assert_matches!(
            provider.check_config(&pool).await,
            Err(Error::Configuration(_))
        );
    }
}
