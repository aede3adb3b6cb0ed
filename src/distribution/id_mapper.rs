//! Local index from bounding boxes to physical tables.
//!
//! Each region hosted by this node is stored in a physical table named
//! `<group>_<table>_<region-id>`. The [`RegionIdMapper`] keeps the boxes of all
//! locally hosted regions so a query box can be translated into the set of
//! tables that may contain matching tuples.
//!
//! Reads go through a [`DashMap`] and never block on the syncer, which is the
//! only writer. Waiters are woken through a `watch` channel carrying a change
//! counter.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::hyperrectangle::Hyperrectangle;

use super::error::{RegionError, RegionResult};
use super::metrics;
use super::region::RegionId;

/// A table name, either logical (`<group>_<table>`) or physical
/// (`<group>_<table>_<region-id>`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableName {
    group: String,
    table: String,
    region: Option<RegionId>,
}

impl TableName {
    pub fn new(group: impl Into<String>, table: impl Into<String>) -> RegionResult<Self> {
        let group = group.into();
        let table = table.into();
        validate_table_element("group", &group)?;
        validate_table_element("table", &table)?;
        Ok(Self {
            group,
            table,
            region: None,
        })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn region(&self) -> Option<RegionId> {
        self.region
    }

    pub fn is_physical(&self) -> bool {
        self.region.is_some()
    }

    /// Physical table of this logical table in `region`.
    pub fn for_region(&self, region: RegionId) -> TableName {
        TableName {
            group: self.group.clone(),
            table: self.table.clone(),
            region: Some(region),
        }
    }

    /// Logical name with the region stripped.
    pub fn logical(&self) -> TableName {
        TableName {
            group: self.group.clone(),
            table: self.table.clone(),
            region: None,
        }
    }
}

fn validate_table_element(kind: &str, value: &str) -> RegionResult<()> {
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(RegionError::configuration(format!(
            "invalid {kind} name '{value}'"
        )));
    }
    Ok(())
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.region {
            Some(region) => write!(f, "{}_{}_{}", self.group, self.table, region),
            None => write!(f, "{}_{}", self.group, self.table),
        }
    }
}

impl FromStr for TableName {
    type Err = RegionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('_').collect();
        match parts.as_slice() {
            [group, table] => TableName::new(*group, *table),
            [group, table, region] => {
                let region: RegionId = region.parse().map_err(|_| {
                    RegionError::configuration(format!("invalid region id in table name '{s}'"))
                })?;
                Ok(TableName::new(*group, *table)?.for_region(region))
            }
            _ => Err(RegionError::configuration(format!(
                "invalid table name '{s}'"
            ))),
        }
    }
}

/// Locally hosted regions of one distribution group.
#[derive(Debug)]
pub struct RegionIdMapper {
    group: String,
    regions: DashMap<RegionId, Hyperrectangle>,
    changes: watch::Sender<u64>,
}

impl RegionIdMapper {
    pub fn new(group: impl Into<String>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            group: group.into(),
            regions: DashMap::new(),
            changes,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    fn notify(&self) {
        self.changes.send_modify(|generation| *generation += 1);
        metrics::MAPPED_REGIONS
            .with_label_values(&[self.group.as_str()])
            .set(self.regions.len() as i64);
    }

    /// Add a mapping. Returns `false` if the region was already mapped.
    pub fn add_mapping(&self, region: RegionId, bounding_box: Hyperrectangle) -> bool {
        if self.regions.contains_key(&region) {
            return false;
        }
        debug!(group = %self.group, region_id = %region, bbox = %bounding_box, "Adding local mapping");
        self.regions.insert(region, bounding_box);
        self.notify();
        true
    }

    /// Remove a mapping. Returns `false` if the region was not mapped.
    pub fn remove_mapping(&self, region: RegionId) -> bool {
        if self.regions.remove(&region).is_none() {
            return false;
        }
        debug!(group = %self.group, region_id = %region, "Removed local mapping");
        self.notify();
        true
    }

    pub fn clear(&self) {
        if self.regions.is_empty() {
            return;
        }
        self.regions.clear();
        debug!(group = %self.group, "Cleared local mappings");
        self.notify();
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn contains(&self, region: RegionId) -> bool {
        self.regions.contains_key(&region)
    }

    pub fn bounding_box(&self, region: RegionId) -> Option<Hyperrectangle> {
        self.regions.get(&region).map(|entry| entry.value().clone())
    }

    pub fn all_region_ids(&self) -> BTreeSet<RegionId> {
        self.regions.iter().map(|entry| *entry.key()).collect()
    }

    /// Ids of the mapped regions whose box intersects `query`.
    pub fn region_ids_for(&self, query: &Hyperrectangle) -> BTreeSet<RegionId> {
        self.regions
            .iter()
            .filter(|entry| entry.value().intersects(query))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Physical tables of `table` that may hold tuples intersecting `query`.
    pub fn local_tables_for(
        &self,
        query: &Hyperrectangle,
        table: &TableName,
    ) -> BTreeSet<TableName> {
        if table.group() != self.group {
            warn!(
                group = %self.group,
                table = %table,
                "Table belongs to a different distribution group"
            );
            return BTreeSet::new();
        }
        self.region_ids_for(query)
            .into_iter()
            .map(|region| table.for_region(region))
            .collect()
    }

    /// Every physical table of `table` hosted locally.
    pub fn all_local_tables(&self, table: &TableName) -> BTreeSet<TableName> {
        self.local_tables_for(&Hyperrectangle::default(), table)
    }

    pub async fn wait_until_mapping_appears(
        &self,
        region: RegionId,
        timeout: Duration,
    ) -> RegionResult<()> {
        self.wait_until(region, true, timeout).await
    }

    pub async fn wait_until_mapping_disappears(
        &self,
        region: RegionId,
        timeout: Duration,
    ) -> RegionResult<()> {
        self.wait_until(region, false, timeout).await
    }

    async fn wait_until(&self, region: RegionId, present: bool, timeout: Duration) -> RegionResult<()> {
        // Subscribe before checking so no change between check and wait is missed.
        let mut changes = self.changes.subscribe();

        let wait = async {
            loop {
                if self.regions.contains_key(&region) == present {
                    return Ok(());
                }
                if changes.changed().await.is_err() {
                    return Err(RegionError::Shutdown(self.group.clone()));
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                metrics::WAIT_TIMEOUTS
                    .with_label_values(&["mapping"])
                    .inc();
                let what = if present { "appear" } else { "disappear" };
                Err(RegionError::Timeout {
                    what: format!("mapping of region {region} to {what}"),
                    waited: timeout,
                })
            }
        }
    }
}
