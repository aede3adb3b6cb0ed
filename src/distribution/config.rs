//! Configuration for distribution groups and partitioners.
//!
//! Two layers of configuration exist:
//!
//! - [`DistributionGroupConfig`]: what a group *is* (dimensions, replication,
//!   placement and partitioner choice). Persisted in the coordination store
//!   when the group is created and read back by every process.
//! - [`PartitionerSettings`]: how *this process* runs its partitioners
//!   (cluster namespace, local node id, wait timeouts). Built from a
//!   [`SettingsProfile`] or from the environment.
//!
//! ```rust,no_run
//! use regiontree::distribution::{DistributionGroupConfig, PartitionerSettings, SettingsProfile};
//!
//! let config = DistributionGroupConfig::builder(2)
//!     .replication_factor(1)
//!     .space_partitioner("static-grid", "[[0.0,5.0]:[0.0,5.0]];0.5;0.5")
//!     .build();
//! assert!(config.validate().is_ok());
//!
//! let settings = PartitionerSettings::from_profile(SettingsProfile::Development);
//! ```

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CLUSTER_NAME, DEFAULT_DIMENSIONS, DEFAULT_MAPPING_WAIT_TIMEOUT,
    DEFAULT_MAX_REGION_SIZE, DEFAULT_MIN_REGION_SIZE, DEFAULT_PLACEMENT_STRATEGY,
    DEFAULT_REPLICATION_FACTOR, DEFAULT_SPACE_PARTITIONER, DEFAULT_STRUCTURE_WAIT_TIMEOUT,
    MAX_GRID_CELLS,
};
use crate::hyperrectangle::Hyperrectangle;

use super::error::{RegionError, RegionResult};
use super::membership::NodeId;
use super::partitioner::PartitionerKind;
use super::placement::PlacementStrategyKind;

// =============================================================================
// Distribution group configuration
// =============================================================================

/// Configuration of one distribution group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionGroupConfig {
    pub dimensions: u32,
    pub replication_factor: u16,
    pub placement_strategy: String,
    #[serde(default)]
    pub placement_config: String,
    pub space_partitioner: String,
    /// Partitioner specific, e.g. `"[[0.0,5.0]:[0.0,5.0]];0.5;0.5"` for grids.
    #[serde(default)]
    pub space_partitioner_config: String,
    pub min_region_size: u64,
    pub max_region_size: u64,
}

impl Default for DistributionGroupConfig {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_DIMENSIONS,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            placement_strategy: DEFAULT_PLACEMENT_STRATEGY.to_string(),
            placement_config: String::new(),
            space_partitioner: DEFAULT_SPACE_PARTITIONER.to_string(),
            space_partitioner_config: String::new(),
            min_region_size: DEFAULT_MIN_REGION_SIZE,
            max_region_size: DEFAULT_MAX_REGION_SIZE,
        }
    }
}

impl DistributionGroupConfig {
    pub fn builder(dimensions: u32) -> DistributionGroupConfigBuilder {
        DistributionGroupConfigBuilder {
            config: DistributionGroupConfig {
                dimensions,
                ..Default::default()
            },
        }
    }

    /// Validate the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.dimensions < 1 {
            errors.push("dimensions must be at least 1".to_string());
        }

        if self.replication_factor < 1 {
            errors.push("replication_factor must be at least 1".to_string());
        }

        if self.min_region_size >= self.max_region_size {
            errors.push(format!(
                "min_region_size ({}) must be less than max_region_size ({})",
                self.min_region_size, self.max_region_size
            ));
        }

        if let Err(e) = self.placement_strategy.parse::<PlacementStrategyKind>() {
            errors.push(e);
        }

        match self.space_partitioner.parse::<PartitionerKind>() {
            Ok(PartitionerKind::FixedGrid | PartitionerKind::StaticGrid | PartitionerKind::DynamicGrid) => {
                if let Err(e) = GridConfig::parse(&self.space_partitioner_config, self.dimensions) {
                    errors.push(e.to_string());
                }
            }
            Ok(PartitionerKind::KdTree) => {
                if let Err(e) = root_box_from_config(&self.space_partitioner_config, self.dimensions)
                {
                    errors.push(e.to_string());
                }
            }
            Ok(PartitionerKind::QuadTree) => {}
            Err(e) => errors.push(e),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// `validate` folded into a single [`RegionError::Configuration`].
    pub fn check(&self) -> RegionResult<()> {
        self.validate()
            .map_err(|errors| RegionError::Configuration(errors.join("; ")))
    }

    pub fn partitioner_kind(&self) -> RegionResult<PartitionerKind> {
        self.space_partitioner
            .parse()
            .map_err(RegionError::Configuration)
    }

    pub fn placement_kind(&self) -> RegionResult<PlacementStrategyKind> {
        self.placement_strategy
            .parse()
            .map_err(RegionError::Configuration)
    }
}

/// Fluent builder for [`DistributionGroupConfig`].
#[derive(Debug, Clone)]
pub struct DistributionGroupConfigBuilder {
    config: DistributionGroupConfig,
}

impl DistributionGroupConfigBuilder {
    pub fn replication_factor(mut self, replication_factor: u16) -> Self {
        self.config.replication_factor = replication_factor;
        self
    }

    pub fn placement_strategy(mut self, name: impl Into<String>, config: impl Into<String>) -> Self {
        self.config.placement_strategy = name.into();
        self.config.placement_config = config.into();
        self
    }

    pub fn space_partitioner(mut self, name: impl Into<String>, config: impl Into<String>) -> Self {
        self.config.space_partitioner = name.into();
        self.config.space_partitioner_config = config.into();
        self
    }

    pub fn region_size(mut self, min: u64, max: u64) -> Self {
        self.config.min_region_size = min;
        self.config.max_region_size = max;
        self
    }

    pub fn build(self) -> DistributionGroupConfig {
        self.config
    }
}

// =============================================================================
// Partitioner configuration strings
// =============================================================================

/// Parsed grid partitioner configuration: covering box plus one step size
/// per dimension, e.g. `"[[0.0,5.0]:[0.0,5.0]];0.5;0.5"`.
#[derive(Debug, Clone, PartialEq)]
pub struct GridConfig {
    pub covering_box: Hyperrectangle,
    pub steps: Vec<f64>,
}

impl GridConfig {
    pub fn parse(config: &str, dimensions: u32) -> RegionResult<Self> {
        let parts: Vec<&str> = config.split(';').map(str::trim).collect();
        let dimensions = dimensions as usize;

        if parts.len() - 1 != dimensions {
            return Err(RegionError::configuration(format!(
                "grid config '{config}' has {} step sizes, expected {dimensions}",
                parts.len() - 1
            )));
        }

        let covering_box: Hyperrectangle = parts[0].parse()?;
        if covering_box.dimensions() != dimensions {
            return Err(RegionError::configuration(format!(
                "grid covering box {covering_box} has {} dimensions, expected {dimensions}",
                covering_box.dimensions()
            )));
        }
        if covering_box.intervals().iter().any(|i| !i.is_bounded()) {
            return Err(RegionError::configuration(format!(
                "grid covering box {covering_box} must be bounded"
            )));
        }

        let steps = parts[1..]
            .iter()
            .map(|raw| {
                let step: f64 = raw.parse().map_err(|_| {
                    RegionError::configuration(format!("invalid grid step size '{raw}'"))
                })?;
                if !(step.is_finite() && step > 0.0) {
                    return Err(RegionError::configuration(format!(
                        "grid step size '{raw}' must be positive"
                    )));
                }
                Ok(step)
            })
            .collect::<RegionResult<Vec<_>>>()?;

        let grid = Self {
            covering_box,
            steps,
        };
        match grid.checked_cell_count() {
            Some(count) if count <= MAX_GRID_CELLS => Ok(grid),
            _ => Err(RegionError::configuration(format!(
                "grid config '{config}' produces more than {MAX_GRID_CELLS} cells"
            ))),
        }
    }

    /// Number of cells along `dimension`.
    pub fn cells_in_dimension(&self, dimension: usize) -> usize {
        let Some(interval) = self.covering_box.intervals().get(dimension) else {
            return 0;
        };
        let cells = interval.length() / self.steps[dimension];
        // Absorb float noise such as 1.0 / 0.1 = 10.000000000000002.
        let rounded = cells.round();
        let cells = if (cells - rounded).abs() < 1e-9 {
            rounded
        } else {
            cells.ceil()
        };
        cells.max(1.0) as usize
    }

    /// Total number of cells. Saturates at `usize::MAX`.
    pub fn cell_count(&self) -> usize {
        self.checked_cell_count().unwrap_or(usize::MAX)
    }

    /// Total number of cells, `None` on overflow.
    pub fn checked_cell_count(&self) -> Option<usize> {
        (0..self.steps.len()).try_fold(1usize, |count, dimension| {
            count.checked_mul(self.cells_in_dimension(dimension))
        })
    }
}

/// Root box of a tree partitioner: a box literal when the config contains one,
/// otherwise the full space of the group.
pub fn root_box_from_config(config: &str, dimensions: u32) -> RegionResult<Hyperrectangle> {
    let trimmed = config.trim();
    if !(trimmed.contains('[') && trimmed.contains(']')) {
        return Ok(Hyperrectangle::full_space(dimensions as usize));
    }

    let bbox: Hyperrectangle = trimmed.parse()?;
    if bbox.dimensions() != dimensions as usize {
        return Err(RegionError::configuration(format!(
            "root box {bbox} has {} dimensions, expected {dimensions}",
            bbox.dimensions()
        )));
    }
    Ok(bbox)
}

// =============================================================================
// Process-local settings
// =============================================================================

/// Pre-validated settings for common deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SettingsProfile {
    /// Short waits for local runs and tests.
    Development,
    #[default]
    Production,
}

impl SettingsProfile {
    pub fn description(&self) -> &'static str {
        match self {
            SettingsProfile::Development => "Local development and testing",
            SettingsProfile::Production => "Production deployments",
        }
    }
}

impl std::fmt::Display for SettingsProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsProfile::Development => write!(f, "development"),
            SettingsProfile::Production => write!(f, "production"),
        }
    }
}

impl FromStr for SettingsProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(SettingsProfile::Development),
            "production" | "prod" => Ok(SettingsProfile::Production),
            other => Err(format!(
                "unknown profile '{other}', expected 'development' or 'production'"
            )),
        }
    }
}

/// Settings of the partitioners running in this process.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionerSettings {
    /// Namespace below the store root shared by all processes of a cluster.
    pub cluster_name: String,
    /// Node this process runs as; regions it hosts are mapped locally.
    pub local_node: Option<NodeId>,
    /// Bound for waits on the syncer during split and merge.
    pub structure_wait_timeout: Duration,
    /// Default bound for id mapper waits.
    pub mapping_wait_timeout: Duration,
    /// Keep the children of a split in `REDISTRIBUTION_ACTIVE` until
    /// `split_complete` instead of activating them right away.
    pub redistribute_on_split: bool,
    /// Let a split proceed when replica placement for a new child fails;
    /// the child stays `CREATING`.
    pub ignore_allocation_failures: bool,
}

impl Default for PartitionerSettings {
    fn default() -> Self {
        Self::from_profile(SettingsProfile::Production)
    }
}

impl PartitionerSettings {
    pub fn from_profile(profile: SettingsProfile) -> Self {
        let base = Self {
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            local_node: None,
            structure_wait_timeout: DEFAULT_STRUCTURE_WAIT_TIMEOUT,
            mapping_wait_timeout: DEFAULT_MAPPING_WAIT_TIMEOUT,
            redistribute_on_split: true,
            ignore_allocation_failures: false,
        };

        match profile {
            SettingsProfile::Development => Self {
                structure_wait_timeout: Duration::from_secs(5),
                mapping_wait_timeout: Duration::from_secs(5),
                ..base
            },
            SettingsProfile::Production => base,
        }
    }

    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    pub fn with_local_node(mut self, node: impl Into<NodeId>) -> Self {
        self.local_node = Some(node.into());
        self
    }

    pub fn with_structure_wait_timeout(mut self, timeout: Duration) -> Self {
        self.structure_wait_timeout = timeout;
        self
    }

    pub fn with_mapping_wait_timeout(mut self, timeout: Duration) -> Self {
        self.mapping_wait_timeout = timeout;
        self
    }

    pub fn with_redistribute_on_split(mut self, redistribute: bool) -> Self {
        self.redistribute_on_split = redistribute;
        self
    }

    pub fn with_ignore_allocation_failures(mut self, ignore: bool) -> Self {
        self.ignore_allocation_failures = ignore;
        self
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = super::paths::validate_name("cluster", &self.cluster_name) {
            errors.push(e.to_string());
        }

        if let Some(node) = &self.local_node {
            if let Err(e) = super::paths::validate_name("node", node.as_str()) {
                errors.push(e.to_string());
            }
        }

        if self.structure_wait_timeout.is_zero() {
            errors.push("structure_wait_timeout must be greater than zero".to_string());
        }

        if self.mapping_wait_timeout.is_zero() {
            errors.push("mapping_wait_timeout must be greater than zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Create settings from environment variables.
    ///
    /// - `REGIONTREE_PROFILE`: `development` or `production` (default: production)
    /// - `REGIONTREE_CLUSTER`: cluster namespace (default: `regiontree`)
    /// - `REGIONTREE_LOCAL_NODE`: id of this node (default: unset)
    /// - `REGIONTREE_STRUCTURE_WAIT_MS`: structural wait bound in milliseconds
    /// - `REGIONTREE_MAPPING_WAIT_MS`: mapping wait bound in milliseconds
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let profile: SettingsProfile = match std::env::var("REGIONTREE_PROFILE") {
            Ok(raw) => raw.parse()?,
            Err(_) => SettingsProfile::default(),
        };
        let mut settings = Self::from_profile(profile);

        if let Ok(cluster) = std::env::var("REGIONTREE_CLUSTER") {
            settings.cluster_name = cluster;
        }

        if let Ok(node) = std::env::var("REGIONTREE_LOCAL_NODE") {
            settings.local_node = Some(NodeId::new(node));
        }

        if let Ok(raw) = std::env::var("REGIONTREE_STRUCTURE_WAIT_MS") {
            let millis: u64 = raw
                .parse()
                .map_err(|e| format!("Invalid REGIONTREE_STRUCTURE_WAIT_MS: {}", e))?;
            settings.structure_wait_timeout = Duration::from_millis(millis);
        }

        if let Ok(raw) = std::env::var("REGIONTREE_MAPPING_WAIT_MS") {
            let millis: u64 = raw
                .parse()
                .map_err(|e| format!("Invalid REGIONTREE_MAPPING_WAIT_MS: {}", e))?;
            settings.mapping_wait_timeout = Duration::from_millis(millis);
        }

        settings
            .validate()
            .map_err(|errors| errors.join("; "))?;

        Ok(settings)
    }
}
