//! Coordination store layout.
//!
//! ```text
//! /<cluster>/nodes/<node-id>                 membership
//! /<cluster>/groups/<group>/config           group configuration (JSON)
//! /<cluster>/groups/<group>/version          version marker
//! /<cluster>/groups/<group>/ids/id-<seq>     region id queue
//! /<cluster>/groups/<group>/root             root region
//!     .../region-id
//!     .../bbox
//!     .../state
//!     .../systems/<node-id>
//!     .../mutation                           mutation-complete stamp
//!     .../statistics/<node-id>/total-size    size reported by one replica
//!     .../statistics/<node-id>/total-tuples
//!     .../child-<n>                          child region n
//! ```
//!
//! A region's path is derived from the child numbers on its way down from the
//! root, so encoding and decoding only need the in-memory tree.

use crate::constants::{
    CHILD_PREFIX, GROUP_CONFIG_NODE, GROUP_IDS_NODE, GROUP_VERSION_NODE, REGION_BBOX_NODE,
    REGION_ID_NODE, REGION_ID_PREFIX, REGION_MUTATION_NODE, REGION_STATE_NODE,
    REGION_STATISTICS_NODE, REGION_SYSTEMS_NODE, ROOT_NODE,
};

use super::error::{RegionError, RegionResult};
use super::membership::NodeId;
use super::region::{RegionId, RegionTree};

/// Check that `name` can be used as a single path element.
pub fn validate_name(kind: &str, name: &str) -> RegionResult<()> {
    if name.is_empty() {
        return Err(RegionError::configuration(format!("{kind} name is empty")));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')))
    {
        return Err(RegionError::configuration(format!(
            "{kind} name '{name}' contains invalid character '{bad}'"
        )));
    }
    Ok(())
}

/// Path builder for one cluster namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    cluster: String,
}

impl StorePaths {
    pub fn new(cluster: impl Into<String>) -> RegionResult<Self> {
        let cluster = cluster.into();
        validate_name("cluster", &cluster)?;
        Ok(Self { cluster })
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn cluster_path(&self) -> String {
        format!("/{}", self.cluster)
    }

    pub fn nodes_path(&self) -> String {
        format!("/{}/nodes", self.cluster)
    }

    pub fn node_path(&self, node: &NodeId) -> RegionResult<String> {
        validate_name("node", node.as_str())?;
        Ok(format!("{}/{}", self.nodes_path(), node))
    }

    pub fn groups_path(&self) -> String {
        format!("/{}/groups", self.cluster)
    }

    pub fn group_path(&self, group: &str) -> String {
        format!("{}/{}", self.groups_path(), group)
    }

    pub fn group_config_path(&self, group: &str) -> String {
        format!("{}/{}", self.group_path(group), GROUP_CONFIG_NODE)
    }

    pub fn group_version_path(&self, group: &str) -> String {
        format!("{}/{}", self.group_path(group), GROUP_VERSION_NODE)
    }

    pub fn group_ids_path(&self, group: &str) -> String {
        format!("{}/{}", self.group_path(group), GROUP_IDS_NODE)
    }

    /// Prefix handed to `create_sequential_node` when allocating region ids.
    pub fn region_id_queue_prefix(&self, group: &str) -> String {
        format!("{}/{}", self.group_ids_path(group), REGION_ID_PREFIX)
    }

    pub fn root_region_path(&self, group: &str) -> String {
        format!("{}/{}", self.group_path(group), ROOT_NODE)
    }

    /// Path of the region reached by following `child_numbers` from the root.
    pub fn region_path_for_child_numbers(&self, group: &str, child_numbers: &[u32]) -> String {
        let mut path = self.root_region_path(group);
        for number in child_numbers {
            path = child_path(&path, *number);
        }
        path
    }

    /// Encode the store path of region `id`.
    pub fn region_path(&self, tree: &RegionTree, id: RegionId) -> RegionResult<String> {
        let numbers = tree.child_path(id)?;
        Ok(self.region_path_for_child_numbers(tree.group(), &numbers))
    }

    /// Decode a region path into the child numbers below the root.
    pub fn child_numbers_from_path(&self, group: &str, path: &str) -> RegionResult<Vec<u32>> {
        let root = self.root_region_path(group);
        let rest = path
            .strip_prefix(&root)
            .ok_or_else(|| RegionError::malformed(path, "not below the group's root region"))?;
        if rest.is_empty() {
            return Ok(Vec::new());
        }
        let rest = rest
            .strip_prefix('/')
            .ok_or_else(|| RegionError::malformed(path, "not below the group's root region"))?;

        rest.split('/')
            .map(|element| {
                parse_child_number(element).ok_or_else(|| {
                    RegionError::malformed(path, format!("'{element}' is not a child element"))
                })
            })
            .collect()
    }

    /// Resolve a region path against the in-memory tree.
    pub fn region_for_path(&self, tree: &RegionTree, path: &str) -> Option<RegionId> {
        let numbers = self.child_numbers_from_path(tree.group(), path).ok()?;
        tree.find_by_child_path(&numbers).map(|region| region.id)
    }

    /// Split a path below the groups node into `(group, rest)`.
    pub fn split_group_path<'a>(&self, path: &'a str) -> Option<(&'a str, &'a str)> {
        let groups = self.groups_path();
        let rest = path.strip_prefix(&groups)?.strip_prefix('/')?;
        Some(match rest.split_once('/') {
            Some((group, tail)) => (group, tail),
            None => (rest, ""),
        })
    }
}

pub fn child_path(parent: &str, child_number: u32) -> String {
    format!("{parent}/{CHILD_PREFIX}{child_number}")
}

/// Parse `child-<n>` into `n`.
pub fn parse_child_number(name: &str) -> Option<u32> {
    name.strip_prefix(CHILD_PREFIX)?.parse().ok()
}

/// Path of the parent node, `None` for top-level paths.
pub fn parent_path(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    (idx > 0).then(|| &path[..idx])
}

pub fn region_id_path(region_path: &str) -> String {
    format!("{region_path}/{REGION_ID_NODE}")
}

pub fn bbox_path(region_path: &str) -> String {
    format!("{region_path}/{REGION_BBOX_NODE}")
}

pub fn state_path(region_path: &str) -> String {
    format!("{region_path}/{REGION_STATE_NODE}")
}

pub fn systems_path(region_path: &str) -> String {
    format!("{region_path}/{REGION_SYSTEMS_NODE}")
}

pub fn mutation_path(region_path: &str) -> String {
    format!("{region_path}/{REGION_MUTATION_NODE}")
}

pub fn statistics_path(region_path: &str) -> String {
    format!("{region_path}/{REGION_STATISTICS_NODE}")
}

/// If `path` is a region's mutation stamp, the region path.
pub fn region_of_mutation_path(path: &str) -> Option<&str> {
    path.strip_suffix(REGION_MUTATION_NODE)?.strip_suffix('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_layout() {
        let paths = StorePaths::new("cluster").unwrap();
        assert_eq!(paths.group_path("g"), "/cluster/groups/g");
        assert_eq!(paths.root_region_path("g"), "/cluster/groups/g/root");
        assert_eq!(paths.group_version_path("g"), "/cluster/groups/g/version");
        assert_eq!(paths.region_id_queue_prefix("g"), "/cluster/groups/g/ids/id-");
        assert_eq!(
            paths.node_path(&NodeId::from("10.0.0.1:50505")).unwrap(),
            "/cluster/nodes/10.0.0.1:50505"
        );
    }

    #[test]
    fn test_invalid_names_rejected() {
        assert!(StorePaths::new("").is_err());
        assert!(StorePaths::new("a/b").is_err());
        let paths = StorePaths::new("c").unwrap();
        assert!(paths.node_path(&NodeId::from("x/y")).is_err());
    }

    #[test]
    fn test_child_numbers_round_trip() {
        let paths = StorePaths::new("c").unwrap();
        for numbers in [vec![], vec![0], vec![1, 0], vec![0, 1, 1], vec![1, 1, 0, 1]] {
            let path = paths.region_path_for_child_numbers("g", &numbers);
            assert_eq!(paths.child_numbers_from_path("g", &path).unwrap(), numbers);
        }
    }

    #[test]
    fn test_decode_rejects_foreign_paths() {
        let paths = StorePaths::new("c").unwrap();
        assert!(paths.child_numbers_from_path("g", "/c/groups/h/root").is_err());
        assert!(paths.child_numbers_from_path("g", "/c/groups/g/root/state").is_err());
        assert!(paths.child_numbers_from_path("g", "/c/groups/g/rootx").is_err());
    }

    #[test]
    fn test_mutation_path_helpers() {
        assert_eq!(
            region_of_mutation_path("/c/groups/g/root/child-0/mutation"),
            Some("/c/groups/g/root/child-0")
        );
        assert_eq!(region_of_mutation_path("/c/groups/g/root/state"), None);
        assert_eq!(parent_path("/c/groups/g/root/child-0"), Some("/c/groups/g/root"));
        assert_eq!(parent_path("/c"), None);
        assert_eq!(parse_child_number("child-12"), Some(12));
        assert_eq!(parse_child_number("systems"), None);
    }

    #[test]
    fn test_split_group_path() {
        let paths = StorePaths::new("c").unwrap();
        assert_eq!(
            paths.split_group_path("/c/groups/g/root/state"),
            Some(("g", "root/state"))
        );
        assert_eq!(paths.split_group_path("/c/groups/g"), Some(("g", "")));
        assert_eq!(paths.split_group_path("/c/nodes/x"), None);
    }
}
