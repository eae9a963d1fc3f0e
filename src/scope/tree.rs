//! Arena backed namespace tree.
//!
//! Nodes refer to their parent and children by index. A node can only be
//! registered under a parent that already exists, so the tree stays acyclic.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{LimiterError, Result};
use crate::ratelimit::LimitSpec;

use super::exemption::ExemptionScope;

/// Index of a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespaceId(pub(crate) usize);

impl NamespaceId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// One namespace (a group of routes).
#[derive(Debug, Clone)]
pub struct NamespaceNode {
    pub name: String,
    pub parent: Option<NamespaceId>,
    pub children: Vec<NamespaceId>,
    pub limits: Vec<Arc<LimitSpec>>,
    pub exemption: ExemptionScope,
}

impl NamespaceNode {
    fn new(name: &str, parent: Option<NamespaceId>) -> Self {
        Self {
            name: name.to_string(),
            parent,
            children: Vec::new(),
            limits: Vec::new(),
            exemption: ExemptionScope::NONE,
        }
    }

    /// Whether the node has limits and every one of them overrides inherited ones.
    pub fn limits_override(&self) -> bool {
        !self.limits.is_empty() && self.limits.iter().all(|l| l.overrides_defaults())
    }
}

#[derive(Debug, Clone, Default)]
pub struct NamespaceTree {
    nodes: Vec<NamespaceNode>,
    index: HashMap<String, NamespaceId>,
}

impl NamespaceTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a namespace, optionally nested under an existing parent.
    pub fn register(&mut self, name: &str, parent: Option<&str>) -> Result<NamespaceId> {
        if name.is_empty() {
            return Err(LimiterError::Configuration(
                "namespace name must not be empty".to_string(),
            ));
        }
        if self.index.contains_key(name) {
            return Err(LimiterError::Configuration(format!(
                "namespace '{}' is already registered",
                name
            )));
        }
        let parent_id = match parent {
            Some(parent) if parent == name => {
                return Err(LimiterError::Configuration(format!(
                    "namespace '{}' cannot be its own parent",
                    name
                )))
            }
            Some(parent) => Some(self.id_of(parent).ok_or_else(|| {
                LimiterError::Configuration(format!(
                    "parent namespace '{}' of '{}' is not registered",
                    parent, name
                ))
            })?),
            None => None,
        };

        let id = NamespaceId(self.nodes.len());
        self.nodes.push(NamespaceNode::new(name, parent_id));
        self.index.insert(name.to_string(), id);
        if let Some(parent_id) = parent_id {
            self.nodes[parent_id.0].children.push(id);
        }
        Ok(id)
    }

    pub fn id_of(&self, name: &str) -> Option<NamespaceId> {
        self.index.get(name).copied()
    }

    pub fn get(&self, id: NamespaceId) -> Option<&NamespaceNode> {
        self.nodes.get(id.0)
    }

    fn get_mut_by_name(&mut self, name: &str) -> Result<&mut NamespaceNode> {
        let id = self
            .id_of(name)
            .ok_or_else(|| LimiterError::Configuration(format!("unknown namespace '{}'", name)))?;
        Ok(&mut self.nodes[id.0])
    }

    pub fn add_limit(&mut self, name: &str, limit: Arc<LimitSpec>) -> Result<()> {
        self.get_mut_by_name(name)?.limits.push(limit);
        Ok(())
    }

    pub fn set_exemption(&mut self, name: &str, exemption: ExemptionScope) -> Result<()> {
        self.get_mut_by_name(name)?.exemption = exemption;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NamespaceId, &NamespaceNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (NamespaceId(i), node))
    }

    /// Strict ancestors of `id`, nearest first.
    ///
    /// Walking stops after as many steps as there are nodes, which only
    /// matters if the arena was corrupted into a cycle.
    pub fn ancestors(&self, id: NamespaceId) -> Vec<NamespaceId> {
        let mut ancestors = Vec::new();
        let mut current = self.get(id).and_then(|node| node.parent);
        while let Some(parent) = current {
            if ancestors.len() >= self.nodes.len() || parent == id {
                break;
            }
            ancestors.push(parent);
            current = self.nodes[parent.0].parent;
        }
        ancestors
    }

    /// Names from the root down to `id`.
    pub fn path(&self, id: NamespaceId) -> Vec<String> {
        let mut path: Vec<String> = self
            .ancestors(id)
            .into_iter()
            .rev()
            .map(|ancestor| self.nodes[ancestor.0].name.clone())
            .collect();
        if let Some(node) = self.get(id) {
            path.push(node.name.clone());
        }
        path
    }

    /// Check a root-to-leaf chain and return the leaf.
    ///
    /// Every name must be registered and each must be the parent of the next.
    pub fn leaf_of(&self, chain: &[String]) -> std::result::Result<NamespaceId, String> {
        let mut previous: Option<NamespaceId> = None;
        for name in chain {
            let id = self
                .id_of(name)
                .ok_or_else(|| format!("namespace '{}' is not registered", name))?;
            if let Some(previous) = previous {
                if self.nodes[id.0].parent != Some(previous) {
                    return Err(format!(
                        "namespace '{}' is not nested under '{}'",
                        name, self.nodes[previous.0].name
                    ));
                }
            }
            previous = Some(id);
        }
        previous.ok_or_else(|| "empty namespace chain".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> NamespaceTree {
        let mut tree = NamespaceTree::new();
        tree.register("api", None).unwrap();
        tree.register("v1", Some("api")).unwrap();
        tree.register("admin", Some("v1")).unwrap();
        tree
    }

    #[test]
    fn test_register_links_parent_and_children() {
        let tree = tree();
        let api = tree.id_of("api").unwrap();
        let v1 = tree.id_of("v1").unwrap();
        assert_eq!(tree.get(v1).unwrap().parent, Some(api));
        assert_eq!(tree.get(api).unwrap().children, vec![v1]);
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_register_rejects_bad_input() {
        let mut tree = tree();
        assert!(matches!(tree.register("api", None), Err(LimiterError::Configuration(_))));
        assert!(tree.register("orphan", Some("missing")).is_err());
        assert!(tree.register("self", Some("self")).is_err());
        assert!(tree.register("", None).is_err());
    }

    #[test]
    fn test_ancestors_and_path() {
        let tree = tree();
        let admin = tree.id_of("admin").unwrap();
        let names: Vec<_> = tree
            .ancestors(admin)
            .into_iter()
            .map(|id| tree.get(id).unwrap().name.clone())
            .collect();
        assert_eq!(names, vec!["v1", "api"]);
        assert_eq!(tree.path(admin), vec!["api", "v1", "admin"]);
    }

    #[test]
    fn test_leaf_of_chain() {
        let tree = tree();
        let chain = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert_eq!(tree.leaf_of(&chain(&["api", "v1"])), Ok(tree.id_of("v1").unwrap()));
        assert!(tree.leaf_of(&chain(&["api", "admin"])).is_err());
        assert!(tree.leaf_of(&chain(&["api", "v2"])).is_err());
        assert!(tree.leaf_of(&[]).is_err());
    }

    #[test]
    fn test_limits_and_exemptions() {
        let mut tree = tree();
        tree.add_limit("v1", Arc::new(LimitSpec::new("1/second"))).unwrap();
        tree.set_exemption("api", ExemptionScope::META).unwrap();
        assert!(tree.add_limit("v9", Arc::new(LimitSpec::new("1/second"))).is_err());

        let v1 = tree.id_of("v1").unwrap();
        assert!(tree.get(v1).unwrap().limits_override());
        let api = tree.id_of("api").unwrap();
        assert_eq!(tree.get(api).unwrap().exemption, ExemptionScope::META);
    }
}
