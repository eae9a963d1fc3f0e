//! Cached resolution of namespace exemptions and inherited limits.
//!
//! Registrations mutate the tree under a write lock and bump a generation
//! counter. Readers work off an immutable [`ScopeSnapshot`] which is rebuilt
//! the first time it is requested after the generation moved.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::ratelimit::LimitSpec;

use super::exemption::ExemptionScope;
use super::tree::{NamespaceId, NamespaceTree};

/// A limit inherited from a namespace, together with its owner.
#[derive(Debug, Clone)]
pub struct NamespaceLimit {
    pub namespace: String,
    pub spec: Arc<LimitSpec>,
}

/// Effective state of one namespace.
#[derive(Debug, Clone, Default)]
pub struct ResolvedScope {
    pub namespace: String,
    /// Exempted limit categories.
    pub exemption: ExemptionScope,
    /// The namespace exempted itself beyond default and application limits
    /// and contributes no namespace limits.
    pub fully_exempt: bool,
    /// Namespace limits in root to leaf order.
    pub limits: Vec<NamespaceLimit>,
    /// Some resolved namespace limit replaces the default limits.
    pub overrides_defaults: bool,
}

/// Outcome of looking up a request's namespace chain.
#[derive(Debug, Clone)]
pub enum ScopeLookup {
    /// The request does not belong to any namespace.
    Root,
    Namespace(Arc<ResolvedScope>),
    /// The chain references an unregistered or misnested namespace.
    Unknown(String),
}

/// Immutable resolution of every namespace at one generation.
#[derive(Debug, Default)]
pub struct ScopeSnapshot {
    generation: u64,
    tree: NamespaceTree,
    resolved: Vec<Arc<ResolvedScope>>,
}

impl ScopeSnapshot {
    fn build(tree: &NamespaceTree, generation: u64) -> Self {
        let resolved = tree
            .nodes()
            .map(|(id, _)| Arc::new(resolve_node(tree, id)))
            .collect();
        Self {
            generation,
            tree: tree.clone(),
            resolved,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn tree(&self) -> &NamespaceTree {
        &self.tree
    }

    pub fn lookup(&self, chain: &[String]) -> ScopeLookup {
        if chain.is_empty() {
            return ScopeLookup::Root;
        }
        match self.tree.leaf_of(chain) {
            Ok(id) => match self.resolved.get(id.index()) {
                Some(resolved) => ScopeLookup::Namespace(resolved.clone()),
                None => ScopeLookup::Unknown(format!("namespace {:?} has no resolution", chain)),
            },
            Err(reason) => ScopeLookup::Unknown(reason),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ResolvedScope>> {
        let id = self.tree.id_of(name)?;
        self.resolved.get(id.index()).cloned()
    }
}

fn resolve_node(tree: &NamespaceTree, id: NamespaceId) -> ResolvedScope {
    let Some(node) = tree.get(id) else {
        return ResolvedScope::default();
    };
    let ancestors = tree.ancestors(id);
    let propagating: Vec<NamespaceId> = ancestors
        .iter()
        .copied()
        .filter(|a| {
            tree.get(*a)
                .is_some_and(|n| n.exemption.contains(ExemptionScope::DESCENDANTS))
        })
        .collect();

    let own = node.exemption & !ExemptionScope::ANCESTORS;
    let exemption = propagating
        .iter()
        .filter_map(|a| tree.get(*a))
        .fold(own, |acc, ancestor| acc | ancestor.exemption)
        .categories();
    let fully_exempt = !(own & !(ExemptionScope::DEFAULT | ExemptionScope::APPLICATION)).is_empty();

    let mut groups = Vec::new();
    if !fully_exempt {
        groups.push(node);
        let inherit =
            !node.limits_override() && !node.exemption.contains(ExemptionScope::ANCESTORS);
        if inherit {
            for ancestor in &ancestors {
                if propagating.contains(ancestor) {
                    continue;
                }
                let Some(ancestor) = tree.get(*ancestor) else {
                    continue;
                };
                groups.push(ancestor);
                if ancestor.limits_override() {
                    break;
                }
            }
        }
    }

    let limits: Vec<NamespaceLimit> = groups
        .into_iter()
        .rev()
        .flat_map(|group| {
            group.limits.iter().map(move |spec| NamespaceLimit {
                namespace: group.name.clone(),
                spec: spec.clone(),
            })
        })
        .collect();
    let overrides_defaults = limits.iter().any(|l| l.spec.overrides_defaults());

    ResolvedScope {
        namespace: node.name.clone(),
        exemption,
        fully_exempt,
        limits,
        overrides_defaults,
    }
}

/// Process wide owner of the namespace tree.
#[derive(Debug, Default)]
pub struct ScopeTreeResolver {
    tree: RwLock<NamespaceTree>,
    snapshot: RwLock<Arc<ScopeSnapshot>>,
    generation: AtomicU64,
}

impl ScopeTreeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut NamespaceTree) -> Result<T>) -> Result<T> {
        let mut tree = self.tree.write();
        let value = f(&mut tree)?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(generation, namespaces = tree.len(), "Namespace tree changed");
        Ok(value)
    }

    pub fn register(&self, name: &str, parent: Option<&str>) -> Result<NamespaceId> {
        self.mutate(|tree| tree.register(name, parent))
    }

    pub fn add_limit(&self, namespace: &str, limit: Arc<LimitSpec>) -> Result<()> {
        self.mutate(|tree| tree.add_limit(namespace, limit))
    }

    pub fn set_exemption(&self, namespace: &str, exemption: ExemptionScope) -> Result<()> {
        self.mutate(|tree| tree.set_exemption(namespace, exemption))
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.tree.read().id_of(namespace).is_some()
    }

    /// The snapshot for the current generation, rebuilding it when stale.
    pub fn snapshot(&self) -> Arc<ScopeSnapshot> {
        let current = self.generation();
        {
            let snapshot = self.snapshot.read();
            if snapshot.generation == current {
                return snapshot.clone();
            }
        }

        let rebuilt = {
            let tree = self.tree.read();
            Arc::new(ScopeSnapshot::build(&tree, self.generation()))
        };
        let mut slot = self.snapshot.write();
        if slot.generation < rebuilt.generation {
            *slot = rebuilt;
        }
        slot.clone()
    }

    pub fn lookup(&self, chain: &[String]) -> ScopeLookup {
        self.snapshot().lookup(chain)
    }
}
