//! Namespace hierarchy, exemption flags and their cached resolution.

mod exemption;
mod resolver;
mod tree;

pub use exemption::ExemptionScope;
pub use resolver::{NamespaceLimit, ResolvedScope, ScopeLookup, ScopeSnapshot, ScopeTreeResolver};
pub use tree::{NamespaceId, NamespaceNode, NamespaceTree};
