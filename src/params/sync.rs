//! Reconciles the host parameter tree with a freshly compiled parameter list.
//!
//! Matching is by label (exact, case-sensitive). Nodes whose label vanished
//! are removed, unseen compiled parameters are appended as new nodes, and
//! surviving nodes keep both their order and their holder position. Holder
//! position is what binds a host handle to a zone, so reordering existing
//! nodes would silently cross-wire parameters.

use std::collections::{HashMap, HashSet};

use super::holder::{Binding, ChangeCallback};
use super::tree::{ParameterNode, ParameterTree};
use crate::dsp::{CompiledParameter, ParameterRange};

#[derive(Debug, Clone, PartialEq)]
pub struct NewNode {
    pub label: String,
    pub range: ParameterRange,
}

/// The structural edits that bring a tree in line with a compiled module.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reconciliation {
    /// One entry per node to remove, in tree order.
    pub to_remove: Vec<String>,
    /// Nodes to append, in compiled order.
    pub to_add: Vec<NewNode>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.to_remove.is_empty() && self.to_add.is_empty()
    }

    /// Applies removals first, then appends the additions.
    pub fn apply(&self, tree: &mut ParameterTree) {
        for label in &self.to_remove {
            tree.remove(label);
        }
        for node in &self.to_add {
            tree.add(&node.label, node.range);
        }
    }
}

pub fn reconcile(nodes: &[ParameterNode], compiled: &[CompiledParameter]) -> Reconciliation {
    let compiled_labels: HashSet<&str> = compiled.iter().map(|p| p.label.as_str()).collect();

    let to_remove = nodes
        .iter()
        .filter(|n| !compiled_labels.contains(n.label.as_str()))
        .map(|n| n.label.clone())
        .collect();

    let mut known: HashSet<&str> = nodes.iter().map(|n| n.label.as_str()).collect();
    let to_add = compiled
        .iter()
        .filter(|p| known.insert(p.label.as_str()))
        .map(|p| NewNode {
            label: p.label.clone(),
            range: p.range,
        })
        .collect();

    Reconciliation {
        to_remove,
        to_add,
    }
}

/// Holder bindings for every node that has a compiled counterpart. Each
/// binding uses the node's range, which the host may have customised.
pub fn bindings(
    nodes: &[ParameterNode],
    compiled: &[CompiledParameter],
    generation: u64,
    on_change: Option<&ChangeCallback>,
) -> Vec<(usize, Binding)> {
    let by_label: HashMap<&str, &CompiledParameter> =
        compiled.iter().map(|p| (p.label.as_str(), p)).collect();

    nodes
        .iter()
        .filter_map(|node| {
            let parameter = by_label.get(node.label.as_str())?;
            Some((
                node.position,
                Binding {
                    generation,
                    zone: parameter.zone,
                    range: node.range,
                    on_change: on_change.cloned(),
                },
            ))
        })
        .collect()
}
