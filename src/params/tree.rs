use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::dsp::ParameterRange;

/// A host-persisted parameter record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterNode {
    pub label: String,
    #[serde(flatten)]
    pub range: ParameterRange,
    /// Permanent holder position. Never reused for another node.
    pub position: usize,
}

/// Receives structural changes synchronously, in the order they happen.
pub trait TreeListener: Send {
    fn node_added(&mut self, node: &ParameterNode);
    fn node_removed(&mut self, node: &ParameterNode);
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TreeState {
    nodes: Vec<ParameterNode>,
    next_position: usize,
}

/// Ordered list of parameter nodes. Additions append; removals never
/// renumber the remaining positions.
#[derive(Default)]
pub struct ParameterTree {
    state: TreeState,
    listeners: Vec<Box<dyn TreeListener>>,
}

impl ParameterTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).context("Failed to read parameter tree")?;
        let mut state: TreeState =
            serde_json::from_str(&contents).context("Failed to parse parameter tree")?;

        let highest = state.nodes.iter().map(|n| n.position + 1).max().unwrap_or(0);
        state.next_position = state.next_position.max(highest);

        debug!(
            "Loaded {} parameter nodes from {:?}",
            state.nodes.len(),
            path
        );
        Ok(Self {
            state,
            listeners: Vec::new(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create parameter tree directory")?;
        }

        let json =
            serde_json::to_string_pretty(&self.state).context("Failed to serialize parameter tree")?;
        fs::write(path, json).context("Failed to write parameter tree")?;

        debug!("Saved parameter tree to {:?}", path);
        Ok(())
    }

    pub fn add_listener(&mut self, listener: Box<dyn TreeListener>) {
        self.listeners.push(listener);
    }

    pub fn nodes(&self) -> &[ParameterNode] {
        &self.state.nodes
    }

    pub fn len(&self) -> usize {
        self.state.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.nodes.is_empty()
    }

    /// Lowest position a new node could take; holders below it may be in use.
    pub fn next_position(&self) -> usize {
        self.state.next_position
    }

    pub fn get(&self, label: &str) -> Option<&ParameterNode> {
        self.state.nodes.iter().find(|n| n.label == label)
    }

    /// Appends a node at the next permanent position and returns it.
    pub fn add(&mut self, label: &str, range: ParameterRange) -> usize {
        let position = self.state.next_position;
        self.state.next_position += 1;

        let node = ParameterNode {
            label: label.to_string(),
            range,
            position,
        };
        for listener in &mut self.listeners {
            listener.node_added(&node);
        }
        self.state.nodes.push(node);
        position
    }

    /// Removes the first node with `label`.
    pub fn remove(&mut self, label: &str) -> Option<ParameterNode> {
        let index = self.state.nodes.iter().position(|n| n.label == label)?;
        let node = self.state.nodes.remove(index);
        for listener in &mut self.listeners {
            listener.node_removed(&node);
        }
        Some(node)
    }

    /// Removes every node. Positions already handed out stay retired.
    pub fn clear(&mut self) {
        while let Some(node) = self.state.nodes.pop() {
            for listener in &mut self.listeners {
                listener.node_removed(&node);
            }
        }
    }

    pub fn set_range(&mut self, label: &str, range: ParameterRange) -> bool {
        match self.state.nodes.iter_mut().find(|n| n.label == label) {
            Some(node) => {
                node.range = range;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl TreeListener for Recorder {
        fn node_added(&mut self, node: &ParameterNode) {
            self.0
                .lock()
                .unwrap()
                .push(format!("+{}@{}", node.label, node.position));
        }

        fn node_removed(&mut self, node: &ParameterNode) {
            self.0
                .lock()
                .unwrap()
                .push(format!("-{}@{}", node.label, node.position));
        }
    }

    #[test]
    fn test_positions_are_never_reused() {
        let mut tree = ParameterTree::new();
        assert_eq!(tree.add("a", ParameterRange::default()), 0);
        assert_eq!(tree.add("b", ParameterRange::default()), 1);

        tree.remove("a");
        assert_eq!(tree.add("c", ParameterRange::default()), 2);
        assert_eq!(tree.get("b").unwrap().position, 1);

        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.add("d", ParameterRange::default()), 3);
    }

    #[test]
    fn test_listeners_see_changes_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut tree = ParameterTree::new();
        tree.add_listener(Box::new(Recorder(Arc::clone(&events))));

        tree.add("a", ParameterRange::default());
        tree.add("b", ParameterRange::default());
        assert!(tree.remove("a").is_some());
        assert!(tree.remove("missing").is_none());

        assert_eq!(*events.lock().unwrap(), vec!["+a@0", "+b@1", "-a@0"]);
    }

    #[test]
    fn test_save_and_load_keep_positions() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("nested").join("tree.json");

        let mut tree = ParameterTree::new();
        tree.add("gain", ParameterRange::new(0.0, 2.0, 0.01, 1.0));
        tree.add("mute", ParameterRange::toggle());
        tree.remove("mute");
        tree.save(&path)?;

        let loaded = ParameterTree::load(&path)?;
        assert_eq!(loaded.nodes(), tree.nodes());
        assert_eq!(loaded.next_position(), 2);

        Ok(())
    }

    #[test]
    fn test_set_range() {
        let mut tree = ParameterTree::new();
        tree.add("gain", ParameterRange::default());

        let custom = ParameterRange::new(0.0, 0.5, 0.0, 0.25);
        assert!(tree.set_range("gain", custom));
        assert_eq!(tree.get("gain").unwrap().range, custom);
        assert!(!tree.set_range("other", custom));
    }
}
