use std::collections::HashMap;
use std::sync::RwLock;

use crate::model::NodeState;

/// Last known connection state per node id.
///
/// Advisory only: the node store stays the state of record.
#[derive(Debug, Default)]
pub struct ConnectionStates {
    states: RwLock<HashMap<String, NodeState>>,
}

impl ConnectionStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node_id: &str) -> Option<NodeState> {
        self.states
            .read()
            .ok()
            .and_then(|states| states.get(node_id).copied())
    }

    pub fn set(&self, node_id: &str, state: NodeState) {
        if let Ok(mut states) = self.states.write() {
            states.insert(node_id.to_string(), state);
        }
    }

    pub fn remove(&self, node_id: &str) -> Option<NodeState> {
        self.states
            .write()
            .ok()
            .and_then(|mut states| states.remove(node_id))
    }

    pub fn snapshot(&self) -> HashMap<String, NodeState> {
        self.states
            .read()
            .map(|states| states.clone())
            .unwrap_or_default()
    }

    /// Replace every entry with `states`.
    pub fn reset(&self, states: HashMap<String, NodeState>) {
        if let Ok(mut current) = self.states.write() {
            *current = states;
        }
    }
}
