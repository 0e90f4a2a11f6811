//! Namespace arena: nodes addressed by index, parent/root as handles

use crate::contract::ContractUnit;
use crate::dirs::Location;
use crate::scanner::{LoadSlot, ScanMap};
use crate::unit::{LoadError, LoadedUnit};
use plugtree_core::LoaderConfig;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

/// The hub itself: its own parent and root.
pub const ROOT: NodeId = NodeId(0);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

pub(crate) struct NodeData {
    pub name: String,
    pub parent: NodeId,
    pub root: NodeId,
    pub children: BTreeMap<String, NodeId>,
    pub aliases: BTreeSet<String>,
    pub active: bool,
    pub dirs: Vec<PathBuf>,
    pub contract_dirs: Vec<PathBuf>,
    pub recursive_contract_dirs: Vec<PathBuf>,
    pub loader: LoaderConfig,
    pub default_contracts: Vec<String>,
    pub scan: Option<ScanMap>,
    pub units: BTreeMap<String, Arc<LoadedUnit>>,
    /// unit alias -> unit name
    pub unit_aliases: BTreeMap<String, String>,
    pub load_errors: BTreeMap<String, LoadError>,
    pub contracts: Option<Arc<Vec<Arc<ContractUnit>>>>,
    /// The node's own `init` unit.
    pub init: Arc<LoadSlot>,
    pub loaded_all: bool,
}

impl NodeData {
    fn new(name: impl Into<String>, parent: NodeId, loader: LoaderConfig) -> Self {
        Self {
            name: name.into(),
            parent,
            root: ROOT,
            children: BTreeMap::new(),
            aliases: BTreeSet::new(),
            active: true,
            dirs: Vec::new(),
            contract_dirs: Vec::new(),
            recursive_contract_dirs: Vec::new(),
            loader,
            default_contracts: Vec::new(),
            scan: None,
            units: BTreeMap::new(),
            unit_aliases: BTreeMap::new(),
            load_errors: BTreeMap::new(),
            contracts: None,
            init: Arc::default(),
            loaded_all: false,
        }
    }

    /// Forget everything derived from the backing directories.
    pub fn clear_loaded(&mut self) {
        self.scan = None;
        self.units.clear();
        self.unit_aliases.clear();
        self.load_errors.clear();
        self.contracts = None;
        self.init = Arc::default();
        self.loaded_all = false;
        self.active = true;
    }
}

pub(crate) struct Arena {
    nodes: Vec<NodeData>,
}

impl Arena {
    pub fn new(root_name: &str, loader: LoaderConfig) -> Self {
        Self {
            nodes: vec![NodeData::new(root_name, ROOT, loader)],
        }
    }

    pub fn get(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.0]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut NodeData {
        &mut self.nodes[id.0]
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id.0 < self.nodes.len()
    }

    /// Child by name, then by node alias.
    pub fn find_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let node = self.get(parent);
        if let Some(id) = node.children.get(name) {
            return Some(*id);
        }
        node.children
            .values()
            .copied()
            .find(|id| self.get(*id).aliases.contains(name))
    }

    /// Returns the existing child unchanged if the name is taken.
    pub fn add_child(&mut self, parent: NodeId, name: &str, loader: LoaderConfig) -> (NodeId, bool) {
        if let Some(id) = self.get(parent).children.get(name) {
            return (*id, false);
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(NodeData::new(name, parent, loader));
        self.get_mut(parent).children.insert(name.to_string(), id);
        (id, true)
    }

    /// Dotted path from the root; empty for the root itself.
    pub fn reference(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut cur = id;
        while cur != ROOT {
            let node = self.get(cur);
            parts.push(node.name.as_str());
            cur = node.parent;
        }
        parts.reverse();
        parts.join(".")
    }

    /// `id` first, then each ancestor up to and including the root.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = vec![id];
        let mut cur = id;
        while cur != ROOT {
            cur = self.get(cur).parent;
            out.push(cur);
        }
        out
    }

    /// A node and every ancestor must be active for it to load.
    pub fn is_active(&self, id: NodeId) -> bool {
        self.ancestors(id).iter().all(|n| self.get(*n).active)
    }
}

/// Description of a node to add.
#[derive(Debug, Clone, Default)]
pub struct NodeSpec {
    pub(crate) name: String,
    pub(crate) locations: Vec<Location>,
    pub(crate) contract_locations: Vec<Location>,
    pub(crate) recursive_contract_locations: Vec<Location>,
    pub(crate) dynes: Vec<String>,
    pub(crate) aliases: Vec<String>,
    pub(crate) default_contracts: Vec<String>,
    pub(crate) loader: Option<LoaderConfig>,
}

impl NodeSpec {
    /// `name` may be dotted; missing intermediate nodes are created.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn location(mut self, location: impl Into<Location>) -> Self {
        self.locations.push(location.into());
        self
    }

    pub fn contract_location(mut self, location: impl Into<Location>) -> Self {
        self.contract_locations.push(location.into());
        self
    }

    pub fn recursive_contract_location(mut self, location: impl Into<Location>) -> Self {
        self.recursive_contract_locations.push(location.into());
        self
    }

    /// Append the backing directories of a dynamic namespace.
    pub fn dyne(mut self, name: impl Into<String>) -> Self {
        self.dynes.push(name.into());
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn default_contract(mut self, name: impl Into<String>) -> Self {
        self.default_contracts.push(name.into());
        self
    }

    pub fn loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Snapshot of a node for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub name: String,
    pub reference: String,
    pub active: bool,
    pub dirs: Vec<PathBuf>,
    pub contract_dirs: Vec<PathBuf>,
    pub recursive_contract_dirs: Vec<PathBuf>,
    pub children: Vec<String>,
    pub units: Vec<String>,
    pub load_errors: BTreeMap<String, String>,
}

impl NodeInfo {
    pub(crate) fn capture(arena: &Arena, id: NodeId) -> Self {
        let node = arena.get(id);
        Self {
            name: node.name.clone(),
            reference: arena.reference(id),
            active: node.active,
            dirs: node.dirs.clone(),
            contract_dirs: node.contract_dirs.clone(),
            recursive_contract_dirs: node.recursive_contract_dirs.clone(),
            children: node.children.keys().cloned().collect(),
            units: node.units.keys().cloned().collect(),
            load_errors: node
                .load_errors
                .iter()
                .map(|(k, v)| (k.clone(), v.message()))
                .collect(),
        }
    }
}
