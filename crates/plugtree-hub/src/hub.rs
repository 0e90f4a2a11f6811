//! Hub - the root of the namespace tree and the programmatic surface
//!
//! Everything hangs off a cheaply clonable `Hub` handle: node creation, lazy
//! resolution of dotted paths, calls through contract chains, reloads, and
//! dyne bootstrap.

use crate::contracted::Contracted;
use crate::dirs::{DirResolver, DynamicManifest};
use crate::function::BoxStream;
use crate::library::{ClassDef, Library};
use crate::loader::{TomlReader, UnitReader, YamlReader, INIT_UNIT};
use crate::scanner::{self, ArtifactKind};
use crate::stack;
use crate::tree::{Arena, NodeId, NodeInfo, NodeSpec, ROOT};
use crate::unit::{LoadError, LoadedUnit, Member};
use dashmap::DashMap;
use plugtree_core::{Args, Error, HubConfig, Result, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// What a dotted path resolved to.
#[derive(Clone)]
pub enum Resolved {
    Node(NodeId),
    Unit(Arc<LoadedUnit>),
    Function(Arc<Contracted>),
    Class(ClassDef),
    Variable(Value),
}

impl From<Member> for Resolved {
    fn from(member: Member) -> Self {
        match member {
            Member::Function(f) => Self::Function(f),
            Member::Class(c) => Self::Class(c),
            Member::Variable(v) => Self::Variable(v),
        }
    }
}

impl Resolved {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Node(_) => "node",
            Self::Unit(_) => "unit",
            Self::Function(_) => "function",
            Self::Class(_) => "class",
            Self::Variable(_) => "variable",
        }
    }

    pub fn node(&self) -> Option<NodeId> {
        match self {
            Self::Node(id) => Some(*id),
            _ => None,
        }
    }

    pub fn unit(&self) -> Option<&Arc<LoadedUnit>> {
        match self {
            Self::Unit(u) => Some(u),
            _ => None,
        }
    }

    pub fn function(&self) -> Option<&Arc<Contracted>> {
        match self {
            Self::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Variable(v) => Some(v),
            _ => None,
        }
    }
}

struct HubInner {
    config: HubConfig,
    library: Library,
    resolver: DirResolver,
    arena: RwLock<Arena>,
    readers: DashMap<ArtifactKind, Arc<dyn UnitReader>>,
    dynamic: RwLock<Option<Arc<DynamicManifest>>>,
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(library: Library) -> Self {
        Self::with_config(library, HubConfig::default())
    }

    pub fn with_config(library: Library, config: HubConfig) -> Self {
        let resolver = DirResolver::from_config(&config);
        let arena = Arena::new("hub", config.loader.clone());
        let readers: DashMap<ArtifactKind, Arc<dyn UnitReader>> = DashMap::new();
        readers.insert(ArtifactKind::Toml, Arc::new(TomlReader));
        readers.insert(ArtifactKind::Yaml, Arc::new(YamlReader));
        Self {
            inner: Arc::new(HubInner {
                config,
                library,
                resolver,
                arena: RwLock::new(arena),
                readers,
                dynamic: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn library(&self) -> &Library {
        &self.inner.library
    }

    pub fn resolver(&self) -> &DirResolver {
        &self.inner.resolver
    }

    /// Replace the reader for an artifact kind.
    pub fn register_reader(&self, reader: Arc<dyn UnitReader>) {
        self.inner.readers.insert(reader.kind(), reader);
    }

    pub(crate) fn reader(&self, kind: ArtifactKind) -> Option<Arc<dyn UnitReader>> {
        self.inner.readers.get(&kind).map(|r| Arc::clone(r.value()))
    }

    // Arena guards never outlive these closures, so no lock is held across an await.

    pub(crate) fn with_arena<R>(&self, f: impl FnOnce(&Arena) -> R) -> R {
        let arena = self.inner.arena.read().unwrap_or_else(|e| e.into_inner());
        f(&arena)
    }

    pub(crate) fn with_arena_mut<R>(&self, f: impl FnOnce(&mut Arena) -> R) -> R {
        let mut arena = self.inner.arena.write().unwrap_or_else(|e| e.into_inner());
        f(&mut arena)
    }

    // ============================================================
    // Nodes
    // ============================================================

    /// Add a node under the root. See [`Hub::add_child`].
    pub fn add_node(&self, spec: NodeSpec) -> Result<NodeId> {
        self.add_child(ROOT, spec)
    }

    /// Add a (possibly dotted) node under `parent`. Adding a name that already
    /// exists changes nothing and returns the existing node.
    pub fn add_child(&self, parent: NodeId, spec: NodeSpec) -> Result<NodeId> {
        if spec.name.is_empty() || spec.name.split('.').any(str::is_empty) {
            return Err(Error::Internal(format!("invalid node name '{}'", spec.name)));
        }
        if !self.with_arena(|arena| arena.contains(parent)) {
            return Err(Error::not_found(format!("node #{}", parent.index())));
        }

        let mut dirs = self.inner.resolver.walk(&spec.locations);
        if !spec.dynes.is_empty() {
            let dynamic = self.dynamic();
            for dyne in &spec.dynes {
                dirs.extend(dynamic.dyne_dirs(dyne).iter().filter(|d| d.is_dir()).cloned());
            }
            dirs.sort();
            dirs.dedup();
        }

        let segments: Vec<&str> = spec.name.split('.').collect();
        let (id, created, loader) = self.with_arena_mut(|arena| {
            let mut cur = parent;
            for seg in &segments[..segments.len() - 1] {
                let inherited = arena.get(cur).loader.clone();
                cur = arena.add_child(cur, seg, inherited).0;
            }
            let loader = spec.loader.clone().unwrap_or_else(|| arena.get(cur).loader.clone());
            let (id, created) = arena.add_child(cur, segments[segments.len() - 1], loader.clone());
            (id, created, loader)
        });

        if !created {
            debug!("Node {} already exists", self.reference(id));
            return Ok(id);
        }

        let mut contract_dirs = self.inner.resolver.walk(&spec.contract_locations);
        contract_dirs.extend(scanner::inline(&dirs, &loader.contracts_dir));
        let mut recursive_dirs = self.inner.resolver.walk(&spec.recursive_contract_locations);
        recursive_dirs.extend(scanner::inline(&dirs, &loader.recursive_contracts_dir));

        self.with_arena_mut(|arena| {
            let data = arena.get_mut(id);
            data.dirs = dirs;
            data.contract_dirs = contract_dirs;
            data.recursive_contract_dirs = recursive_dirs;
            data.aliases.extend(spec.aliases.iter().cloned());
            data.default_contracts = spec.default_contracts.clone();
        });
        info!("Added node {}", self.reference(id));
        Ok(id)
    }

    /// Configure the root node's own directories.
    pub fn set_root(&self, spec: NodeSpec) {
        let dirs = self.inner.resolver.walk(&spec.locations);
        let loader = self.config().loader.clone();
        let mut contract_dirs = self.inner.resolver.walk(&spec.contract_locations);
        contract_dirs.extend(scanner::inline(&dirs, &loader.contracts_dir));
        let mut recursive_dirs = self.inner.resolver.walk(&spec.recursive_contract_locations);
        recursive_dirs.extend(scanner::inline(&dirs, &loader.recursive_contracts_dir));
        self.with_arena_mut(|arena| {
            let data = arena.get_mut(ROOT);
            data.dirs = dirs;
            data.contract_dirs = contract_dirs;
            data.recursive_contract_dirs = recursive_dirs;
            data.default_contracts = spec.default_contracts;
            data.clear_loaded();
        });
    }

    /// Node at a dotted path, without loading anything.
    pub fn node(&self, path: &str) -> Option<NodeId> {
        self.with_arena(|arena| {
            if path.is_empty() {
                return Some(ROOT);
            }
            path.split('.').try_fold(ROOT, |cur, seg| arena.find_child(cur, seg))
        })
    }

    pub fn node_info(&self, id: NodeId) -> Option<NodeInfo> {
        self.with_arena(|arena| arena.contains(id).then(|| NodeInfo::capture(arena, id)))
    }

    pub fn reference(&self, id: NodeId) -> String {
        self.with_arena(|arena| arena.reference(id))
    }

    pub fn is_active(&self, id: NodeId) -> bool {
        self.with_arena(|arena| arena.is_active(id))
    }

    /// Child nodes sorted by name; depth-first when `recurse` is set.
    /// Inactive nodes and their subtrees are skipped.
    pub fn iter_nodes(&self, node: NodeId, recurse: bool) -> Vec<NodeId> {
        self.with_arena(|arena| {
            let mut out = Vec::new();
            let mut stack: Vec<NodeId> = arena.get(node).children.values().rev().copied().collect();
            while let Some(id) = stack.pop() {
                if !arena.get(id).active {
                    continue;
                }
                out.push(id);
                if recurse {
                    stack.extend(arena.get(id).children.values().rev().copied());
                }
            }
            out
        })
    }

    // ============================================================
    // Loading and resolution
    // ============================================================

    /// Load every unit of a node.
    pub async fn load_all(&self, node: NodeId) -> Result<()> {
        self.load_node(node).await
    }

    /// Load every unit of a node and of all its descendants.
    pub async fn load_all_recursive(&self, node: NodeId) -> Result<()> {
        self.load_node(node).await?;
        for id in self.iter_nodes(node, true) {
            self.load_node(id).await?;
        }
        Ok(())
    }

    /// Installed unit or alias on a node, or a member grafted from its init unit.
    fn lookup(&self, node: NodeId, name: &str) -> Option<Resolved> {
        self.with_arena(|arena| {
            if let Some(child) = arena.find_child(node, name) {
                return Some(Resolved::Node(child));
            }
            let data = arena.get(node);
            let unit = data
                .units
                .get(name)
                .or_else(|| data.unit_aliases.get(name).and_then(|n| data.units.get(n)));
            if let Some(unit) = unit {
                return Some(Resolved::Unit(Arc::clone(unit)));
            }
            data.units
                .get(INIT_UNIT)
                .and_then(|init| init.member(name))
                .map(Resolved::from)
        })
    }

    /// Resolve one name on a node, loading on miss.
    async fn resolve_in(&self, node: NodeId, name: &str, path: &str) -> Result<Resolved> {
        if let Some(found) = self.lookup(node, name) {
            return Ok(found);
        }
        self.ensure_node_init(node).await?;
        if !self.is_active(node) {
            return Err(self.inactive_error(node, path));
        }
        if let Some(found) = self.lookup(node, name) {
            return Ok(found);
        }
        self.load_basename(node, name).await?;
        if let Some(found) = self.lookup(node, name) {
            return Ok(found);
        }
        // The name may be a virtual name of a file not loaded yet.
        while self.load_next(node).await? {
            if let Some(found) = self.lookup(node, name) {
                return Ok(found);
            }
        }
        match self.with_arena(|arena| arena.get(node).load_errors.get(name).cloned()) {
            Some(err) => Err(err.to_error()),
            None => Err(Error::not_found(path)),
        }
    }

    fn inactive_error(&self, node: NodeId, path: &str) -> Error {
        let rejected = self.with_arena(|arena| {
            arena
                .ancestors(node)
                .into_iter()
                .find(|id| !arena.get(*id).active)
                .and_then(|id| arena.get(id).load_errors.get(INIT_UNIT).cloned())
        });
        match rejected {
            Some(err) => err.to_error(),
            None => Error::not_found(path),
        }
    }

    /// Resolve a dotted path from the root, loading units on first touch.
    pub async fn resolve(&self, path: &str) -> Result<Resolved> {
        let mut current = Resolved::Node(ROOT);
        let mut walked = String::new();
        for seg in path.split('.').filter(|s| !s.is_empty()) {
            if !walked.is_empty() {
                walked.push('.');
            }
            walked.push_str(seg);
            current = match current {
                Resolved::Node(id) => self.resolve_in(id, seg, &walked).await?,
                Resolved::Unit(unit) => unit
                    .member(seg)
                    .map(Resolved::from)
                    .ok_or_else(|| Error::not_found(&walked))?,
                _ => return Err(Error::not_found(&walked)),
            };
        }
        Ok(current)
    }

    pub async fn resolve_unit(&self, path: &str) -> Result<Arc<LoadedUnit>> {
        match self.resolve(path).await? {
            Resolved::Unit(unit) => Ok(unit),
            other => Err(Error::Runtime(format!("{} is a {}, not a unit", path, other.kind()))),
        }
    }

    pub async fn resolve_function(&self, path: &str) -> Result<Arc<Contracted>> {
        match self.resolve(path).await? {
            Resolved::Function(f) => Ok(f),
            other => Err(Error::Runtime(format!("{} is a {}, not callable", path, other.kind()))),
        }
    }

    /// Resolve and call a function through its contract chain.
    pub async fn call(&self, path: &str, args: Args) -> Result<Value> {
        let function = self.resolve_function(path).await?;
        function.call(self, args).await
    }

    /// Resolve a stream function and open it lazily.
    pub async fn stream(&self, path: &str, args: Args) -> Result<BoxStream<'static, Result<Value>>> {
        let function = self.resolve_function(path).await?;
        Ok(function.stream(self, args))
    }

    /// Drop everything loaded on a node and rescan on next access. Other nodes
    /// are left alone.
    pub fn reload(&self, name: &str) -> Result<NodeId> {
        let id = self.node(name).ok_or_else(|| Error::not_found(name))?;
        self.with_arena_mut(|arena| arena.get_mut(id).clear_loaded());
        info!("Reloaded node {}", if name.is_empty() { "hub" } else { name });
        Ok(id)
    }

    /// Structured load failure recorded for `node.unit`.
    pub fn load_error(&self, path: &str) -> Option<LoadError> {
        let (node, unit) = match path.rsplit_once('.') {
            Some((node, unit)) => (self.node(node)?, unit),
            None => (ROOT, path),
        };
        self.with_arena(|arena| arena.get(node).load_errors.get(unit).cloned())
    }

    // ============================================================
    // Call stack
    // ============================================================

    /// Reference of the innermost executing function.
    pub fn current_reference(&self) -> Option<String> {
        stack::current().map(|frame| frame.reference().to_string())
    }

    /// The unit defining the innermost executing function.
    pub fn current_unit(&self) -> Option<Arc<LoadedUnit>> {
        let frame = stack::current()?;
        let active = frame.active();
        self.with_arena(|arena| arena.get(active.node()).units.get(active.unit()).cloned())
    }

    /// References of every active frame, innermost first.
    pub fn call_stack(&self) -> Vec<String> {
        stack::call_stack()
    }

    // ============================================================
    // Dynes
    // ============================================================

    /// Rescan every code root's manifest.
    pub fn scan_dynamic(&self) -> Arc<DynamicManifest> {
        let manifest = Arc::new(self.inner.resolver.dynamic(&self.inner.library));
        debug!("Found {} dynes", manifest.dyne.len());
        *self.inner.dynamic.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&manifest));
        manifest
    }

    /// Cached manifest, scanned on first use.
    pub fn dynamic(&self) -> Arc<DynamicManifest> {
        let cached = self.inner.dynamic.read().unwrap_or_else(|e| e.into_inner()).clone();
        cached.unwrap_or_else(|| self.scan_dynamic())
    }

    /// Turn every non-reserved subdirectory of a node's directories into a
    /// child node. Same-named subdirectories are grouped into one child.
    pub fn load_subdirs(&self, node: NodeId, recurse: bool) -> Result<Vec<NodeId>> {
        let mut added = Vec::new();
        let mut pending = vec![node];
        while let Some(current) = pending.pop() {
            let (dirs, loader) = self.with_arena(|arena| {
                let data = arena.get(current);
                (data.dirs.clone(), data.loader.clone())
            });
            if !self.is_active(current) {
                continue;
            }
            let exclusions = scanner::Exclusions::from_config(&loader, &self.config().manifest_name);
            let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
            for dir in &dirs {
                let Ok(entries) = std::fs::read_dir(dir) else {
                    continue;
                };
                for entry in entries.filter_map(|e| e.ok()) {
                    let path = entry.path();
                    let name = entry.file_name().to_string_lossy().to_string();
                    if !path.is_dir() || exclusions.excludes(&name) || name.contains('.') {
                        continue;
                    }
                    groups.entry(name).or_default().push(path);
                }
            }
            for (name, paths) in groups {
                let spec = paths
                    .into_iter()
                    .fold(NodeSpec::new(name).loader(loader.clone()), |spec, p| spec.location(p));
                let id = self.add_child(current, spec)?;
                added.push(id);
                if recurse {
                    pending.push(id);
                }
            }
        }
        Ok(added)
    }

    /// Add a root node per dyne, expand subdirectories and load, following
    /// the `[dynes]` settings.
    pub async fn load_dynes(&self) -> Result<Vec<NodeId>> {
        let settings = self.config().dynes.clone();
        let dynamic = self.scan_dynamic();
        let mut nodes = Vec::new();
        for name in dynamic.dyne.keys() {
            let id = self.add_node(NodeSpec::new(name.clone()).dyne(name.clone()))?;
            if settings.load_all_subdirs {
                self.load_subdirs(id, settings.recurse_subdirs)?;
            }
            if settings.load_all_dynes {
                self.load_all_recursive(id).await?;
            }
            nodes.push(id);
        }
        Ok(nodes)
    }
}
