//! Plugin loader: unit files -> installed units
//!
//! A unit file declares what a unit exports; the code behind each export is
//! looked up in the hub's library. Loading a unit runs its virtual gate,
//! classifies its exports, wraps every function in its contract chain, verifies
//! signatures, installs (or merges) it on the node, and finally runs its init
//! entry point.

use crate::contract::{classify, ContractFn, ContractUnit};
use crate::contracted::Contracted;
use crate::function::Function;
use crate::hub::Hub;
use crate::library::Export;
use crate::scanner::{self, ArtifactKind, Candidate, Exclusions};
use crate::stack;
use crate::tree::NodeId;
use crate::unit::{Bindings, LoadError, LoadErrorKind, LoadedUnit};
use crate::verify;
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use plugtree_core::{Args, Error, GateResult, LoaderConfig, Map, Result, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const GATE_ENTRY: &str = "__virtual__";
const INIT_ENTRY: &str = "__init__";
pub const INIT_UNIT: &str = "init";

/// Declaration of one plugin unit, as written in its file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitManifest {
    /// Public name, used instead of the file basename.
    pub virtualname: Option<String>,
    /// Library symbol of the virtual gate.
    #[serde(rename = "virtual")]
    pub gate: Option<String>,
    /// Library symbol run once after the unit is installed.
    pub init: Option<String>,
    /// Export allow-list (glob patterns). Overrides the omission rule when set.
    pub load: Vec<String>,
    /// export name -> public name
    pub func_alias: BTreeMap<String, String>,
    /// Extra contract units to apply to this unit.
    pub contracts: Vec<String>,
    /// export name -> library symbol
    pub exports: BTreeMap<String, String>,
    pub vars: Map,
}

impl UnitManifest {
    pub fn resolved_name(&self, basename: &str) -> String {
        self.virtualname.clone().unwrap_or_else(|| basename.to_string())
    }

    fn allow_list(&self, path: &Path) -> Result<Option<GlobSet>> {
        if self.load.is_empty() {
            return Ok(None);
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.load {
            let glob = Glob::new(pattern)
                .map_err(|e| Error::invalid_unit(path.display().to_string(), e.to_string()))?;
            builder.add(glob);
        }
        builder
            .build()
            .map(Some)
            .map_err(|e| Error::invalid_unit(path.display().to_string(), e.to_string()))
    }
}

/// Reads one artifact kind into a manifest.
#[async_trait]
pub trait UnitReader: Send + Sync {
    fn kind(&self) -> ArtifactKind;

    async fn read(&self, path: &Path) -> Result<UnitManifest>;
}

pub struct TomlReader;

#[async_trait]
impl UnitReader for TomlReader {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::Toml
    }

    async fn read(&self, path: &Path) -> Result<UnitManifest> {
        let content = tokio::fs::read_to_string(path).await?;
        toml::from_str(&content).map_err(|e| Error::invalid_unit(path.display().to_string(), e.to_string()))
    }
}

pub struct YamlReader;

#[async_trait]
impl UnitReader for YamlReader {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::Yaml
    }

    async fn read(&self, path: &Path) -> Result<UnitManifest> {
        let content = tokio::fs::read_to_string(path).await?;
        if content.trim().is_empty() {
            return Ok(UnitManifest::default());
        }
        serde_yaml::from_str(&content).map_err(|e| Error::invalid_unit(path.display().to_string(), e.to_string()))
    }
}

fn join_ref(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", base, name)
    }
}

/// Everything known about a candidate once its file has been read.
struct Prepared {
    basename: String,
    name: String,
    aliases: BTreeSet<String>,
    reference: String,
    origin: PathBuf,
    manifest: UnitManifest,
}

impl Hub {
    fn reader_for(&self, kind: ArtifactKind) -> Result<Arc<dyn UnitReader>> {
        self.reader(kind)
            .ok_or_else(|| Error::Internal(format!("no reader registered for {}", kind.as_str())))
    }

    fn exclusions(&self, loader: &LoaderConfig) -> Exclusions {
        Exclusions::from_config(loader, &self.config().manifest_name)
    }

    /// Scan a node's directories once.
    pub(crate) fn ensure_scan(&self, node: NodeId) {
        let pending = self.with_arena(|arena| {
            let data = arena.get(node);
            data.scan.is_none().then(|| (data.dirs.clone(), data.loader.clone()))
        });
        let Some((dirs, loader)) = pending else {
            return;
        };
        let map = scanner::scan(&dirs, &self.exclusions(&loader));
        self.with_arena_mut(|arena| {
            let data = arena.get_mut(node);
            if data.scan.is_none() {
                data.scan = Some(map);
            }
        });
    }

    /// Candidates matching `pick` whose load has not completed, in load order.
    fn pending(&self, node: NodeId, pick: impl Fn(&Candidate) -> bool) -> Vec<(ArtifactKind, Candidate)> {
        self.with_arena(|arena| {
            let Some(scan) = arena.get(node).scan.as_ref() else {
                return Vec::new();
            };
            scan.iter()
                .flat_map(|(kind, candidates)| candidates.values().map(move |c| (*kind, c)))
                .filter(|(_, c)| !c.is_loaded() && pick(*c))
                .map(|(kind, c)| (kind, c.clone()))
                .collect()
        })
    }

    /// Whether this task is inside a gate or init entry of `node`, i.e. a load
    /// of that node is further up the call stack.
    fn inside_entry(node: NodeId) -> bool {
        stack::any_frame(|f| f.node() == node && (f.name() == GATE_ENTRY || f.name() == INIT_ENTRY))
    }

    /// Load a candidate unless its load already completed. A caller arriving
    /// while another load runs waits for it. `false` when the load is skipped
    /// because it is the one currently running this task's entry point.
    async fn load_once(&self, node: NodeId, kind: ArtifactKind, candidate: &Candidate) -> Result<bool> {
        if candidate.slot.is_running() && Self::inside_entry(node) {
            return Ok(false);
        }
        let mut failed = None;
        candidate
            .slot
            .run(async {
                if let Err(e) = self.load_item(node, kind, candidate).await {
                    failed = Some(e);
                }
            })
            .await;
        failed.map_or(Ok(true), Err)
    }

    /// Load every candidate file named `basename` on the node.
    pub(crate) async fn load_basename(&self, node: NodeId, basename: &str) -> Result<usize> {
        self.ensure_scan(node);
        let mut count = 0;
        for (kind, candidate) in self.pending(node, |c| c.basename == basename) {
            if self.load_once(node, kind, &candidate).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Load one more unloaded candidate; `false` once none remain.
    pub(crate) async fn load_next(&self, node: NodeId) -> Result<bool> {
        if self.with_arena(|arena| arena.get(node).loaded_all) {
            return Ok(false);
        }
        self.ensure_scan(node);
        let mut skipped = false;
        for (kind, candidate) in self.pending(node, |_| true) {
            if self.load_once(node, kind, &candidate).await? {
                return Ok(true);
            }
            skipped = true;
        }
        if !skipped {
            self.with_arena_mut(|arena| arena.get_mut(node).loaded_all = true);
        }
        Ok(false)
    }

    /// Load the node's own `init` unit once. Its gate may deactivate the node.
    pub(crate) async fn ensure_node_init(&self, node: NodeId) -> Result<()> {
        let slot = self.with_arena(|arena| Arc::clone(&arena.get(node).init));
        if slot.is_done() || (slot.is_running() && Self::inside_entry(node)) {
            return Ok(());
        }
        let mut failed = None;
        slot.run(async {
            if let Err(e) = self.load_basename(node, INIT_UNIT).await {
                failed = Some(e);
            }
        })
        .await;
        failed.map_or(Ok(()), Err)
    }

    fn record_error(&self, node: NodeId, keys: &[&str], error: LoadError) {
        warn!("Failed to load {} from {}: {}", error.unit, error.origin.display(), error.message());
        self.with_arena_mut(|arena| {
            let data = arena.get_mut(node);
            for key in keys {
                data.load_errors.insert(key.to_string(), error.clone());
            }
        });
    }

    /// Record an invalid unit, or abort when failures are fatal.
    fn invalid(
        &self,
        node: NodeId,
        loader: &LoaderConfig,
        keys: &[&str],
        origin: &Path,
        err: Error,
    ) -> Result<Option<Arc<LoadedUnit>>> {
        if loader.stop_on_failures {
            return Err(err);
        }
        let unit = keys.first().copied().unwrap_or_default();
        self.record_error(node, keys, LoadError::invalid(unit, origin.to_path_buf(), err.to_string()));
        Ok(None)
    }

    /// Read, gate, populate, install and initialize one candidate.
    pub(crate) async fn load_item(
        &self,
        node: NodeId,
        kind: ArtifactKind,
        candidate: &Candidate,
    ) -> Result<Option<Arc<LoadedUnit>>> {
        let loader = self.with_arena(|arena| arena.get(node).loader.clone());
        let basename = candidate.basename.as_str();
        debug!("Loading {} ({})", candidate.path.display(), kind.as_str());

        let manifest = match self.reader_for(kind)?.read(&candidate.path).await {
            Ok(manifest) => manifest,
            Err(e) => return self.invalid(node, &loader, &[basename], &candidate.path, e),
        };
        let prepared = self.prepare_unit(node, candidate, manifest);
        let keys = [prepared.name.as_str(), basename];

        if loader.virtual_gates {
            if let Some(symbol) = prepared.manifest.gate.clone() {
                let verdict = match self.run_entry(node, &prepared, &symbol, GATE_ENTRY).await {
                    Ok(value) => GateResult::from_value(&value),
                    Err(e) => return self.invalid(node, &loader, &keys, &prepared.origin, e),
                };
                if !self.apply_gate(node, &prepared, verdict) {
                    return Ok(None);
                }
            }
        }

        let bindings = match self.populate(node, &prepared, &loader).await {
            Ok(bindings) => bindings,
            Err(Error::SignatureMismatch { unit, errors }) => {
                let error = LoadError {
                    unit: unit.clone(),
                    origin: prepared.origin.clone(),
                    kind: LoadErrorKind::Signature { errors: errors.clone() },
                };
                self.record_error(node, &keys, error);
                return Err(Error::SignatureMismatch { unit, errors });
            }
            Err(e) => return self.invalid(node, &loader, &keys, &prepared.origin, e),
        };

        let unit = self.install(node, &prepared, bindings, &loader);

        if loader.process_init {
            if let Some(symbol) = prepared.manifest.init.clone() {
                self.run_entry(node, &prepared, &symbol, INIT_ENTRY).await?;
            }
        }
        Ok(Some(unit))
    }

    fn prepare_unit(&self, node: NodeId, candidate: &Candidate, manifest: UnitManifest) -> Prepared {
        let name = manifest.resolved_name(&candidate.basename);
        let mut aliases = BTreeSet::from([candidate.basename.clone()]);
        if let Some(vname) = &manifest.virtualname {
            aliases.insert(vname.clone());
        }
        let reference = self.with_arena(|arena| join_ref(&arena.reference(node), &name));
        Prepared {
            basename: candidate.basename.clone(),
            name,
            aliases,
            reference,
            origin: candidate.path.clone(),
            manifest,
        }
    }

    /// Record a rejection; `true` if the unit may be installed.
    fn apply_gate(&self, node: NodeId, prepared: &Prepared, verdict: GateResult) -> bool {
        let (reason, key) = match verdict {
            GateResult::Allowed => return true,
            GateResult::Rejected(reason) => (reason, prepared.name.clone()),
            GateResult::RejectedAndRenamed { reason, alias } => (reason, alias),
        };
        let error = LoadError::rejected(key.clone(), prepared.origin.clone(), reason);
        self.record_error(node, &[key.as_str(), prepared.basename.as_str()], error);
        if prepared.basename == INIT_UNIT {
            info!("Deactivating {}: init gate rejected", prepared.reference);
            self.with_arena_mut(|arena| arena.get_mut(node).active = false);
        }
        false
    }

    /// Run a gate or init entry point in its own call frame.
    async fn run_entry(
        &self,
        node: NodeId,
        prepared: &Prepared,
        symbol: &str,
        entry: &str,
    ) -> Result<Value> {
        let function = self.library().function(symbol).ok_or_else(|| Error::UnknownSymbol {
            unit: prepared.reference.clone(),
            symbol: symbol.to_string(),
        })?;
        let entry = Arc::new(Contracted::new(
            function.renamed(entry),
            join_ref(&prepared.reference, entry),
            node,
            prepared.name.clone(),
            Default::default(),
        ));
        entry.call(self, Args::new()).await
    }

    /// Classify exports into buckets and wrap functions in their contract chains.
    async fn populate(&self, node: NodeId, prepared: &Prepared, loader: &LoaderConfig) -> Result<Bindings> {
        let manifest = &prepared.manifest;
        let allow = manifest.allow_list(&prepared.origin)?;
        let included = |name: &str| match &allow {
            Some(set) => set.is_match(name),
            None => !loader.omits(name),
        };

        let mut functions: BTreeMap<String, Function> = BTreeMap::new();
        let mut bindings = Bindings::default();
        for (export, symbol) in &manifest.exports {
            if !included(export) {
                continue;
            }
            let public = manifest.func_alias.get(export).unwrap_or(export).clone();
            match self.library().get(symbol) {
                Some(Export::Function(f)) if !loader.omit_func => {
                    functions.insert(public.clone(), f.renamed(public));
                }
                Some(Export::Class(c)) if !loader.omit_class => {
                    bindings.classes.insert(public, c);
                }
                Some(Export::Value(v)) if !loader.omit_vars => {
                    bindings.variables.insert(public, v);
                }
                Some(_) => {}
                None => {
                    return Err(Error::UnknownSymbol {
                        unit: prepared.reference.clone(),
                        symbol: symbol.clone(),
                    })
                }
            }
        }
        if !loader.omit_vars {
            for (name, value) in &manifest.vars {
                if included(name) {
                    bindings.variables.entry(name.clone()).or_insert_with(|| value.clone());
                }
            }
        }

        let mut wanted = prepared.aliases.clone();
        wanted.insert(prepared.name.clone());
        wanted.extend(manifest.contracts.iter().cloned());
        let targets: Vec<String> = functions.keys().cloned().collect();
        let mut discovery = self.discover(node, &wanted, &targets).await?;

        if prepared.name != INIT_UNIT {
            verify::unit(&prepared.reference, &functions, &discovery.signatures)?;
        }

        for (name, function) in functions {
            let chain = discovery.chains.remove(&name).unwrap_or_default();
            let reference = join_ref(&prepared.reference, &name);
            let contracted = Contracted::new(function, reference, node, prepared.name.clone(), chain);
            bindings.functions.insert(name, Arc::new(contracted));
        }
        Ok(bindings)
    }

    /// Install a new unit or fold this source into the existing one.
    fn install(
        &self,
        node: NodeId,
        prepared: &Prepared,
        bindings: Bindings,
        loader: &LoaderConfig,
    ) -> Arc<LoadedUnit> {
        self.with_arena_mut(|arena| {
            let taken: BTreeSet<String> = arena.get(node).children.keys().cloned().collect();
            let data = arena.get_mut(node);
            let unit = match data.units.get(&prepared.name) {
                Some(existing) => {
                    debug!(
                        "Merging {} into {} ({})",
                        prepared.origin.display(),
                        prepared.reference,
                        loader.merge
                    );
                    existing.merge(
                        prepared.origin.clone(),
                        prepared.aliases.clone(),
                        bindings,
                        loader.merge,
                    );
                    Arc::clone(existing)
                }
                None => {
                    let unit = Arc::new(LoadedUnit::new(
                        prepared.name.clone(),
                        node,
                        prepared.reference.clone(),
                        prepared.origin.clone(),
                        prepared.aliases.clone(),
                        bindings,
                    ));
                    data.units.insert(prepared.name.clone(), Arc::clone(&unit));
                    unit
                }
            };
            for alias in &prepared.aliases {
                if alias == &prepared.name {
                    continue;
                }
                if taken.contains(alias) || data.units.contains_key(alias) {
                    warn!("Ignoring alias {} of {}: name is taken", alias, prepared.reference);
                    continue;
                }
                data.unit_aliases.insert(alias.clone(), prepared.name.clone());
            }
            unit
        })
    }

    /// Contract units of a node, loaded on first use.
    pub(crate) async fn contract_units(&self, node: NodeId) -> Result<Arc<Vec<Arc<ContractUnit>>>> {
        let (cached, dirs, rdirs, loader, reference) = self.with_arena(|arena| {
            let data = arena.get(node);
            (
                data.contracts.clone(),
                data.contract_dirs.clone(),
                data.recursive_contract_dirs.clone(),
                data.loader.clone(),
                arena.reference(node),
            )
        });
        if let Some(units) = cached {
            return Ok(units);
        }

        let exclusions = self.exclusions(&loader);
        let mut units = Vec::new();
        for (dir_set, recursive) in [(dirs, false), (rdirs, true)] {
            let subdir = if recursive { &loader.recursive_contracts_dir } else { &loader.contracts_dir };
            let base = join_ref(&reference, subdir);
            for (kind, candidates) in scanner::scan(&dir_set, &exclusions) {
                for candidate in candidates.values() {
                    match self.load_contract_unit(kind, candidate, &base, recursive).await {
                        Ok(unit) => units.push(Arc::new(unit)),
                        Err(e) if loader.stop_on_failures => return Err(e),
                        Err(e) => warn!("Skipping contract unit {}: {}", candidate.path.display(), e),
                    }
                }
            }
        }
        debug!(
            "Loaded {} contract units for {}",
            units.len(),
            if reference.is_empty() { "hub" } else { reference.as_str() }
        );

        let units = Arc::new(units);
        Ok(self.with_arena_mut(|arena| {
            let data = arena.get_mut(node);
            Arc::clone(data.contracts.get_or_insert_with(|| Arc::clone(&units)))
        }))
    }

    async fn load_contract_unit(
        &self,
        kind: ArtifactKind,
        candidate: &Candidate,
        base: &str,
        recursive: bool,
    ) -> Result<ContractUnit> {
        let manifest = self.reader_for(kind)?.read(&candidate.path).await?;
        let name = manifest.resolved_name(&candidate.basename);
        let reference = join_ref(base, &name);
        let mut aliases = BTreeSet::from([candidate.basename.clone()]);
        aliases.extend(manifest.virtualname.clone());

        let mut hooks = Vec::new();
        for (export, symbol) in &manifest.exports {
            let public = manifest.func_alias.get(export).unwrap_or(export);
            let Some(phase) = classify(public) else {
                continue;
            };
            let function = self.library().function(symbol).ok_or_else(|| Error::UnknownSymbol {
                unit: reference.clone(),
                symbol: symbol.clone(),
            })?;
            hooks.push(ContractFn {
                name: public.clone(),
                reference: join_ref(&reference, public),
                phase,
                function: function.renamed(public.clone()),
            });
        }
        hooks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(ContractUnit {
            name,
            aliases,
            recursive_source: recursive,
            hooks,
        })
    }

    /// Load every candidate of a node, in ascending (kind, path) order.
    pub(crate) async fn load_node(&self, node: NodeId) -> Result<()> {
        self.ensure_node_init(node).await?;
        if !self.with_arena(|arena| arena.is_active(node)) {
            debug!("Skipping inactive node {}", self.with_arena(|arena| arena.reference(node)));
            return Ok(());
        }
        while self.load_next(node).await? {}
        Ok(())
    }
}
