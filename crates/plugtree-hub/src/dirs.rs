//! Directory resolution and per-code-root manifests
//!
//! A location is either a plain directory or a dotted code-root name looked up
//! under every search path. Code roots may carry a manifest (`config.yaml`) that
//! contributes directories to dynamic namespaces ("dynes").

use crate::library::Library;
use plugtree_core::{Error, HubConfig, Map, Result, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Where a node's plugin units live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Path(PathBuf),
    /// Existing directory, or a dotted code-root name such as `acme.plugins`.
    Name(String),
}

impl From<PathBuf> for Location {
    fn from(p: PathBuf) -> Self {
        Self::Path(p)
    }
}

impl From<&Path> for Location {
    fn from(p: &Path) -> Self {
        Self::Path(p.to_path_buf())
    }
}

impl From<&str> for Location {
    fn from(s: &str) -> Self {
        Self::Name(s.to_string())
    }
}

impl From<String> for Location {
    fn from(s: String) -> Self {
        Self::Name(s)
    }
}

/// Merged view of every code-root manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicManifest {
    /// dyne name -> backing directories
    pub dyne: BTreeMap<String, Vec<PathBuf>>,
    pub config: Map,
    pub cli_config: Map,
    pub subcommands: Map,
    /// Imported code namespaces that resolved against the library.
    pub imports: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawManifest {
    dyne: BTreeMap<String, Vec<String>>,
    config: Map,
    cli_config: Map,
    subcommands: Map,
    #[serde(rename = "import")]
    imports: Vec<String>,
}

impl DynamicManifest {
    /// Fold another root's manifest into this one: lists union, maps merge recursively.
    pub fn merge(&mut self, other: DynamicManifest) {
        for (name, dirs) in other.dyne {
            let entry = self.dyne.entry(name).or_default();
            for dir in dirs {
                if !entry.contains(&dir) {
                    entry.push(dir);
                }
            }
            entry.sort();
        }
        merge_map(&mut self.config, other.config);
        merge_map(&mut self.cli_config, other.cli_config);
        merge_map(&mut self.subcommands, other.subcommands);
        for import in other.imports {
            if !self.imports.contains(&import) {
                self.imports.push(import);
            }
        }
    }

    pub fn dyne_dirs(&self, name: &str) -> &[PathBuf] {
        self.dyne.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Recursively merge `src` into `dest`. Objects merge key by key, arrays union,
/// anything else is overwritten.
pub fn update(dest: &mut Value, src: Value) {
    match (dest, src) {
        (Value::Object(d), Value::Object(s)) => merge_map(d, s),
        (Value::Array(d), Value::Array(s)) => {
            for item in s {
                if !d.contains(&item) {
                    d.push(item);
                }
            }
        }
        (d, s) => *d = s,
    }
}

fn merge_map(dest: &mut Map, src: Map) {
    for (key, value) in src {
        match dest.get_mut(&key) {
            Some(existing) => update(existing, value),
            None => {
                dest.insert(key, value);
            }
        }
    }
}

/// Parse one manifest file, resolving dyne paths against its directory.
pub fn parse_manifest(path: &Path) -> Result<DynamicManifest> {
    let content = std::fs::read_to_string(path)?;
    let raw: RawManifest = if content.trim().is_empty() {
        RawManifest::default()
    } else {
        serde_yaml::from_str(&content)
            .map_err(|e| Error::manifest(path.display().to_string(), e.to_string()))?
    };
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let dyne = raw
        .dyne
        .into_iter()
        .map(|(name, rels)| {
            let dirs = rels
                .iter()
                .map(|rel| rel.split('.').fold(base.to_path_buf(), |p, part| p.join(part)))
                .collect();
            (name, dirs)
        })
        .collect();
    Ok(DynamicManifest {
        dyne,
        config: raw.config,
        cli_config: raw.cli_config,
        subcommands: raw.subcommands,
        imports: raw.imports,
    })
}

#[derive(Debug, Clone)]
pub struct DirResolver {
    search_paths: Vec<PathBuf>,
    manifest_name: String,
}

impl DirResolver {
    pub fn new(search_paths: Vec<PathBuf>, manifest_name: impl Into<String>) -> Self {
        Self {
            search_paths,
            manifest_name: manifest_name.into(),
        }
    }

    pub fn from_config(config: &HubConfig) -> Self {
        Self::new(config.effective_search_paths(), config.manifest_name.clone())
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Resolve locations to a sorted, de-duplicated directory list.
    pub fn walk(&self, locations: &[Location]) -> Vec<PathBuf> {
        let mut out = BTreeSet::new();
        for location in locations {
            match location {
                Location::Path(p) => {
                    if p.is_dir() {
                        out.insert(p.clone());
                    } else {
                        debug!("Dropping missing directory {}", p.display());
                    }
                }
                Location::Name(name) => {
                    let direct = Path::new(name);
                    if direct.is_dir() {
                        out.insert(direct.to_path_buf());
                        continue;
                    }
                    let found: Vec<PathBuf> = self
                        .search_paths
                        .iter()
                        .map(|sp| name.split('.').fold(sp.clone(), |p, part| p.join(part)))
                        .filter(|p| p.is_dir())
                        .collect();
                    if found.is_empty() {
                        debug!("Dropping unresolvable location {}", name);
                    }
                    out.extend(found);
                }
            }
        }
        out.into_iter().collect()
    }

    /// Immediate subdirectories of every search path, plus `*.link` targets.
    pub fn code_roots(&self) -> Vec<PathBuf> {
        let mut roots = BTreeSet::new();
        for sp in &self.search_paths {
            for entry in WalkDir::new(sp)
                .min_depth(1)
                .max_depth(1)
                .follow_links(true)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if entry.file_type().is_dir() {
                    roots.insert(path.to_path_buf());
                } else if path.extension().and_then(|e| e.to_str()) == Some("link") {
                    match std::fs::read_to_string(path) {
                        Ok(target) => {
                            let target = PathBuf::from(target.trim());
                            if target.is_dir() {
                                roots.insert(target);
                            }
                        }
                        Err(e) => warn!("Unreadable link file {}: {}", path.display(), e),
                    }
                }
            }
        }
        roots.into_iter().collect()
    }

    /// Merge the manifests of every code root. Unparseable manifests are skipped
    /// with a warning; imports not present in the library are dropped.
    pub fn dynamic(&self, library: &Library) -> DynamicManifest {
        let mut merged = DynamicManifest::default();
        for root in self.code_roots() {
            let path = root.join(&self.manifest_name);
            if !path.is_file() {
                continue;
            }
            match parse_manifest(&path) {
                Ok(manifest) => {
                    debug!("Read manifest {}", path.display());
                    merged.merge(manifest);
                }
                Err(e) => warn!("Skipping manifest {}: {}", path.display(), e),
            }
        }
        merged.imports.retain(|ns| {
            let found = library.has_namespace(ns);
            if !found {
                debug!("Dropping unresolved import {}", ns);
            }
            found
        });
        merged.imports.sort();
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_merges_recursively() {
        let mut dest = json!({"a": {"x": 1, "l": [1]}, "b": 2});
        update(&mut dest, json!({"a": {"y": 2, "l": [1, 2]}, "b": 3}));
        assert_eq!(dest, json!({"a": {"x": 1, "y": 2, "l": [1, 2]}, "b": 3}));
    }

    #[test]
    fn walk_dotted_names_and_drops_unknown() {
        let sp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(sp.path().join("acme").join("plugins")).unwrap();
        let resolver = DirResolver::new(vec![sp.path().to_path_buf()], "config.yaml");
        let dirs = resolver.walk(&[
            Location::from("acme.plugins"),
            Location::from("no.such.root"),
            Location::from(sp.path().join("acme")),
            Location::from("acme.plugins"),
        ]);
        assert_eq!(
            dirs,
            vec![sp.path().join("acme"), sp.path().join("acme").join("plugins")]
        );
    }

    #[test]
    fn manifest_dyne_paths_are_dotted() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("config.yaml");
        std::fs::write(
            &path,
            "dyne:\n  tools:\n    - plugins.tools\nconfig:\n  tools:\n    level: 1\nimport:\n  - net\n",
        )
        .unwrap();
        let m = parse_manifest(&path).unwrap();
        assert_eq!(m.dyne_dirs("tools"), &[root.path().join("plugins").join("tools")]);
        assert_eq!(m.config["tools"], json!({"level": 1}));
        assert_eq!(m.imports, vec!["net".to_string()]);
    }

    #[test]
    fn bad_manifest_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("config.yaml");
        std::fs::write(&path, "dyne: [unclosed").unwrap();
        assert!(matches!(parse_manifest(&path), Err(Error::Manifest { .. })));
    }
}
