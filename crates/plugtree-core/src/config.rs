//! Hub configuration
//!
//! All tunable loader parameters in one place. Loaded from TOML at startup,
//! falls back to defaults if no config file exists.

use crate::types::MergeMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable holding extra search paths (platform path-list syntax).
pub const SEARCH_PATH_ENV: &str = "PLUGTREE_PATH";

/// Top-level hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Directories whose subdirectories are code roots.
    pub search_paths: Vec<PathBuf>,
    /// Also treat the current working directory as a search path.
    pub include_cwd: bool,
    /// File name of the per-code-root manifest.
    pub manifest_name: String,
    /// Plugin loader behavior, used as the default for every node.
    pub loader: LoaderConfig,
    /// Dyne bootstrap behavior.
    pub dynes: DyneConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Exported names starting with any of these are not loaded.
    pub omit_start: Vec<String>,
    /// Exported names ending with any of these are not loaded.
    pub omit_end: Vec<String>,
    pub omit_func: bool,
    pub omit_class: bool,
    pub omit_vars: bool,
    /// Evaluate virtual gates.
    pub virtual_gates: bool,
    /// Run init entry points after load.
    pub process_init: bool,
    /// Precedence when two sources produce the same unit.
    pub merge: MergeMode,
    /// Inline subdirectory holding ordinary contract units.
    pub contracts_dir: String,
    /// Inline subdirectory holding recursive contract units.
    pub recursive_contracts_dir: String,
    /// Directory entries starting with this prefix are never scanned.
    pub reserved_prefix: String,
    /// Abort on an invalid unit instead of recording a load error.
    pub stop_on_failures: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DyneConfig {
    pub load_all_dynes: bool,
    pub load_all_subdirs: bool,
    pub recurse_subdirs: bool,
}

// ============================================================
// Defaults
// ============================================================

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            include_cwd: true,
            manifest_name: "config.yaml".into(),
            loader: LoaderConfig::default(),
            dynes: DyneConfig::default(),
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            omit_start: vec!["_".into()],
            omit_end: Vec::new(),
            omit_func: false,
            omit_class: false,
            omit_vars: false,
            virtual_gates: true,
            process_init: true,
            merge: MergeMode::FirstWins,
            contracts_dir: "contracts".into(),
            recursive_contracts_dir: "recursive_contracts".into(),
            reserved_prefix: "_".into(),
            stop_on_failures: false,
        }
    }
}

impl Default for DyneConfig {
    fn default() -> Self {
        Self { load_all_dynes: true, load_all_subdirs: true, recurse_subdirs: true }
    }
}

// ============================================================
// Loading
// ============================================================

impl HubConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Every search path: configured, then `PLUGTREE_PATH`, then the working directory.
    pub fn effective_search_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.search_paths.clone();
        if let Some(extra) = std::env::var_os(SEARCH_PATH_ENV) {
            paths.extend(std::env::split_paths(&extra).filter(|p| !p.as_os_str().is_empty()));
        }
        if self.include_cwd {
            if let Ok(cwd) = std::env::current_dir() {
                paths.push(cwd);
            }
        }
        let mut seen = std::collections::HashSet::new();
        paths.retain(|p| seen.insert(p.clone()));
        paths
    }
}

impl LoaderConfig {
    /// Whether an exported name falls under the prefix/suffix omission rule.
    pub fn omits(&self, name: &str) -> bool {
        self.omit_start.iter().any(|p| !p.is_empty() && name.starts_with(p.as_str()))
            || self.omit_end.iter().any(|s| !s.is_empty() && name.ends_with(s.as_str()))
    }

    /// Directory names that belong to contract sources, never to plugin units.
    pub fn reserved_dirs(&self) -> [&str; 2] {
        [self.contracts_dir.as_str(), self.recursive_contracts_dir.as_str()]
    }
}
