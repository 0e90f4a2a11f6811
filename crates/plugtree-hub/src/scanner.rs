//! Scanner - lists loadable artifacts in a directory set

use plugtree_core::LoaderConfig;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArtifactKind {
    Toml,
    Yaml,
}

impl ArtifactKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "toml" => Some(Self::Toml),
            "yaml" | "yml" => Some(Self::Yaml),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Toml => "toml",
            Self::Yaml => "yaml",
        }
    }
}

/// Completion state of a load that runs at most once.
///
/// The slot fills only when the load finishes. Callers arriving while it runs
/// wait for it; a load whose future is dropped leaves the slot empty and the
/// next caller starts over.
#[derive(Debug, Default)]
pub struct LoadSlot {
    done: OnceCell<()>,
    running: AtomicBool,
}

impl LoadSlot {
    pub fn is_done(&self) -> bool {
        self.done.initialized()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run `load` unless it already completed.
    pub async fn run<F: Future<Output = ()>>(&self, load: F) {
        let running = &self.running;
        self.done
            .get_or_init(|| async move {
                let _running = Running::enter(running);
                load.await;
            })
            .await;
    }
}

struct Running<'a>(&'a AtomicBool);

impl<'a> Running<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub basename: String,
    pub path: PathBuf,
    pub(crate) slot: Arc<LoadSlot>,
}

impl Candidate {
    /// Whether a load of this candidate ran to completion.
    pub fn is_loaded(&self) -> bool {
        self.slot.is_done()
    }
}

/// kind -> (directory-qualified path without extension) -> candidate
pub type ScanMap = BTreeMap<ArtifactKind, BTreeMap<String, Candidate>>;

/// Names the scanner never lists.
#[derive(Debug, Clone)]
pub struct Exclusions {
    pub prefix: String,
    pub names: Vec<String>,
}

impl Exclusions {
    pub fn from_config(loader: &LoaderConfig, manifest_name: &str) -> Self {
        Self {
            prefix: loader.reserved_prefix.clone(),
            names: loader
                .reserved_dirs()
                .iter()
                .map(|d| d.to_string())
                .chain(std::iter::once(manifest_name.to_string()))
                .collect(),
        }
    }

    pub fn excludes(&self, file_name: &str) -> bool {
        (!self.prefix.is_empty() && file_name.starts_with(&self.prefix))
            || self.names.iter().any(|n| n == file_name)
    }
}

/// Single-level listing of every directory in `dirs`.
pub fn scan(dirs: &[PathBuf], exclusions: &Exclusions) -> ScanMap {
    let mut map = ScanMap::new();
    for dir in dirs {
        for entry in WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            if exclusions.excludes(&file_name) {
                continue;
            }
            let path = entry.path();
            let (Some(kind), Some(stem)) = (ArtifactKind::from_path(path), path.file_stem()) else {
                continue;
            };
            let basename = stem.to_string_lossy().to_string();
            let id = path.with_extension("").to_string_lossy().to_string();
            map.entry(kind).or_default().insert(
                id,
                Candidate {
                    basename,
                    path: path.to_path_buf(),
                    slot: Arc::default(),
                },
            );
        }
    }
    debug!(
        "Scanned {} dirs: {} artifacts",
        dirs.len(),
        map.values().map(BTreeMap::len).sum::<usize>()
    );
    map
}

/// Existing `<dir>/<name>` subdirectories of each directory.
pub fn inline(dirs: &[PathBuf], name: &str) -> Vec<PathBuf> {
    dirs.iter()
        .map(|d| d.join(name))
        .filter(|d| d.is_dir())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_skips_reserved_and_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("alpha.toml"), "").unwrap();
        std::fs::write(root.join("beta.yml"), "").unwrap();
        std::fs::write(root.join("_hidden.toml"), "").unwrap();
        std::fs::write(root.join("config.yaml"), "").unwrap();
        std::fs::write(root.join("notes.txt"), "").unwrap();
        std::fs::create_dir(root.join("contracts")).unwrap();
        std::fs::write(root.join("contracts").join("alpha.toml"), "").unwrap();

        let ex = Exclusions::from_config(&LoaderConfig::default(), "config.yaml");
        let map = scan(&[root.to_path_buf()], &ex);

        let toml: Vec<_> = map[&ArtifactKind::Toml].values().map(|c| c.basename.as_str()).collect();
        let yaml: Vec<_> = map[&ArtifactKind::Yaml].values().map(|c| c.basename.as_str()).collect();
        assert_eq!(toml, vec!["alpha"]);
        assert_eq!(yaml, vec!["beta"]);
    }

    #[test]
    fn same_basename_in_two_dirs_is_kept_twice() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("net.toml"), "").unwrap();
        std::fs::write(b.path().join("net.toml"), "").unwrap();
        let ex = Exclusions::from_config(&LoaderConfig::default(), "config.yaml");
        let map = scan(&[a.path().to_path_buf(), b.path().to_path_buf()], &ex);
        assert_eq!(map[&ArtifactKind::Toml].len(), 2);
        assert!(map[&ArtifactKind::Toml].values().all(|c| c.basename == "net" && !c.is_loaded()));
    }

    #[test]
    fn exclusions_cover_contract_dirs_and_manifest() {
        let loader = LoaderConfig {
            contracts_dir: "hooks".into(),
            ..Default::default()
        };
        let ex = Exclusions::from_config(&loader, "plug.yaml");
        assert!(ex.excludes("hooks"));
        assert!(ex.excludes("recursive_contracts"));
        assert!(ex.excludes("plug.yaml"));
        assert!(!ex.excludes("contracts"));
    }

    #[tokio::test]
    async fn load_slot_runs_once_and_survives_cancellation() {
        let slot = LoadSlot::default();
        let cancelled = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            slot.run(tokio::time::sleep(std::time::Duration::from_secs(5))),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(!slot.is_done());
        assert!(!slot.is_running());

        let runs = std::sync::atomic::AtomicUsize::new(0);
        slot.run(async {
            runs.fetch_add(1, Ordering::SeqCst);
        })
        .await;
        slot.run(async {
            runs.fetch_add(1, Ordering::SeqCst);
        })
        .await;
        assert!(slot.is_done());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_dir_scans_empty() {
        let ex = Exclusions::from_config(&LoaderConfig::default(), "config.yaml");
        assert!(scan(&[PathBuf::from("/definitely/not/here")], &ex).is_empty());
    }
}
