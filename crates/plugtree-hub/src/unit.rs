//! Loaded plugin units and structured load failures

use crate::contracted::Contracted;
use crate::library::ClassDef;
use crate::tree::NodeId;
use plugtree_core::{Error, MergeMode, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The three symbol buckets of a unit.
#[derive(Clone, Default)]
pub struct Bindings {
    pub functions: BTreeMap<String, Arc<Contracted>>,
    pub classes: BTreeMap<String, ClassDef>,
    pub variables: BTreeMap<String, Value>,
}

impl Bindings {
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty() && self.classes.is_empty() && self.variables.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .functions
            .keys()
            .chain(self.classes.keys())
            .chain(self.variables.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn member(&self, name: &str) -> Option<Member> {
        if let Some(f) = self.functions.get(name) {
            return Some(Member::Function(Arc::clone(f)));
        }
        if let Some(c) = self.classes.get(name) {
            return Some(Member::Class(c.clone()));
        }
        self.variables.get(name).cloned().map(Member::Variable)
    }

    /// Union `other` into `self`. Conflicting keys keep the current entry under
    /// `FirstWins` and take `other`'s under `LatestWins`.
    pub fn absorb(&mut self, other: &Bindings, mode: MergeMode) {
        fn fold<V: Clone>(dest: &mut BTreeMap<String, V>, src: &BTreeMap<String, V>, mode: MergeMode) {
            for (k, v) in src {
                if mode == MergeMode::LatestWins || !dest.contains_key(k) {
                    dest.insert(k.clone(), v.clone());
                }
            }
        }
        fold(&mut self.functions, &other.functions, mode);
        fold(&mut self.classes, &other.classes, mode);
        fold(&mut self.variables, &other.variables, mode);
    }
}

#[derive(Clone)]
pub enum Member {
    Function(Arc<Contracted>),
    Class(ClassDef),
    Variable(Value),
}

/// Whether a unit came from one source or several.
#[derive(Clone)]
pub enum UnitIdentity {
    Singleton { origin: PathBuf },
    Merged {
        /// Load order.
        origins: Vec<PathBuf>,
        /// Each source's own bindings.
        by_origin: BTreeMap<PathBuf, Bindings>,
        mode: MergeMode,
    },
}

struct UnitState {
    aliases: BTreeSet<String>,
    bindings: Bindings,
    identity: UnitIdentity,
}

/// One installed plugin unit, owned by a node.
pub struct LoadedUnit {
    name: String,
    node: NodeId,
    reference: String,
    state: RwLock<UnitState>,
}

impl LoadedUnit {
    pub(crate) fn new(
        name: impl Into<String>,
        node: NodeId,
        reference: impl Into<String>,
        origin: PathBuf,
        aliases: BTreeSet<String>,
        bindings: Bindings,
    ) -> Self {
        Self {
            name: name.into(),
            node,
            reference: reference.into(),
            state: RwLock::new(UnitState {
                aliases,
                bindings,
                identity: UnitIdentity::Singleton { origin },
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, UnitState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, UnitState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Dotted path from the root.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn aliases(&self) -> BTreeSet<String> {
        self.read().aliases.clone()
    }

    pub fn bindings(&self) -> Bindings {
        self.read().bindings.clone()
    }

    pub fn identity(&self) -> UnitIdentity {
        self.read().identity.clone()
    }

    pub fn is_merged(&self) -> bool {
        matches!(self.read().identity, UnitIdentity::Merged { .. })
    }

    pub fn origins(&self) -> Vec<PathBuf> {
        match &self.read().identity {
            UnitIdentity::Singleton { origin } => vec![origin.clone()],
            UnitIdentity::Merged { origins, .. } => origins.clone(),
        }
    }

    /// A single source's own bindings, including sources superseded by a merge.
    pub fn origin(&self, path: &Path) -> Option<Bindings> {
        let state = self.read();
        match &state.identity {
            UnitIdentity::Singleton { origin } if origin == path => Some(state.bindings.clone()),
            UnitIdentity::Singleton { .. } => None,
            UnitIdentity::Merged { by_origin, .. } => by_origin.get(path).cloned(),
        }
    }

    pub fn member(&self, name: &str) -> Option<Member> {
        self.read().bindings.member(name)
    }

    pub fn function(&self, name: &str) -> Option<Arc<Contracted>> {
        self.read().bindings.functions.get(name).cloned()
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        self.read().bindings.variables.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.read().bindings.names()
    }

    /// Fold another source of the same unit into this one.
    pub(crate) fn merge(
        &self,
        origin: PathBuf,
        aliases: BTreeSet<String>,
        incoming: Bindings,
        mode: MergeMode,
    ) {
        let mut state = self.write();
        state.aliases.extend(aliases);
        let identity = std::mem::replace(
            &mut state.identity,
            UnitIdentity::Singleton { origin: PathBuf::new() },
        );
        let (mut origins, mut by_origin) = match identity {
            UnitIdentity::Singleton { origin: first } => {
                let mut by_origin = BTreeMap::new();
                by_origin.insert(first.clone(), state.bindings.clone());
                (vec![first], by_origin)
            }
            UnitIdentity::Merged { origins, by_origin, .. } => (origins, by_origin),
        };
        state.bindings.absorb(&incoming, mode);
        if !origins.contains(&origin) {
            origins.push(origin.clone());
        }
        by_origin.insert(origin, incoming);
        state.identity = UnitIdentity::Merged { origins, by_origin, mode };
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadErrorKind {
    Rejected { reason: String },
    Invalid { message: String },
    Signature { errors: Vec<String> },
}

/// A recorded failure to install a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadError {
    pub unit: String,
    pub origin: PathBuf,
    pub kind: LoadErrorKind,
}

impl LoadError {
    pub fn rejected(unit: impl Into<String>, origin: PathBuf, reason: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            origin,
            kind: LoadErrorKind::Rejected { reason: reason.into() },
        }
    }

    pub fn invalid(unit: impl Into<String>, origin: PathBuf, message: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            origin,
            kind: LoadErrorKind::Invalid { message: message.into() },
        }
    }

    pub fn message(&self) -> String {
        match &self.kind {
            LoadErrorKind::Rejected { reason } => reason.clone(),
            LoadErrorKind::Invalid { message } => message.clone(),
            LoadErrorKind::Signature { errors } => errors.join("\n"),
        }
    }

    pub fn to_error(&self) -> Error {
        match &self.kind {
            LoadErrorKind::Rejected { reason } => Error::load_rejected(&self.unit, reason),
            LoadErrorKind::Invalid { message } => {
                Error::invalid_unit(self.origin.display().to_string(), message)
            }
            LoadErrorKind::Signature { errors } => Error::SignatureMismatch {
                unit: self.unit.clone(),
                errors: errors.clone(),
            },
        }
    }
}
