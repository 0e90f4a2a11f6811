//! Library - registry of native symbols that plugin unit files refer to
//!
//! A symbol is addressed as `namespace::name`. Unit files only carry names;
//! the code they stand for lives here.

use crate::function::Function;
use dashmap::DashMap;
use plugtree_core::Value;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Type descriptor exported by a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

impl ClassDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            doc: None,
        }
    }

    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.fields.push(name.into());
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }
}

#[derive(Debug, Clone)]
pub enum Export {
    Function(Function),
    Class(ClassDef),
    Value(Value),
}

#[derive(Clone, Default)]
pub struct Library {
    symbols: Arc<DashMap<String, Export>>,
}

impl Library {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_fn(&self, symbol: impl Into<String>, function: Function) -> &Self {
        self.register(symbol, Export::Function(function))
    }

    pub fn register_class(&self, symbol: impl Into<String>, class: ClassDef) -> &Self {
        self.register(symbol, Export::Class(class))
    }

    pub fn register_value(&self, symbol: impl Into<String>, value: impl Into<Value>) -> &Self {
        self.register(symbol, Export::Value(value.into()))
    }

    pub fn register(&self, symbol: impl Into<String>, export: Export) -> &Self {
        let symbol = symbol.into();
        tracing::debug!("Registered symbol: {}", symbol);
        self.symbols.insert(symbol, export);
        self
    }

    pub fn get(&self, symbol: &str) -> Option<Export> {
        self.symbols.get(symbol).map(|e| e.value().clone())
    }

    pub fn function(&self, symbol: &str) -> Option<Function> {
        match self.get(symbol)? {
            Export::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.contains_key(symbol)
    }

    pub fn remove(&self, symbol: &str) -> Option<Export> {
        self.symbols.remove(symbol).map(|(_, e)| e)
    }

    /// All registered symbols, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.symbols.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Whether any symbol lives under `ns` (or a nested namespace of it).
    pub fn has_namespace(&self, ns: &str) -> bool {
        let prefix = format!("{}::", ns.replace('.', "::"));
        self.symbols.iter().any(|e| e.key().starts_with(&prefix))
    }
}
