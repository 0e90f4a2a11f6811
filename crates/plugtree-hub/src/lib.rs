//! Plugtree Hub - hierarchical plugin namespace with lazy loading and contracts
//!
//! Plugin units are declaration files (TOML or YAML) found in a node's
//! directories. They name native functions registered in a [`Library`]. Units
//! load on first access; every function is wrapped in the pre/call/post
//! contract chain discovered from contract units on the way up the tree.

pub mod blocking;
pub mod contract;
pub mod contracted;
pub mod dirs;
pub mod function;
pub mod hub;
pub mod library;
pub mod loader;
pub mod scanner;
pub mod stack;
pub mod tree;
pub mod unit;
pub mod verify;

pub use contract::{classify, ContractChain, ContractCtx, ContractFn, ContractPhase, ContractUnit, Phase};
pub use contracted::Contracted;
pub use dirs::{DirResolver, DynamicManifest, Location};
pub use function::{BoxFuture, BoxStream, Call, Function};
pub use hub::{Hub, Resolved};
pub use library::{ClassDef, Export, Library};
pub use loader::{TomlReader, UnitManifest, UnitReader, YamlReader};
pub use scanner::{ArtifactKind, Candidate, ScanMap};
pub use tree::{NodeId, NodeInfo, NodeSpec, ROOT};
pub use unit::{Bindings, LoadError, LoadErrorKind, LoadedUnit, Member, UnitIdentity};

pub use plugtree_core::{Args, Convention, Error, HubConfig, LoaderConfig, Param, Result, Signature, Value};
