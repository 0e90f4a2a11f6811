//! Plugtree Core - Types, signatures, configuration, and error handling

pub mod config;
pub mod error;
pub mod signature;
pub mod types;

pub use config::{DyneConfig, HubConfig, LoaderConfig};
pub use error::{Error, Result};
pub use signature::{Convention, Param, ParamKind, Signature};
pub use types::*;
