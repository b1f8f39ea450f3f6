//! Core of the assetflow declarative pipeline runtime: template evaluation,
//! discovery, transfer and pipeline compilation.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod compiler;
pub mod config;
pub mod connector;
pub mod context;
pub mod discovery;
pub mod dispatch;
pub mod errors;
pub mod materialize;
pub mod partition;
pub mod result;
pub mod template;
pub mod transfer;

// Re-export public API for convenience
pub use compiler::{compile, load_pipeline, CompiledPipeline};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use errors::{DefinitionError, DiscoveryError, TransferError, TransferItemError};
pub use materialize::{MaterializeRequest, Materializer};
pub use result::TransferResult;
