//! Fleet coordination engine for distributed iterative fixpoint computation.
//!
//! A fixed set of nodes jointly drives a data-dependent computation to a
//! fixpoint over a partitioned dataset, communicating only through per-node
//! coordination stores (an ordered key/value service with atomic scripting
//! and pub/sub) and their broadcast channels. The engine handles chunked
//! work distribution, peer progress tracking, work stealing, and the
//! per-round fleet-wide continue-or-stop agreement; the per-chunk domain
//! computation is supplied by the caller via [`engine::ChunkProcessor`].

pub mod config;
pub mod cursor;
pub mod distributor;
pub mod engine;
pub mod error;
pub mod fleet;
pub mod keys;
pub mod progress;
pub mod protocol;
pub mod stealer;
pub mod store;

pub use config::EngineConfig;
pub use engine::{ChunkContext, ChunkProcessor, Engine, RunSummary, Topology};
pub use error::{EngineError, Result};
