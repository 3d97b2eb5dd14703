//! fractal-core - domain types and contracts for the fractal memory system.
//!
//! The hierarchical memory core of a conversational agent: tiered episodes
//! (L0 volatile log → L1 session summaries → L2 episode graph → L3
//! abstractions), hybrid retrieval, and a reasoning bank of task
//! strategies. This crate holds the types, the configuration surface, and
//! the narrow store/provider traits the adapters implement.

pub mod config;
pub mod error;
pub mod retry;
pub mod traits;
pub mod types;
pub mod util;

pub use config::{MemoryOptions, RetrievalWeights};
pub use error::{Error, Result};
pub use traits::{
    CompletionProvider, EmbeddingProvider, GraphStore, LockToken, VolatileStore,
};
pub use types::{
    ConsolidationCounters, Entity, EntityRef, Episode, Experience, GcCounters, L1Record,
    MemorySource, MemoryStats, Outcome, RecallResult, Scale, ScoredId, Strategy, Tier,
};
