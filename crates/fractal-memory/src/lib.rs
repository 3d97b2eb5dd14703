//! fractal-memory - tiered memory, hybrid retrieval and reasoning bank.
//!
//! The working parts of the fractal memory system: SQLite-backed adapters
//! for the volatile (L0/L1) and graph (L2/L3) store contracts, the
//! `FractalMemory` orchestrator, the `HybridRetriever`, the `ReasoningBank`
//! and the `FractalAgent` facade that ties them to a completion provider.

pub mod agent;
pub mod embeddings;
pub mod graph;
pub mod memory;
pub mod migrations;
pub mod reasoning;
pub mod retrieval;
pub mod summarize;
pub mod testing;
pub mod volatile;

pub use agent::{AgentComponents, AgentReply, FractalAgent};
pub use embeddings::LocalEmbedder;
pub use graph::SqliteGraphStore;
pub use memory::FractalMemory;
pub use reasoning::{ReasoningBank, ReasoningOptions};
pub use retrieval::{HybridRetriever, RetrievedEpisode, SearchOutcome};
pub use volatile::SqliteVolatileStore;
