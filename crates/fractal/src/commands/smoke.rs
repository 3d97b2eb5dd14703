//! End-to-end smoke test against the configured stores.

use std::sync::Arc;

use serde_json::Map;

use fractal_core::error::Result;
use fractal_core::traits::{GraphStore, VolatileStore};
use fractal_core::MemoryOptions;
use fractal_memory::{FractalMemory, SqliteGraphStore, SqliteVolatileStore};

pub async fn run(options: &MemoryOptions) -> Result<()> {
    // Unconfigured stores fall back to in-memory databases so the pipeline
    // itself is still exercised
    let (volatile, graph): (Arc<dyn VolatileStore>, Arc<dyn GraphStore>) =
        if options.volatile_url.is_empty() || options.graph_uri.is_empty() {
            println!("stores not configured, using in-memory databases");
            (
                Arc::new(SqliteVolatileStore::open_in_memory(options.l0_capacity)?),
                Arc::new(SqliteGraphStore::open_in_memory()?),
            )
        } else {
            super::open_stores(options)?
        };

    volatile.ping().await?;
    graph.ping().await?;
    println!("store connectivity: ok");

    let mut smoke_options = options.clone();
    smoke_options.batch_size = 3;
    let memory = FractalMemory::new(smoke_options, volatile, graph, None, None);

    let marker = format!("smoke-test marker {}", uuid_suffix());
    memory.remember(&marker, 0.9, Map::new()).await?;
    memory.remember("smoke-test filler one", 0.9, Map::new()).await?;
    memory.remember("smoke-test filler two", 0.9, Map::new()).await?;
    println!("remember: ok");

    let recalled = memory.recall("smoke-test marker", 5).await?;
    if recalled.is_empty() {
        return Err(fractal_core::Error::Other(
            "smoke-test marker was not recallable".into(),
        ));
    }
    println!("recall: ok ({} hits)", recalled.len());

    let counters = memory.consolidate().await?;
    println!(
        "consolidate: ok (promoted={}, decayed={}, forgotten={})",
        counters.promoted, counters.decayed, counters.forgotten
    );

    let stats = memory.get_stats().await?;
    println!(
        "stats: l0={} l1={} l2={} l3={}",
        stats.l0_size, stats.l1_size, stats.l2_size, stats.l3_size
    );

    println!("smoke test passed");
    Ok(())
}

fn uuid_suffix() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}
