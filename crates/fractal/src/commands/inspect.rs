//! Dump per-tier counters.

use serde_json::json;

use fractal_core::error::Result;
use fractal_core::MemoryOptions;
use fractal_memory::FractalMemory;

pub async fn run(options: &MemoryOptions, as_json: bool) -> Result<()> {
    let (volatile, graph) = super::open_stores(options)?;
    let dropped = volatile.l0_dropped_count(&options.user_id).await?;

    let memory = FractalMemory::new(options.clone(), volatile, graph, None, None);
    let stats = memory.get_stats().await?;

    if as_json {
        let body = json!({
            "user_id": options.user_id,
            "l0_size": stats.l0_size,
            "l1_size": stats.l1_size,
            "l2_size": stats.l2_size,
            "l3_size": stats.l3_size,
            "l0_avg_importance": stats.l0_avg_importance,
            "l1_avg_importance": stats.l1_avg_importance,
            "l0_dropped": dropped,
            "last_consolidation": stats.last_consolidation_at.map(|t| t.to_rfc3339()),
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        println!("user:               {}", options.user_id);
        println!("L0 (working log):   {}", stats.l0_size);
        println!("L1 (sessions):      {}", stats.l1_size);
        println!("L2 (episodes):      {}", stats.l2_size);
        println!("L3 (abstractions):  {}", stats.l3_size);
        println!("L0 avg importance:  {:.3}", stats.l0_avg_importance);
        println!("L1 avg importance:  {:.3}", stats.l1_avg_importance);
        println!("L0 dropped by cap:  {dropped}");
    }
    Ok(())
}
