//! End-to-end scenarios over shared store clients.

use std::sync::Arc;

use serde_json::{json, Map};

use fractal_core::types::{Entity, EntityRef, Episode, Scale, Tier};
use fractal_core::{GraphStore, MemoryOptions, RetrievalWeights, VolatileStore};
use fractal_memory::testing::{StaticEmbedder, StubCompletion};
use fractal_memory::{
    AgentComponents, FractalAgent, FractalMemory, HybridRetriever, SqliteGraphStore,
    SqliteVolatileStore,
};

fn shared_stores(l0_cap: usize) -> (Arc<SqliteVolatileStore>, Arc<SqliteGraphStore>) {
    (
        Arc::new(SqliteVolatileStore::open_in_memory(l0_cap).unwrap()),
        Arc::new(SqliteGraphStore::open_in_memory().unwrap()),
    )
}

fn memory_for(
    user: &str,
    volatile: &Arc<SqliteVolatileStore>,
    graph: &Arc<SqliteGraphStore>,
    mutate: impl FnOnce(&mut MemoryOptions),
) -> Arc<FractalMemory> {
    let mut opts = MemoryOptions {
        user_id: user.into(),
        ..Default::default()
    };
    mutate(&mut opts);
    let volatile: Arc<dyn VolatileStore> = volatile.clone();
    let graph: Arc<dyn GraphStore> = graph.clone();
    FractalMemory::new(opts, volatile, graph, None, None)
}

// Two agents over the same stores never leak records across users,
// neither from the volatile log nor after promotion into the graph.
#[tokio::test]
async fn user_isolation_across_shared_stores() {
    let (volatile, graph) = shared_stores(500);

    let alice = FractalAgent::new(
        json!({"user_id": "alice", "batch_size": 3, "l2_threshold": 0.0}),
        volatile.clone(),
        graph.clone(),
        Some(Arc::new(StubCompletion::new("ok"))),
        None,
        AgentComponents::default(),
    )
    .unwrap();
    let bob = FractalAgent::new(
        json!({"user_id": "bob"}),
        volatile.clone(),
        graph.clone(),
        Some(Arc::new(StubCompletion::new("ok"))),
        None,
        AgentComponents::default(),
    )
    .unwrap();

    alice
        .memory()
        .remember("alice_secret_42", 1.0, Map::new())
        .await
        .unwrap();

    let leaked = bob.memory().recall("alice_secret_42", 5).await.unwrap();
    assert!(leaked.is_empty());

    // Promote the secret into the graph tier and check again
    for filler in ["filler one", "filler two"] {
        alice
            .memory()
            .remember(filler, 1.0, Map::new())
            .await
            .unwrap();
    }
    alice.memory().consolidate().await.unwrap();

    let leaked = bob.memory().recall("alice_secret_42", 5).await.unwrap();
    assert!(leaked.is_empty());
    let found = alice.memory().recall("alice_secret_42", 5).await.unwrap();
    assert!(!found.is_empty());
}

// Two concurrent consolidators for the same user: exactly one performs the
// batch, no duplicate L1 session appears and the lock is free afterwards.
#[tokio::test]
async fn concurrent_consolidation_is_exclusive() {
    let (volatile, graph) = shared_stores(500);
    let a = memory_for("u", &volatile, &graph, |o| o.batch_size = 4);
    let b = memory_for("u", &volatile, &graph, |o| o.batch_size = 4);

    for i in 0..4 {
        a.remember(&format!("observation {i}"), 0.9, Map::new())
            .await
            .unwrap();
    }

    let (ra, rb) = tokio::join!(a.consolidate(), b.consolidate());
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(
        ra.l0_to_l1 + rb.l0_to_l1,
        1,
        "exactly one caller performs the batch"
    );

    let sessions = volatile.l1_list("u", 50).await.unwrap();
    assert_eq!(sessions.len(), 1);

    // Lock released on exit
    let token = volatile
        .lock_acquire(
            &fractal_memory::volatile::keys::consolidation_lock("u"),
            std::time::Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert!(token.is_some());
}

// Appends past the L0 cap drop the oldest entries only; the surviving tail
// is uncorrupted and the drop count is observable.
#[tokio::test]
async fn backpressure_drops_oldest_without_corruption() {
    let (volatile, graph) = shared_stores(5);
    let memory = memory_for("u", &volatile, &graph, |o| {
        o.l0_capacity = 5;
        o.batch_size = 100;
    });

    for i in 0..8 {
        memory
            .remember(&format!("message number {i}"), 0.9, Map::new())
            .await
            .unwrap();
    }

    let stats = memory.get_stats().await.unwrap();
    assert_eq!(stats.l0_size, 5);
    assert_eq!(memory.dropped_count().await.unwrap(), 3);

    let read = volatile.l0_read("u", 10).await.unwrap();
    let contents: Vec<&str> = read.iter().map(|e| e.content.as_str()).collect();
    assert_eq!(
        contents,
        vec![
            "message number 7",
            "message number 6",
            "message number 5",
            "message number 4",
            "message number 3",
        ]
    );
}

// After L0 -> L1 -> L2 consolidation the original tokens remain reachable
// through summary search, even with the deterministic fallback summariser.
#[tokio::test]
async fn promotion_preserves_content_tokens() {
    let (volatile, graph) = shared_stores(500);
    let memory = memory_for("u", &volatile, &graph, |o| o.batch_size = 3);

    memory
        .remember("The quarterly report is due Friday.", 0.9, Map::new())
        .await
        .unwrap();
    memory
        .remember("Finance wants the quarterly numbers early.", 0.9, Map::new())
        .await
        .unwrap();
    memory
        .remember("Remember to attach the appendix.", 0.9, Map::new())
        .await
        .unwrap();

    let counters = memory.consolidate().await.unwrap();
    assert_eq!(counters.l0_to_l1, 1);

    // L1 substring search
    let from_l1 = memory
        .recall_tiers("quarterly", 5, &[Tier::L1])
        .await
        .unwrap();
    assert!(!from_l1.is_empty());
    assert!(from_l1[0].content.contains("quarterly"));

    // L2 keyword search over the promoted summary
    let from_graph = memory
        .recall_tiers("quarterly report", 5, &[Tier::L2, Tier::L3])
        .await
        .unwrap();
    assert!(!from_graph.is_empty());
    assert_eq!(from_graph[0].source, Tier::L2);
}

// Hybrid fusion at the recall surface: keyword, vector and graph hits all
// arrive, scores are normalised, the graph-only hit ranks last.
#[tokio::test]
async fn hybrid_recall_over_graph_tier() {
    let (volatile, graph) = shared_stores(500);

    let e1 = Episode::new("u", "python type hints are great", 0.8)
        .with_level(Tier::L2)
        .with_scale(Scale::Meso);
    graph.upsert_episode(&e1, &[]).await.unwrap();

    let mut e2 = Episode::new("u", "static typing pays off in large systems", 0.8)
        .with_level(Tier::L2)
        .with_scale(Scale::Meso);
    e2.embedding = Some(vec![1.0, 0.0, 0.0]);
    graph.upsert_episode(&e2, &[]).await.unwrap();

    let python = Entity::new("u", "Python", "concept");
    graph.upsert_entity(&python).await.unwrap();
    let e3 = Episode::new("u", "the interpreter release cadence changed", 0.8)
        .with_level(Tier::L2)
        .with_scale(Scale::Meso);
    graph
        .upsert_episode(
            &e3,
            &[EntityRef {
                entity_id: python.id.clone(),
                confidence: 1.0,
            }],
        )
        .await
        .unwrap();

    let embedder: Arc<StaticEmbedder> = Arc::new(StaticEmbedder::new(
        3,
        vec![("typing", vec![0.95, 0.05, 0.0])],
    ));
    let mut opts = MemoryOptions {
        user_id: "u".into(),
        ..Default::default()
    };
    opts.retrieval_weights = RetrievalWeights::default();
    let shared_volatile: Arc<dyn VolatileStore> = volatile.clone();
    let shared_graph: Arc<dyn GraphStore> = graph.clone();
    let memory = FractalMemory::new(opts, shared_volatile, shared_graph, Some(embedder), None);

    let results = memory
        .recall_tiers("Python typing", 3, &[Tier::L2, Tier::L3])
        .await
        .unwrap();
    assert_eq!(results.len(), 3);

    // Normalised per source: the best hit carries score 1.0
    assert!((results[0].score - 1.0).abs() < 1e-9);
    assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.score)));

    // The graph-only hit trails the keyword/vector hits
    assert_eq!(results[2].episode_id.as_deref(), Some(e3.id.as_str()));

    // Access bookkeeping reached the graph tier
    let touched = graph.get_episode("u", &e1.id).await.unwrap().unwrap();
    assert_eq!(touched.access_count, 1);
}

// A retriever shared between assemblies stays usable when one of them is
// closed: ownership of provided components remains with the caller.
#[tokio::test]
async fn shared_retriever_survives_agent_close() {
    let (volatile, graph) = shared_stores(500);
    let shared_graph: Arc<dyn GraphStore> = graph.clone();
    let retriever = Arc::new(HybridRetriever::new(
        shared_graph,
        None,
        "u",
        RetrievalWeights::default(),
    ));

    let agent = FractalAgent::new(
        json!({"user_id": "u"}),
        volatile.clone(),
        graph.clone(),
        None,
        None,
        AgentComponents {
            retriever: Some(retriever.clone()),
            ..Default::default()
        },
    )
    .unwrap();

    let episode = Episode::new("u", "shared retriever target", 0.8)
        .with_level(Tier::L2)
        .with_scale(Scale::Meso);
    graph.upsert_episode(&episode, &[]).await.unwrap();

    agent.close().await;

    let outcome = retriever.search("retriever target", 5).await.unwrap();
    assert_eq!(outcome.results.len(), 1);
}
