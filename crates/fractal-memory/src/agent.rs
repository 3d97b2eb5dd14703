//! Agent facade: memory + retrieval + reasoning + completion.
//!
//! Runs the per-turn fast path (remember, recall, strategy hints, complete,
//! remember the reply) and owns the background slow path (periodic
//! consolidation and daily garbage collection). Pre-built components are
//! borrowed; internally constructed ones are owned and closed with the
//! agent.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fractal_core::error::Result;
use fractal_core::traits::{
    CompletionProvider, EmbeddingProvider, GraphStore, VolatileStore,
};
use fractal_core::types::Strategy;
use fractal_core::MemoryOptions;

use crate::memory::FractalMemory;
use crate::reasoning::{ReasoningBank, ReasoningOptions};
use crate::retrieval::HybridRetriever;

const SYSTEM_PROMPT: &str = "You are an attentive assistant with a long-term memory. \
Weave remembered context into your replies naturally; never enumerate your memory or \
say that you remember. Answer concisely.";

const FALLBACK_REPLY: &str =
    "I'm having trouble reaching my language model right now. I've noted your message \
and will pick the thread back up shortly.";

/// Per-turn completion deadline.
const TURN_TIMEOUT: Duration = Duration::from_secs(30);
/// Context budget in tokens (~4 characters per token).
const CONTEXT_TOKEN_BUDGET: usize = 1_000;
/// Bounded replay queue for user turns that failed to persist.
const REPLAY_QUEUE_CAP: usize = 100;
/// At most this many strategy hints are rendered into the prompt.
const MAX_STRATEGY_HINTS: usize = 2;

const TASK_MARKERS: &[&str] = &[
    "how do i", "help me", "implement", "fix", "create", "build", "write", "debug",
    "deploy", "refactor", "error",
];

/// Reply plus per-turn metadata.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub content: String,
    pub context_count: usize,
    pub strategies_used: Vec<String>,
    pub processing_time_ms: f64,
    /// The turn completed partially (fallback reply or missing context)
    pub degraded: bool,
}

/// Pre-built components. Any left as `None` is constructed internally and
/// owned by the agent.
#[derive(Default)]
pub struct AgentComponents {
    pub memory: Option<Arc<FractalMemory>>,
    pub retriever: Option<Arc<HybridRetriever>>,
    pub reasoning: Option<Arc<ReasoningBank>>,
}

pub struct FractalAgent {
    options: MemoryOptions,
    memory: Arc<FractalMemory>,
    retriever: Arc<HybridRetriever>,
    reasoning: Arc<ReasoningBank>,
    completion: Option<Arc<dyn CompletionProvider>>,
    owns_memory: bool,
    owns_retriever: bool,
    owns_reasoning: bool,
    replay_queue: Mutex<VecDeque<(String, f64)>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl FractalAgent {
    /// Assemble an agent from an arbitrary configuration payload (unknown
    /// keys are ignored) and shared store clients.
    pub fn new(
        payload: Value,
        volatile: Arc<dyn VolatileStore>,
        graph: Arc<dyn GraphStore>,
        completion: Option<Arc<dyn CompletionProvider>>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        components: AgentComponents,
    ) -> Result<Arc<Self>> {
        let options = MemoryOptions::from_value(payload)?;

        let owns_memory = components.memory.is_none();
        let owns_retriever = components.retriever.is_none();
        let owns_reasoning = components.reasoning.is_none();

        let memory = components.memory.unwrap_or_else(|| {
            FractalMemory::new(
                options.clone(),
                Arc::clone(&volatile),
                Arc::clone(&graph),
                embedder.clone(),
                completion.clone(),
            )
        });
        let retriever = components.retriever.unwrap_or_else(|| {
            Arc::new(HybridRetriever::new(
                Arc::clone(&graph),
                embedder.clone(),
                options.user_id.clone(),
                options.retrieval_weights,
            ))
        });
        let reasoning = components.reasoning.unwrap_or_else(|| {
            Arc::new(ReasoningBank::new(
                Arc::clone(&graph),
                options.user_id.clone(),
                ReasoningOptions::from(&options),
            ))
        });

        Ok(Arc::new(Self {
            options,
            memory,
            retriever,
            reasoning,
            completion,
            owns_memory,
            owns_retriever,
            owns_reasoning,
            replay_queue: Mutex::new(VecDeque::new()),
            background: Mutex::new(Vec::new()),
        }))
    }

    pub fn memory(&self) -> &Arc<FractalMemory> {
        &self.memory
    }

    pub fn retriever(&self) -> &Arc<HybridRetriever> {
        &self.retriever
    }

    pub fn reasoning(&self) -> &Arc<ReasoningBank> {
        &self.reasoning
    }

    pub fn options(&self) -> &MemoryOptions {
        &self.options
    }

    /// One user turn through the fast path. Never fails outright: partial
    /// failures degrade the reply instead.
    pub async fn chat(&self, text: &str) -> Result<AgentReply> {
        let start = Instant::now();
        let mut degraded = false;

        self.drain_replay_queue().await;

        // 1. Remember the user turn; one inline retry, then the bounded
        // replay queue picks it up on a later turn
        let mut role_meta = Map::new();
        role_meta.insert("role".into(), Value::String("user".into()));
        if let Err(first) = self.memory.remember(text, 1.0, role_meta.clone()).await {
            warn!(error = %first, "Failed to persist user turn, retrying once");
            if let Err(second) = self.memory.remember(text, 1.0, role_meta).await {
                warn!(error = %second, "User turn deferred to replay queue");
                self.enqueue_replay(text.to_string(), 1.0).await;
                degraded = true;
            }
        }

        // 2. Context. A failed recall yields an empty context, not an error
        let context = match self
            .memory
            .recall(text, self.options.retrieval_limit)
            .await
        {
            Ok(results) => results,
            Err(e) => {
                warn!(error = %e, "Recall failed, continuing with empty context");
                degraded = true;
                Vec::new()
            }
        };

        // 3. Strategy hints for task-like turns
        let strategies = if is_task_like(text) {
            self.reasoning
                .strategies_for(text, None, MAX_STRATEGY_HINTS)
                .await
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        // 4 + 5. Prompt assembly and completion under the per-turn deadline
        let prompt = build_prompt(text, &context, &strategies);
        let content = match &self.completion {
            Some(provider) => {
                match tokio::time::timeout(TURN_TIMEOUT, provider.complete(SYSTEM_PROMPT, &prompt))
                    .await
                {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(e)) => {
                        warn!(error = %e, "Completion failed, serving fallback");
                        degraded = true;
                        FALLBACK_REPLY.to_string()
                    }
                    Err(_) => {
                        warn!("Completion timed out, serving fallback");
                        degraded = true;
                        FALLBACK_REPLY.to_string()
                    }
                }
            }
            None => {
                degraded = true;
                FALLBACK_REPLY.to_string()
            }
        };

        // 6. Remember the agent turn
        let mut bot_meta = Map::new();
        bot_meta.insert("role".into(), Value::String("assistant".into()));
        if let Err(e) = self.memory.remember(&content, 0.8, bot_meta).await {
            debug!(error = %e, "Failed to persist agent turn");
            self.enqueue_replay(content.clone(), 0.8).await;
        }

        Ok(AgentReply {
            context_count: context.len(),
            strategies_used: strategies.into_iter().map(|s| s.description).collect(),
            processing_time_ms: start.elapsed().as_secs_f64() * 1_000.0,
            degraded,
            content,
        })
    }

    /// Start the background slow path: a consolidation tick every
    /// `consolidation_interval_seconds` and a daily GC tick.
    pub async fn start_background(self: &Arc<Self>) {
        let mut background = self.background.lock().await;
        if !background.is_empty() {
            return;
        }

        let interval = self.options.consolidation_interval_seconds.max(1);
        let memory = Arc::clone(&self.memory);
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = memory.consolidate().await {
                    // Logged and retried next tick
                    warn!(error = %e, "Background consolidation failed");
                }
            }
        }));

        let memory = Arc::clone(&self.memory);
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(86_400));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The immediate first tick doubles as a startup sweep
            loop {
                ticker.tick().await;
                if let Err(e) = memory.garbage_collect(7).await {
                    warn!(error = %e, "Background garbage collection failed");
                }
            }
        }));

        info!(interval_seconds = interval, "Background maintenance started");
    }

    /// Stop background tasks and close owned components. Components passed
    /// in by the caller are left untouched.
    pub async fn close(&self) {
        for handle in self.background.lock().await.drain(..) {
            handle.abort();
        }
        if self.owns_memory {
            self.memory.close();
        }
        // The retriever and reasoning bank hold no resources beyond the
        // shared store clients; ownership is tracked for symmetry
        debug!(
            owns_memory = self.owns_memory,
            owns_retriever = self.owns_retriever,
            owns_reasoning = self.owns_reasoning,
            "Agent closed"
        );
    }

    async fn enqueue_replay(&self, content: String, importance: f64) {
        let mut queue = self.replay_queue.lock().await;
        if queue.len() >= REPLAY_QUEUE_CAP {
            queue.pop_front();
        }
        queue.push_back((content, importance));
    }

    /// Opportunistically flush deferred turns. Stops at the first failure
    /// and keeps the rest queued.
    async fn drain_replay_queue(&self) {
        loop {
            let next = { self.replay_queue.lock().await.pop_front() };
            let Some((content, importance)) = next else { return };
            if self
                .memory
                .remember(&content, importance, Map::new())
                .await
                .is_err()
            {
                let mut queue = self.replay_queue.lock().await;
                queue.push_front((content, importance));
                return;
            }
        }
    }

    #[cfg(test)]
    async fn replay_queue_len(&self) -> usize {
        self.replay_queue.lock().await.len()
    }
}

/// Keyword heuristic: does the turn look like a task request?
fn is_task_like(text: &str) -> bool {
    let lower = text.to_lowercase();
    TASK_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn build_prompt(
    text: &str,
    context: &[fractal_core::types::RecallResult],
    strategies: &[Strategy],
) -> String {
    let mut prompt = String::new();

    if !context.is_empty() {
        prompt.push_str("Context from memory:\n");
        let budget_chars = CONTEXT_TOKEN_BUDGET * 4;
        let mut used = 0;
        for result in context {
            let line = format!("- {}\n", result.content);
            if used + line.len() > budget_chars {
                break;
            }
            used += line.len();
            prompt.push_str(&line);
        }
        prompt.push('\n');
    }

    for strategy in strategies.iter().take(MAX_STRATEGY_HINTS) {
        if strategy.confidence >= 0.5 {
            prompt.push_str(&format!("DO: {}\n", strategy.description));
        } else {
            prompt.push_str(&format!("AVOID: {}\n", strategy.description));
        }
    }
    if !strategies.is_empty() {
        prompt.push('\n');
    }

    prompt.push_str("User: ");
    prompt.push_str(text);
    prompt
}
