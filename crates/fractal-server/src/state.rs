//! Shared application state.

use std::sync::Arc;
use std::time::Instant;

use fractal_core::traits::{GraphStore, VolatileStore};
use fractal_memory::FractalAgent;

pub struct AppState {
    pub agent: Arc<FractalAgent>,
    pub volatile: Arc<dyn VolatileStore>,
    pub graph: Arc<dyn GraphStore>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        agent: Arc<FractalAgent>,
        volatile: Arc<dyn VolatileStore>,
        graph: Arc<dyn GraphStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            agent,
            volatile,
            graph,
            start_time: Instant::now(),
        })
    }
}
