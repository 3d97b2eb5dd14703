//! Command implementations.

pub mod inspect;
pub mod migrate;
pub mod reset;
pub mod smoke;

use std::sync::Arc;

use fractal_core::error::{Error, Result};
use fractal_core::traits::{GraphStore, VolatileStore};
use fractal_core::MemoryOptions;
use fractal_memory::{SqliteGraphStore, SqliteVolatileStore};

/// Load memory options from the optional config file plus environment.
pub fn load_options(config_path: Option<&str>) -> Result<MemoryOptions> {
    let payload = match config_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw)?
        }
        None => serde_json::Value::Object(serde_json::Map::new()),
    };
    MemoryOptions::from_value(payload)
}

/// Open the configured store clients. Both connection options must name a
/// database path.
pub fn open_stores(
    options: &MemoryOptions,
) -> Result<(Arc<dyn VolatileStore>, Arc<dyn GraphStore>)> {
    if options.volatile_url.is_empty() {
        return Err(Error::validation(
            "volatile_url is required (set VOLATILE_URL or the config file)",
        ));
    }
    if options.graph_uri.is_empty() {
        return Err(Error::validation(
            "graph_uri is required (set GRAPH_URI or the config file)",
        ));
    }

    let volatile = SqliteVolatileStore::open(&options.volatile_url, options.l0_capacity)?;
    let graph = SqliteGraphStore::open(&options.graph_uri)?;
    Ok((Arc::new(volatile), Arc::new(graph)))
}
