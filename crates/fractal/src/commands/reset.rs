//! Destructive reset of both stores.

use fractal_core::error::{Error, Result};
use fractal_core::MemoryOptions;

pub async fn run(options: &MemoryOptions, confirmed: bool) -> Result<()> {
    if !confirmed {
        return Err(Error::validation(
            "reset is destructive; re-run with --yes to confirm",
        ));
    }

    let (volatile, graph) = super::open_stores(options)?;
    volatile.flush_all().await?;
    graph.delete_all().await?;

    println!("volatile store flushed, graph store emptied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reset_refuses_without_confirmation() {
        let options = MemoryOptions::default();
        let err = run(&options, false).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
