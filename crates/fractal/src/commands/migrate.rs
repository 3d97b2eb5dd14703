//! Apply schema migrations.

use rusqlite::Connection;

use fractal_core::error::{Error, Result};
use fractal_core::MemoryOptions;
use fractal_memory::migrations;

pub fn run(options: &MemoryOptions) -> Result<()> {
    if options.volatile_url.is_empty() || options.graph_uri.is_empty() {
        return Err(Error::validation(
            "volatile_url and graph_uri are required for migrate",
        ));
    }

    let volatile_conn = Connection::open(&options.volatile_url)?;
    migrations::run_volatile_migrations(&volatile_conn)?;
    println!("volatile store schema up to date ({})", options.volatile_url);

    let graph_conn = Connection::open(&options.graph_uri)?;
    let applied = migrations::apply_versioned(&graph_conn)?;
    if applied.is_empty() {
        println!("graph store schema up to date ({})", options.graph_uri);
    } else {
        for version in applied {
            println!("applied graph migration version {version}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_requires_connection_options() {
        let options = MemoryOptions::default();
        assert!(matches!(run(&options), Err(Error::Validation(_))));
    }

    #[test]
    fn migrate_is_idempotent_on_files() {
        let dir = tempfile::tempdir().unwrap();
        let options = MemoryOptions {
            volatile_url: dir.path().join("volatile.db").display().to_string(),
            graph_uri: dir.path().join("graph.db").display().to_string(),
            ..Default::default()
        };
        run(&options).unwrap();
        run(&options).unwrap();

        let conn = Connection::open(&options.graph_uri).unwrap();
        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, 1);
    }
}
