//! Embedded SQL migrations for the store adapters.
//!
//! SQL is embedded as strings and executed during adapter construction and
//! by the `migrate` CLI command, which also records version rows.

use chrono::Utc;
use fractal_core::Result;
use rusqlite::{params, Connection};

/// Volatile store tables (001)
pub const VOLATILE_TABLES_SQL: &str = include_str!("001_volatile_tables.sql");

/// Graph store tables (001)
pub const GRAPH_TABLES_SQL: &str = include_str!("001_graph_tables.sql");

/// Ordered graph-store migrations with their version numbers.
pub const GRAPH_MIGRATIONS: &[(i64, &str, &str)] = &[(1, "graph_tables", GRAPH_TABLES_SQL)];

/// Ordered volatile-store migrations with their version numbers.
pub const VOLATILE_MIGRATIONS: &[(i64, &str, &str)] = &[(1, "volatile_tables", VOLATILE_TABLES_SQL)];

/// Run all volatile store migrations.
pub fn run_volatile_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(VOLATILE_TABLES_SQL)?;
    Ok(())
}

/// Run all graph store migrations.
pub fn run_graph_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(GRAPH_TABLES_SQL)?;
    Ok(())
}

/// Apply graph migrations up to the latest version, recording a
/// `migrations(version, name, applied_at)` row per step. Already-applied
/// versions are skipped.
pub fn apply_versioned(conn: &Connection) -> Result<Vec<i64>> {
    // The migrations table itself ships with version 1
    conn.execute_batch(GRAPH_TABLES_SQL)?;

    let mut applied = Vec::new();
    for (version, name, sql) in GRAPH_MIGRATIONS {
        let seen: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM migrations WHERE version = ?1)",
            params![version],
            |row| row.get(0),
        )?;
        if seen {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![version, name, Utc::now().timestamp_millis()],
        )?;
        applied.push(*version);
    }
    Ok(applied)
}
