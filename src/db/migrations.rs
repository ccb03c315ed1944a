use anyhow::{bail, Context, Result};
use rusqlite::Connection;

/// Schema steps in order; step `i` brings the database to version `i + 1`.
const STEPS: &[(&str, &str)] = &[("schema_v1.sql", include_str!("schemas/schema_v1.sql"))];

fn latest_version() -> u32 {
    STEPS.len() as u32
}

fn stored_version(conn: &Connection) -> Result<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read ledger schema version")
}

/// Brings the ledger database up to the latest schema in one transaction.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let from = stored_version(conn)?;
    let latest = latest_version();
    if from > latest {
        bail!("ledger database is at schema {from}; this build only knows {latest}");
    }

    let pending = &STEPS[from as usize..];
    if pending.is_empty() {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .context("failed to begin ledger schema upgrade")?;
    for (name, sql) in pending {
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply {name}"))?;
    }
    tx.pragma_update(None, "user_version", latest)
        .context("failed to record ledger schema version")?;
    tx.commit().context("failed to commit ledger schema upgrade")?;

    log::info!("Ledger schema upgraded from {from} to {latest}");
    Ok(())
}
