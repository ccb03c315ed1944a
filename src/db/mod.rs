//! Persistent ledger slot.
//!
//! A single named slot holds the serialized [`SessionLedger`]. Every write
//! replaces the whole document, so callers always read-modify-write the full
//! ledger.

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{error, info};
use rusqlite::{params, Connection, OptionalExtension};

mod memory;
mod migrations;

pub use memory::MemoryLedgerStore;

use crate::{models::SessionLedger, settings::TrackerSettings};
use migrations::run_migrations;

/// Synchronous key-value slot holding at most one ledger.
pub trait LedgerStore: Send + Sync {
    fn load(&self) -> Result<Option<SessionLedger>>;
    fn save(&self, ledger: &SessionLedger) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Ledger slot stored in a SQLite file.
pub struct SqliteLedgerStore {
    conn: Mutex<Connection>,
    slot_key: String,
    db_path: Option<PathBuf>,
}

impl SqliteLedgerStore {
    pub fn open(db_path: PathBuf, slot_key: impl Into<String>) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create ledger directory {}", parent.display())
            })?;
        }

        let conn = Connection::open(&db_path).context("failed to open SQLite ledger database")?;
        if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
            error!("Failed to enable WAL mode: {err}");
        }

        info!("Ledger store initialized at {}", db_path.display());
        Self::init(conn, slot_key.into(), Some(db_path))
    }

    /// Opens the slot named by `settings.storage_key`.
    pub fn from_settings(db_path: PathBuf, settings: &TrackerSettings) -> Result<Self> {
        Self::open(db_path, settings.storage_key.clone())
    }

    pub fn open_in_memory(slot_key: impl Into<String>) -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory ledger database")?;
        Self::init(conn, slot_key.into(), None)
    }

    fn init(mut conn: Connection, slot_key: String, db_path: Option<PathBuf>) -> Result<Self> {
        run_migrations(&mut conn).context("failed to run ledger migrations")?;
        Ok(Self {
            conn: Mutex::new(conn),
            slot_key,
            db_path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn with_conn<T>(&self, task: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("ledger database lock poisoned"))?;
        task(&guard)
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn load(&self) -> Result<Option<SessionLedger>> {
        let payload: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT payload FROM ledger_slots WHERE slot_key = ?1",
                params![self.slot_key],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read ledger slot")
        })?;

        payload
            .map(|raw| {
                serde_json::from_str(&raw)
                    .with_context(|| format!("corrupt ledger in slot '{}'", self.slot_key))
            })
            .transpose()
    }

    fn save(&self, ledger: &SessionLedger) -> Result<()> {
        let payload = serde_json::to_string(ledger).context("failed to serialize ledger")?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO ledger_slots (slot_key, payload, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(slot_key) DO UPDATE
                 SET payload = excluded.payload,
                     updated_at = excluded.updated_at",
                params![self.slot_key, payload, Utc::now().to_rfc3339()],
            )
            .with_context(|| "failed to write ledger slot")?;
            Ok(())
        })
    }

    fn clear(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM ledger_slots WHERE slot_key = ?1",
                params![self.slot_key],
            )
            .with_context(|| "failed to clear ledger slot")?;
            Ok(())
        })
    }
}
