//! # Dripcast Store
//!
//! SQLite-backed source of truth for subscribers, templates, scheduled
//! deliveries, operator broadcasts, payments, and settings.
//!
//! ## Design
//! - WAL journal + `synchronous=NORMAL`: readers never block the dispatcher writer
//! - r2d2 pool; acquisition retries with linear backoff, then `StoreBusy`
//! - Forward-only migration ledger applied on open
//! - Every operation lives on [`Db`], a borrowed connection; [`Store::write`]
//!   runs a closure inside one `IMMEDIATE` transaction so multi-step state
//!   changes (expire, leave, pay) commit atomically
//!
//! ```text
//! Store ── pool ──► Db<'_>
//!                    ├── subscribers  (lifecycle flags)
//!                    ├── templates    (free|paid, dense seq_no)
//!                    ├── deliveries   (pending / sent queue)
//!                    ├── broadcasts   (+ per-recipient receipts)
//!                    ├── welcome menu, settings, payments
//!                    └── stats, health, CSV export
//! ```

pub mod broadcasts;
pub mod deliveries;
pub mod migrations;
pub mod models;
pub mod payments;
pub mod pool;
pub mod settings;
pub mod stats;
pub mod subscribers;
pub mod templates;
pub mod time;
pub mod welcome;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dripcast_core::config::StoreConfig;
use dripcast_core::error::{DripError, Result};
use rusqlite::Connection;

pub use models::*;
pub use pool::db_err;
pub use settings::SettingKey;

/// Pooled SQLite store.
pub struct Store {
    pool: pool::SqlitePool,
    retries: u32,
    retry_base: Duration,
    span: tracing::Span,
}

/// A borrowed connection (or open transaction) exposing every store operation.
pub struct Db<'c> {
    conn: &'c Connection,
}

impl<'c> Db<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn ping(&self) -> Result<()> {
        self.conn
            .query_row("SELECT 1", [], |r| r.get::<_, i64>(0))
            .map_err(db_err)?;
        Ok(())
    }
}

impl Store {
    /// Open or create the database at `path` and bring its schema up to date.
    pub fn open(path: &Path, config: &StoreConfig) -> Result<Self> {
        Self::open_with_span(path, config, tracing::info_span!("store"))
    }

    pub fn open_with_span(path: &Path, config: &StoreConfig, span: tracing::Span) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let pool = pool::build(path, config)?;
        let store = Self {
            pool,
            retries: config.acquire_retries.max(1),
            retry_base: Duration::from_millis(config.retry_base_ms),
            span,
        };
        {
            let _enter = store.span.enter();
            let mut conn = store.acquire()?;
            let applied = migrations::migrate(&mut conn)?;
            if applied > 0 {
                tracing::info!(applied, path = %path.display(), "schema migrations applied");
            }
        }
        Ok(store)
    }

    /// Get a pooled connection, retrying with linearly increasing delay.
    fn acquire(&self) -> Result<pool::PooledConn> {
        pool::acquire_with_retry(&self.pool, self.retries, self.retry_base)
    }

    /// Run read-only work on a pooled connection.
    pub fn read<T>(&self, f: impl FnOnce(&Db<'_>) -> Result<T>) -> Result<T> {
        let conn = self.acquire()?;
        f(&Db::new(&conn))
    }

    /// Run `f` inside one `IMMEDIATE` transaction; commits on `Ok`, rolls back on `Err`.
    pub fn write<T>(&self, f: impl FnOnce(&Db<'_>) -> Result<T>) -> Result<T> {
        let conn = self.acquire()?;
        let tx = pool::TxGuard::begin_immediate(&conn, self.retries, self.retry_base)?;
        let out = f(&Db::new(&conn))?;
        tx.commit()?;
        Ok(out)
    }

    /// [`Store::read`] on tokio's blocking pool. Connection waits and busy
    /// backoff then park a blocking thread instead of an async worker.
    pub async fn read_async<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(&Db<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.read(f))
            .await
            .map_err(join_err)?
    }

    /// [`Store::write`] on tokio's blocking pool.
    pub async fn write_async<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(&Db<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.write(f))
            .await
            .map_err(join_err)?
    }

    /// Cheap liveness check: acquire, query, release.
    pub fn ping(&self) -> Result<()> {
        self.read(|db| db.ping())
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.pool.state();
        f.debug_struct("Store")
            .field("connections", &state.connections)
            .field("idle", &state.idle_connections)
            .finish()
    }
}

/// Convenience for tests and tools: a store in a fresh file under `dir`.
pub fn open_in_dir(dir: &Path) -> Result<Store> {
    Store::open(
        &dripcast_core::config::DripConfig::database_path(dir),
        &StoreConfig::default(),
    )
}

fn join_err(e: tokio::task::JoinError) -> DripError {
    DripError::StoreIntegrity(format!("store task aborted: {e}"))
}

/// Map "no rows" to `NotFound` with a readable subject.
pub(crate) fn not_found(what: impl Into<String>) -> DripError {
    DripError::NotFound(what.into())
}
