//! Connection pool: r2d2 over rusqlite with per-connection tuning and
//! bounded-retry acquisition.

use std::path::Path;
use std::time::Duration;

use dripcast_core::config::StoreConfig;
use dripcast_core::error::{DripError, Result};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, ErrorCode};

pub type SqlitePool = r2d2::Pool<SqliteConnectionManager>;
pub type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

/// Build the pool. Each new connection gets the WAL/durability pragmas.
pub fn build(path: &Path, config: &StoreConfig) -> Result<SqlitePool> {
    let pragmas = format!(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = {busy};
         PRAGMA cache_size = -16000;
         PRAGMA mmap_size = {mmap};
         PRAGMA temp_store = MEMORY;",
        busy = config.busy_timeout_ms,
        mmap = config.mmap_size,
    );
    let manager =
        SqliteConnectionManager::file(path).with_init(move |c| c.execute_batch(&pragmas));

    r2d2::Pool::builder()
        .max_size(config.pool_size)
        .connection_timeout(Duration::from_millis(config.busy_timeout_ms.max(100)))
        .build(manager)
        .map_err(|e| DripError::StoreBusy(format!("DB pool open: {e}")))
}

/// Acquire a connection; on contention back off `base * attempt` and retry
/// up to `retries` times before giving up with `StoreBusy`.
pub fn acquire_with_retry(pool: &SqlitePool, retries: u32, base: Duration) -> Result<PooledConn> {
    let mut last = String::new();
    for attempt in 1..=retries {
        match pool.get() {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                last = e.to_string();
                tracing::debug!(attempt, error = %last, "store connection busy, backing off");
                if attempt < retries {
                    std::thread::sleep(base * attempt);
                }
            }
        }
    }
    Err(DripError::StoreBusy(format!(
        "no connection after {retries} attempts: {last}"
    )))
}

/// Open `IMMEDIATE` transaction that rolls back unless committed.
pub struct TxGuard<'c> {
    conn: &'c Connection,
    committed: bool,
}

impl<'c> TxGuard<'c> {
    /// Take the write lock, retrying on `SQLITE_BUSY` with the same backoff
    /// policy as connection acquisition.
    pub fn begin_immediate(conn: &'c Connection, retries: u32, base: Duration) -> Result<Self> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match conn.execute_batch("BEGIN IMMEDIATE") {
                Ok(()) => {
                    return Ok(Self {
                        conn,
                        committed: false,
                    });
                }
                Err(e) => {
                    let err = db_err(e);
                    if !matches!(err, DripError::StoreBusy(_)) || attempt >= retries {
                        return Err(err);
                    }
                    tracing::debug!(attempt, "write lock busy, backing off");
                    std::thread::sleep(base * attempt);
                }
            }
        }
    }

    pub fn commit(mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT").map_err(db_err)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for TxGuard<'_> {
    fn drop(&mut self) {
        if !self.committed
            && let Err(e) = self.conn.execute_batch("ROLLBACK")
        {
            tracing::warn!("rollback failed: {e}");
        }
    }
}

/// Classify a rusqlite error into a store error kind.
pub fn db_err(e: rusqlite::Error) -> DripError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            DripError::StoreBusy(e.to_string())
        }
        _ => DripError::StoreIntegrity(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pragmas_applied() {
        let dir = tempfile::tempdir().unwrap();
        let pool = build(&dir.path().join("p.db"), &StoreConfig::default()).unwrap();
        let conn = acquire_with_retry(&pool, 5, Duration::from_millis(1)).unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |r| r.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        let fk: i64 = conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0)).unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_exhausted_pool_is_store_busy() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            pool_size: 1,
            busy_timeout_ms: 100,
            ..StoreConfig::default()
        };
        let pool = build(&dir.path().join("p.db"), &config).unwrap();
        let _held = acquire_with_retry(&pool, 1, Duration::from_millis(1)).unwrap();
        let err = acquire_with_retry(&pool, 2, Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err, DripError::StoreBusy(_)));
    }

    #[test]
    fn test_guard_rolls_back_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let pool = build(&dir.path().join("p.db"), &StoreConfig::default()).unwrap();
        let conn = acquire_with_retry(&pool, 5, Duration::from_millis(1)).unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        {
            let _tx = TxGuard::begin_immediate(&conn, 1, Duration::from_millis(1)).unwrap();
            conn.execute("INSERT INTO t VALUES (1)", []).unwrap();
        }
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 0);
    }
}
