//! Forward-only migration ledger.
//!
//! Each migration is applied once, inside its own transaction, and recorded
//! in `schema_migrations`. Column additions are explicit steps that check
//! `PRAGMA table_info` first, so databases created by older builds (which may
//! already carry some columns) heal without errors.

use chrono::Utc;
use dripcast_core::error::Result;
use rusqlite::{Connection, params};

use crate::pool::db_err;

pub enum Step {
    Sql(&'static str),
    AddColumn {
        table: &'static str,
        column: &'static str,
        decl: &'static str,
    },
}

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub steps: &'static [Step],
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        steps: &[Step::Sql(SCHEMA_V1)],
    },
    Migration {
        version: 2,
        name: "payments_utm_id",
        steps: &[Step::AddColumn {
            table: "payments",
            column: "utm_id",
            decl: "TEXT",
        }],
    },
    Migration {
        version: 3,
        name: "deliveries_sent_at",
        steps: &[Step::AddColumn {
            table: "scheduled_deliveries",
            column: "sent_at",
            decl: "TEXT",
        }],
    },
    Migration {
        version: 4,
        name: "lifecycle_events",
        steps: &[Step::Sql(
            "CREATE TABLE IF NOT EXISTS lifecycle_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                event TEXT NOT NULL,
                detail TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_lifecycle_events_user ON lifecycle_events(user_id);",
        )],
    },
];

const SCHEMA_V1: &str = "
    -- Subscribers: lifecycle flags, never physically deleted
    CREATE TABLE IF NOT EXISTS subscribers (
        user_id INTEGER PRIMARY KEY,
        username TEXT,
        first_name TEXT,
        joined_at TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        engaged INTEGER NOT NULL DEFAULT 0,
        paid INTEGER NOT NULL DEFAULT 0,
        paid_at TEXT,
        paid_through TEXT               -- YYYY-MM-DD
    );
    CREATE INDEX IF NOT EXISTS idx_subscribers_active ON subscribers(active);
    CREATE INDEX IF NOT EXISTS idx_subscribers_engaged ON subscribers(engaged);
    CREATE INDEX IF NOT EXISTS idx_subscribers_paid ON subscribers(paid);

    -- Drip templates, one dense seq_no range per track
    CREATE TABLE IF NOT EXISTS templates (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        track TEXT NOT NULL CHECK (track IN ('free', 'paid')),
        seq_no INTEGER NOT NULL,
        body TEXT NOT NULL,
        photo_ref TEXT,
        delay_hours REAL NOT NULL DEFAULT 0,
        UNIQUE (track, seq_no)
    );

    CREATE TABLE IF NOT EXISTS template_buttons (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        template_id INTEGER NOT NULL REFERENCES templates(id) ON DELETE CASCADE,
        label TEXT NOT NULL,
        url TEXT NOT NULL,
        position INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_template_buttons_template ON template_buttons(template_id);

    -- Per-user work queue
    CREATE TABLE IF NOT EXISTS scheduled_deliveries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES subscribers(user_id),
        track TEXT NOT NULL CHECK (track IN ('free', 'paid')),
        seq_no INTEGER NOT NULL,
        fire_at INTEGER NOT NULL,       -- unix seconds
        sent INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_deliveries_fire_at ON scheduled_deliveries(fire_at);
    CREATE INDEX IF NOT EXISTS idx_deliveries_sent ON scheduled_deliveries(sent);
    CREATE INDEX IF NOT EXISTS idx_deliveries_track_due ON scheduled_deliveries(track, sent, fire_at);
    CREATE UNIQUE INDEX IF NOT EXISTS uq_deliveries_pending
        ON scheduled_deliveries(user_id, track, seq_no) WHERE sent = 0;

    -- Operator broadcasts
    CREATE TABLE IF NOT EXISTS broadcasts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        track TEXT NOT NULL CHECK (track IN ('free', 'paid')),
        body TEXT NOT NULL,
        photo_ref TEXT,
        fire_at INTEGER NOT NULL,
        sent INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_broadcasts_due ON broadcasts(track, sent, fire_at);

    CREATE TABLE IF NOT EXISTS broadcast_buttons (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        broadcast_id INTEGER NOT NULL REFERENCES broadcasts(id) ON DELETE CASCADE,
        label TEXT NOT NULL,
        url TEXT NOT NULL,
        position INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS broadcast_receipts (
        broadcast_id INTEGER NOT NULL REFERENCES broadcasts(id) ON DELETE CASCADE,
        user_id INTEGER NOT NULL,
        sent_at TEXT NOT NULL,
        PRIMARY KEY (broadcast_id, user_id)
    );

    -- Welcome menu: labels, each with ordered follow-ups
    CREATE TABLE IF NOT EXISTS welcome_buttons (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        label TEXT NOT NULL UNIQUE,
        position INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS welcome_followups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        button_id INTEGER NOT NULL REFERENCES welcome_buttons(id) ON DELETE CASCADE,
        position INTEGER NOT NULL DEFAULT 0,
        body TEXT NOT NULL,
        photo_ref TEXT
    );

    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    -- Immutable payment log
    CREATE TABLE IF NOT EXISTS payments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        amount TEXT NOT NULL,
        status TEXT NOT NULL,
        utm_source TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_payments_status ON payments(status);
";

/// Apply every pending migration. Returns how many were applied.
pub fn migrate(conn: &mut Connection) -> Result<usize> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )
    .map_err(db_err)?;

    let done = applied_versions(conn)?;
    let mut applied = 0;
    for migration in MIGRATIONS {
        if done.contains(&migration.version) {
            continue;
        }
        let tx = conn.transaction().map_err(db_err)?;
        for step in migration.steps {
            apply_step(&tx, step)?;
        }
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.name, Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        tracing::debug!(version = migration.version, name = migration.name, "migration applied");
        applied += 1;
    }
    Ok(applied)
}

fn apply_step(conn: &Connection, step: &Step) -> Result<()> {
    match step {
        Step::Sql(sql) => conn.execute_batch(sql).map_err(db_err),
        Step::AddColumn {
            table,
            column,
            decl,
        } => {
            if has_column(conn, table, column)? {
                return Ok(());
            }
            conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))
                .map_err(db_err)
        }
    }
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(db_err)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
    Ok(names.iter().any(|n| n == column))
}

pub fn applied_versions(conn: &Connection) -> Result<Vec<i64>> {
    let mut stmt = conn
        .prepare("SELECT version FROM schema_migrations ORDER BY version")
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, i64>(0))
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_database_gets_all_columns() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(migrate(&mut conn).unwrap(), MIGRATIONS.len());
        assert!(has_column(&conn, "payments", "utm_id").unwrap());
        assert!(has_column(&conn, "scheduled_deliveries", "sent_at").unwrap());
        assert_eq!(migrate(&mut conn).unwrap(), 0);
    }

    #[test]
    fn test_legacy_table_is_healed() {
        let mut conn = Connection::open_in_memory().unwrap();
        // A pre-ledger database that already has payments with utm_id.
        conn.execute_batch(
            "CREATE TABLE payments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                amount TEXT NOT NULL,
                status TEXT NOT NULL,
                utm_source TEXT,
                utm_id TEXT,
                created_at TEXT NOT NULL
            );",
        )
        .unwrap();
        migrate(&mut conn).unwrap();
        assert!(has_column(&conn, "payments", "utm_id").unwrap());
        assert_eq!(applied_versions(&conn).unwrap(), vec![1, 2, 3, 4]);
    }
}
