//! Operator broadcasts and their per-recipient receipts.

use chrono::{DateTime, Utc};
use dripcast_core::error::{DripError, Result};
use dripcast_core::types::{LinkButton, Track};
use rusqlite::{OptionalExtension, Row, params};

use crate::models::{Broadcast, BroadcastInput};
use crate::pool::db_err;
use crate::subscribers::audience_predicate;
use crate::templates::{blank_to_none, validate_buttons};
use crate::{Db, not_found, time};

const BROADCAST_COLUMNS: &str = "id, track, body, photo_ref, fire_at, sent, created_at";

type BroadcastRow = (i64, String, String, Option<String>, i64, bool, String);

fn broadcast_row(row: &Row<'_>) -> rusqlite::Result<BroadcastRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

impl Db<'_> {
    pub fn schedule_broadcast(&self, input: &BroadcastInput, now: DateTime<Utc>) -> Result<Broadcast> {
        if input.body.trim().is_empty() {
            return Err(DripError::validation("body", "must not be empty"));
        }
        validate_buttons(&input.buttons)?;
        self.conn
            .execute(
                "INSERT INTO broadcasts (track, body, photo_ref, fire_at, sent, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![
                    input.track.as_str(),
                    input.body,
                    blank_to_none(&input.photo_ref),
                    time::to_secs(input.fire_at),
                    time::to_text(now)
                ],
            )
            .map_err(db_err)?;
        let id = self.conn.last_insert_rowid();
        for (position, button) in input.buttons.iter().enumerate() {
            self.conn
                .execute(
                    "INSERT INTO broadcast_buttons (broadcast_id, label, url, position)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, button.label.trim(), button.url.trim(), position as i64],
                )
                .map_err(db_err)?;
        }
        self.get_broadcast(id)
    }

    pub fn get_broadcast(&self, id: i64) -> Result<Broadcast> {
        let sql = format!("SELECT {BROADCAST_COLUMNS} FROM broadcasts WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], broadcast_row)
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| not_found(format!("broadcast {id}")))?;
        self.hydrate_broadcast(row)
    }

    /// All broadcasts, upcoming first by `fire_at`.
    pub fn list_broadcasts(&self, include_sent: bool) -> Result<Vec<Broadcast>> {
        let filter = if include_sent { "" } else { "WHERE sent = 0" };
        let sql = format!("SELECT {BROADCAST_COLUMNS} FROM broadcasts {filter} ORDER BY fire_at, id");
        self.query_broadcasts(&sql, [])
    }

    pub fn delete_broadcast(&self, id: i64) -> Result<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM broadcasts WHERE id = ?1", params![id])
            .map_err(db_err)?;
        if deleted == 0 {
            return Err(not_found(format!("broadcast {id}")));
        }
        Ok(())
    }

    /// Un-sent broadcasts of `track` whose `fire_at` has passed.
    pub fn due_broadcasts(&self, track: Track, now: DateTime<Utc>) -> Result<Vec<Broadcast>> {
        let sql = format!(
            "SELECT {BROADCAST_COLUMNS} FROM broadcasts
             WHERE track = ?1 AND sent = 0 AND fire_at <= ?2 ORDER BY fire_at, id"
        );
        self.query_broadcasts(&sql, params![track.as_str(), time::to_secs(now)])
    }

    /// Current audience of `track` that has no receipt for this broadcast yet.
    pub fn broadcast_audience(&self, track: Track, broadcast_id: i64) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT s.user_id FROM subscribers s
             WHERE {} AND NOT EXISTS (
                 SELECT 1 FROM broadcast_receipts r
                 WHERE r.broadcast_id = ?1 AND r.user_id = s.user_id)
             ORDER BY s.user_id",
            audience_predicate(track)
        );
        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let ids = stmt
            .query_map(params![broadcast_id], |r| r.get(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .map_err(db_err)?;
        Ok(ids)
    }

    pub fn record_receipt(&self, broadcast_id: i64, user_id: i64, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO broadcast_receipts (broadcast_id, user_id, sent_at)
                 VALUES (?1, ?2, ?3)",
                params![broadcast_id, user_id, time::to_text(now)],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn receipts_for(&self, broadcast_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id FROM broadcast_receipts WHERE broadcast_id = ?1 ORDER BY user_id")
            .map_err(db_err)?;
        let ids = stmt
            .query_map(params![broadcast_id], |r| r.get(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .map_err(db_err)?;
        Ok(ids)
    }

    pub fn mark_broadcast_sent(&self, broadcast_id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE broadcasts SET sent = 1 WHERE id = ?1 AND sent = 0",
                params![broadcast_id],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    fn query_broadcasts(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Broadcast>> {
        let mut stmt = self.conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params, broadcast_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter().map(|r| self.hydrate_broadcast(r)).collect()
    }

    fn hydrate_broadcast(&self, row: BroadcastRow) -> Result<Broadcast> {
        let (id, track, body, photo_ref, fire_at, sent, created_at) = row;
        let mut stmt = self
            .conn
            .prepare(
                "SELECT label, url FROM broadcast_buttons WHERE broadcast_id = ?1
                 ORDER BY position, id",
            )
            .map_err(db_err)?;
        let buttons = stmt
            .query_map(params![id], |r| {
                Ok(LinkButton {
                    label: r.get(0)?,
                    url: r.get(1)?,
                })
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(Broadcast {
            id,
            track: track.parse()?,
            body,
            photo_ref,
            fire_at: time::from_secs(fire_at),
            sent,
            created_at: time::from_text(&created_at).unwrap_or_default(),
            buttons,
        })
    }
}
