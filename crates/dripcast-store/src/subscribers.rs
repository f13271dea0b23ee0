//! Subscriber lifecycle flags.

use chrono::{DateTime, NaiveDate, Utc};
use dripcast_core::error::Result;
use dripcast_core::types::Track;
use rusqlite::{OptionalExtension, Row, params};

use crate::models::{MarkPaid, Subscriber, Upsert};
use crate::pool::db_err;
use crate::{Db, time};

pub(crate) const SUBSCRIBER_COLUMNS: &str =
    "user_id, username, first_name, joined_at, active, engaged, paid, paid_at, paid_through";

/// SQL predicate (over alias `s`) selecting the audience of a track.
pub(crate) fn audience_predicate(track: Track) -> &'static str {
    match track {
        Track::Free => "s.active = 1 AND s.engaged = 1 AND s.paid = 0",
        Track::Paid => "s.active = 1 AND s.paid = 1",
    }
}

pub(crate) fn subscriber_from_row(row: &Row<'_>) -> rusqlite::Result<Subscriber> {
    let joined: String = row.get(3)?;
    let paid_at: Option<String> = row.get(7)?;
    let paid_through: Option<String> = row.get(8)?;
    Ok(Subscriber {
        user_id: row.get(0)?,
        username: row.get(1)?,
        first_name: row.get(2)?,
        joined_at: time::from_text(&joined).unwrap_or_default(),
        active: row.get(4)?,
        engaged: row.get(5)?,
        paid: row.get(6)?,
        paid_at: paid_at.as_deref().and_then(time::from_text),
        paid_through: paid_through.as_deref().and_then(time::date_from_text),
    })
}

impl Db<'_> {
    /// Create the subscriber, or revive it (`active = 1`) and refresh the
    /// profile fields that were supplied.
    pub fn upsert_subscriber(
        &self,
        user_id: i64,
        username: Option<&str>,
        first_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Upsert> {
        let existing: Option<bool> = self
            .conn
            .query_row(
                "SELECT active FROM subscribers WHERE user_id = ?1",
                params![user_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;

        let outcome = match existing {
            None => {
                self.conn
                    .execute(
                        "INSERT INTO subscribers (user_id, username, first_name, joined_at, active)
                         VALUES (?1, ?2, ?3, ?4, 1)",
                        params![user_id, username, first_name, time::to_text(now)],
                    )
                    .map_err(db_err)?;
                Upsert::Created
            }
            Some(active) => {
                self.conn
                    .execute(
                        "UPDATE subscribers
                         SET active = 1,
                             username = COALESCE(?2, username),
                             first_name = COALESCE(?3, first_name)
                         WHERE user_id = ?1",
                        params![user_id, username, first_name],
                    )
                    .map_err(db_err)?;
                if active {
                    Upsert::Refreshed
                } else {
                    Upsert::Revived
                }
            }
        };
        if outcome != Upsert::Refreshed {
            self.record_event(user_id, "joined", None, now)?;
        }
        Ok(outcome)
    }

    /// Set `engaged = 1`, reactivating if needed. Returns true when either
    /// flag changed; false for unknown subscribers and repeat calls.
    pub fn mark_engaged(&self, user_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE subscribers SET engaged = 1, active = 1
                 WHERE user_id = ?1 AND (engaged = 0 OR active = 0)",
                params![user_id],
            )
            .map_err(db_err)?;
        if changed > 0 {
            self.record_event(user_id, "engaged", None, now)?;
        }
        Ok(changed > 0)
    }

    /// Set `paid`, `paid_at = now` and, when given, `paid_through`.
    pub fn mark_paid(
        &self,
        user_id: i64,
        paid_through: Option<NaiveDate>,
        now: DateTime<Utc>,
    ) -> Result<MarkPaid> {
        let was_paid: Option<bool> = self
            .conn
            .query_row(
                "SELECT paid FROM subscribers WHERE user_id = ?1",
                params![user_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let Some(was_paid) = was_paid else {
            return Ok(MarkPaid::UnknownSubscriber);
        };

        self.conn
            .execute(
                "UPDATE subscribers
                 SET paid = 1, paid_at = ?2, paid_through = COALESCE(?3, paid_through)
                 WHERE user_id = ?1",
                params![
                    user_id,
                    time::to_text(now),
                    paid_through.map(time::date_to_text)
                ],
            )
            .map_err(db_err)?;
        let detail = paid_through.map(time::date_to_text);
        self.record_event(user_id, "paid", detail.as_deref(), now)?;
        Ok(if was_paid {
            MarkPaid::Renewed
        } else {
            MarkPaid::NewlyPaid
        })
    }

    /// Channel leave: clear every lifecycle flag and cancel both tracks.
    pub fn leave(&self, user_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE subscribers
                 SET active = 0, engaged = 0, paid = 0, paid_through = NULL
                 WHERE user_id = ?1",
                params![user_id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Ok(false);
        }
        for track in Track::ALL {
            self.cancel_pending_for(user_id, track)?;
        }
        self.record_event(user_id, "left", None, now)?;
        Ok(true)
    }

    /// Recipient is gone for good (blocked the bot, account deleted).
    pub fn deactivate(&self, user_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE subscribers SET active = 0, engaged = 0
                 WHERE user_id = ?1 AND (active = 1 OR engaged = 1)",
                params![user_id],
            )
            .map_err(db_err)?;
        let mut cancelled = 0;
        for track in Track::ALL {
            cancelled += self.cancel_pending_for(user_id, track)?;
        }
        if changed > 0 {
            self.record_event(user_id, "deactivated", None, now)?;
        }
        Ok(changed > 0 || cancelled > 0)
    }

    /// Demotion: clear `paid` and `paid_through`. `paid_at` is kept as history.
    pub fn clear_paid(&self, user_id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE subscribers SET paid = 0, paid_through = NULL
                 WHERE user_id = ?1 AND paid = 1",
                params![user_id],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Active paid subscribers whose `paid_through` is on or before `date`.
    pub fn expiring_on_or_before(&self, date: NaiveDate) -> Result<Vec<Subscriber>> {
        let sql = format!(
            "SELECT {SUBSCRIBER_COLUMNS} FROM subscribers
             WHERE paid = 1 AND active = 1 AND paid_through IS NOT NULL AND paid_through <= ?1
             ORDER BY user_id"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![time::date_to_text(date)], subscriber_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    pub fn get_subscriber(&self, user_id: i64) -> Result<Option<Subscriber>> {
        let sql = format!("SELECT {SUBSCRIBER_COLUMNS} FROM subscribers WHERE user_id = ?1");
        self.conn
            .query_row(&sql, params![user_id], subscriber_from_row)
            .optional()
            .map_err(db_err)
    }

    /// User ids currently in the audience of `track`.
    pub fn audience(&self, track: Track) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT s.user_id FROM subscribers s WHERE {} ORDER BY s.user_id",
            audience_predicate(track)
        );
        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let ids = stmt
            .query_map([], |r| r.get(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .map_err(db_err)?;
        Ok(ids)
    }

    /// Append to the lifecycle log.
    pub fn record_event(
        &self,
        user_id: i64,
        event: &str,
        detail: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO lifecycle_events (user_id, event, detail, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, event, detail, time::to_text(now)],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Event names for a user, oldest first.
    pub fn events_for(&self, user_id: i64) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT event FROM lifecycle_events WHERE user_id = ?1 ORDER BY id")
            .map_err(db_err)?;
        let events = stmt
            .query_map(params![user_id], |r| r.get(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(db_err)?;
        Ok(events)
    }
}
