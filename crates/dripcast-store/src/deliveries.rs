//! Per-user scheduled deliveries: the dispatcher's work queue.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dripcast_core::error::{DripError, Result};
use dripcast_core::types::{OutgoingMessage, Track};
use rusqlite::{OptionalExtension, Row, params};

use crate::models::{Delivery, DueDelivery, PlanOutcome};
use crate::pool::db_err;
use crate::subscribers::audience_predicate;
use crate::{Db, time};

fn delivery_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, i64, String, i64, i64, bool)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

impl Db<'_> {
    /// Insert one pending delivery after checking that the subscriber can
    /// receive it and that the template exists.
    pub fn plan_delivery(
        &self,
        user_id: i64,
        track: Track,
        seq_no: i64,
        fire_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PlanOutcome> {
        let flags: Option<(bool, bool, bool)> = self
            .conn
            .query_row(
                "SELECT active, engaged, paid FROM subscribers WHERE user_id = ?1",
                params![user_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()
            .map_err(db_err)?;
        let Some((active, engaged, paid)) = flags else {
            return Err(DripError::validation(
                "user_id",
                format!("subscriber {user_id} does not exist"),
            ));
        };
        if !active {
            return Err(DripError::validation(
                "user_id",
                format!("subscriber {user_id} is inactive"),
            ));
        }
        if !engaged {
            return Err(DripError::validation(
                "user_id",
                format!("subscriber {user_id} has not opened a conversation"),
            ));
        }
        if track == Track::Free && paid {
            return Ok(PlanOutcome::SkippedPaid);
        }

        let template_exists: bool = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM templates WHERE track = ?1 AND seq_no = ?2)",
                params![track.as_str(), seq_no],
                |r| r.get(0),
            )
            .map_err(db_err)?;
        if !template_exists {
            return Err(DripError::validation(
                "seq_no",
                format!("no {track} template #{seq_no}"),
            ));
        }

        let duplicate: bool = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM scheduled_deliveries
                 WHERE user_id = ?1 AND track = ?2 AND seq_no = ?3 AND sent = 0)",
                params![user_id, track.as_str(), seq_no],
                |r| r.get(0),
            )
            .map_err(db_err)?;
        if duplicate {
            return Ok(PlanOutcome::Duplicate);
        }

        self.conn
            .execute(
                "INSERT INTO scheduled_deliveries (user_id, track, seq_no, fire_at, sent, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![
                    user_id,
                    track.as_str(),
                    seq_no,
                    time::to_secs(fire_at),
                    time::to_text(now)
                ],
            )
            .map_err(db_err)?;
        Ok(PlanOutcome::Inserted(self.conn.last_insert_rowid()))
    }

    /// Due un-sent deliveries of `track` whose subscriber is still in the
    /// track's audience, oldest `fire_at` first. Body, photo and buttons are
    /// read from the template as it is now.
    pub fn drain_due(&self, track: Track, now: DateTime<Utc>) -> Result<Vec<DueDelivery>> {
        let sql = format!(
            "SELECT d.id, d.user_id, d.seq_no, d.fire_at, t.id, t.body, t.photo_ref
             FROM scheduled_deliveries d
             JOIN subscribers s ON s.user_id = d.user_id
             JOIN templates t ON t.track = d.track AND t.seq_no = d.seq_no
             WHERE d.track = ?1 AND d.sent = 0 AND d.fire_at <= ?2 AND {}
             ORDER BY d.fire_at ASC, d.id ASC",
            audience_predicate(track)
        );
        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![track.as_str(), time::to_secs(now)], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, Option<String>>(6)?,
                ))
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        let mut buttons = HashMap::new();
        let mut due = Vec::with_capacity(rows.len());
        for (id, user_id, seq_no, fire_at, template_id, body, photo) in rows {
            if !buttons.contains_key(&template_id) {
                buttons.insert(template_id, self.template_buttons(template_id)?);
            }
            let message = OutgoingMessage::text(&body)
                .with_photo(photo)
                .with_buttons(buttons[&template_id].clone());
            due.push(DueDelivery {
                id,
                user_id,
                track,
                seq_no,
                fire_at: time::from_secs(fire_at),
                message,
            });
        }
        Ok(due)
    }

    /// Flip `sent` on. Returns false if the row was already sent or is gone.
    pub fn mark_sent(&self, delivery_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE scheduled_deliveries SET sent = 1, sent_at = ?2 WHERE id = ?1 AND sent = 0",
                params![delivery_id, time::to_text(now)],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Delete every un-sent row for `(user, track)`.
    pub fn cancel_pending_for(&self, user_id: i64, track: Track) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM scheduled_deliveries WHERE user_id = ?1 AND track = ?2 AND sent = 0",
                params![user_id, track.as_str()],
            )
            .map_err(db_err)
    }

    pub fn pending_for(&self, user_id: i64, track: Track) -> Result<Vec<Delivery>> {
        self.deliveries_where(user_id, track, "AND sent = 0")
    }

    /// Every row, sent and pending, for `(user, track)`.
    pub fn deliveries_for(&self, user_id: i64, track: Track) -> Result<Vec<Delivery>> {
        self.deliveries_where(user_id, track, "")
    }

    fn deliveries_where(&self, user_id: i64, track: Track, extra: &str) -> Result<Vec<Delivery>> {
        let sql = format!(
            "SELECT id, user_id, track, seq_no, fire_at, sent FROM scheduled_deliveries
             WHERE user_id = ?1 AND track = ?2 {extra}
             ORDER BY fire_at, id"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![user_id, track.as_str()], delivery_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter()
            .map(|(id, user_id, track, seq_no, fire_at, sent)| {
                Ok(Delivery {
                    id,
                    user_id,
                    track: track.parse()?,
                    seq_no,
                    fire_at: time::from_secs(fire_at),
                    sent,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TemplateInput;
    use crate::testutil::{store, t0};
    use chrono::Duration;
    use dripcast_core::types::LinkButton;

    fn seed(db: &Db<'_>, now: DateTime<Utc>) -> Result<()> {
        db.add_template(
            Track::Free,
            &TemplateInput {
                body: "one".into(),
                delay_hours: 0.05,
                buttons: vec![LinkButton::new("Go", "https://example.com")],
                ..Default::default()
            },
        )?;
        db.add_template(
            Track::Free,
            &TemplateInput {
                body: "two".into(),
                delay_hours: 4.0,
                ..Default::default()
            },
        )?;
        db.upsert_subscriber(7, Some("ann"), Some("Ann"), now)?;
        db.mark_engaged(7, now)?;
        Ok(())
    }

    #[test]
    fn test_plan_rejects_ineligible() {
        let (_dir, store) = store();
        let now = t0();
        store
            .write(|db| {
                seed(db, now)?;
                db.upsert_subscriber(8, None, None, now)?;
                Ok(())
            })
            .unwrap();
        let err = store
            .write(|db| db.plan_delivery(99, Track::Free, 1, now, now))
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        let err = store
            .write(|db| db.plan_delivery(8, Track::Free, 1, now, now))
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        let err = store
            .write(|db| db.plan_delivery(7, Track::Free, 5, now, now))
            .unwrap_err();
        assert!(matches!(err, DripError::Validation { ref field, .. } if field == "seq_no"));
    }

    #[test]
    fn test_plan_twice_is_noop() {
        let (_dir, store) = store();
        let now = t0();
        store
            .write(|db| {
                seed(db, now)?;
                assert!(matches!(
                    db.plan_delivery(7, Track::Free, 1, now, now)?,
                    PlanOutcome::Inserted(_)
                ));
                assert_eq!(db.plan_delivery(7, Track::Free, 1, now, now)?, PlanOutcome::Duplicate);
                Ok(())
            })
            .unwrap();
        assert_eq!(store.read(|db| db.pending_for(7, Track::Free)).unwrap().len(), 1);
    }

    #[test]
    fn test_free_plan_for_paid_user_is_skipped() {
        let (_dir, store) = store();
        let now = t0();
        let outcome = store
            .write(|db| {
                seed(db, now)?;
                db.mark_paid(7, None, now)?;
                db.plan_delivery(7, Track::Free, 1, now, now)
            })
            .unwrap();
        assert_eq!(outcome, PlanOutcome::SkippedPaid);
    }

    #[test]
    fn test_drain_due_never_early_and_sorted() {
        let (_dir, store) = store();
        let now = t0();
        store
            .write(|db| {
                seed(db, now)?;
                db.plan_delivery(7, Track::Free, 2, now + Duration::hours(4), now)?;
                db.plan_delivery(7, Track::Free, 1, now + Duration::minutes(3), now)?;
                Ok(())
            })
            .unwrap();

        let early = store
            .read(|db| db.drain_due(Track::Free, now + Duration::minutes(2)))
            .unwrap();
        assert!(early.is_empty());

        let due = store
            .read(|db| db.drain_due(Track::Free, now + Duration::minutes(4)))
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].seq_no, 1);
        assert_eq!(due[0].message.body, "one");
        assert_eq!(due[0].message.buttons.len(), 1);

        let all = store
            .read(|db| db.drain_due(Track::Free, now + Duration::hours(5)))
            .unwrap();
        let seqs: Vec<i64> = all.iter().map(|d| d.seq_no).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_mark_sent_once() {
        let (_dir, store) = store();
        let now = t0();
        let id = store
            .write(|db| {
                seed(db, now)?;
                match db.plan_delivery(7, Track::Free, 1, now, now)? {
                    PlanOutcome::Inserted(id) => Ok(id),
                    other => panic!("unexpected {other:?}"),
                }
            })
            .unwrap();
        assert!(store.write(|db| db.mark_sent(id, now)).unwrap());
        assert!(!store.write(|db| db.mark_sent(id, now)).unwrap());
        assert!(store.read(|db| db.drain_due(Track::Free, now)).unwrap().is_empty());
        // A sent row is history; the same key can be planned again.
        let again = store
            .write(|db| db.plan_delivery(7, Track::Free, 1, now, now))
            .unwrap();
        assert!(matches!(again, PlanOutcome::Inserted(_)));
    }

    #[test]
    fn test_late_binding_reads_current_template() {
        let (_dir, store) = store();
        let now = t0();
        store
            .write(|db| {
                seed(db, now)?;
                db.plan_delivery(7, Track::Free, 1, now, now)?;
                db.update_template(
                    Track::Free,
                    1,
                    &TemplateInput {
                        body: "edited".into(),
                        delay_hours: 9.0,
                        ..Default::default()
                    },
                )
            })
            .unwrap();
        let due = store.read(|db| db.drain_due(Track::Free, now)).unwrap();
        assert_eq!(due[0].message.body, "edited");
        assert_eq!(due[0].fire_at, now);
        assert!(due[0].message.buttons.is_empty());
    }
}
