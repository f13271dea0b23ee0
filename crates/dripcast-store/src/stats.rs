//! Read-side queries for operators: counts, health alarms, CSV export.

use chrono::{DateTime, NaiveDate, Utc};
use dripcast_core::error::Result;
use dripcast_core::types::Track;
use rusqlite::params;

use crate::models::{Health, PaymentStats, Stats, TrackQueue};
use crate::pool::db_err;
use crate::subscribers::{SUBSCRIBER_COLUMNS, subscriber_from_row};
use crate::{Db, time};

const CSV_HEADER: &str = "ID,Username,Name,Joined,Status,Engaged,Paid,Paid_At";

/// Same precedence as `LifecycleState::derive`, in SQL. `?1` is today.
const STATE_CASE: &str = "CASE
        WHEN active = 0 THEN 'inactive'
        WHEN paid_through IS NOT NULL AND paid_through < ?1 THEN 'expired'
        WHEN paid = 1 THEN 'paid'
        WHEN engaged = 1 THEN 'engaged'
        ELSE 'new'
    END";

impl Db<'_> {
    pub fn stats(&self, today: NaiveDate, now: DateTime<Utc>) -> Result<Stats> {
        let mut stats = Stats::default();
        let sql = format!("SELECT {STATE_CASE} AS state, COUNT(*) FROM subscribers GROUP BY state");
        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let counts = stmt
            .query_map(params![time::date_to_text(today)], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        for (state, n) in counts {
            stats.total += n;
            match state.as_str() {
                "inactive" => stats.inactive = n,
                "expired" => stats.expired = n,
                "paid" => stats.paid = n,
                "engaged" => stats.engaged = n,
                _ => stats.new = n,
            }
        }

        stats.free = self.track_queue(Track::Free, now)?;
        stats.paid_queue = self.track_queue(Track::Paid, now)?;
        stats.broadcasts_pending = self.count("SELECT COUNT(*) FROM broadcasts WHERE sent = 0")?;
        stats.payments = self.payment_stats()?;
        Ok(stats)
    }

    fn track_queue(&self, track: Track, now: DateTime<Utc>) -> Result<TrackQueue> {
        self.conn
            .query_row(
                "SELECT
                    COALESCE(SUM(sent = 0), 0),
                    COALESCE(SUM(sent = 1), 0),
                    COALESCE(SUM(sent = 0 AND fire_at <= ?2), 0)
                 FROM scheduled_deliveries WHERE track = ?1",
                params![track.as_str(), time::to_secs(now)],
                |r| {
                    Ok(TrackQueue {
                        pending: r.get(0)?,
                        sent: r.get(1)?,
                        due: r.get(2)?,
                    })
                },
            )
            .map_err(db_err)
    }

    pub fn payment_stats(&self) -> Result<PaymentStats> {
        self.conn
            .query_row(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(status = 'success'), 0),
                    COALESCE(SUM(status = 'failed'), 0),
                    COALESCE(SUM(status = 'pending'), 0),
                    COUNT(DISTINCT CASE WHEN status = 'success' THEN user_id END)
                 FROM payments",
                [],
                |r| {
                    Ok(PaymentStats {
                        total: r.get(0)?,
                        success: r.get(1)?,
                        failed: r.get(2)?,
                        pending: r.get(3)?,
                        paying_users: r.get(4)?,
                    })
                },
            )
            .map_err(db_err)
    }

    pub fn health(&self) -> Result<Health> {
        let pending = self.count("SELECT COUNT(*) FROM scheduled_deliveries WHERE sent = 0")?;
        let orphans = self.count(
            "SELECT COUNT(*) FROM scheduled_deliveries d
             LEFT JOIN subscribers s ON s.user_id = d.user_id
             WHERE d.sent = 0 AND NOT (COALESCE(s.active, 0) = 1 AND COALESCE(s.engaged, 0) = 1)",
        )?;
        let duplicates = self.count(
            "SELECT COUNT(*) FROM (
                SELECT 1 FROM scheduled_deliveries WHERE sent = 0
                GROUP BY user_id, track, seq_no HAVING COUNT(*) > 1)",
        )?;
        Ok(Health {
            pending,
            orphans,
            duplicates,
            broadcast_enabled: self.broadcast_enabled()?,
            auto_resume_at: self.auto_resume_at()?,
        })
    }

    /// All subscribers as CSV, most recently joined first.
    pub fn export_users_csv(&self, today: NaiveDate) -> Result<String> {
        let sql = format!("SELECT {SUBSCRIBER_COLUMNS} FROM subscribers ORDER BY joined_at DESC, user_id DESC");
        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let subscribers = stmt
            .query_map([], subscriber_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        let mut out = String::from(CSV_HEADER);
        out.push('\n');
        for s in subscribers {
            let fields = [
                s.user_id.to_string(),
                s.username.clone().unwrap_or_default(),
                s.first_name.clone().unwrap_or_default(),
                time::to_text(s.joined_at),
                s.state(today).to_string(),
                yes_no(s.engaged),
                yes_no(s.paid),
                s.paid_at.map(time::to_text).unwrap_or_default(),
            ];
            let line: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
            out.push_str(&line.join(","));
            out.push('\n');
        }
        Ok(out)
    }

    fn count(&self, sql: &str) -> Result<i64> {
        self.conn.query_row(sql, [], |r| r.get(0)).map_err(db_err)
    }
}

fn yes_no(flag: bool) -> String {
    if flag { "yes" } else { "no" }.to_string()
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TemplateInput;
    use crate::testutil::{store, t0};
    use chrono::Duration;

    #[test]
    fn test_empty_csv_is_header_only() {
        let (_dir, store) = store();
        let csv = store.read(|db| db.export_users_csv(t0().date_naive())).unwrap();
        assert_eq!(csv, format!("{CSV_HEADER}\n"));
    }

    #[test]
    fn test_csv_newest_first_and_quoted() {
        let (_dir, store) = store();
        let now = t0();
        store
            .write(|db| {
                db.upsert_subscriber(1, Some("old"), Some("Smith, Ann"), now)?;
                db.upsert_subscriber(2, Some("new"), Some("Bo \"B\""), now + Duration::hours(1))?;
                Ok(())
            })
            .unwrap();
        let csv = store.read(|db| db.export_users_csv(now.date_naive())).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("2,new,\"Bo \"\"B\"\"\","));
        assert!(lines[2].starts_with("1,old,\"Smith, Ann\","));
        assert!(lines[2].contains(",new,no,no,"));
    }

    #[test]
    fn test_stats_by_state() {
        let (_dir, store) = store();
        let now = t0();
        let today = now.date_naive();
        store
            .write(|db| {
                db.upsert_subscriber(1, None, None, now)?;
                db.upsert_subscriber(2, None, None, now)?;
                db.mark_engaged(2, now)?;
                db.upsert_subscriber(3, None, None, now)?;
                db.mark_paid(3, Some(today + Duration::days(10)), now)?;
                db.upsert_subscriber(4, None, None, now)?;
                db.mark_paid(4, Some(today - Duration::days(1)), now)?;
                db.upsert_subscriber(5, None, None, now)?;
                db.leave(5, now)?;
                Ok(())
            })
            .unwrap();
        let stats = store.read(|db| db.stats(today, now)).unwrap();
        assert_eq!(
            (stats.total, stats.new, stats.engaged, stats.paid, stats.expired, stats.inactive),
            (5, 1, 1, 1, 1, 1)
        );
    }

    #[test]
    fn test_health_counts_orphans() {
        let (_dir, store) = store();
        let now = t0();
        store
            .write(|db| {
                db.add_template(
                    Track::Free,
                    &TemplateInput {
                        body: "hi".into(),
                        ..Default::default()
                    },
                )?;
                db.upsert_subscriber(1, None, None, now)?;
                db.mark_engaged(1, now)?;
                db.plan_delivery(1, Track::Free, 1, now, now)?;
                // Bypass the lifecycle operations to leave an orphan behind.
                db.conn
                    .execute("UPDATE subscribers SET engaged = 0 WHERE user_id = 1", [])
                    .map_err(db_err)?;
                Ok(())
            })
            .unwrap();
        let health = store.read(|db| db.health()).unwrap();
        assert_eq!(health.pending, 1);
        assert_eq!(health.orphans, 1);
        assert_eq!(health.duplicates, 0);
        assert!(!health.ok());
    }
}
