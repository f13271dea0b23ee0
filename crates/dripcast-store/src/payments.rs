//! Append-only payment log.

use chrono::{DateTime, Utc};
use dripcast_core::error::{DripError, Result};
use rusqlite::params;

use crate::models::{NewPayment, Payment, UtmRow};
use crate::pool::db_err;
use crate::templates::blank_to_none;
use crate::{Db, time};

impl Db<'_> {
    pub fn log_payment(&self, payment: &NewPayment, now: DateTime<Utc>) -> Result<i64> {
        if payment.amount.trim().is_empty() {
            return Err(DripError::validation("amount", "must not be empty"));
        }
        self.conn
            .execute(
                "INSERT INTO payments (user_id, amount, status, utm_source, utm_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    payment.user_id,
                    payment.amount.trim(),
                    payment.status.as_str(),
                    blank_to_none(&payment.utm_source),
                    blank_to_none(&payment.utm_id),
                    time::to_text(now)
                ],
            )
            .map_err(db_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Newest first.
    pub fn recent_payments(&self, limit: u32) -> Result<Vec<Payment>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, user_id, amount, status, utm_source, utm_id, created_at
                 FROM payments ORDER BY id DESC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit.clamp(1, 1000)], |r| {
                Ok(Payment {
                    id: r.get(0)?,
                    user_id: r.get(1)?,
                    amount: r.get(2)?,
                    status: r.get(3)?,
                    utm_source: r.get(4)?,
                    utm_id: r.get(5)?,
                    created_at: r.get(6)?,
                })
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// Successful payments per `utm_source`; missing sources count as "direct".
    pub fn utm_breakdown(&self) -> Result<Vec<UtmRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT COALESCE(utm_source, 'direct') AS src, COUNT(*), COUNT(DISTINCT user_id)
                 FROM payments WHERE status = 'success'
                 GROUP BY src ORDER BY COUNT(*) DESC, src",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |r| {
                Ok(UtmRow {
                    utm_source: r.get(0)?,
                    payments: r.get(1)?,
                    users: r.get(2)?,
                })
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use crate::models::{NewPayment, PaymentStatus};
    use crate::testutil::{store, t0};

    fn payment(user_id: i64, status: PaymentStatus, utm: Option<&str>) -> NewPayment {
        NewPayment {
            user_id,
            amount: "9.99".into(),
            status,
            utm_source: utm.map(str::to_string),
            utm_id: None,
        }
    }

    #[test]
    fn test_log_and_recent() {
        let (_dir, store) = store();
        let now = t0();
        store
            .write(|db| {
                db.log_payment(&payment(1, PaymentStatus::Success, Some("ads")), now)?;
                db.log_payment(&payment(2, PaymentStatus::Failed, None), now)?;
                Ok(())
            })
            .unwrap();
        let recent = store.read(|db| db.recent_payments(10)).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].user_id, 2);
        assert_eq!(recent[0].status, "failed");
    }

    #[test]
    fn test_utm_breakdown_counts_success_only() {
        let (_dir, store) = store();
        let now = t0();
        store
            .write(|db| {
                db.log_payment(&payment(1, PaymentStatus::Success, Some("ads")), now)?;
                db.log_payment(&payment(1, PaymentStatus::Success, Some("ads")), now)?;
                db.log_payment(&payment(2, PaymentStatus::Success, None), now)?;
                db.log_payment(&payment(3, PaymentStatus::Pending, Some("ads")), now)?;
                Ok(())
            })
            .unwrap();
        let rows = store.read(|db| db.utm_breakdown()).unwrap();
        assert_eq!(rows[0].utm_source, "ads");
        assert_eq!(rows[0].payments, 2);
        assert_eq!(rows[0].users, 1);
        assert_eq!(rows[1].utm_source, "direct");
    }

    #[test]
    fn test_blank_amount_rejected() {
        let (_dir, store) = store();
        let mut p = payment(1, PaymentStatus::Success, None);
        p.amount = " ".into();
        let err = store.write(|db| db.log_payment(&p, t0())).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
