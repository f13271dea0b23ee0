//! Lifecycle registry: translates membership, chat and payment events into
//! subscriber-state changes and fans out to the planner.
//!
//! Every state change and the planning it implies commit in one store
//! transaction. Direct messages (welcome, goodbye, payment confirmation,
//! menu follow-ups) are sent after the commit and never roll it back.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use dripcast_core::error::{DripError, Result};
use dripcast_core::traits::{Clock, Transport};
use dripcast_core::types::{OutgoingMessage, Track};
use dripcast_store::{MarkPaid, NewPayment, PaymentStatus, Store, Upsert};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::Instrument;

use crate::planner::{PlanReport, Planner};

/// Payment notification as reported by the payment provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub user_id: i64,
    /// Kept as text; providers send either `"9.99"` or `9.99`.
    #[serde(deserialize_with = "amount_text")]
    pub amount: String,
    pub status: PaymentStatus,
    #[serde(default)]
    pub utm_source: Option<String>,
    #[serde(default)]
    pub utm_id: Option<String>,
    #[serde(default)]
    pub paid_through: Option<NaiveDate>,
}

fn amount_text<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Amount {
        Text(String),
        Int(i64),
        Float(f64),
    }
    Ok(match Amount::deserialize(de)? {
        Amount::Text(s) => s,
        Amount::Int(n) => n.to_string(),
        Amount::Float(x) => x.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    /// Non-success status: logged only.
    Logged,
    /// Success for a user id we have never seen: logged only.
    UnknownSubscriber,
    /// Unpaid -> paid: free track cancelled, paid track planned.
    Activated { cancelled_free: usize, planned_paid: usize },
    /// Already paid: `paid_at` / `paid_through` refreshed.
    Renewed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FirstContact {
    /// `engaged` or `active` flipped on this contact.
    pub changed: bool,
    pub plan: PlanReport,
    pub welcomed: bool,
}

pub struct LifecycleRegistry {
    store: Arc<Store>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    planner: Planner,
    followup_pause: Duration,
    span: tracing::Span,
}

impl LifecycleRegistry {
    pub fn new(store: Arc<Store>, transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            transport,
            clock,
            planner: Planner::new(),
            followup_pause: Duration::ZERO,
            span: tracing::info_span!("lifecycle"),
        }
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.planner = Planner::with_span(tracing::info_span!(parent: &span, "planner"));
        self.span = span;
        self
    }

    /// Pause between consecutive menu follow-ups.
    pub fn with_followup_pause(mut self, pause: Duration) -> Self {
        self.followup_pause = pause;
        self
    }

    /// Channel join: create or revive the subscriber.
    pub async fn joined(
        &self,
        user_id: i64,
        username: Option<&str>,
        first_name: Option<&str>,
    ) -> Result<Upsert> {
        let now = self.clock.now();
        let (username, first_name) = (username.map(str::to_owned), first_name.map(str::to_owned));
        let outcome = self
            .store
            .write_async(move |db| {
                db.upsert_subscriber(user_id, username.as_deref(), first_name.as_deref(), now)
            })
            .instrument(self.span.clone())
            .await?;
        self.span.in_scope(|| tracing::info!(user_id, ?outcome, "subscriber joined"));
        Ok(outcome)
    }

    /// First private message (`/start`). Engages the subscriber, plans the
    /// track they belong to when that changed, and sends the welcome menu.
    pub async fn first_contact(
        &self,
        user_id: i64,
        username: Option<&str>,
        first_name: Option<&str>,
    ) -> Result<FirstContact> {
        async {
            let now = self.clock.now();
            let (username, first_name) =
                (username.map(str::to_owned), first_name.map(str::to_owned));
            let planner = self.planner.clone();
            let (contact, welcome, labels) = self.store.write_async(move |db| {
                db.upsert_subscriber(user_id, username.as_deref(), first_name.as_deref(), now)?;
                let mut contact = FirstContact {
                    changed: db.mark_engaged(user_id, now)?,
                    ..FirstContact::default()
                };
                if contact.changed {
                    let paid = db.get_subscriber(user_id)?.is_some_and(|s| s.paid);
                    let track = if paid { Track::Paid } else { Track::Free };
                    contact.plan = planner.materialise(db, user_id, track, now)?;
                }
                Ok((contact, db.welcome_message()?, db.menu_labels()?))
            })
            .await?;

            let mut contact = contact;
            contact.welcomed = match self.transport.send_menu(user_id, &welcome, &labels).await {
                Ok(()) => true,
                Err(e) => {
                    self.direct_send_failed(user_id, "welcome", e).await?;
                    false
                }
            };
            tracing::info!(
                user_id,
                changed = contact.changed,
                planned = contact.plan.inserted,
                "first contact"
            );
            Ok(contact)
        }
        .instrument(self.span.clone())
        .await
    }

    /// Channel leave: clear every flag, cancel both tracks, say goodbye.
    pub async fn left(&self, user_id: i64) -> Result<bool> {
        async {
            let now = self.clock.now();
            let (known, goodbye) = self
                .store
                .write_async(move |db| Ok((db.leave(user_id, now)?, db.goodbye_message()?)))
                .await?;
            if !known {
                tracing::debug!(user_id, "leave for unknown subscriber ignored");
                return Ok(false);
            }
            tracing::info!(user_id, "subscriber left");
            if let Some(message) = goodbye {
                self.send_direct(user_id, "goodbye", &message).await?;
            }
            Ok(true)
        }
        .instrument(self.span.clone())
        .await
    }

    /// Payment notification. The log entry, the flag change, the free-track
    /// cancellation and the paid-track plan share one transaction.
    pub async fn payment(&self, event: &PaymentEvent) -> Result<PaymentOutcome> {
        async {
            let now = self.clock.now();
            let user_id = event.user_id;
            let record = NewPayment {
                user_id,
                amount: event.amount.clone(),
                status: event.status,
                utm_source: event.utm_source.clone(),
                utm_id: event.utm_id.clone(),
            };

            let (status, paid_through) = (event.status, event.paid_through);
            let planner = self.planner.clone();
            let (outcome, confirmation) = self.store.write_async(move |db| {
                db.log_payment(&record, now)?;
                if status != PaymentStatus::Success {
                    return Ok((PaymentOutcome::Logged, None));
                }
                let outcome = match db.mark_paid(user_id, paid_through, now)? {
                    MarkPaid::UnknownSubscriber => PaymentOutcome::UnknownSubscriber,
                    MarkPaid::NewlyPaid => {
                        let cancelled_free = db.cancel_pending_for(user_id, Track::Free)?;
                        let plan = planner.materialise(db, user_id, Track::Paid, now)?;
                        PaymentOutcome::Activated {
                            cancelled_free,
                            planned_paid: plan.inserted,
                        }
                    }
                    MarkPaid::Renewed => {
                        db.cancel_pending_for(user_id, Track::Free)?;
                        PaymentOutcome::Renewed
                    }
                };
                let confirmation = match outcome {
                    PaymentOutcome::Activated { .. } | PaymentOutcome::Renewed => {
                        db.payment_success_message()?
                    }
                    _ => None,
                };
                Ok((outcome, confirmation))
            })
            .await?;

            tracing::info!(
                user_id,
                status = event.status.as_str(),
                amount = %event.amount,
                ?outcome,
                "payment processed"
            );
            if let Some(message) = confirmation {
                self.send_direct(user_id, "payment_success", &message).await?;
            }
            Ok(outcome)
        }
        .instrument(self.span.clone())
        .await
    }

    /// A welcome-menu label was pressed: deliver its follow-ups in order.
    /// Text that is not a menu label is ignored. Returns how many were sent.
    pub async fn menu_pressed(&self, user_id: i64, label: &str) -> Result<usize> {
        async {
            let owned = label.to_owned();
            let Some(followups) = self
                .store
                .read_async(move |db| db.followups_for_label(&owned))
                .await?
            else {
                tracing::debug!(user_id, "text is not a menu label");
                return Ok(0);
            };
            let mut sent = 0;
            for (i, followup) in followups.iter().enumerate() {
                if i > 0 && !self.followup_pause.is_zero() {
                    tokio::time::sleep(self.followup_pause).await;
                }
                if !self.send_direct(user_id, "menu_followup", &followup.message()).await? {
                    break;
                }
                sent += 1;
            }
            tracing::debug!(user_id, label, sent, "menu follow-ups delivered");
            Ok(sent)
        }
        .instrument(self.span.clone())
        .await
    }

    /// One best-effort transport call. Returns whether it was delivered.
    async fn send_direct(&self, user_id: i64, what: &str, message: &OutgoingMessage) -> Result<bool> {
        match self.transport.deliver(user_id, message).await {
            Ok(()) => Ok(true),
            Err(e) => {
                self.direct_send_failed(user_id, what, e).await?;
                Ok(false)
            }
        }
    }

    async fn direct_send_failed(&self, user_id: i64, what: &str, err: DripError) -> Result<()> {
        handle_direct_failure(&self.store, self.clock.as_ref(), user_id, what, err).await
    }
}

/// Shared handling for non-queued sends: a gone recipient is deactivated,
/// anything else is logged and dropped.
pub(crate) async fn handle_direct_failure(
    store: &Arc<Store>,
    clock: &dyn Clock,
    user_id: i64,
    what: &str,
    err: DripError,
) -> Result<()> {
    if let DripError::TransportPermanent(_) = err {
        let now = clock.now();
        store
            .write_async(move |db| db.deactivate(user_id, now))
            .await?;
        tracing::info!(user_id, message = what, kind = err.kind(), "recipient gone, deactivated");
    } else {
        tracing::warn!(user_id, message = what, kind = err.kind(), "direct send failed: {err}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Failure, RecordingTransport};
    use chrono::{DateTime, TimeZone, Utc};
    use dripcast_core::traits::ManualClock;
    use dripcast_store::{SettingKey, TemplateInput};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<Store>,
        transport: Arc<RecordingTransport>,
        registry: LifecycleRegistry,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(dripcast_store::open_in_dir(dir.path()).unwrap());
        let transport = Arc::new(RecordingTransport::new());
        let clock = Arc::new(ManualClock::new(t0()));
        store
            .write(|db| {
                for track in Track::ALL {
                    db.add_template(
                        track,
                        &TemplateInput {
                            body: format!("{track} #1"),
                            delay_hours: 1.0,
                            ..Default::default()
                        },
                    )?;
                }
                Ok(())
            })
            .unwrap();
        let registry = LifecycleRegistry::new(store.clone(), transport.clone(), clock);
        Fixture {
            _dir: dir,
            store,
            transport,
            registry,
        }
    }

    fn success(user_id: i64) -> PaymentEvent {
        PaymentEvent {
            user_id,
            amount: "9.99".into(),
            status: PaymentStatus::Success,
            utm_source: None,
            utm_id: None,
            paid_through: None,
        }
    }

    #[tokio::test]
    async fn test_first_contact_plans_free_and_welcomes() {
        let f = fixture();
        f.store.write(|db| db.add_menu_button("Prices")).unwrap();
        let contact = f.registry.first_contact(7, Some("ann"), Some("Ann")).await.unwrap();
        assert!(contact.changed);
        assert_eq!(contact.plan.inserted, 1);
        assert!(contact.welcomed);
        let sent = f.transport.sent_to(7);
        assert_eq!(sent[0].menu.as_deref(), Some(&["Prices".to_string()][..]));

        // A second /start re-sends the menu but plans nothing.
        let again = f.registry.first_contact(7, None, None).await.unwrap();
        assert!(!again.changed);
        assert_eq!(f.store.read(|db| db.pending_for(7, Track::Free)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_payment_switches_tracks() {
        let f = fixture();
        f.registry.first_contact(7, None, None).await.unwrap();
        f.transport.reset();

        let outcome = f.registry.payment(&success(7)).await.unwrap();
        assert_eq!(
            outcome,
            PaymentOutcome::Activated {
                cancelled_free: 1,
                planned_paid: 1
            }
        );
        assert!(f.store.read(|db| db.pending_for(7, Track::Free)).unwrap().is_empty());
        assert_eq!(f.transport.sent_to(7).len(), 1);

        assert_eq!(f.registry.payment(&success(7)).await.unwrap(), PaymentOutcome::Renewed);
        assert_eq!(f.store.read(|db| db.pending_for(7, Track::Paid)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_payment_outcomes_without_state_change() {
        let f = fixture();
        assert_eq!(
            f.registry.payment(&success(404)).await.unwrap(),
            PaymentOutcome::UnknownSubscriber
        );
        let mut failed = success(404);
        failed.status = PaymentStatus::Failed;
        assert_eq!(f.registry.payment(&failed).await.unwrap(), PaymentOutcome::Logged);
        assert_eq!(f.store.read(|db| db.recent_payments(10)).unwrap().len(), 2);
        assert!(f.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_confirmation_respects_flag() {
        let f = fixture();
        f.registry.first_contact(7, None, None).await.unwrap();
        f.store
            .write(|db| db.set_setting(SettingKey::PaymentSuccessEnabled, "0", t0()))
            .unwrap();
        f.transport.reset();
        f.registry.payment(&success(7)).await.unwrap();
        assert!(f.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_blocked_welcome_deactivates() {
        let f = fixture();
        f.transport.fail_next(7, Failure::Permanent);
        let contact = f.registry.first_contact(7, None, None).await.unwrap();
        assert!(!contact.welcomed);
        let sub = f.store.read(|db| db.get_subscriber(7)).unwrap().unwrap();
        assert!(!sub.active);
        assert!(f.store.read(|db| db.pending_for(7, Track::Free)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_left_sends_goodbye() {
        let f = fixture();
        f.store
            .write(|db| db.set_setting(SettingKey::GoodbyeBody, "Bye!", t0()))
            .unwrap();
        assert!(!f.registry.left(7).await.unwrap());
        f.registry.first_contact(7, None, None).await.unwrap();
        f.transport.reset();
        assert!(f.registry.left(7).await.unwrap());
        assert_eq!(f.transport.bodies_to(7), vec!["Bye!"]);
    }

    #[tokio::test]
    async fn test_menu_followups_in_order() {
        let f = fixture();
        f.store
            .write(|db| {
                let b = db.add_menu_button("Prices")?;
                db.add_followup(b.id, "first", None)?;
                db.add_followup(b.id, "second", Some("photo".into()))?;
                Ok(())
            })
            .unwrap();
        assert_eq!(f.registry.menu_pressed(7, "Prices").await.unwrap(), 2);
        assert_eq!(f.transport.bodies_to(7), vec!["first", "second"]);
        assert_eq!(f.registry.menu_pressed(7, "hello").await.unwrap(), 0);
    }
}
