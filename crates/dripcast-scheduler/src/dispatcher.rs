//! Dispatcher: the single loop that drains due work and calls the transport.
//! Driven by a tokio interval.
//!
//! One tick:
//! 1. if dispatch is paused and `broadcast.auto_resume_at` has passed, resume
//! 2. if paused, stop
//! 3. free deliveries → free broadcasts → paid deliveries → paid broadcasts
//!
//! The dispatcher is the only writer of `sent`.

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use dripcast_core::error::{DripError, Result};
use dripcast_core::traits::{Clock, Transport};
use dripcast_core::types::Track;
use dripcast_store::Store;
use tracing::Instrument;

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub sent: usize,
    /// Transient failures; the row stays pending for the next tick.
    pub failed: usize,
    pub deactivated: usize,
    /// Rejected by the transport as malformed; marked sent anyway.
    pub bad_template: usize,
    /// Rows skipped because an earlier row for the same user failed this tick.
    pub skipped: usize,
    pub broadcasts_completed: usize,
    pub resumed: bool,
    pub paused: bool,
    pub rate_limited: bool,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.sent == 0
            && self.failed == 0
            && self.deactivated == 0
            && self.bad_template == 0
            && self.skipped == 0
            && self.broadcasts_completed == 0
            && !self.resumed
            && !self.rate_limited
    }
}

pub struct Dispatcher {
    store: Arc<Store>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    tick_every: Duration,
    span: tracing::Span,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Store>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        tick_every: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            clock,
            tick_every,
            span: tracing::info_span!("dispatcher"),
        }
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Run forever. Store errors are logged; the next tick starts fresh.
    pub async fn run(&self) {
        async {
            tracing::info!(
                "⏰ Dispatcher started (tick every {}s)",
                self.tick_every.as_secs()
            );
            let mut interval = tokio::time::interval(self.tick_every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match self.tick_inner().await {
                    Ok(report) if !report.is_empty() => {
                        tracing::info!(
                            sent = report.sent,
                            failed = report.failed,
                            deactivated = report.deactivated,
                            bad_template = report.bad_template,
                            skipped = report.skipped,
                            broadcasts = report.broadcasts_completed,
                            rate_limited = report.rate_limited,
                            "tick"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(kind = e.kind(), "tick failed: {e}"),
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    /// One pass over all due work.
    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_inner().instrument(self.span.clone()).await
    }

    async fn tick_inner(&self) -> Result<TickReport> {
        let mut report = TickReport::default();
        let now = self.clock.now();

        let (enabled, resume_at) = self
            .store
            .read_async(|db| Ok((db.broadcast_enabled()?, db.auto_resume_at()?)))
            .await?;
        if !enabled {
            match resume_at {
                Some(at) if at <= now => {
                    self.store
                        .write_async(move |db| db.resume_broadcasts(now))
                        .await?;
                    tracing::info!(%at, "dispatch auto-resumed");
                    report.resumed = true;
                }
                _ => {
                    report.paused = true;
                    return Ok(report);
                }
            }
        }

        for track in Track::ALL {
            if self.deliveries(track, &mut report).await?.is_break() {
                break;
            }
            if self.broadcasts(track, &mut report).await?.is_break() {
                break;
            }
        }
        Ok(report)
    }

    async fn deliveries(&self, track: Track, report: &mut TickReport) -> Result<ControlFlow<()>> {
        let now = self.clock.now();
        let due = self.store.read_async(move |db| db.drain_due(track, now)).await?;
        // Users whose earlier row failed this tick; later rows wait so that
        // per-user order is kept.
        let mut held: HashSet<i64> = HashSet::new();

        for delivery in due {
            let user_id = delivery.user_id;
            if held.contains(&user_id) {
                report.skipped += 1;
                continue;
            }
            match self.transport.deliver(user_id, &delivery.message).await {
                Ok(()) => {
                    self.mark_sent(delivery.id).await?;
                    report.sent += 1;
                    tracing::debug!(
                        user_id,
                        track = %track,
                        seq_no = delivery.seq_no,
                        delivery_id = delivery.id,
                        "delivered"
                    );
                }
                Err(DripError::TransportRateLimited { retry_after }) => {
                    tracing::warn!(
                        user_id,
                        delivery_id = delivery.id,
                        kind = "rate_limited",
                        retry_after = ?retry_after,
                        "rate limited, ending tick"
                    );
                    report.rate_limited = true;
                    return Ok(ControlFlow::Break(()));
                }
                Err(DripError::TransportBadTemplate(reason)) => {
                    self.mark_sent(delivery.id).await?;
                    report.bad_template += 1;
                    tracing::warn!(
                        user_id,
                        track = %track,
                        seq_no = delivery.seq_no,
                        delivery_id = delivery.id,
                        kind = "bad_template",
                        "template rejected by transport, marked sent: {reason}"
                    );
                }
                Err(e @ DripError::TransportPermanent(_)) => {
                    self.deactivate(user_id).await?;
                    held.insert(user_id);
                    report.deactivated += 1;
                    tracing::info!(user_id, kind = e.kind(), "recipient gone, deactivated");
                }
                Err(e) => {
                    held.insert(user_id);
                    report.failed += 1;
                    tracing::warn!(
                        user_id,
                        delivery_id = delivery.id,
                        kind = e.kind(),
                        "delivery failed, retrying next tick: {e}"
                    );
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn broadcasts(&self, track: Track, report: &mut TickReport) -> Result<ControlFlow<()>> {
        let now = self.clock.now();
        let due = self
            .store
            .read_async(move |db| db.due_broadcasts(track, now))
            .await?;

        for broadcast in due {
            let message = broadcast.message();
            let broadcast_id = broadcast.id;
            let audience = self
                .store
                .read_async(move |db| db.broadcast_audience(track, broadcast_id))
                .await?;
            let mut complete = true;

            for user_id in audience {
                match self.transport.deliver(user_id, &message).await {
                    Ok(()) => {
                        let now = self.clock.now();
                        self.store
                            .write_async(move |db| db.record_receipt(broadcast_id, user_id, now))
                            .await?;
                        report.sent += 1;
                    }
                    Err(DripError::TransportRateLimited { retry_after }) => {
                        tracing::warn!(
                            broadcast_id = broadcast.id,
                            kind = "rate_limited",
                            retry_after = ?retry_after,
                            "rate limited, ending tick"
                        );
                        report.rate_limited = true;
                        return Ok(ControlFlow::Break(()));
                    }
                    Err(DripError::TransportBadTemplate(reason)) => {
                        // Same body for everyone: no recipient will accept it.
                        tracing::warn!(
                            broadcast_id = broadcast.id,
                            kind = "bad_template",
                            "broadcast rejected by transport, marked sent: {reason}"
                        );
                        report.bad_template += 1;
                        break;
                    }
                    Err(e @ DripError::TransportPermanent(_)) => {
                        self.deactivate(user_id).await?;
                        report.deactivated += 1;
                        tracing::info!(user_id, kind = e.kind(), "recipient gone, deactivated");
                    }
                    Err(e) => {
                        complete = false;
                        report.failed += 1;
                        tracing::warn!(
                            user_id,
                            broadcast_id = broadcast.id,
                            kind = e.kind(),
                            "broadcast send failed, retrying next tick: {e}"
                        );
                    }
                }
            }

            if complete {
                self.store
                    .write_async(move |db| db.mark_broadcast_sent(broadcast_id))
                    .await?;
                report.broadcasts_completed += 1;
                tracing::info!(broadcast_id = broadcast.id, track = %track, "📣 broadcast complete");
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn mark_sent(&self, delivery_id: i64) -> Result<bool> {
        let now = self.clock.now();
        self.store
            .write_async(move |db| db.mark_sent(delivery_id, now))
            .await
    }

    async fn deactivate(&self, user_id: i64) -> Result<bool> {
        let now = self.clock.now();
        self.store
            .write_async(move |db| db.deactivate(user_id, now))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Failure, RecordingTransport};
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use dripcast_core::traits::ManualClock;
    use dripcast_store::{BroadcastInput, TemplateInput};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<Store>,
        transport: Arc<RecordingTransport>,
        clock: Arc<ManualClock>,
        dispatcher: Dispatcher,
    }

    /// Two free templates at 0 h and 1 h; users 1 and 2 engaged and planned.
    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(dripcast_store::open_in_dir(dir.path()).unwrap());
        let transport = Arc::new(RecordingTransport::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let now = t0();
        store
            .write(|db| {
                for (body, hours) in [("one", 0.0), ("two", 1.0)] {
                    db.add_template(
                        Track::Free,
                        &TemplateInput {
                            body: body.into(),
                            delay_hours: hours,
                            ..Default::default()
                        },
                    )?;
                }
                for user in [1, 2] {
                    db.upsert_subscriber(user, None, None, now)?;
                    db.mark_engaged(user, now)?;
                    for (seq, at) in db.template_offsets(Track::Free, now)? {
                        db.plan_delivery(user, Track::Free, seq, at, now)?;
                    }
                }
                Ok(())
            })
            .unwrap();
        let dispatcher = Dispatcher::new(
            store.clone(),
            transport.clone(),
            clock.clone(),
            Duration::from_secs(30),
        );
        Fixture {
            _dir: dir,
            store,
            transport,
            clock,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn test_sends_due_and_marks_sent() {
        let f = fixture();
        let report = f.dispatcher.tick().await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(f.transport.bodies_to(1), vec!["one"]);

        let report = f.dispatcher.tick().await.unwrap();
        assert!(report.is_empty());

        f.clock.advance(ChronoDuration::hours(1));
        f.dispatcher.tick().await.unwrap();
        assert_eq!(f.transport.bodies_to(1), vec!["one", "two"]);
        assert!(f.store.read(|db| db.pending_for(1, Track::Free)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_holds_user_order() {
        let f = fixture();
        f.clock.advance(ChronoDuration::hours(2));
        f.transport.fail_next(1, Failure::Transient);
        let report = f.dispatcher.tick().await.unwrap();
        assert_eq!((report.failed, report.skipped, report.sent), (1, 1, 2));
        assert!(f.transport.bodies_to(1).is_empty());

        f.dispatcher.tick().await.unwrap();
        assert_eq!(f.transport.bodies_to(1), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_permanent_failure_deactivates() {
        let f = fixture();
        f.transport.fail_next(2, Failure::Permanent);
        let report = f.dispatcher.tick().await.unwrap();
        assert_eq!(report.deactivated, 1);
        let sub = f.store.read(|db| db.get_subscriber(2)).unwrap().unwrap();
        assert!(!sub.active);
        assert!(f.store.read(|db| db.pending_for(2, Track::Free)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_template_is_not_retried() {
        let f = fixture();
        f.transport.fail_next(1, Failure::BadTemplate);
        let report = f.dispatcher.tick().await.unwrap();
        assert_eq!(report.bad_template, 1);
        f.dispatcher.tick().await.unwrap();
        assert!(f.transport.bodies_to(1).is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_ends_tick() {
        let f = fixture();
        f.transport.fail_next(1, Failure::RateLimited);
        let report = f.dispatcher.tick().await.unwrap();
        assert!(report.rate_limited);
        assert_eq!(report.sent, 0);
        assert!(f.transport.sent().is_empty());

        let report = f.dispatcher.tick().await.unwrap();
        assert_eq!(report.sent, 2);
    }

    #[tokio::test]
    async fn test_paused_then_auto_resumed() {
        let f = fixture();
        let resume = t0() + ChronoDuration::minutes(10);
        f.store.write(|db| db.pause_broadcasts(Some(resume), t0())).unwrap();
        let report = f.dispatcher.tick().await.unwrap();
        assert!(report.paused);
        assert!(f.transport.sent().is_empty());

        f.clock.set(resume);
        let report = f.dispatcher.tick().await.unwrap();
        assert!(report.resumed);
        assert_eq!(report.sent, 2);
        assert!(f.store.read(|db| db.broadcast_enabled()).unwrap());
    }

    #[tokio::test]
    async fn test_broadcast_retry_skips_reached_recipients() {
        let f = fixture();
        f.dispatcher.tick().await.unwrap();
        f.transport.reset();

        let b = f
            .store
            .write(|db| {
                db.schedule_broadcast(
                    &BroadcastInput {
                        track: Track::Free,
                        body: "news".into(),
                        photo_ref: None,
                        fire_at: t0(),
                        buttons: vec![],
                    },
                    t0(),
                )
            })
            .unwrap();
        f.transport.fail_next(2, Failure::Transient);
        let report = f.dispatcher.tick().await.unwrap();
        assert_eq!(report.broadcasts_completed, 0);
        assert_eq!(f.store.read(|db| db.receipts_for(b.id)).unwrap(), vec![1]);

        let report = f.dispatcher.tick().await.unwrap();
        assert_eq!(report.broadcasts_completed, 1);
        assert_eq!(f.transport.bodies_to(1), vec!["news"]);
        assert_eq!(f.transport.bodies_to(2), vec!["news"]);

        let report = f.dispatcher.tick().await.unwrap();
        assert!(report.is_empty());
    }
}
