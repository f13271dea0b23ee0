//! Expiry controller: the daily sweep that demotes subscribers whose paid
//! period has ended.

use std::sync::Arc;

use dripcast_core::config::ExpiryConfig;
use dripcast_core::error::Result;
use dripcast_core::traits::{Clock, Transport};
use dripcast_core::types::Track;
use dripcast_store::{Store, time};
use tracing::Instrument;

use crate::planner::Planner;
use crate::registry::handle_direct_failure;
use crate::schedule::DailySchedule;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub demoted: Vec<i64>,
    pub cancelled_paid: usize,
    pub prompted: usize,
    pub replanned: usize,
}

pub struct ExpiryController {
    store: Arc<Store>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    schedule: DailySchedule,
    utc_offset_minutes: i32,
    replan_free_track: bool,
    planner: Planner,
    span: tracing::Span,
}

impl ExpiryController {
    pub fn new(
        store: Arc<Store>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: &ExpiryConfig,
    ) -> Result<Self> {
        Ok(Self {
            store,
            transport,
            clock,
            schedule: DailySchedule::parse(&config.schedule)?,
            utc_offset_minutes: config.utc_offset_minutes,
            replan_free_track: config.replan_free_track,
            planner: Planner::new(),
            span: tracing::info_span!("expiry"),
        })
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.planner = Planner::with_span(tracing::info_span!(parent: &span, "planner"));
        self.span = span;
        self
    }

    /// Sleep until each scheduled run, then sweep. Errors are logged and the
    /// next day's run proceeds.
    pub async fn run(&self) {
        async {
            tracing::info!(schedule = self.schedule.expression(), "expiry controller started");
            loop {
                let now = self.clock.now();
                let Some(next) = self.schedule.next_after(now, self.utc_offset_minutes) else {
                    tracing::error!("schedule never fires, expiry controller stopped");
                    return;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                if let Err(e) = self.sweep_inner().await {
                    tracing::warn!(kind = e.kind(), "expiry sweep failed: {e}");
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    /// Demote every active paid subscriber whose `paid_through` is today or
    /// earlier, each in its own transaction, then send the renewal prompt.
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_inner().instrument(self.span.clone()).await
    }

    async fn sweep_inner(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let today = time::local_date(now, self.utc_offset_minutes);
        let (expiring, prompt) = self
            .store
            .read_async(move |db| Ok((db.expiring_on_or_before(today)?, db.renewal_prompt()?)))
            .await?;

        let mut report = SweepReport::default();
        for subscriber in expiring {
            let user_id = subscriber.user_id;
            let detail = subscriber.paid_through.map(time::date_to_text);
            let (planner, replan, event_detail) =
                (self.planner.clone(), self.replan_free_track, detail.clone());
            let demoted = self
                .store
                .write_async(move |db| {
                    if !db.clear_paid(user_id)? {
                        return Ok(None);
                    }
                    let cancelled = db.cancel_pending_for(user_id, Track::Paid)?;
                    db.record_event(user_id, "expired", event_detail.as_deref(), now)?;
                    let replanned = if replan {
                        planner.materialise(db, user_id, Track::Free, now)?.inserted
                    } else {
                        0
                    };
                    Ok(Some((cancelled, replanned)))
                })
                .await?;
            let Some((cancelled, replanned)) = demoted else {
                continue;
            };
            report.demoted.push(user_id);
            report.cancelled_paid += cancelled;
            report.replanned += replanned;
            tracing::info!(user_id, paid_through = ?detail, cancelled, "subscription expired");

            if let Some(message) = &prompt {
                match self.transport.deliver(user_id, message).await {
                    Ok(()) => report.prompted += 1,
                    Err(e) => handle_direct_failure(
                        &self.store,
                        self.clock.as_ref(),
                        user_id,
                        "renewal",
                        e,
                    )
                    .await?,
                }
            }
        }
        if !report.demoted.is_empty() {
            tracing::info!(
                %today,
                demoted = report.demoted.len(),
                prompted = report.prompted,
                "expiry sweep done"
            );
        }
        Ok(report)
    }
}
