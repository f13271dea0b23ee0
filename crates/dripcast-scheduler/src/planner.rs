//! Planner: turns "user entered track X at time T" into pending deliveries.

use chrono::{DateTime, Utc};
use dripcast_core::error::Result;
use dripcast_core::types::Track;
use dripcast_store::{Db, PlanOutcome};

/// What one materialisation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanReport {
    pub inserted: usize,
    pub duplicates: usize,
    /// The subscriber could not receive this track (unknown, inactive,
    /// not engaged, or paid for the free track); nothing was planned.
    pub ineligible: bool,
}

/// Computes the anchored schedule for a user entering a track.
#[derive(Debug, Clone)]
pub struct Planner {
    span: tracing::Span,
}

impl Default for Planner {
    fn default() -> Self {
        Self::with_span(tracing::info_span!("planner"))
    }
}

impl Planner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_span(span: tracing::Span) -> Self {
        Self { span }
    }

    /// Plan one delivery per template of `track`, each at
    /// `anchor + delay_hours`. Runs inside the caller's transaction, so it
    /// commits or rolls back together with the lifecycle change.
    pub fn materialise(
        &self,
        db: &Db<'_>,
        user_id: i64,
        track: Track,
        anchor: DateTime<Utc>,
    ) -> Result<PlanReport> {
        let _enter = self.span.enter();
        let mut report = PlanReport::default();

        let eligible = db
            .get_subscriber(user_id)?
            .is_some_and(|s| s.active && s.engaged && !(track == Track::Free && s.paid));
        if !eligible {
            tracing::debug!(user_id, track = %track, "not eligible for track, nothing planned");
            report.ineligible = true;
            return Ok(report);
        }

        for (seq_no, fire_at) in db.template_offsets(track, anchor)? {
            match db.plan_delivery(user_id, track, seq_no, fire_at, anchor)? {
                PlanOutcome::Inserted(_) => report.inserted += 1,
                PlanOutcome::Duplicate => report.duplicates += 1,
                PlanOutcome::SkippedPaid => {
                    report.ineligible = true;
                    break;
                }
            }
        }
        tracing::info!(
            user_id,
            track = %track,
            inserted = report.inserted,
            duplicates = report.duplicates,
            "track materialised"
        );
        Ok(report)
    }
}
