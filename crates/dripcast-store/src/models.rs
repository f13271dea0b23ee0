//! Row types returned by the store.

use chrono::{DateTime, NaiveDate, Utc};
use dripcast_core::error::DripError;
use dripcast_core::types::{LifecycleState, LinkButton, OutgoingMessage, Track};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Subscriber record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub user_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub active: bool,
    pub engaged: bool,
    pub paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
    pub paid_through: Option<NaiveDate>,
}

impl Subscriber {
    pub fn state(&self, today: NaiveDate) -> LifecycleState {
        let passed = self.paid_through.is_some_and(|d| d < today);
        LifecycleState::derive(self.active, self.engaged, self.paid, passed)
    }
}

/// Result of `upsert_subscriber`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    /// Existed but was inactive; now active again.
    Revived,
    /// Existed and active; profile refreshed.
    Refreshed,
}

/// Result of `mark_paid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkPaid {
    UnknownSubscriber,
    /// Was unpaid, now paid.
    NewlyPaid,
    /// Already paid; `paid_at`/`paid_through` refreshed.
    Renewed,
}

impl MarkPaid {
    pub fn changed(&self) -> bool {
        !matches!(self, MarkPaid::UnknownSubscriber)
    }
}

/// Result of `plan_delivery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanOutcome {
    Inserted(i64),
    /// An un-sent row with the same `(user, track, seq_no)` already exists.
    Duplicate,
    /// Free-track planning for a paid subscriber is a successful no-op.
    SkippedPaid,
}

/// A drip template with its buttons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub track: Track,
    pub seq_no: i64,
    pub body: String,
    pub photo_ref: Option<String>,
    pub delay_hours: f64,
    pub buttons: Vec<LinkButton>,
}

/// Admin input for adding or replacing a template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateInput {
    pub body: String,
    #[serde(default)]
    pub photo_ref: Option<String>,
    #[serde(default)]
    pub delay_hours: f64,
    #[serde(default)]
    pub buttons: Vec<LinkButton>,
}

/// A pending delivery that is due now, resolved against its template.
#[derive(Debug, Clone, PartialEq)]
pub struct DueDelivery {
    pub id: i64,
    pub user_id: i64,
    pub track: Track,
    pub seq_no: i64,
    pub fire_at: DateTime<Utc>,
    pub message: OutgoingMessage,
}

/// A scheduled delivery row, as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delivery {
    pub id: i64,
    pub user_id: i64,
    pub track: Track,
    pub seq_no: i64,
    pub fire_at: DateTime<Utc>,
    pub sent: bool,
}

/// Operator broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broadcast {
    pub id: i64,
    pub track: Track,
    pub body: String,
    pub photo_ref: Option<String>,
    pub fire_at: DateTime<Utc>,
    pub sent: bool,
    pub created_at: DateTime<Utc>,
    pub buttons: Vec<LinkButton>,
}

impl Broadcast {
    pub fn message(&self) -> OutgoingMessage {
        OutgoingMessage::text(&self.body)
            .with_photo(self.photo_ref.clone())
            .with_buttons(self.buttons.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastInput {
    pub track: Track,
    pub body: String,
    #[serde(default)]
    pub photo_ref: Option<String>,
    pub fire_at: DateTime<Utc>,
    #[serde(default)]
    pub buttons: Vec<LinkButton>,
}

/// A welcome-menu label with its follow-ups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuButton {
    pub id: i64,
    pub label: String,
    pub position: i64,
    pub followups: Vec<Followup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Followup {
    pub id: i64,
    pub position: i64,
    pub body: String,
    pub photo_ref: Option<String>,
}

impl Followup {
    pub fn message(&self) -> OutgoingMessage {
        OutgoingMessage::text(&self.body).with_photo(self.photo_ref.clone())
    }
}

/// Payment status as reported by the payment notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Success,
    Failed,
    Pending,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Pending => "pending",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = DripError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(PaymentStatus::Success),
            "failed" => Ok(PaymentStatus::Failed),
            "pending" => Ok(PaymentStatus::Pending),
            other => Err(DripError::validation(
                "status",
                format!("unknown payment status '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPayment {
    pub user_id: i64,
    pub amount: String,
    pub status: PaymentStatus,
    #[serde(default)]
    pub utm_source: Option<String>,
    #[serde(default)]
    pub utm_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Payment {
    pub id: i64,
    pub user_id: i64,
    pub amount: String,
    pub status: String,
    pub utm_source: Option<String>,
    pub utm_id: Option<String>,
    pub created_at: String,
}

/// Successful payments grouped by `utm_source`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UtmRow {
    pub utm_source: String,
    pub payments: i64,
    pub users: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PaymentStats {
    pub total: i64,
    pub success: i64,
    pub failed: i64,
    pub pending: i64,
    pub paying_users: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackQueue {
    pub pending: i64,
    pub sent: i64,
    pub due: i64,
}

/// Subscriber counts by derived lifecycle state, plus queue depth per track.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    pub total: i64,
    pub new: i64,
    pub engaged: i64,
    pub paid: i64,
    pub expired: i64,
    pub inactive: i64,
    pub free: TrackQueue,
    pub paid_queue: TrackQueue,
    pub broadcasts_pending: i64,
    pub payments: PaymentStats,
}

/// Operator alarms.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Health {
    pub pending: i64,
    /// Pending rows whose subscriber is no longer active and engaged.
    pub orphans: i64,
    /// `(user, track, seq_no)` keys with more than one un-sent row.
    pub duplicates: i64,
    pub broadcast_enabled: bool,
    pub auto_resume_at: Option<DateTime<Utc>>,
}

impl Health {
    pub fn ok(&self) -> bool {
        self.orphans == 0 && self.duplicates == 0
    }
}
