//! # Dripcast Scheduler
//!
//! The moving parts of the drip engine. Every component shares one
//! [`dripcast_store::Store`] and talks to the chat platform only through
//! [`dripcast_core::Transport`].
//!
//! ## Architecture
//! ```text
//! chat / webhook events
//!   └── LifecycleRegistry ── state change + Planner, one transaction
//!                               └── scheduled_deliveries (pending)
//! Dispatcher (tokio interval, single writer of `sent`)
//!   ├── free deliveries → free broadcasts
//!   └── paid deliveries → paid broadcasts
//! ExpiryController (daily schedule)
//!   └── clear paid, cancel paid track, renewal prompt
//! ```

pub mod dispatcher;
pub mod expiry;
pub mod planner;
pub mod registry;
pub mod schedule;
pub mod testing;

pub use dispatcher::{Dispatcher, TickReport};
pub use expiry::{ExpiryController, SweepReport};
pub use planner::{PlanReport, Planner};
pub use registry::{FirstContact, LifecycleRegistry, PaymentEvent, PaymentOutcome};
pub use schedule::DailySchedule;
