//! # Dripcast Core
//!
//! Shared vocabulary for the drip-campaign engine: error kinds, configuration,
//! domain types, and the seams other crates plug into (`Transport`, `Clock`).

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::DripConfig;
pub use error::{DripError, Result};
pub use traits::{Clock, ManualClock, SystemClock, Transport};
pub use types::{LifecycleState, LinkButton, OutgoingMessage, Track};
