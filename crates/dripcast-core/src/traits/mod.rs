//! Seams between the engine and the outside world.

pub mod clock;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use transport::Transport;
