//! # Dripcast Channels
//! The chat platform the engine talks to: outbound `Transport` and the
//! inbound stream of chat events that drive the lifecycle registry.

pub mod events;
pub mod telegram;

pub use events::ChatEvent;
pub use telegram::{TelegramEvents, TelegramEventStream, TelegramTransport};
