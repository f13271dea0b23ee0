//! Transport trait: the chat platform the engine delivers through.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{LinkButton, OutgoingMessage};

/// Sends messages to a subscriber.
///
/// Implementations classify failures into the transport error kinds:
/// `TransportPermanent`, `TransportRateLimited`, `TransportTransient`,
/// `TransportBadTemplate`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name (e.g., "telegram").
    fn name(&self) -> &str;

    /// Send a text message with optional link buttons.
    async fn send_text(&self, user_id: i64, body: &str, buttons: &[LinkButton]) -> Result<()>;

    /// Send a photo with a caption and optional link buttons.
    async fn send_photo(
        &self,
        user_id: i64,
        photo_ref: &str,
        caption: &str,
        buttons: &[LinkButton],
    ) -> Result<()>;

    /// Send a message that also presents a reply keyboard of menu labels.
    /// Transports without keyboards fall back to a plain message.
    async fn send_menu(
        &self,
        user_id: i64,
        message: &OutgoingMessage,
        labels: &[String],
    ) -> Result<()> {
        let _ = labels;
        self.deliver(user_id, message).await
    }

    /// Send a resolved message, picking text or photo form.
    async fn deliver(&self, user_id: i64, message: &OutgoingMessage) -> Result<()> {
        match &message.photo {
            Some(photo) => {
                self.send_photo(user_id, photo, &message.body, &message.buttons)
                    .await
            }
            None => self.send_text(user_id, &message.body, &message.buttons).await,
        }
    }
}
