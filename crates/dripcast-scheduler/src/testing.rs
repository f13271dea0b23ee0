//! Test doubles: a transport that records every send and can be scripted
//! to fail for particular users.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use dripcast_core::error::{DripError, Result};
use dripcast_core::traits::Transport;
use dripcast_core::types::{LinkButton, OutgoingMessage};

/// Failure kinds a [`RecordingTransport`] can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Permanent,
    RateLimited,
    Transient,
    BadTemplate,
}

impl Failure {
    fn to_error(self, user_id: i64) -> DripError {
        match self {
            Failure::Permanent => DripError::TransportPermanent(format!("user {user_id} blocked the bot")),
            Failure::RateLimited => DripError::TransportRateLimited {
                retry_after: Some(1),
            },
            Failure::Transient => DripError::TransportTransient("connection reset".into()),
            Failure::BadTemplate => DripError::TransportBadTemplate("can't parse entities".into()),
        }
    }
}

/// One recorded send.
#[derive(Debug, Clone, PartialEq)]
pub struct Sent {
    pub user_id: i64,
    pub body: String,
    pub photo: Option<String>,
    pub buttons: Vec<LinkButton>,
    /// Reply-keyboard labels, for menu sends.
    pub menu: Option<Vec<String>>,
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Sent>>,
    next: Mutex<HashMap<i64, VecDeque<Failure>>>,
    always: Mutex<HashMap<i64, Failure>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next send to `user_id` once.
    pub fn fail_next(&self, user_id: i64, failure: Failure) {
        lock(&self.next).entry(user_id).or_default().push_back(failure);
    }

    /// Fail every send to `user_id` until [`clear_failures`](Self::clear_failures).
    pub fn fail_always(&self, user_id: i64, failure: Failure) {
        lock(&self.always).insert(user_id, failure);
    }

    pub fn clear_failures(&self) {
        lock(&self.next).clear();
        lock(&self.always).clear();
    }

    pub fn sent(&self) -> Vec<Sent> {
        lock(&self.sent).clone()
    }

    pub fn sent_to(&self, user_id: i64) -> Vec<Sent> {
        lock(&self.sent)
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn bodies_to(&self, user_id: i64) -> Vec<String> {
        self.sent_to(user_id).into_iter().map(|s| s.body).collect()
    }

    pub fn reset(&self) {
        lock(&self.sent).clear();
    }

    fn scripted(&self, user_id: i64) -> Option<DripError> {
        if let Some(f) = lock(&self.next).get_mut(&user_id).and_then(|q| q.pop_front()) {
            return Some(f.to_error(user_id));
        }
        lock(&self.always).get(&user_id).map(|f| f.to_error(user_id))
    }

    fn record(&self, user_id: i64, body: &str, photo: Option<&str>, buttons: &[LinkButton], menu: Option<&[String]>) -> Result<()> {
        if let Some(err) = self.scripted(user_id) {
            return Err(err);
        }
        lock(&self.sent).push(Sent {
            user_id,
            body: body.to_string(),
            photo: photo.map(str::to_string),
            buttons: buttons.to_vec(),
            menu: menu.map(<[String]>::to_vec),
        });
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl Transport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send_text(&self, user_id: i64, body: &str, buttons: &[LinkButton]) -> Result<()> {
        self.record(user_id, body, None, buttons, None)
    }

    async fn send_photo(
        &self,
        user_id: i64,
        photo_ref: &str,
        caption: &str,
        buttons: &[LinkButton],
    ) -> Result<()> {
        self.record(user_id, caption, Some(photo_ref), buttons, None)
    }

    async fn send_menu(
        &self,
        user_id: i64,
        message: &OutgoingMessage,
        labels: &[String],
    ) -> Result<()> {
        self.record(
            user_id,
            &message.body,
            message.photo.as_deref(),
            &message.buttons,
            Some(labels),
        )
    }
}
