//! Typed settings over the `settings` key/value table.
//!
//! Only the keys in [`SettingKey`] exist; anything else is rejected on write.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use dripcast_core::error::{DripError, Result};
use dripcast_core::types::{LinkButton, OutgoingMessage};
use rusqlite::{OptionalExtension, params};

use crate::pool::db_err;
use crate::{Db, time};

pub const DEFAULT_WELCOME: &str = "Welcome! Pick a topic below to learn more.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    WelcomeBody,
    WelcomePhoto,
    GoodbyeBody,
    GoodbyePhoto,
    PaymentSuccessBody,
    PaymentSuccessPhoto,
    PaymentSuccessEnabled,
    RenewalBody,
    RenewalPhoto,
    RenewalButtonLabel,
    RenewalButtonUrl,
    BroadcastEnabled,
    BroadcastAutoResumeAt,
}

enum Kind {
    Text,
    Flag,
    Timestamp,
}

impl SettingKey {
    pub const ALL: [SettingKey; 13] = [
        SettingKey::WelcomeBody,
        SettingKey::WelcomePhoto,
        SettingKey::GoodbyeBody,
        SettingKey::GoodbyePhoto,
        SettingKey::PaymentSuccessBody,
        SettingKey::PaymentSuccessPhoto,
        SettingKey::PaymentSuccessEnabled,
        SettingKey::RenewalBody,
        SettingKey::RenewalPhoto,
        SettingKey::RenewalButtonLabel,
        SettingKey::RenewalButtonUrl,
        SettingKey::BroadcastEnabled,
        SettingKey::BroadcastAutoResumeAt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::WelcomeBody => "welcome.body",
            SettingKey::WelcomePhoto => "welcome.photo",
            SettingKey::GoodbyeBody => "goodbye.body",
            SettingKey::GoodbyePhoto => "goodbye.photo",
            SettingKey::PaymentSuccessBody => "payment_success.body",
            SettingKey::PaymentSuccessPhoto => "payment_success.photo",
            SettingKey::PaymentSuccessEnabled => "payment_success.enabled",
            SettingKey::RenewalBody => "renewal.body",
            SettingKey::RenewalPhoto => "renewal.photo",
            SettingKey::RenewalButtonLabel => "renewal.button_label",
            SettingKey::RenewalButtonUrl => "renewal.button_url",
            SettingKey::BroadcastEnabled => "broadcast.enabled",
            SettingKey::BroadcastAutoResumeAt => "broadcast.auto_resume_at",
        }
    }

    /// Value returned when the key was never written.
    pub fn default_value(&self) -> &'static str {
        match self {
            SettingKey::WelcomeBody => DEFAULT_WELCOME,
            SettingKey::PaymentSuccessBody => "Payment received. Thank you!",
            SettingKey::PaymentSuccessEnabled | SettingKey::BroadcastEnabled => "1",
            _ => "",
        }
    }

    fn kind(&self) -> Kind {
        match self {
            SettingKey::PaymentSuccessEnabled | SettingKey::BroadcastEnabled => Kind::Flag,
            SettingKey::BroadcastAutoResumeAt => Kind::Timestamp,
            _ => Kind::Text,
        }
    }

    fn validate(&self, value: &str) -> Result<()> {
        match self.kind() {
            Kind::Flag if value != "0" && value != "1" => Err(DripError::validation(
                self.as_str(),
                format!("expected 0 or 1, got '{value}'"),
            )),
            Kind::Timestamp if !value.is_empty() && time::from_text(value).is_none() => {
                Err(DripError::validation(
                    self.as_str(),
                    format!("expected an RFC 3339 timestamp or empty, got '{value}'"),
                ))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingKey {
    type Err = DripError;

    fn from_str(s: &str) -> Result<Self> {
        SettingKey::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DripError::validation("key", format!("unknown setting '{s}'")))
    }
}

impl Db<'_> {
    pub fn get_setting(&self, key: SettingKey) -> Result<String> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key.as_str()],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(value.unwrap_or_else(|| key.default_value().to_string()))
    }

    pub fn set_setting(&self, key: SettingKey, value: &str, now: DateTime<Utc>) -> Result<()> {
        let value = value.trim();
        key.validate(value)?;
        self.conn
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key.as_str(), value, time::to_text(now)],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Every known key with its effective value.
    pub fn all_settings(&self) -> Result<Vec<(SettingKey, String)>> {
        SettingKey::ALL
            .into_iter()
            .map(|k| Ok((k, self.get_setting(k)?)))
            .collect()
    }

    fn message_setting(&self, body: SettingKey, photo: SettingKey) -> Result<Option<OutgoingMessage>> {
        let text = self.get_setting(body)?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        let photo = self.get_setting(photo)?;
        Ok(Some(OutgoingMessage::text(&text).with_photo(Some(photo))))
    }

    pub fn welcome_message(&self) -> Result<OutgoingMessage> {
        Ok(self
            .message_setting(SettingKey::WelcomeBody, SettingKey::WelcomePhoto)?
            .unwrap_or_else(|| OutgoingMessage::text(DEFAULT_WELCOME)))
    }

    pub fn set_welcome_message(&self, message: &OutgoingMessage, now: DateTime<Utc>) -> Result<()> {
        if message.body.trim().is_empty() {
            return Err(DripError::validation("welcome.body", "must not be empty"));
        }
        self.set_setting(SettingKey::WelcomeBody, &message.body, now)?;
        self.set_setting(
            SettingKey::WelcomePhoto,
            message.photo.as_deref().unwrap_or(""),
            now,
        )
    }

    pub fn goodbye_message(&self) -> Result<Option<OutgoingMessage>> {
        self.message_setting(SettingKey::GoodbyeBody, SettingKey::GoodbyePhoto)
    }

    /// `None` when disabled or empty.
    pub fn payment_success_message(&self) -> Result<Option<OutgoingMessage>> {
        if self.get_setting(SettingKey::PaymentSuccessEnabled)? != "1" {
            return Ok(None);
        }
        self.message_setting(SettingKey::PaymentSuccessBody, SettingKey::PaymentSuccessPhoto)
    }

    /// Renewal prompt, with a link button when both label and url are set.
    pub fn renewal_prompt(&self) -> Result<Option<OutgoingMessage>> {
        let Some(message) = self.message_setting(SettingKey::RenewalBody, SettingKey::RenewalPhoto)?
        else {
            return Ok(None);
        };
        let label = self.get_setting(SettingKey::RenewalButtonLabel)?;
        let url = self.get_setting(SettingKey::RenewalButtonUrl)?;
        if label.is_empty() || url.is_empty() {
            return Ok(Some(message));
        }
        Ok(Some(message.with_buttons(vec![LinkButton::new(&label, &url)])))
    }

    pub fn broadcast_enabled(&self) -> Result<bool> {
        Ok(self.get_setting(SettingKey::BroadcastEnabled)? == "1")
    }

    pub fn auto_resume_at(&self) -> Result<Option<DateTime<Utc>>> {
        let raw = self.get_setting(SettingKey::BroadcastAutoResumeAt)?;
        Ok(time::from_text(&raw))
    }

    /// Stop all dispatch, optionally until `resume_at`.
    pub fn pause_broadcasts(&self, resume_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<()> {
        self.set_setting(SettingKey::BroadcastEnabled, "0", now)?;
        let at = resume_at.map(time::to_text).unwrap_or_default();
        self.set_setting(SettingKey::BroadcastAutoResumeAt, &at, now)
    }

    pub fn resume_broadcasts(&self, now: DateTime<Utc>) -> Result<()> {
        self.set_setting(SettingKey::BroadcastEnabled, "1", now)?;
        self.set_setting(SettingKey::BroadcastAutoResumeAt, "", now)
    }
}
