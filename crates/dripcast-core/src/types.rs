//! Domain types shared between the store, the scheduler, and the transports.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DripError;

/// One of the two parallel template pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Track {
    /// Engaged subscribers who have not paid.
    Free,
    /// Paying subscribers.
    Paid,
}

impl Track {
    pub const ALL: [Track; 2] = [Track::Free, Track::Paid];

    pub fn as_str(&self) -> &'static str {
        match self {
            Track::Free => "free",
            Track::Paid => "paid",
        }
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Track {
    type Err = DripError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Track::Free),
            "paid" => Ok(Track::Paid),
            other => Err(DripError::validation(
                "track",
                format!("unknown track '{other}' (expected free|paid)"),
            )),
        }
    }
}

/// Derived lifecycle state of a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    New,
    Engaged,
    Paid,
    Expired,
    Inactive,
}

impl LifecycleState {
    /// Precedence: inactive, expired, paid, engaged, new.
    ///
    /// `paid_through_passed` is true when `paid_through` is set and lies before today.
    pub fn derive(active: bool, engaged: bool, paid: bool, paid_through_passed: bool) -> Self {
        if !active {
            LifecycleState::Inactive
        } else if paid_through_passed {
            LifecycleState::Expired
        } else if paid {
            LifecycleState::Paid
        } else if engaged {
            LifecycleState::Engaged
        } else {
            LifecycleState::New
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::New => "new",
            LifecycleState::Engaged => "engaged",
            LifecycleState::Paid => "paid",
            LifecycleState::Expired => "expired",
            LifecycleState::Inactive => "inactive",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A link button attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkButton {
    pub label: String,
    pub url: String,
}

impl LinkButton {
    pub fn new(label: &str, url: &str) -> Self {
        Self {
            label: label.to_string(),
            url: url.to_string(),
        }
    }
}

/// A fully resolved message, ready for a transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub body: String,
    pub photo: Option<String>,
    #[serde(default)]
    pub buttons: Vec<LinkButton>,
}

impl OutgoingMessage {
    pub fn text(body: &str) -> Self {
        Self {
            body: body.to_string(),
            photo: None,
            buttons: Vec::new(),
        }
    }

    pub fn with_photo(mut self, photo: Option<String>) -> Self {
        self.photo = photo.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn with_buttons(mut self, buttons: Vec<LinkButton>) -> Self {
        self.buttons = buttons;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_parse() {
        assert_eq!("free".parse::<Track>().unwrap(), Track::Free);
        assert_eq!("paid".parse::<Track>().unwrap(), Track::Paid);
        assert!("vip".parse::<Track>().is_err());
    }

    #[test]
    fn test_lifecycle_precedence() {
        assert_eq!(LifecycleState::derive(false, true, true, false), LifecycleState::Inactive);
        assert_eq!(LifecycleState::derive(true, true, true, true), LifecycleState::Expired);
        assert_eq!(LifecycleState::derive(true, true, true, false), LifecycleState::Paid);
        assert_eq!(LifecycleState::derive(true, true, false, false), LifecycleState::Engaged);
        assert_eq!(LifecycleState::derive(true, false, false, false), LifecycleState::New);
    }

    #[test]
    fn test_blank_photo_is_dropped() {
        let msg = OutgoingMessage::text("hi").with_photo(Some("  ".into()));
        assert!(msg.photo.is_none());
    }
}
