//! Platform-neutral chat events consumed by the lifecycle registry.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChatEvent {
    /// The user joined the channel.
    Joined {
        user_id: i64,
        username: Option<String>,
        name: Option<String>,
    },
    /// The user left or was removed from the channel.
    Left { user_id: i64 },
    /// The user opened a private conversation with the bot.
    FirstContact {
        user_id: i64,
        username: Option<String>,
        name: Option<String>,
    },
    /// Private text that may match a welcome-menu label.
    MenuPressed { user_id: i64, label: String },
}

impl ChatEvent {
    pub fn user_id(&self) -> i64 {
        match self {
            ChatEvent::Joined { user_id, .. }
            | ChatEvent::Left { user_id }
            | ChatEvent::FirstContact { user_id, .. }
            | ChatEvent::MenuPressed { user_id, .. } => *user_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::Joined { .. } => "joined",
            ChatEvent::Left { .. } => "left",
            ChatEvent::FirstContact { .. } => "first_contact",
            ChatEvent::MenuPressed { .. } => "menu_pressed",
        }
    }
}
