//! Telegram Bot API: message sending with failure classification, and a
//! long-polling loop that turns updates into [`ChatEvent`]s.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use dripcast_core::config::TelegramConfig;
use dripcast_core::error::{DripError, Result};
use dripcast_core::traits::Transport;
use dripcast_core::types::{LinkButton, OutgoingMessage};
use futures::stream::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::events::ChatEvent;

const API_BASE: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Thin Bot API client shared by the transport and the event source.
#[derive(Clone)]
struct BotApi {
    token: String,
    client: reqwest::Client,
}

impl BotApi {
    fn new(token: &str, timeout: Duration) -> Result<Self> {
        if token.trim().is_empty() {
            return Err(DripError::Config("telegram.bot_token is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DripError::Channel(format!("HTTP client: {e}")))?;
        Ok(Self {
            token: token.to_string(),
            client,
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{API_BASE}/bot{}/{method}", self.token)
    }

    /// POST a method call and unwrap the `{ok, result}` envelope, classifying
    /// failures into the transport error kinds.
    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value) -> Result<T> {
        let response = self
            .client
            .post(self.url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| DripError::TransportTransient(format!("{method}: {e}")))?;
        let status = response.status().as_u16();
        let envelope: ApiResponse<T> = response.json().await.map_err(|e| {
            DripError::TransportTransient(format!("{method}: unreadable response ({status}): {e}"))
        })?;

        if !envelope.ok {
            let code = envelope.error_code.unwrap_or(status);
            let retry_after = envelope.parameters.and_then(|p| p.retry_after);
            return Err(classify(
                code,
                envelope.description.as_deref().unwrap_or_default(),
                retry_after,
            ));
        }
        envelope
            .result
            .ok_or_else(|| DripError::Channel(format!("{method}: ok response without result")))
    }
}

/// Map a Bot API failure onto the transport error kinds.
pub fn classify(code: u16, description: &str, retry_after: Option<u64>) -> DripError {
    let lower = description.to_lowercase();
    let gone = ["bot was blocked", "user is deactivated", "chat not found", "bot was kicked"];
    if code == 429 {
        DripError::TransportRateLimited { retry_after }
    } else if code == 403 || gone.iter().any(|g| lower.contains(g)) {
        DripError::TransportPermanent(description.to_string())
    } else if code == 400 {
        // Bad markup, dead file ids, oversized text: resending unchanged won't help.
        DripError::TransportBadTemplate(description.to_string())
    } else {
        DripError::TransportTransient(format!("{code}: {description}"))
    }
}

// --- Outbound ---

/// Delivers messages through `sendMessage` / `sendPhoto` with HTML markup.
#[derive(Clone)]
pub struct TelegramTransport {
    api: BotApi,
}

impl TelegramTransport {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        Ok(Self {
            api: BotApi::new(&config.bot_token, SEND_TIMEOUT)?,
        })
    }

    /// Verify the token; returns the bot's username.
    pub async fn get_me(&self) -> Result<String> {
        let me: TelegramUser = self.api.call("getMe", &json!({})).await?;
        Ok(me.username.unwrap_or(me.first_name))
    }

    async fn send(&self, user_id: i64, message: &OutgoingMessage, markup: Option<Value>) -> Result<()> {
        let (method, payload) = payload(user_id, message, markup);
        let _: Value = self.api.call(method, &payload).await?;
        tracing::debug!(user_id, method, "telegram message sent");
        Ok(())
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send_text(&self, user_id: i64, body: &str, buttons: &[LinkButton]) -> Result<()> {
        let message = OutgoingMessage::text(body).with_buttons(buttons.to_vec());
        self.send(user_id, &message, inline_keyboard(buttons)).await
    }

    async fn send_photo(
        &self,
        user_id: i64,
        photo_ref: &str,
        caption: &str,
        buttons: &[LinkButton],
    ) -> Result<()> {
        let message = OutgoingMessage::text(caption)
            .with_photo(Some(photo_ref.to_string()))
            .with_buttons(buttons.to_vec());
        self.send(user_id, &message, inline_keyboard(buttons)).await
    }

    /// One message carries one keyboard. With a menu to show, link buttons
    /// are rendered as HTML links under the body instead.
    async fn send_menu(
        &self,
        user_id: i64,
        message: &OutgoingMessage,
        labels: &[String],
    ) -> Result<()> {
        let Some(markup) = reply_keyboard(labels) else {
            return self.deliver(user_id, message).await;
        };
        let mut flattened = message.clone();
        flattened.body = append_links(&message.body, &message.buttons);
        flattened.buttons.clear();
        self.send(user_id, &flattened, Some(markup)).await
    }
}

fn payload(user_id: i64, message: &OutgoingMessage, markup: Option<Value>) -> (&'static str, Value) {
    let (method, mut body) = match &message.photo {
        Some(photo) => (
            "sendPhoto",
            json!({
                "chat_id": user_id,
                "photo": photo,
                "caption": message.body,
                "parse_mode": "HTML",
            }),
        ),
        None => (
            "sendMessage",
            json!({
                "chat_id": user_id,
                "text": message.body,
                "parse_mode": "HTML",
                "disable_web_page_preview": true,
            }),
        ),
    };
    if let (Some(markup), Some(obj)) = (markup, body.as_object_mut()) {
        obj.insert("reply_markup".into(), markup);
    }
    (method, body)
}

fn inline_keyboard(buttons: &[LinkButton]) -> Option<Value> {
    if buttons.is_empty() {
        return None;
    }
    let rows: Vec<Value> = buttons
        .iter()
        .map(|b| json!([{ "text": b.label, "url": b.url }]))
        .collect();
    Some(json!({ "inline_keyboard": rows }))
}

fn reply_keyboard(labels: &[String]) -> Option<Value> {
    if labels.is_empty() {
        return None;
    }
    let rows: Vec<Value> = labels.iter().map(|l| json!([{ "text": l }])).collect();
    Some(json!({ "keyboard": rows, "resize_keyboard": true }))
}

fn append_links(body: &str, buttons: &[LinkButton]) -> String {
    let mut out = body.to_string();
    for b in buttons {
        out.push_str(&format!(
            "\n<a href=\"{}\">{}</a>",
            escape_html(&b.url),
            escape_html(&b.label)
        ));
    }
    out
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// --- Inbound ---

/// Long-polls `getUpdates` for private messages and channel membership changes.
pub struct TelegramEvents {
    api: BotApi,
    poll_timeout_secs: u64,
    last_update_id: i64,
}

impl TelegramEvents {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        // The HTTP timeout must outlast the server-side long poll.
        let timeout = Duration::from_secs(config.poll_timeout_secs + 10);
        Ok(Self {
            api: BotApi::new(&config.bot_token, timeout)?,
            poll_timeout_secs: config.poll_timeout_secs,
            last_update_id: 0,
        })
    }

    /// Fetch the next batch of updates and advance the offset past them.
    pub async fn get_updates(&mut self) -> Result<Vec<TelegramUpdate>> {
        let updates: Vec<TelegramUpdate> = self
            .api
            .call(
                "getUpdates",
                &json!({
                    "offset": self.last_update_id + 1,
                    "timeout": self.poll_timeout_secs,
                    "allowed_updates": ["message", "chat_member"],
                }),
            )
            .await?;
        if let Some(last) = updates.last() {
            self.last_update_id = last.update_id;
        }
        Ok(updates)
    }

    /// Spawn the polling loop; events arrive on the returned stream until
    /// it is dropped.
    pub fn start(self) -> TelegramEventStream {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut events = self;
            tracing::info!("📡 Telegram polling started");

            loop {
                match events.get_updates().await {
                    Ok(updates) => {
                        for update in updates {
                            if let Some(event) = update.to_event()
                                && tx.send(event).is_err()
                            {
                                tracing::info!("Telegram polling stopped (receiver dropped)");
                                return;
                            }
                        }
                    }
                    Err(DripError::TransportRateLimited { retry_after }) => {
                        let wait = retry_after.map(Duration::from_secs).unwrap_or(POLL_ERROR_BACKOFF);
                        tracing::warn!(kind = "rate_limited", ?wait, "getUpdates throttled");
                        tokio::time::sleep(wait).await;
                    }
                    Err(e) => {
                        tracing::error!(kind = e.kind(), "Telegram polling error: {e}");
                        tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                    }
                }
                if tx.is_closed() {
                    return;
                }
            }
        });

        TelegramEventStream { rx }
    }
}

/// Stream of chat events produced by [`TelegramEvents::start`].
pub struct TelegramEventStream {
    rx: tokio::sync::mpsc::UnboundedReceiver<ChatEvent>,
}

impl Stream for TelegramEventStream {
    type Item = ChatEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// --- Bot API types ---

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
    pub chat_member: Option<ChatMemberUpdated>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub from: Option<TelegramUser>,
    pub chat: TelegramChat,
    pub text: Option<String>,
    pub date: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

impl TelegramUser {
    fn display_name(&self) -> String {
        match &self.last_name {
            Some(last) => format!("{} {last}", self.first_name),
            None => self.first_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMemberUpdated {
    pub chat: TelegramChat,
    pub old_chat_member: ChatMember,
    pub new_chat_member: ChatMember,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMember {
    pub status: String,
    pub user: TelegramUser,
}

impl ChatMember {
    fn is_in(&self) -> bool {
        matches!(self.status.as_str(), "creator" | "administrator" | "member" | "restricted")
    }
}

impl TelegramUpdate {
    /// Translate one update; anything the engine does not care about
    /// (group chatter, bots, edits) yields `None`.
    pub fn to_event(&self) -> Option<ChatEvent> {
        if let Some(change) = &self.chat_member {
            let user = &change.new_chat_member.user;
            if user.is_bot {
                return None;
            }
            let (was_in, is_in) = (change.old_chat_member.is_in(), change.new_chat_member.is_in());
            return match (was_in, is_in) {
                (false, true) => Some(ChatEvent::Joined {
                    user_id: user.id,
                    username: user.username.clone(),
                    name: Some(user.display_name()),
                }),
                (true, false) => Some(ChatEvent::Left { user_id: user.id }),
                _ => None,
            };
        }

        let msg = self.message.as_ref()?;
        let from = msg.from.as_ref()?;
        if from.is_bot || msg.chat.chat_type != "private" {
            return None;
        }
        let text = msg.text.as_deref()?.trim();
        if is_start_command(text) {
            Some(ChatEvent::FirstContact {
                user_id: from.id,
                username: from.username.clone(),
                name: Some(from.display_name()),
            })
        } else if !text.is_empty() && !text.starts_with('/') {
            Some(ChatEvent::MenuPressed {
                user_id: from.id,
                label: text.to_string(),
            })
        } else {
            None
        }
    }
}

/// `/start`, `/start payload`, `/start@botname`.
fn is_start_command(text: &str) -> bool {
    let command = text.split_whitespace().next().unwrap_or_default();
    command == "/start" || command.starts_with("/start@")
}
