//! Telegram Bot API transport.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{ChatRecipient, ChatTransport, NotifyError};
use crate::config::TelegramConfig;

#[derive(Debug, Deserialize)]
struct BotResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Sends HTML messages with `sendMessage`
pub struct TelegramBot {
    client: reqwest::Client,
    endpoint: String,
}

impl TelegramBot {
    pub fn new(config: &TelegramConfig) -> Result<Self, NotifyError> {
        let token = config
            .bot_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(NotifyError::NotConfigured)?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/bot{}/sendMessage", config.api_base.trim_end_matches('/'), token),
        })
    }
}

/// Bot API errors meaning the user never opened a conversation with the bot
fn is_unreachable_chat(description: &str) -> bool {
    let description = description.to_lowercase();
    description.contains("chat not found")
        || description.contains("can't initiate conversation")
        || description.contains("bot was blocked")
}

#[async_trait]
impl ChatTransport for TelegramBot {
    fn is_configured(&self) -> bool {
        true
    }

    async fn send(&self, to: &ChatRecipient, html: &str) -> Result<(), NotifyError> {
        let body = json!({
            "chat_id": to.as_param(),
            "text": html,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.without_url().to_string()))?;
        let status = response.status();

        // The Bot API answers errors with a JSON body as well
        let reply: BotResponse = response
            .json()
            .await
            .map_err(|e| NotifyError::Transport(format!("unreadable Bot API response ({}): {}", status, e)))?;

        if reply.ok {
            tracing::debug!(chat = %to, "Telegram message sent");
            return Ok(());
        }

        let description = reply.description.unwrap_or_else(|| status.to_string());
        match to {
            ChatRecipient::Handle(_) if is_unreachable_chat(&description) => {
                Err(NotifyError::ChatNotStarted(to.to_string()))
            }
            _ => Err(NotifyError::Rejected(description)),
        }
    }
}
