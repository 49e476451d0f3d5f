//! Outbound notifications by email and Telegram.
//!
//! Sending is best effort. [`NotificationService`] bounds every send with a
//! timeout and turns the result into a [`ChannelOutcome`] instead of an
//! error, so callers can report per-channel results without failing the
//! operation that triggered them.

pub mod email;
pub mod messages;
pub mod telegram;

pub use email::SmtpMailer;
pub use messages::DocumentLine;
pub use telegram::TelegramBot;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("channel is not configured")]
    NotConfigured,

    #[error("{0} has not started a conversation with the bot; ask them to send /start first")]
    ChatNotStarted(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Telegram destination: a numeric chat id or an `@handle`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatRecipient {
    ChatId(i64),
    Handle(String),
}

impl ChatRecipient {
    /// Numbers (optionally negative, optionally behind `@`) are chat ids,
    /// anything else is a handle. Blank input has no recipient.
    pub fn parse(raw: &str) -> Option<Self> {
        let value = raw.trim();
        let value = value.strip_prefix('@').unwrap_or(value).trim();
        if value.is_empty() {
            return None;
        }
        match value.parse::<i64>() {
            Ok(id) => Some(ChatRecipient::ChatId(id)),
            Err(_) => Some(ChatRecipient::Handle(value.to_string())),
        }
    }

    /// Value of the Bot API `chat_id` parameter
    pub fn as_param(&self) -> serde_json::Value {
        match self {
            ChatRecipient::ChatId(id) => serde_json::Value::from(*id),
            ChatRecipient::Handle(handle) => serde_json::Value::from(format!("@{}", handle)),
        }
    }
}

impl fmt::Display for ChatRecipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRecipient::ChatId(id) => write!(f, "{}", id),
            ChatRecipient::Handle(handle) => write!(f, "@{}", handle),
        }
    }
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    fn is_configured(&self) -> bool;

    async fn send(&self, message: &EmailMessage) -> Result<(), NotifyError>;
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    fn is_configured(&self) -> bool;

    async fn send(&self, to: &ChatRecipient, html: &str) -> Result<(), NotifyError>;
}

/// Stand-in for a channel without settings
pub struct Disabled;

#[async_trait]
impl MailTransport for Disabled {
    fn is_configured(&self) -> bool {
        false
    }

    async fn send(&self, _message: &EmailMessage) -> Result<(), NotifyError> {
        Err(NotifyError::NotConfigured)
    }
}

#[async_trait]
impl ChatTransport for Disabled {
    fn is_configured(&self) -> bool {
        false
    }

    async fn send(&self, _to: &ChatRecipient, _html: &str) -> Result<(), NotifyError> {
        Err(NotifyError::NotConfigured)
    }
}

/// Result of one send on one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "camelCase")]
pub enum ChannelOutcome {
    Sent,
    NotConfigured,
    NoRecipient,
    Failed(String),
}

impl ChannelOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, ChannelOutcome::Sent)
    }
}

/// Email and chat outcomes of one notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub email: ChannelOutcome,
    pub telegram: ChannelOutcome,
}

/// Partner contact details a message is addressed to
#[derive(Debug, Clone, Copy)]
pub struct Recipient<'a> {
    pub name: &'a str,
    pub email: Option<&'a str>,
    pub telegram: Option<&'a str>,
}

pub struct NotificationService {
    mail: Arc<dyn MailTransport>,
    chat: Arc<dyn ChatTransport>,
    timeout: Duration,
    frontend_url: String,
}

impl NotificationService {
    pub fn new(
        mail: Arc<dyn MailTransport>,
        chat: Arc<dyn ChatTransport>,
        timeout: Duration,
        frontend_url: impl Into<String>,
    ) -> Self {
        Self {
            mail,
            chat,
            timeout,
            frontend_url: frontend_url.into(),
        }
    }

    /// Real transports for configured channels, [`Disabled`] for the rest
    pub fn from_config(config: &Config) -> Self {
        let mail: Arc<dyn MailTransport> = if config.email.is_configured() {
            match SmtpMailer::new(&config.email) {
                Ok(mailer) => Arc::new(mailer),
                Err(e) => {
                    warn!(error = %e, "Invalid SMTP settings, email notifications disabled");
                    Arc::new(Disabled)
                }
            }
        } else {
            info!("SMTP not configured, email notifications disabled");
            Arc::new(Disabled)
        };

        let chat: Arc<dyn ChatTransport> = if config.telegram.is_configured() {
            match TelegramBot::new(&config.telegram) {
                Ok(bot) => Arc::new(bot),
                Err(e) => {
                    warn!(error = %e, "Invalid Telegram settings, chat notifications disabled");
                    Arc::new(Disabled)
                }
            }
        } else {
            info!("Telegram bot token not set, chat notifications disabled");
            Arc::new(Disabled)
        };

        Self::new(
            mail,
            chat,
            Duration::from_secs(config.notifications.timeout_secs),
            config.server.frontend_url.clone(),
        )
    }

    pub fn portal_url(&self) -> &str {
        self.frontend_url.trim_end_matches('/')
    }

    /// Link to the password form for a reset token
    pub fn reset_link(&self, token: &str) -> String {
        format!("{}/reset-password/{}", self.portal_url(), token)
    }

    pub async fn send_email(&self, message: EmailMessage) -> ChannelOutcome {
        if !self.mail.is_configured() {
            info!(to = %message.to, subject = %message.subject, "Email not sent, SMTP not configured");
            return ChannelOutcome::NotConfigured;
        }
        if message.to.trim().is_empty() {
            return ChannelOutcome::NoRecipient;
        }

        match tokio::time::timeout(self.timeout, self.mail.send(&message)).await {
            Ok(Ok(())) => ChannelOutcome::Sent,
            Ok(Err(NotifyError::NotConfigured)) => ChannelOutcome::NotConfigured,
            Ok(Err(e)) => {
                warn!(to = %message.to, error = %e, "Failed to send email");
                ChannelOutcome::Failed(e.to_string())
            }
            Err(_) => {
                warn!(to = %message.to, timeout_secs = self.timeout.as_secs(), "Email send timed out");
                ChannelOutcome::Failed(format!("timed out after {}s", self.timeout.as_secs()))
            }
        }
    }

    pub async fn send_chat(&self, to: Option<&str>, html: &str) -> ChannelOutcome {
        let Some(recipient) = to.and_then(ChatRecipient::parse) else {
            return ChannelOutcome::NoRecipient;
        };
        if !self.chat.is_configured() {
            info!(chat = %recipient, "Telegram message not sent, bot not configured");
            return ChannelOutcome::NotConfigured;
        }

        match tokio::time::timeout(self.timeout, self.chat.send(&recipient, html)).await {
            Ok(Ok(())) => ChannelOutcome::Sent,
            Ok(Err(NotifyError::NotConfigured)) => ChannelOutcome::NotConfigured,
            Ok(Err(e)) => {
                warn!(chat = %recipient, error = %e, "Failed to send Telegram message");
                ChannelOutcome::Failed(e.to_string())
            }
            Err(_) => {
                warn!(chat = %recipient, timeout_secs = self.timeout.as_secs(), "Telegram send timed out");
                ChannelOutcome::Failed(format!("timed out after {}s", self.timeout.as_secs()))
            }
        }
    }

    async fn deliver(&self, to: Recipient<'_>, email: Option<EmailMessage>, chat: &str) -> Delivery {
        let email = match email {
            Some(message) => self.send_email(message).await,
            None => ChannelOutcome::NoRecipient,
        };
        let telegram = self.send_chat(to.telegram, chat).await;
        Delivery { email, telegram }
    }

    /// Digest of newly published documents. The chat copy goes out even
    /// when the email fails.
    pub async fn documents_published(&self, to: Recipient<'_>, documents: &[DocumentLine]) -> Delivery {
        let url = self.portal_url().to_string();
        let email = to
            .email
            .map(|address| messages::documents_published_email(address, to.name, documents, &url));
        let chat = messages::documents_published_chat(to.name, documents, &url);
        self.deliver(to, email, &chat).await
    }

    pub async fn password_reset(&self, to: Recipient<'_>, token: &str, ttl_minutes: i64) -> Delivery {
        let link = self.reset_link(token);
        let email = to
            .email
            .map(|address| messages::password_reset_email(address, to.name, &link, ttl_minutes));
        let chat = messages::password_reset_chat(to.name, &link, ttl_minutes);
        self.deliver(to, email, &chat).await
    }

    pub async fn invitation(&self, to: Recipient<'_>, alias: &str, token: &str) -> Delivery {
        let link = self.reset_link(token);
        let email = to
            .email
            .map(|address| messages::invitation_email(address, to.name, alias, &link));
        let chat = messages::invitation_chat(to.name, alias, &link);
        self.deliver(to, email, &chat).await
    }

    /// Aggregate birthday message to the operator chat
    pub async fn birthday_digest(&self, chat_id: Option<&str>, names: &[String], today: NaiveDate) -> ChannelOutcome {
        let text = messages::birthday_digest_chat(names, today);
        self.send_chat(chat_id, &text).await
    }
}
