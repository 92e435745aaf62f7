//! Concrete notification channels: Telegram chat and SMTP mail. SMS goes
//! out as mail to a carrier's email-to-SMS gateway address.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::Client;

use super::{AlertError, BodyFormat, Notifier};

/// Telegram Bot API `sendMessage`.
pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub const DEFAULT_API_BASE: &'static str = "https://api.telegram.org";

    pub fn new(
        bot_token: impl Into<String>,
        chat_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AlertError> {
        Ok(TelegramNotifier {
            client: Client::builder().timeout(timeout).build()?,
            api_base: Self::DEFAULT_API_BASE.to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn channel(&self) -> &str {
        "telegram"
    }

    fn body_format(&self) -> BodyFormat {
        BodyFormat::Markdown
    }

    async fn send(&self, _subject: &str, body: &str) -> Result<(), AlertError> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.bot_token
        );
        let payload = serde_json::json!({
            "chat_id": self.chat_id,
            "text": body,
            "parse_mode": "Markdown",
        });

        let response = self.client.post(&url).json(&payload).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AlertError::Rejected {
                channel: self.channel().to_string(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(())
    }
}

/// SMTP account used for outgoing mail.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

/// Mail channel over implicit-TLS SMTP.
pub struct EmailNotifier {
    channel: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
    /// Replaces the alert subject, e.g. a short fixed one for SMS gateways
    fixed_subject: Option<String>,
}

impl EmailNotifier {
    pub fn new(
        channel: impl Into<String>,
        settings: &SmtpSettings,
        recipient: &str,
        timeout: Duration,
    ) -> Result<Self, AlertError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)?
            .port(settings.port)
            .credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ))
            .timeout(Some(timeout))
            .build();

        Ok(EmailNotifier {
            channel: channel.into(),
            transport,
            from: settings.from.parse()?,
            to: recipient.parse()?,
            fixed_subject: None,
        })
    }

    /// Mail to an email-to-SMS gateway address.
    pub fn sms_gateway(
        settings: &SmtpSettings,
        gateway_address: &str,
        timeout: Duration,
    ) -> Result<Self, AlertError> {
        let mut notifier = Self::new("sms", settings, gateway_address, timeout)?;
        notifier.fixed_subject = Some("Login Guard SMS".to_string());
        Ok(notifier)
    }

    fn build_message(&self, subject: &str, body: &str) -> Result<Message, AlertError> {
        let subject = self.fixed_subject.as_deref().unwrap_or(subject);
        let message = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())?;
        Ok(message)
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn send(&self, subject: &str, body: &str) -> Result<(), AlertError> {
        let message = self.build_message(subject, body)?;
        self.transport.send(message).await?;
        Ok(())
    }
}
