// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Operator alerts.
//!
//! Routine skips and retries only go to the log. Events an operator must act
//! on (failed submissions, fee ceiling reached, nonce drift, corrupted roots)
//! are also pushed through a [`Notifier`].

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_SECS: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    fn tag(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, severity: Severity, title: &str, body: &str);
}

pub type SharedNotifier = Arc<dyn Notifier>;

/// Writes alerts to the log only.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, severity: Severity, title: &str, body: &str) {
        match severity {
            Severity::Info => info!("[alert] {}: {}", title, body),
            Severity::Warning => warn!("[alert] {}: {}", title, body),
            Severity::Critical => error!("[alert] {}: {}", title, body),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }
}

pub struct TelegramNotifier {
    config: TelegramConfig,
    client: Client,
    api_base: String,
    instance: String,
}

impl std::fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("configured", &self.is_configured())
            .field("api_base", &"<redacted>")
            .field("instance", &self.instance)
            .finish()
    }
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig, instance: &str) -> anyhow::Result<Self> {
        let api_base = format!("https://api.telegram.org/bot{}", config.bot_token);
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            config,
            client,
            api_base,
            instance: instance.to_string(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    fn format_message(&self, severity: Severity, title: &str, body: &str) -> String {
        format!(
            "<b>[{}] {}</b>\n<i>{}</i>\n\n{}",
            severity.tag(),
            html_escape(title),
            html_escape(&self.instance),
            html_escape(body)
        )
    }

    async fn send_message(&self, text: &str) {
        if !self.is_configured() {
            info!(
                "Telegram not configured, would send: {}",
                &text[..text.len().min(200)]
            );
            return;
        }

        for attempt in 0..MAX_RETRIES {
            match self
                .client
                .post(format!("{}/sendMessage", self.api_base))
                .json(&json!({
                    "chat_id": self.config.chat_id,
                    "text": text,
                    "parse_mode": "HTML",
                    "disable_web_page_preview": true,
                }))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => {
                    warn!(
                        "Telegram send attempt {}/{} failed: {}",
                        attempt + 1,
                        MAX_RETRIES,
                        resp.status()
                    );
                }
                Err(e) => {
                    warn!(
                        "Telegram send attempt {}/{} failed: {:?}",
                        attempt + 1,
                        MAX_RETRIES,
                        e
                    );
                }
            }

            if attempt < MAX_RETRIES - 1 {
                tokio::time::sleep(Duration::from_secs(RETRY_DELAY_SECS * (attempt as u64 + 1)))
                    .await;
            }
        }

        warn!(
            "Failed to send Telegram message after {} attempts",
            MAX_RETRIES
        );
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, severity: Severity, title: &str, body: &str) {
        // always keep a log trail, the chat is best effort
        LogNotifier.notify(severity, title, body).await;
        if severity >= Severity::Warning {
            let text = self.format_message(severity, title, body);
            self.send_message(&text).await;
        }
    }
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_message_escapes_html() {
        let notifier = TelegramNotifier::new(TelegramConfig::default(), "bonder-1").unwrap();
        assert!(!notifier.is_configured());
        let text = notifier.format_message(Severity::Critical, "root <x>", "a & b");
        assert!(text.contains("[CRITICAL] root &lt;x&gt;"));
        assert!(text.contains("a &amp; b"));
        assert!(text.contains("bonder-1"));
    }

    #[tokio::test]
    async fn test_unconfigured_notifier_does_not_send() {
        let notifier = TelegramNotifier::new(TelegramConfig::default(), "bonder-1").unwrap();
        // returns without touching the network
        notifier.notify(Severity::Critical, "t", "b").await;
    }
}
