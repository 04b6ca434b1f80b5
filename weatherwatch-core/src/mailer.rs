//! Outgoing email.

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, time::Duration};
use tracing::{debug, info};

use crate::{
    config::{Config, MailerKind},
    error::MailError,
    provider::{http_client, truncate_body},
};

const RESEND_BASE_URL: &str = "https://api.resend.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

impl Email {
    /// The alert sent when a subscription's condition holds.
    pub fn condition_met(to: &str, condition: &str, city: &str) -> Self {
        Self {
            to: to.to_string(),
            subject: "Weather Update".to_string(),
            html_body: format!(
                "The weather condition `{}` is met for city `{}`.",
                escape_html(condition),
                escape_html(city)
            ),
        }
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[async_trait]
pub trait Mailer: Send + Sync + Debug {
    async fn send(&self, email: &Email) -> Result<(), MailError>;
}

/// Delivers mail through the Resend HTTP API.
#[derive(Debug, Clone)]
pub struct ResendMailer {
    api_key: String,
    from: String,
    base_url: String,
    http: Client,
}

#[derive(Debug, Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

#[derive(Debug, Deserialize)]
struct ResendResponse {
    id: Option<String>,
}

impl ResendMailer {
    pub fn new(api_key: String, from: String, timeout: Duration) -> Self {
        Self {
            api_key,
            from,
            base_url: RESEND_BASE_URL.to_string(),
            http: http_client(timeout),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        debug!(to = %email.to, "sending email");

        let res = self
            .http
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&ResendRequest {
                from: &self.from,
                to: [email.to.as_str()],
                subject: &email.subject,
                html: &email.html_body,
            })
            .send()
            .await?;

        let status = res.status();
        let body = res.text().await?;

        if !status.is_success() {
            return Err(MailError::Rejected {
                to: email.to.clone(),
                status,
                body: truncate_body(&body),
            });
        }

        let id = serde_json::from_str::<ResendResponse>(&body)
            .ok()
            .and_then(|r| r.id)
            .unwrap_or_default();
        info!(to = %email.to, id = %id, "email sent");

        Ok(())
    }
}

/// Writes emails to the log instead of sending them.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        info!(
            to = %email.to,
            subject = %email.subject,
            body = %email.html_body,
            "email (log mailer, not delivered)"
        );
        Ok(())
    }
}

pub fn mailer_from_config(config: &Config) -> anyhow::Result<Box<dyn Mailer>> {
    let boxed: Box<dyn Mailer> = match config.mailer.kind {
        MailerKind::Log => Box::new(LogMailer),
        MailerKind::Resend => {
            let api_key = config.mailer.api_key.clone().ok_or_else(|| {
                anyhow!(
                    "No Resend API key configured.\n\
                     Hint: set RESEND_API_KEY or `api_key` under [mailer] in the config file."
                )
            })?;
            let mut mailer =
                ResendMailer::new(api_key, config.mailer.from.clone(), config.http_timeout()?);
            if let Some(url) = &config.mailer.base_url {
                mailer = mailer.with_base_url(url.clone());
            }
            Box::new(mailer)
        }
    };

    Ok(boxed)
}
