//! Webhook notification payloads and delivery.
//!
//! Delivery is fire-and-forget from the pipeline's point of view: the
//! scheduler logs a failed send and moves on, so nothing here retries or
//! blocks beyond the request timeout.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use thriftwatch_core::{AlertDefinition, Listing, MatchResult};
use tracing::debug;

pub const CRATE_NAME: &str = "thriftwatch-notify";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook returned http status {status}")]
    HttpStatus { status: u16 },
}

/// One outgoing notification, already reduced to display fields.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchNotification {
    pub title: String,
    pub url: String,
    pub price_text: String,
    pub size_text: Option<String>,
    pub estimated_profit: Option<f64>,
    pub image_url: Option<String>,
}

impl MatchNotification {
    /// Notification for a listing that matched an alert.
    pub fn for_match(listing: &Listing, result: &MatchResult) -> Self {
        Self {
            title: listing.title.clone(),
            url: listing.url.clone(),
            price_text: listing.price_text.clone(),
            size_text: listing.size_text.clone(),
            estimated_profit: result.estimated_profit,
            image_url: listing.image_url.clone(),
        }
    }

    /// Startup announcement sent once per enabled alert so the channel
    /// shows which watches are live.
    pub fn alert_started(alert: &AlertDefinition) -> Self {
        Self {
            title: format!("Alert '{}' started", alert.name),
            url: alert.search_url.clone(),
            price_text: String::new(),
            size_text: None,
            estimated_profit: None,
            image_url: None,
        }
    }

    /// Render as a Discord-style embed body. Empty or unknown fields are
    /// omitted rather than sent blank.
    pub fn to_embed_body(&self) -> Value {
        let mut fields = Vec::new();
        if !self.price_text.is_empty() {
            fields.push(json!({"name": "Price", "value": self.price_text, "inline": true}));
        }
        if let Some(size) = &self.size_text {
            fields.push(json!({"name": "Size", "value": size, "inline": true}));
        }
        if let Some(profit) = self.estimated_profit {
            fields.push(json!({
                "name": "Est. Profit",
                "value": format!("£{profit:.2}"),
                "inline": true
            }));
        }

        let mut embed = json!({
            "title": self.title,
            "url": self.url,
            "fields": fields,
        });
        if let Some(image) = &self.image_url {
            embed["image"] = json!({"url": image});
        }

        json!({ "embeds": [embed] })
    }
}

/// Delivery seam the scheduler talks to; tests substitute a recording
/// implementation.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(
        &self,
        webhook_url: &str,
        message: &MatchNotification,
    ) -> Result<(), DispatchError>;
}

/// Production sink: POST the embed body as JSON to the webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building webhook client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn deliver(
        &self,
        webhook_url: &str,
        message: &MatchNotification,
    ) -> Result<(), DispatchError> {
        let resp = self
            .client
            .post(webhook_url)
            .json(&message.to_embed_body())
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DispatchError::HttpStatus {
                status: status.as_u16(),
            });
        }
        debug!(title = %message.title, "notification delivered");
        Ok(())
    }
}
