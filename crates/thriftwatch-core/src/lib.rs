//! Core domain model and alert evaluation for Thriftwatch.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "thriftwatch-core";

/// A named rule set describing which listings to watch for and how to judge
/// their profitability. `name` is the unique key across the active set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDefinition {
    pub name: String,
    pub search_url: String,
    pub webhook_url: String,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub must_include: Vec<String>,
    #[serde(default)]
    pub must_exclude: Vec<String>,
    /// Accepted size tokens; empty means any size.
    #[serde(default)]
    pub size_filter: Vec<String>,
    #[serde(default)]
    pub avg_resale_price: Option<f64>,
    #[serde(default)]
    pub fees_estimate: f64,
    #[serde(default)]
    pub min_profit: Option<f64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl AlertDefinition {
    /// Estimated resale profit for a listing at `price`, when both the
    /// resale estimate and the price are known.
    pub fn estimate_profit(&self, price: Option<f64>) -> Option<f64> {
        match (self.avg_resale_price, price) {
            (Some(resale), Some(price)) => Some(resale - price - self.fees_estimate),
            _ => None,
        }
    }
}

/// One scraped marketplace offer. `url` is the resolved absolute listing
/// URL and doubles as the dedup key; every other field is best-effort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub url: String,
    pub title: String,
    pub price_text: String,
    pub price: Option<f64>,
    pub size_text: Option<String>,
    pub image_url: Option<String>,
}

impl Listing {
    pub fn dedup_key(&self) -> &str {
        &self.url
    }
}

/// Verdict of evaluating one listing against one alert. The estimated
/// profit is carried for display whenever it was computable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub is_match: bool,
    pub estimated_profit: Option<f64>,
}

impl MatchResult {
    fn no_match() -> Self {
        Self {
            is_match: false,
            estimated_profit: None,
        }
    }
}

/// Evaluate a listing against an alert. Checks short-circuit in order:
/// enabled, must-include keywords, must-exclude keywords, max price, size
/// filter, minimum profit. Unknown price, size, or profit skip their check
/// rather than failing it, so missing data never suppresses a listing on
/// its own.
pub fn evaluate(listing: &Listing, alert: &AlertDefinition) -> MatchResult {
    if !alert.enabled {
        return MatchResult::no_match();
    }

    let title = listing.title.to_lowercase();

    if !alert.must_include.is_empty()
        && !alert
            .must_include
            .iter()
            .any(|kw| title.contains(&kw.to_lowercase()))
    {
        return MatchResult::no_match();
    }

    if alert
        .must_exclude
        .iter()
        .any(|kw| title.contains(&kw.to_lowercase()))
    {
        return MatchResult::no_match();
    }

    if let (Some(max_price), Some(price)) = (alert.max_price, listing.price) {
        if price > max_price {
            return MatchResult::no_match();
        }
    }

    if !alert.size_filter.is_empty() {
        if let Some(size_text) = listing.size_text.as_deref() {
            let size = normalize_size(size_text);
            if !alert.size_filter.iter().any(|s| normalize_size(s) == size) {
                return MatchResult::no_match();
            }
        }
    }

    let estimated_profit = alert.estimate_profit(listing.price);
    if let (Some(min_profit), Some(profit)) = (alert.min_profit, estimated_profit) {
        if profit < min_profit {
            return MatchResult::no_match();
        }
    }

    MatchResult {
        is_match: true,
        estimated_profit,
    }
}

/// Canonical size form used for membership tests: trimmed and uppercased.
pub fn normalize_size(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Rejected alert-list edits. Validation runs before any list is published,
/// so a failing edit leaves the prior configuration active.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("alert at position {index} has an empty name")]
    EmptyName { index: usize },
    #[error("duplicate alert name '{name}'")]
    DuplicateName { name: String },
    #[error("alert '{name}' has an empty {field}")]
    EmptyField { name: String, field: &'static str },
    #[error("alert '{name}' has a non-finite {field}")]
    NonFinite { name: String, field: &'static str },
    #[error("alert '{name}' has a negative {field}")]
    Negative { name: String, field: &'static str },
}

/// Validate a whole alert list: non-empty unique names, non-empty URLs,
/// finite numbers, and non-negative prices and fees. `min_profit` only has
/// to be finite; a negative floor is a legitimate way to say "alert even at
/// a small loss".
pub fn validate_alerts(alerts: &[AlertDefinition]) -> Result<(), ValidationError> {
    let mut seen_names = Vec::with_capacity(alerts.len());

    for (index, alert) in alerts.iter().enumerate() {
        let name = alert.name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyName { index });
        }
        if seen_names.contains(&name) {
            return Err(ValidationError::DuplicateName {
                name: name.to_string(),
            });
        }
        seen_names.push(name);

        if alert.search_url.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                name: name.to_string(),
                field: "search_url",
            });
        }
        if alert.webhook_url.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                name: name.to_string(),
                field: "webhook_url",
            });
        }

        check_optional(name, "max_price", alert.max_price, false)?;
        check_optional(name, "avg_resale_price", alert.avg_resale_price, false)?;
        check_optional(name, "fees_estimate", Some(alert.fees_estimate), false)?;
        check_optional(name, "min_profit", alert.min_profit, true)?;
    }

    Ok(())
}

fn check_optional(
    name: &str,
    field: &'static str,
    value: Option<f64>,
    allow_negative: bool,
) -> Result<(), ValidationError> {
    let Some(value) = value else {
        return Ok(());
    };
    if !value.is_finite() {
        return Err(ValidationError::NonFinite {
            name: name.to_string(),
            field,
        });
    }
    if value < 0.0 && !allow_negative {
        return Err(ValidationError::Negative {
            name: name.to_string(),
            field,
        });
    }
    Ok(())
}
