//! Search-page fetching and best-effort listing extraction.
//!
//! Extraction is deliberately heuristic: marketplace markup shifts, so every
//! field is pulled through a cascade of fallback selectors and a listing is
//! only dropped when its link cannot be determined.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use thriftwatch_core::Listing;
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "thriftwatch-fetch";

/// Size tokens recognized when sniffing a card for a size label.
const SIZE_TOKENS: [&str; 6] = ["XS", "S", "M", "L", "XL", "XXL"];

const CARD_SELECTOR: &str =
    "div.feed-grid__item, div.new-item-box, div.item-box, div[class^='ItemBox_root__']";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: format!("thriftwatch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Thin reqwest wrapper with the bounded timeout every network call in the
/// scan cycle must respect.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_html(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        Ok(resp.text().await?)
    }
}

/// Source of listings for one search endpoint. The scan scheduler only
/// talks to this trait, which keeps the scraping heuristics out of the
/// core pipeline and lets tests script fetch results.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch(&self, search_url: &str) -> Result<Vec<Listing>, FetchError>;
}

/// Production source: fetch the search page over HTTP and extract listing
/// cards from the returned HTML.
#[derive(Debug, Clone)]
pub struct SearchPageSource {
    http: HttpClient,
}

impl SearchPageSource {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ListingSource for SearchPageSource {
    async fn fetch(&self, search_url: &str) -> Result<Vec<Listing>, FetchError> {
        let html = self.http.fetch_html(search_url).await?;
        let listings = extract_listings(search_url, &html);
        debug!(search_url, count = listings.len(), "extracted listings");
        Ok(listings)
    }
}

/// Extract listing cards from a search-results page. Title, price, size and
/// image are each independently optional; a card with no resolvable link is
/// skipped entirely.
pub fn extract_listings(search_url: &str, html: &str) -> Vec<Listing> {
    let document = Html::parse_document(html);
    let base = Url::parse(search_url).ok();

    let mut listings = Vec::new();
    for card in document.select(&sel(CARD_SELECTOR)) {
        let Some(url) = card_link(&card, base.as_ref()) else {
            continue;
        };

        let title = card_title(&card).unwrap_or_else(|| "No title".to_string());
        let price_text = card_price_text(&card).unwrap_or_default();
        let price = parse_price(&price_text);
        let size_text = card_size(&card);
        let image_url = select_first_attr(&card, "img", "src");

        listings.push(Listing {
            url,
            title,
            price_text,
            price,
            size_text,
            image_url,
        });
    }
    listings
}

/// Strip the currency symbol and thousands separators and parse what is
/// left. Anything unparseable is an unknown price, not an error.
pub fn parse_price(price_text: &str) -> Option<f64> {
    let cleaned = price_text.replace(['£', ','], "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

fn card_link(card: &ElementRef<'_>, base: Option<&Url>) -> Option<String> {
    let href = card
        .select(&sel("a[href]"))
        .next()
        .and_then(|a| a.value().attr("href"))
        .map(str::trim)
        .filter(|h| !h.is_empty())?;

    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    base.and_then(|b| b.join(href).ok()).map(|u| u.to_string())
}

fn card_title(card: &ElementRef<'_>) -> Option<String> {
    select_first_text(card, "h3")
        .or_else(|| select_first_text(card, "span[class^='ItemBox_title__']"))
        .or_else(|| select_first_text(card, "div[class^='ItemBox_title__']"))
        .or_else(|| select_first_text(card, "span"))
}

fn card_price_text(card: &ElementRef<'_>) -> Option<String> {
    select_first_text(card, "span.price")
        .or_else(|| select_first_text(card, "div[class^='ItemBox_price__']"))
        .or_else(|| {
            card.select(&sel("span"))
                .filter_map(|n| text_or_none(n.text().collect::<String>()))
                .find(|t| t.contains('£'))
        })
}

fn card_size(card: &ElementRef<'_>) -> Option<String> {
    card.select(&sel("span"))
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .find(|t| SIZE_TOKENS.contains(&t.to_uppercase().as_str()))
}

fn select_first_text(card: &ElementRef<'_>, selector: &str) -> Option<String> {
    card.select(&sel(selector))
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn select_first_attr(card: &ElementRef<'_>, selector: &str, attr: &str) -> Option<String> {
    card.select(&sel(selector))
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn sel(selector: &str) -> Selector {
    Selector::parse(selector).expect("selector is statically valid")
}
