//! Axum + Askama operator dashboard for alert editing.
//!
//! The dashboard is the write side of the shared [`AlertStore`]: every save
//! validates a full copy before publishing it, so a bad edit answers 422 and
//! the running scanner keeps its previous configuration.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Form, Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use thriftwatch_core::AlertDefinition;
use thriftwatch_scan::{AlertSelector, AlertStore};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "thriftwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<AlertStore>,
}

impl AppState {
    pub fn new(store: Arc<AlertStore>) -> Self {
        Self { store }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/alerts", post(append_alert_handler))
        .route("/alerts/{index}", post(update_alert_handler))
        .route("/api/alerts", get(api_list_handler).put(api_replace_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(store: Arc<AlertStore>) -> anyhow::Result<()> {
    let port: u16 = std::env::var("THRIFTWATCH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "dashboard listening");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    rows: Vec<AlertRow>,
}

struct AlertRow {
    index: usize,
    name: String,
    search_url: String,
    webhook_url: String,
    max_price: String,
    must_include: String,
    must_exclude: String,
    size_filter: String,
    avg_resale_price: String,
    fees_estimate: String,
    min_profit: String,
    enabled: bool,
}

impl AlertRow {
    fn from_alert(index: usize, alert: &AlertDefinition) -> Self {
        Self {
            index,
            name: alert.name.clone(),
            search_url: alert.search_url.clone(),
            webhook_url: alert.webhook_url.clone(),
            max_price: number_field(alert.max_price),
            must_include: alert.must_include.join(", "),
            must_exclude: alert.must_exclude.join(", "),
            size_filter: alert.size_filter.join(", "),
            avg_resale_price: number_field(alert.avg_resale_price),
            fees_estimate: format_number(alert.fees_estimate),
            min_profit: number_field(alert.min_profit),
            enabled: alert.enabled,
        }
    }
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let rows = state
        .store
        .snapshot()
        .iter()
        .enumerate()
        .map(|(index, alert)| AlertRow::from_alert(index, alert))
        .collect();
    render_html(IndexTemplate { rows })
}

/// HTML form fields for one alert. Numbers arrive as strings so an empty
/// input can mean "unset"; keyword and size lists are comma-separated.
#[derive(Debug, Deserialize)]
struct AlertForm {
    name: String,
    search_url: String,
    webhook_url: String,
    #[serde(default)]
    max_price: String,
    #[serde(default)]
    must_include: String,
    #[serde(default)]
    must_exclude: String,
    #[serde(default)]
    size_filter: String,
    #[serde(default)]
    avg_resale_price: String,
    #[serde(default)]
    fees_estimate: String,
    #[serde(default)]
    min_profit: String,
    // Checkboxes are simply absent when unchecked.
    #[serde(default)]
    enabled: Option<String>,
}

impl AlertForm {
    fn into_alert(self) -> Result<AlertDefinition, String> {
        Ok(AlertDefinition {
            name: self.name.trim().to_string(),
            search_url: self.search_url.trim().to_string(),
            webhook_url: self.webhook_url.trim().to_string(),
            max_price: parse_number_field("max_price", &self.max_price)?,
            must_include: parse_list_field(&self.must_include),
            must_exclude: parse_list_field(&self.must_exclude),
            size_filter: parse_list_field(&self.size_filter),
            avg_resale_price: parse_number_field("avg_resale_price", &self.avg_resale_price)?,
            fees_estimate: parse_number_field("fees_estimate", &self.fees_estimate)?
                .unwrap_or(0.0),
            min_profit: parse_number_field("min_profit", &self.min_profit)?,
            enabled: self.enabled.is_some(),
        })
    }
}

async fn update_alert_handler(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
    Form(form): Form<AlertForm>,
) -> Response {
    let alert = match form.into_alert() {
        Ok(alert) => alert,
        Err(message) => return unprocessable(message),
    };
    match state
        .store
        .update(&AlertSelector::Index(index), |entry| *entry = alert)
    {
        Ok(()) => Redirect::to("/").into_response(),
        Err(err) => unprocessable(err.to_string()),
    }
}

async fn append_alert_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<AlertForm>,
) -> Response {
    let alert = match form.into_alert() {
        Ok(alert) => alert,
        Err(message) => return unprocessable(message),
    };
    match state.store.append(alert) {
        Ok(()) => Redirect::to("/").into_response(),
        Err(err) => unprocessable(err.to_string()),
    }
}

async fn api_list_handler(State(state): State<Arc<AppState>>) -> Json<Vec<AlertDefinition>> {
    Json(state.store.snapshot().as_ref().clone())
}

async fn api_replace_handler(
    State(state): State<Arc<AppState>>,
    Json(alerts): Json<Vec<AlertDefinition>>,
) -> Response {
    match state.store.replace(alerts) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

fn parse_list_field(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_number_field(field: &str, raw: &str) -> Result<Option<f64>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse()
        .map(Some)
        .map_err(|_| format!("invalid number for {field}: '{trimmed}'"))
}

fn number_field(value: Option<f64>) -> String {
    value.map(format_number).unwrap_or_default()
}

fn format_number(value: f64) -> String {
    if value == value.trunc() {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(format!("Server error: {err}")),
        )
            .into_response(),
    }
}

fn unprocessable(message: String) -> Response {
    (StatusCode::UNPROCESSABLE_ENTITY, message).into_response()
}
