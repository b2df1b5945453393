//! Scan scheduling, the shared alert store, and notification dedup.
//!
//! The scheduler and the web dashboard run truly in parallel; the
//! [`AlertStore`] is the only state they share. Readers take an `Arc`
//! snapshot, writers validate a full copy and swap it in atomically, so a
//! scan mid-cycle never observes a half-edited alert.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use thriftwatch_core::{evaluate, validate_alerts, AlertDefinition, ValidationError};
use thriftwatch_fetch::ListingSource;
use thriftwatch_notify::{MatchNotification, NotificationSink};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "thriftwatch-scan";

/// Process-wide tunables, environment-driven.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub scan_interval_secs: u64,
    pub alerts_file: String,
    pub http_timeout_secs: u64,
    pub webhook_timeout_secs: u64,
    pub user_agent: String,
}

impl ScanConfig {
    pub fn from_env() -> Self {
        Self {
            scan_interval_secs: std::env::var("THRIFTWATCH_SCAN_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            alerts_file: std::env::var("THRIFTWATCH_ALERTS_FILE")
                .unwrap_or_else(|_| "alerts.yaml".to_string()),
            http_timeout_secs: std::env::var("THRIFTWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15),
            webhook_timeout_secs: std::env::var("THRIFTWATCH_WEBHOOK_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            user_agent: std::env::var("THRIFTWATCH_USER_AGENT")
                .unwrap_or_else(|_| format!("thriftwatch/{}", env!("CARGO_PKG_VERSION"))),
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }
}

#[derive(Debug, Deserialize)]
struct AlertsFile {
    alerts: Vec<AlertDefinition>,
}

/// Load and validate the startup alert list. The process refuses to start
/// on a file the editor surface would also reject.
pub fn load_alerts_file(path: impl AsRef<Path>) -> anyhow::Result<Vec<AlertDefinition>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let parsed: AlertsFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    validate_alerts(&parsed.alerts)
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(parsed.alerts)
}

/// Addresses one alert for a single-entry edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertSelector {
    Index(usize),
    Name(String),
}

impl fmt::Display for AlertSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSelector::Index(index) => write!(f, "index {index}"),
            AlertSelector::Name(name) => write!(f, "name '{name}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum UpdateError {
    #[error("no alert matches {0}")]
    NotFound(String),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Copy-on-write store for the canonical alert list.
///
/// Every published list has passed [`validate_alerts`]; a rejected edit
/// leaves the previous list active. Readers get a cheap `Arc` clone and are
/// never exposed to in-place mutation.
#[derive(Debug)]
pub struct AlertStore {
    alerts: RwLock<Arc<Vec<AlertDefinition>>>,
}

impl AlertStore {
    pub fn new(alerts: Vec<AlertDefinition>) -> Result<Self, ValidationError> {
        validate_alerts(&alerts)?;
        Ok(Self {
            alerts: RwLock::new(Arc::new(alerts)),
        })
    }

    /// Internally consistent view of the current list; safe from any task
    /// at any time.
    pub fn snapshot(&self) -> Arc<Vec<AlertDefinition>> {
        Arc::clone(&self.alerts.read().expect("alert store lock poisoned"))
    }

    /// Atomically swap in a whole new list after validating it.
    pub fn replace(&self, alerts: Vec<AlertDefinition>) -> Result<(), ValidationError> {
        validate_alerts(&alerts)?;
        *self.alerts.write().expect("alert store lock poisoned") = Arc::new(alerts);
        Ok(())
    }

    /// Single-entry edit as copy-then-swap: clone the list, mutate one
    /// entry of the clone, validate, publish. Concurrent readers keep the
    /// old list until the swap.
    pub fn update(
        &self,
        selector: &AlertSelector,
        mutate: impl FnOnce(&mut AlertDefinition),
    ) -> Result<(), UpdateError> {
        let mut guard = self.alerts.write().expect("alert store lock poisoned");
        let mut next = guard.as_ref().clone();
        let entry = match selector {
            AlertSelector::Index(index) => next.get_mut(*index),
            AlertSelector::Name(name) => next.iter_mut().find(|a| &a.name == name),
        }
        .ok_or_else(|| UpdateError::NotFound(selector.to_string()))?;
        mutate(entry);
        validate_alerts(&next)?;
        *guard = Arc::new(next);
        Ok(())
    }

    /// Append one alert, validated against the rest of the list.
    pub fn append(&self, alert: AlertDefinition) -> Result<(), ValidationError> {
        let mut guard = self.alerts.write().expect("alert store lock poisoned");
        let mut next = guard.as_ref().clone();
        next.push(alert);
        validate_alerts(&next)?;
        *guard = Arc::new(next);
        Ok(())
    }
}

/// Per-alert record of listing URLs already notified.
///
/// "Seen" means notified, not observed: non-matching listings are left out
/// so they can match after a later rule relaxation. Entries are kept for
/// the process lifetime; there is no eviction.
#[derive(Debug, Default)]
pub struct DedupIndex {
    seen: HashMap<String, HashSet<String>>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lazily create the set for a newly added alert so its first lookup
    /// never errors.
    pub fn ensure_alert(&mut self, alert_name: &str) {
        if !self.seen.contains_key(alert_name) {
            self.seen.insert(alert_name.to_string(), HashSet::new());
        }
    }

    pub fn has_seen(&self, alert_name: &str, listing_url: &str) -> bool {
        self.seen
            .get(alert_name)
            .is_some_and(|urls| urls.contains(listing_url))
    }

    /// Idempotent: re-marking an already-seen listing is a no-op.
    pub fn mark_seen(&mut self, alert_name: &str, listing_url: &str) {
        self.seen
            .entry(alert_name.to_string())
            .or_default()
            .insert(listing_url.to_string());
    }

    pub fn seen_count(&self, alert_name: &str) -> usize {
        self.seen.get(alert_name).map_or(0, HashSet::len)
    }
}

/// Result of one full pass over the alert list.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub alerts_scanned: usize,
    pub alerts_failed: usize,
    pub listings_evaluated: usize,
    pub matches_dispatched: usize,
}

/// Drives the periodic scan: snapshot the store, fetch each enabled
/// alert's search page, evaluate listings, dedup, dispatch.
pub struct Scanner {
    store: Arc<AlertStore>,
    source: Box<dyn ListingSource>,
    sink: Box<dyn NotificationSink>,
    dedup: DedupIndex,
    interval: Duration,
}

impl Scanner {
    pub fn new(
        store: Arc<AlertStore>,
        source: Box<dyn ListingSource>,
        sink: Box<dyn NotificationSink>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            source,
            sink,
            dedup: DedupIndex::new(),
            interval,
        }
    }

    /// Announce every enabled alert to its webhook once, before the first
    /// cycle. Delivery failures are logged and swallowed like any other.
    pub async fn announce_started(&self) {
        for alert in self.store.snapshot().iter().filter(|a| a.enabled) {
            let message = MatchNotification::alert_started(alert);
            if let Err(err) = self.sink.deliver(&alert.webhook_url, &message).await {
                warn!(alert = %alert.name, error = %err, "startup announcement failed");
            }
        }
    }

    /// One pass over a single snapshot of the alert list. Alerts added or
    /// edited mid-cycle are picked up on the next pass.
    pub async fn run_cycle(&mut self) -> CycleSummary {
        let started_at = Utc::now();
        let cycle_id = Uuid::new_v4();
        let alerts = self.store.snapshot();

        let mut summary = CycleSummary {
            cycle_id,
            started_at,
            finished_at: started_at,
            alerts_scanned: 0,
            alerts_failed: 0,
            listings_evaluated: 0,
            matches_dispatched: 0,
        };

        for alert in alerts.iter() {
            if !alert.enabled {
                continue;
            }
            summary.alerts_scanned += 1;
            self.scan_alert(alert, &mut summary).await;
        }

        summary.finished_at = Utc::now();
        summary
    }

    async fn scan_alert(&mut self, alert: &AlertDefinition, summary: &mut CycleSummary) {
        self.dedup.ensure_alert(&alert.name);

        let listings = match self.source.fetch(&alert.search_url).await {
            Ok(listings) => listings,
            Err(err) => {
                // One alert's fetch failure never aborts the cycle.
                warn!(alert = %alert.name, error = %err, "fetch failed");
                summary.alerts_failed += 1;
                return;
            }
        };

        for listing in listings {
            if self.dedup.has_seen(&alert.name, listing.dedup_key()) {
                continue;
            }

            summary.listings_evaluated += 1;
            let verdict = evaluate(&listing, alert);
            if !verdict.is_match {
                continue;
            }

            // Mark before dispatch: a failed delivery is not re-sent.
            self.dedup.mark_seen(&alert.name, listing.dedup_key());
            info!(
                alert = %alert.name,
                title = %listing.title,
                price = %listing.price_text,
                "new match"
            );

            let message = MatchNotification::for_match(&listing, &verdict);
            if let Err(err) = self.sink.deliver(&alert.webhook_url, &message).await {
                warn!(alert = %alert.name, error = %err, "notification delivery failed");
            }
            summary.matches_dispatched += 1;
        }
    }

    /// Run cycles until the shutdown channel flips. The in-flight cycle is
    /// allowed to finish; its network calls are bounded by client timeouts.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        self.announce_started().await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let summary = self.run_cycle().await;
            info!(
                cycle = %summary.cycle_id,
                alerts = summary.alerts_scanned,
                failed = summary.alerts_failed,
                evaluated = summary.listings_evaluated,
                dispatched = summary.matches_dispatched,
                "scan cycle complete"
            );

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("scan loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::Mutex;
    use thriftwatch_core::Listing;
    use thriftwatch_fetch::FetchError;
    use thriftwatch_notify::DispatchError;

    fn alert(name: &str, search_url: &str) -> AlertDefinition {
        AlertDefinition {
            name: name.to_string(),
            search_url: search_url.to_string(),
            webhook_url: format!("https://hooks.example/{name}"),
            max_price: None,
            must_include: vec![],
            must_exclude: vec![],
            size_filter: vec![],
            avg_resale_price: None,
            fees_estimate: 0.0,
            min_profit: None,
            enabled: true,
        }
    }

    fn listing(url: &str, title: &str, price: Option<f64>) -> Listing {
        Listing {
            url: url.to_string(),
            title: title.to_string(),
            price_text: price.map(|p| format!("£{p:.2}")).unwrap_or_default(),
            price,
            size_text: None,
            image_url: None,
        }
    }

    /// Scripted pages keyed by search URL; unknown URLs fail the fetch.
    struct ScriptedSource {
        pages: HashMap<String, Vec<Listing>>,
    }

    #[async_trait]
    impl ListingSource for ScriptedSource {
        async fn fetch(&self, search_url: &str) -> Result<Vec<Listing>, FetchError> {
            self.pages
                .get(search_url)
                .cloned()
                .ok_or(FetchError::HttpStatus {
                    status: 500,
                    url: search_url.to_string(),
                })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<(String, MatchNotification)>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(
            &self,
            webhook_url: &str,
            message: &MatchNotification,
        ) -> Result<(), DispatchError> {
            self.delivered
                .lock()
                .unwrap()
                .push((webhook_url.to_string(), message.clone()));
            if self.fail {
                return Err(DispatchError::HttpStatus { status: 502 });
            }
            Ok(())
        }
    }

    fn scanner_with(
        alerts: Vec<AlertDefinition>,
        pages: HashMap<String, Vec<Listing>>,
        sink: Arc<RecordingSink>,
    ) -> (Scanner, Arc<AlertStore>) {
        let store = Arc::new(AlertStore::new(alerts).unwrap());
        let scanner = Scanner::new(
            Arc::clone(&store),
            Box::new(ScriptedSource { pages }),
            Box::new(SharedSink(sink)),
            Duration::from_secs(30),
        );
        (scanner, store)
    }

    /// Lets a test keep a handle on the sink the scanner owns.
    struct SharedSink(Arc<RecordingSink>);

    #[async_trait]
    impl NotificationSink for SharedSink {
        async fn deliver(
            &self,
            webhook_url: &str,
            message: &MatchNotification,
        ) -> Result<(), DispatchError> {
            self.0.deliver(webhook_url, message).await
        }
    }

    #[tokio::test]
    async fn same_listing_across_cycles_notifies_once() {
        let a = alert("jumpers", "https://market.example/jumpers");
        let pages = HashMap::from([(
            a.search_url.clone(),
            vec![listing("https://market.example/items/1", "Wool jumper", Some(4.0))],
        )]);
        let sink = Arc::new(RecordingSink::default());
        let (mut scanner, _store) = scanner_with(vec![a], pages, Arc::clone(&sink));

        let first = scanner.run_cycle().await;
        let second = scanner.run_cycle().await;

        assert_eq!(first.matches_dispatched, 1);
        assert_eq!(second.matches_dispatched, 0);
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_listing_in_one_page_notifies_once() {
        let a = alert("jumpers", "https://market.example/jumpers");
        let item = listing("https://market.example/items/1", "Wool jumper", Some(4.0));
        let pages = HashMap::from([(a.search_url.clone(), vec![item.clone(), item])]);
        let sink = Arc::new(RecordingSink::default());
        let (mut scanner, _store) = scanner_with(vec![a], pages, Arc::clone(&sink));

        let summary = scanner.run_cycle().await;
        assert_eq!(summary.matches_dispatched, 1);
    }

    #[tokio::test]
    async fn fetch_failure_is_isolated_to_its_alert() {
        let broken = alert("broken", "https://market.example/broken");
        let healthy = alert("healthy", "https://market.example/healthy");
        // Only the healthy alert's URL is scripted; the other 500s.
        let pages = HashMap::from([(
            healthy.search_url.clone(),
            vec![listing("https://market.example/items/2", "Denim jacket", Some(6.0))],
        )]);
        let sink = Arc::new(RecordingSink::default());
        let (mut scanner, _store) = scanner_with(vec![broken, healthy], pages, Arc::clone(&sink));

        let summary = scanner.run_cycle().await;

        assert_eq!(summary.alerts_scanned, 2);
        assert_eq!(summary.alerts_failed, 1);
        assert_eq!(summary.matches_dispatched, 1);
    }

    #[tokio::test]
    async fn disabled_alerts_are_skipped_entirely() {
        let mut a = alert("paused", "https://market.example/paused");
        a.enabled = false;
        let pages = HashMap::from([(
            a.search_url.clone(),
            vec![listing("https://market.example/items/3", "Anything", None)],
        )]);
        let sink = Arc::new(RecordingSink::default());
        let (mut scanner, _store) = scanner_with(vec![a], pages, Arc::clone(&sink));

        let summary = scanner.run_cycle().await;

        assert_eq!(summary.alerts_scanned, 0);
        assert!(sink.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_match_is_not_marked_and_matches_after_an_edit() {
        let mut a = alert("flips", "https://market.example/flips");
        a.max_price = Some(5.0);
        let search_url = a.search_url.clone();
        let pages = HashMap::from([(
            search_url,
            vec![listing("https://market.example/items/4", "Wool jumper", Some(8.0))],
        )]);
        let sink = Arc::new(RecordingSink::default());
        let (mut scanner, store) = scanner_with(vec![a], pages, Arc::clone(&sink));

        let first = scanner.run_cycle().await;
        assert_eq!(first.matches_dispatched, 0);

        // Operator raises the price cap between cycles.
        store
            .update(&AlertSelector::Name("flips".to_string()), |entry| {
                entry.max_price = Some(10.0);
            })
            .unwrap();

        let second = scanner.run_cycle().await;
        assert_eq!(second.matches_dispatched, 1);
    }

    #[tokio::test]
    async fn failed_dispatch_still_counts_as_seen() {
        let a = alert("jumpers", "https://market.example/jumpers");
        let pages = HashMap::from([(
            a.search_url.clone(),
            vec![listing("https://market.example/items/5", "Wool jumper", Some(4.0))],
        )]);
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let (mut scanner, _store) = scanner_with(vec![a], pages, Arc::clone(&sink));

        scanner.run_cycle().await;
        scanner.run_cycle().await;

        // One delivery attempt total: the listing stayed marked seen even
        // though the webhook call failed.
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn startup_announcement_covers_enabled_alerts_only() {
        let enabled = alert("live", "https://market.example/live");
        let mut disabled = alert("paused", "https://market.example/paused");
        disabled.enabled = false;

        let sink = Arc::new(RecordingSink::default());
        let (scanner, _store) =
            scanner_with(vec![enabled, disabled], HashMap::new(), Arc::clone(&sink));

        scanner.announce_started().await;

        let delivered = sink.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1.title, "Alert 'live' started");
    }

    #[tokio::test]
    async fn run_stops_when_shutdown_flips() {
        let (mut scanner, _store) = scanner_with(
            vec![],
            HashMap::new(),
            Arc::new(RecordingSink::default()),
        );
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { scanner.run(rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scan loop should exit promptly")
            .unwrap();
    }

    #[test]
    fn store_replace_then_snapshot_round_trips() {
        let store = AlertStore::new(vec![alert("one", "https://market.example/one")]).unwrap();
        let next = vec![
            alert("two", "https://market.example/two"),
            alert("three", "https://market.example/three"),
        ];
        store.replace(next.clone()).unwrap();
        assert_eq!(*store.snapshot(), next);
    }

    #[test]
    fn store_rejects_duplicate_names_and_keeps_prior_state() {
        let prior = vec![alert("one", "https://market.example/one")];
        let store = AlertStore::new(prior.clone()).unwrap();

        let result = store.replace(vec![
            alert("same", "https://market.example/a"),
            alert("same", "https://market.example/b"),
        ]);

        assert!(matches!(result, Err(ValidationError::DuplicateName { .. })));
        assert_eq!(*store.snapshot(), prior);
    }

    #[test]
    fn store_update_rejects_a_mutation_that_breaks_validation() {
        let store = AlertStore::new(vec![
            alert("one", "https://market.example/one"),
            alert("two", "https://market.example/two"),
        ])
        .unwrap();

        let result = store.update(&AlertSelector::Index(1), |entry| {
            entry.name = "one".to_string();
        });

        assert!(matches!(
            result,
            Err(UpdateError::Invalid(ValidationError::DuplicateName { .. }))
        ));
        assert_eq!(store.snapshot()[1].name, "two");
    }

    #[test]
    fn store_update_addresses_by_index_or_name() {
        let store = AlertStore::new(vec![
            alert("one", "https://market.example/one"),
            alert("two", "https://market.example/two"),
        ])
        .unwrap();

        store
            .update(&AlertSelector::Index(0), |entry| entry.enabled = false)
            .unwrap();
        store
            .update(&AlertSelector::Name("two".to_string()), |entry| {
                entry.max_price = Some(9.0)
            })
            .unwrap();

        let snapshot = store.snapshot();
        assert!(!snapshot[0].enabled);
        assert_eq!(snapshot[1].max_price, Some(9.0));

        assert!(matches!(
            store.update(&AlertSelector::Index(9), |_| {}),
            Err(UpdateError::NotFound(_))
        ));
    }

    #[test]
    fn dedup_mark_is_idempotent() {
        let mut dedup = DedupIndex::new();
        dedup.ensure_alert("jumpers");

        assert!(!dedup.has_seen("jumpers", "https://market.example/items/1"));
        dedup.mark_seen("jumpers", "https://market.example/items/1");
        dedup.mark_seen("jumpers", "https://market.example/items/1");

        assert!(dedup.has_seen("jumpers", "https://market.example/items/1"));
        assert_eq!(dedup.seen_count("jumpers"), 1);
    }

    #[test]
    fn dedup_sets_are_scoped_per_alert() {
        let mut dedup = DedupIndex::new();
        dedup.mark_seen("jumpers", "https://market.example/items/1");
        assert!(!dedup.has_seen("trainers", "https://market.example/items/1"));
    }

    #[test]
    fn alerts_file_loads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "alerts:\n  - name: jumpers\n    search_url: https://market.example/jumpers\n    webhook_url: https://hooks.example/T1\n    max_price: 10.0\n    must_exclude: [replica, fake]\n"
        )
        .unwrap();

        let alerts = load_alerts_file(file.path()).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].name, "jumpers");
        assert_eq!(alerts[0].max_price, Some(10.0));
        assert!(alerts[0].enabled);
    }

    #[test]
    fn alerts_file_with_duplicate_names_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "alerts:\n  - name: same\n    search_url: https://a.example\n    webhook_url: https://h.example\n  - name: same\n    search_url: https://b.example\n    webhook_url: https://h.example\n"
        )
        .unwrap();

        let err = load_alerts_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("validating"));
    }
}
