// Completeness audit and requeue monitor. The audit is a pure weighted
// checklist over a persisted vehicle record; the monitor walks a batch of
// stale records, flags incomplete ones, and conditionally re-enqueues them
// for extraction with cooldown and monotonic priority.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use lotledger_store::VehicleRecord;

use crate::traits::{LotStore, Notifier};

/// Image galleries below this count score as thin coverage.
const IMAGE_TARGET: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct AuditReport {
    pub missing_fields: Vec<String>,
    pub score: f32,
    pub flagged: bool,
}

/// Weighted completeness checklist. Identity gaps weigh heaviest; media and
/// inconsistency checks catch records that parsed but extracted badly.
pub fn audit(vehicle: &VehicleRecord) -> AuditReport {
    let mut missing = Vec::new();
    let mut score = 0.0f32;

    let mut check = |absent: bool, field: &str, weight: f32| {
        if absent {
            missing.push(field.to_string());
            score += weight;
        }
    };

    // Identity
    check(vehicle.year.is_none(), "year", 2.0);
    check(is_blank(&vehicle.make), "make", 2.0);
    check(is_blank(&vehicle.model), "model", 2.0);

    // Specification
    check(is_blank(&vehicle.vin), "vin", 2.0);
    check(vehicle.mileage.is_none(), "mileage", 1.0);
    check(is_blank(&vehicle.exterior_color), "exterior_color", 1.0);
    check(is_blank(&vehicle.transmission), "transmission", 1.0);
    check(is_blank(&vehicle.drivetrain), "drivetrain", 1.0);
    check(is_blank(&vehicle.engine), "engine", 1.0);
    check(is_blank(&vehicle.body_style), "body_style", 1.0);

    // Media and social proof
    let image_count = vehicle.image_urls.0.len();
    check(image_count == 0, "images", 3.0);
    check(image_count > 0 && image_count < IMAGE_TARGET, "images_thin", 1.0);
    check(vehicle.comment_count.unwrap_or(0) == 0, "comments", 1.0);

    // Auction state
    check(vehicle.auction_end.is_none(), "auction_end", 1.0);

    // Derived inconsistencies
    let no_reserve_claim = vehicle
        .description
        .as_deref()
        .is_some_and(|d| d.to_lowercase().contains("no reserve"));
    check(
        no_reserve_claim && vehicle.sale_status == "reserve_not_met",
        "inconsistent_no_reserve_outcome",
        2.0,
    );
    check(
        vehicle.outcome().is_terminal()
            && vehicle.bid_count.unwrap_or(0) > 0
            && vehicle.high_bid.is_none(),
        "inconsistent_bids_without_high_bid",
        1.0,
    );

    let flagged = !missing.is_empty();
    AuditReport { missing_fields: missing, score, flagged }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

#[derive(Debug, Clone)]
pub struct AuditOptions {
    pub batch_size: i64,
    pub dry_run: bool,
    pub min_age_hours: i64,
    pub requeue_priority: i32,
    pub cooldown_hours: i64,
    pub vehicle_id: Option<Uuid>,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            dry_run: false,
            min_age_hours: 24,
            requeue_priority: 1,
            cooldown_hours: 48,
            vehicle_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditCounters {
    pub scanned: u32,
    pub flagged: u32,
    pub cleared: u32,
    pub requeued: u32,
    pub skipped: u32,
    pub failed: u32,
}

pub struct RequeueMonitor {
    store: Arc<dyn LotStore>,
    notifier: Option<Arc<dyn Notifier>>,
    requeue_enabled: bool,
}

impl RequeueMonitor {
    pub fn new(store: Arc<dyn LotStore>, requeue_enabled: bool) -> Self {
        Self { store, notifier: None, requeue_enabled }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Audit a batch of stale records. Per-record store failures increment
    /// `failed` and move on; only the batch query itself is fatal.
    pub async fn run(&self, opts: &AuditOptions) -> Result<AuditCounters> {
        let batch = self
            .store
            .vehicles_for_audit(opts.batch_size, opts.min_age_hours, opts.vehicle_id)
            .await
            .context("loading audit batch")?;

        let mut counters = AuditCounters::default();
        for vehicle in &batch {
            counters.scanned += 1;
            let report = audit(vehicle);

            if !report.flagged {
                if let Err(e) = self.store.clear_flag(vehicle.id).await {
                    warn!(vehicle_id = %vehicle.id, error = %e, "Clearing audit flag failed");
                    counters.failed += 1;
                } else {
                    counters.cleared += 1;
                }
                continue;
            }

            counters.flagged += 1;
            if let Err(e) = self
                .store
                .flag_vehicle(
                    vehicle.id,
                    vehicle.source_url.as_deref(),
                    &report.missing_fields,
                    report.score,
                )
                .await
            {
                warn!(vehicle_id = %vehicle.id, error = %e, "Recording audit flag failed");
                counters.failed += 1;
                continue;
            }

            if let Some(notifier) = &self.notifier {
                let context = report.missing_fields.join(",");
                if let Err(e) = notifier.notify_missing(vehicle.id, &[], &context).await {
                    warn!(vehicle_id = %vehicle.id, error = %e, "Missing-fields notification failed");
                }
            }

            if !self.requeue_enabled || opts.dry_run {
                counters.skipped += 1;
                continue;
            }

            match self
                .store
                .try_requeue(vehicle.id, opts.requeue_priority, opts.cooldown_hours)
                .await
            {
                Ok(true) => {
                    info!(
                        vehicle_id = %vehicle.id,
                        score = report.score,
                        missing = report.missing_fields.len(),
                        "Vehicle re-enqueued for extraction"
                    );
                    counters.requeued += 1;
                }
                // Cooldown window or an in-flight extraction.
                Ok(false) => counters.skipped += 1,
                Err(e) => {
                    warn!(vehicle_id = %vehicle.id, error = %e, "Requeue failed");
                    counters.failed += 1;
                }
            }
        }

        info!(
            scanned = counters.scanned,
            flagged = counters.flagged,
            cleared = counters.cleared,
            requeued = counters.requeued,
            skipped = counters.skipped,
            failed = counters.failed,
            "Audit run complete"
        );
        Ok(counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{blank_vehicle, MockLotStore, MockNotifier};
    use chrono::Duration;
    use sqlx::types::Json;

    fn complete(v: &mut VehicleRecord) {
        v.year = Some(1972);
        v.make = Some("BMW".to_string());
        v.model = Some("2002tii".to_string());
        v.vin = Some("1HGCM82633A004352".to_string());
        v.mileage = Some(41_000);
        v.exterior_color = Some("Polaris Silver".to_string());
        v.transmission = Some("4-Speed Manual".to_string());
        v.drivetrain = Some("RWD".to_string());
        v.engine = Some("2.0L Inline-Four".to_string());
        v.body_style = Some("Coupe".to_string());
        v.image_urls = Json((0..12).map(|i| format!("https://cdn.example.com/{i}.jpg")).collect());
        v.comment_count = Some(58);
        v.auction_end = chrono::Utc::now().into();
    }

    #[test]
    fn complete_record_is_not_flagged() {
        let mut v = blank_vehicle();
        complete(&mut v);
        let report = audit(&v);
        assert!(!report.flagged, "missing: {:?}", report.missing_fields);
        assert_eq!(report.score, 0.0);
    }

    #[test]
    fn missing_identity_weighs_heavier_than_missing_spec_field() {
        let mut no_make = blank_vehicle();
        complete(&mut no_make);
        no_make.make = None;

        let mut no_color = blank_vehicle();
        complete(&mut no_color);
        no_color.exterior_color = None;

        assert!(audit(&no_make).score > audit(&no_color).score);
    }

    #[test]
    fn zero_images_scores_worse_than_thin_gallery() {
        let mut none = blank_vehicle();
        complete(&mut none);
        none.image_urls = Json(Vec::new());

        let mut thin = blank_vehicle();
        complete(&mut thin);
        thin.image_urls = Json(vec!["https://cdn.example.com/a.jpg".to_string()]);

        let none_report = audit(&none);
        let thin_report = audit(&thin);
        assert!(none_report.missing_fields.contains(&"images".to_string()));
        assert!(thin_report.missing_fields.contains(&"images_thin".to_string()));
        assert!(none_report.score > thin_report.score);
    }

    #[test]
    fn no_reserve_description_with_reserve_not_met_is_inconsistent() {
        let mut v = blank_vehicle();
        complete(&mut v);
        v.description = Some("Offered at NO RESERVE, this 2002tii ...".to_string());
        v.sale_status = "reserve_not_met".to_string();

        let report = audit(&v);
        assert!(report
            .missing_fields
            .contains(&"inconsistent_no_reserve_outcome".to_string()));
    }

    #[test]
    fn sold_with_bids_but_no_high_bid_is_inconsistent() {
        let mut v = blank_vehicle();
        complete(&mut v);
        v.sale_status = "sold".to_string();
        v.bid_count = Some(14);
        v.high_bid = None;

        let report = audit(&v);
        assert!(report
            .missing_fields
            .contains(&"inconsistent_bids_without_high_bid".to_string()));
    }

    #[tokio::test]
    async fn run_flags_and_requeues_stale_incomplete_vehicle() {
        let store = Arc::new(MockLotStore::new());
        let id = store.seed_vehicle(|v| {
            v.source_url = Some("https://bringatrailer.com/listing/a/".to_string());
        });
        store.advance_clock(Duration::hours(48));

        let monitor = RequeueMonitor::new(store.clone(), true);
        let counters = monitor.run(&AuditOptions::default()).await.unwrap();
        assert_eq!(counters.scanned, 1);
        assert_eq!(counters.flagged, 1);
        assert_eq!(counters.requeued, 1);

        let entry = store.queue_entry(id).await.unwrap().expect("queue entry");
        assert!(entry.flagged);
        assert!(!entry.missing_fields.0.is_empty());
        assert_eq!(entry.status, "pending");
        assert!(entry.last_enqueued_at.is_some());
    }

    #[tokio::test]
    async fn reflag_within_cooldown_updates_score_but_not_enqueue_time() {
        let store = Arc::new(MockLotStore::new());
        let id = store.seed_vehicle(|v| {
            v.source_url = Some("https://bringatrailer.com/listing/a/".to_string());
        });
        store.advance_clock(Duration::hours(48));

        let monitor = RequeueMonitor::new(store.clone(), true);
        let opts = AuditOptions { min_age_hours: 24, cooldown_hours: 48, ..Default::default() };

        monitor.run(&opts).await.unwrap();
        let first = store.queue_entry(id).await.unwrap().unwrap();

        // Second run inside the cooldown window: flag data refreshes, the
        // enqueue timestamp does not advance.
        store.advance_clock(Duration::hours(30));
        let counters = monitor.run(&opts).await.unwrap();
        assert_eq!(counters.flagged, 1);
        assert_eq!(counters.requeued, 0);
        assert_eq!(counters.skipped, 1);

        let second = store.queue_entry(id).await.unwrap().unwrap();
        assert_eq!(second.last_enqueued_at, first.last_enqueued_at);

        // Outside the cooldown the same record requeues again.
        store.advance_clock(Duration::hours(30));
        let counters = monitor.run(&opts).await.unwrap();
        assert_eq!(counters.requeued, 1);
    }

    #[tokio::test]
    async fn processing_records_are_never_raced() {
        let store = Arc::new(MockLotStore::new());
        let id = store.seed_vehicle(|v| {
            v.source_url = Some("https://bringatrailer.com/listing/a/".to_string());
        });
        store.seed_queue_entry(|q| {
            q.vehicle_id = id;
            q.status = "processing".to_string();
        });
        store.advance_clock(Duration::hours(48));

        let monitor = RequeueMonitor::new(store.clone(), true);
        let counters = monitor.run(&AuditOptions::default()).await.unwrap();
        assert_eq!(counters.flagged, 1);
        assert_eq!(counters.requeued, 0);
        assert_eq!(counters.skipped, 1);
    }

    #[tokio::test]
    async fn dry_run_flags_without_requeueing() {
        let store = Arc::new(MockLotStore::new());
        let id = store.seed_vehicle(|v| {
            v.source_url = Some("https://bringatrailer.com/listing/a/".to_string());
        });
        store.advance_clock(Duration::hours(48));

        let monitor = RequeueMonitor::new(store.clone(), true);
        let opts = AuditOptions { dry_run: true, ..Default::default() };
        let counters = monitor.run(&opts).await.unwrap();
        assert_eq!(counters.flagged, 1);
        assert_eq!(counters.requeued, 0);

        let entry = store.queue_entry(id).await.unwrap().unwrap();
        assert!(entry.last_enqueued_at.is_none());
    }

    #[tokio::test]
    async fn complete_record_gets_its_flag_cleared() {
        let store = Arc::new(MockLotStore::new());
        let id = store.seed_vehicle(complete);
        store.seed_queue_entry(|q| {
            q.vehicle_id = id;
            q.flagged = true;
        });
        store.advance_clock(Duration::hours(48));

        let monitor = RequeueMonitor::new(store.clone(), true);
        let counters = monitor.run(&AuditOptions::default()).await.unwrap();
        assert_eq!(counters.cleared, 1);

        let entry = store.queue_entry(id).await.unwrap().unwrap();
        assert!(!entry.flagged);
        assert_eq!(entry.status, "done");
    }

    #[tokio::test]
    async fn priority_only_ever_increases() {
        let store = Arc::new(MockLotStore::new());
        let id = store.seed_vehicle(|v| {
            v.source_url = Some("https://bringatrailer.com/listing/a/".to_string());
        });
        store.seed_queue_entry(|q| {
            q.vehicle_id = id;
            q.priority = 5;
        });
        store.advance_clock(Duration::hours(48));

        let monitor = RequeueMonitor::new(store.clone(), true);
        let opts = AuditOptions { requeue_priority: 1, ..Default::default() };
        monitor.run(&opts).await.unwrap();

        let entry = store.queue_entry(id).await.unwrap().unwrap();
        assert_eq!(entry.priority, 5);
    }

    #[tokio::test]
    async fn notifier_receives_missing_field_context() {
        let store = Arc::new(MockLotStore::new());
        let id = store.seed_vehicle(|v| {
            v.source_url = Some("https://bringatrailer.com/listing/a/".to_string());
        });
        store.advance_clock(Duration::hours(48));

        let notifier = Arc::new(MockNotifier::new());
        let monitor = RequeueMonitor::new(store, true).with_notifier(notifier.clone());
        monitor.run(&AuditOptions::default()).await.unwrap();

        let calls = notifier.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, id);
        assert!(calls[0].2.contains("vin"));
    }
}
