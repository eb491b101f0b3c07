// In-memory doubles for the pipeline's trait seams. MockLotStore mirrors the
// Postgres writer's conflict handling (ratchets, sticky outcomes, cooldown
// windows) so merge and requeue behavior can be tested without a database.
// The clock is injectable so cooldown and staleness windows are deterministic.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use lotledger_common::{Extracted, ExtractedFields, ExtractionMethod, ListingDocument};
use lotledger_store::{
    AuctionEvent, ExternalIdentity, OutboundTask, ProvenanceEntry, QueueEntry, VehicleMutation,
    VehicleRecord,
};

use crate::traits::{
    BackfillOutcome, CommentIngestor, ImageBackfiller, LotStore, Notifier, PageFetcher,
};

const TERMINAL: [&str; 3] = ["sold", "ended", "reserve_not_met"];

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn blank_vehicle() -> VehicleRecord {
    let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    VehicleRecord {
        id: Uuid::new_v4(),
        year: None,
        make: None,
        model: None,
        trim: None,
        vin: None,
        mileage: None,
        exterior_color: None,
        transmission: None,
        drivetrain: None,
        engine: None,
        body_style: None,
        description: None,
        location: None,
        lot_number: None,
        source_url: None,
        discovery_url: None,
        legacy_listing_url: None,
        sale_status: "active".to_string(),
        high_bid: None,
        bid_count: None,
        watcher_count: None,
        view_count: None,
        comment_count: None,
        image_urls: Json(Vec::new()),
        provenance: Json(serde_json::json!({})),
        auction_start: None,
        auction_end: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn extracted_with_vin(vin: &str) -> ExtractedFields {
    let mut fields = ExtractedFields::default();
    fields.vin = Extracted::present(vin.to_string(), ExtractionMethod::DomTemplate, 0.95);
    fields
}

pub fn extracted_with_ymm(year: i32, make: &str, model: &str) -> ExtractedFields {
    let mut fields = ExtractedFields::default();
    fields.year = Extracted::present(year, ExtractionMethod::TitleParse, 0.9);
    fields.make = Extracted::present(make.to_string(), ExtractionMethod::TitleParse, 0.9);
    fields.model = Extracted::present(model.to_string(), ExtractionMethod::TitleParse, 0.9);
    fields
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockFetcher {
    pages: Mutex<HashMap<String, ListingDocument>>,
    calls: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stub(&self, url: &str, doc: ListingDocument) {
        self.pages.lock().unwrap().insert(url.to_string(), doc);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<Option<ListingDocument>> {
        self.calls.lock().unwrap().push(url.to_string());
        Ok(self.pages.lock().unwrap().get(url).cloned())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ---------------------------------------------------------------------------
// MockLotStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    vehicles: Vec<VehicleRecord>,
    identities: Vec<ExternalIdentity>,
    events: Vec<AuctionEvent>,
    queue: HashMap<Uuid, QueueEntry>,
    tasks: Vec<OutboundTask>,
    provenance: Vec<(Uuid, ProvenanceEntry)>,
    next_task_id: i64,
}

pub struct MockLotStore {
    state: Mutex<StoreState>,
    clock: Mutex<DateTime<Utc>>,
}

impl Default for MockLotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLotStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState {
                next_task_id: 1,
                ..Default::default()
            }),
            clock: Mutex::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.clock.lock().unwrap()
    }

    pub fn advance_clock(&self, by: Duration) {
        *self.clock.lock().unwrap() += by;
    }

    pub fn seed_vehicle(&self, build: impl FnOnce(&mut VehicleRecord)) -> Uuid {
        let mut vehicle = blank_vehicle();
        vehicle.created_at = self.now();
        vehicle.updated_at = self.now();
        build(&mut vehicle);
        let id = vehicle.id;
        self.state.lock().unwrap().vehicles.push(vehicle);
        id
    }

    pub fn identity_row(&self, platform: &str, handle: &str) -> Option<ExternalIdentity> {
        self.state
            .lock()
            .unwrap()
            .identities
            .iter()
            .find(|i| i.platform == platform && i.handle.eq_ignore_ascii_case(handle))
            .cloned()
    }

    pub fn vehicle(&self, id: Uuid) -> Option<VehicleRecord> {
        self.state
            .lock()
            .unwrap()
            .vehicles
            .iter()
            .find(|v| v.id == id)
            .cloned()
    }

    pub fn vehicle_count(&self) -> usize {
        self.state.lock().unwrap().vehicles.len()
    }

    pub fn events_for(&self, vehicle_id: Uuid) -> Vec<AuctionEvent> {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.vehicle_id == vehicle_id)
            .cloned()
            .collect()
    }

    pub fn tasks(&self) -> Vec<OutboundTask> {
        self.state.lock().unwrap().tasks.clone()
    }

    pub fn provenance_fields(&self, vehicle_id: Uuid) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .provenance
            .iter()
            .filter(|(id, _)| *id == vehicle_id)
            .map(|(_, e)| e.field.clone())
            .collect()
    }

    pub fn seed_queue_entry(&self, build: impl FnOnce(&mut QueueEntry)) -> Uuid {
        let now = self.now();
        let mut entry = QueueEntry {
            vehicle_id: Uuid::new_v4(),
            listing_url: None,
            status: "pending".to_string(),
            priority: 0,
            missing_fields: Json(Vec::new()),
            health_score: 0.0,
            flagged: true,
            last_enqueued_at: None,
            updated_at: now,
        };
        build(&mut entry);
        let id = entry.vehicle_id;
        self.state.lock().unwrap().queue.insert(id, entry);
        id
    }
}

#[async_trait]
impl LotStore for MockLotStore {
    async fn vehicle_by_source_url(&self, url: &str) -> Result<Option<VehicleRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .vehicles
            .iter()
            .find(|v| v.source_url.as_deref() == Some(url))
            .cloned())
    }

    async fn vehicle_by_alias_url(&self, url: &str) -> Result<Option<VehicleRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .vehicles
            .iter()
            .find(|v| {
                v.discovery_url.as_deref() == Some(url)
                    || v.legacy_listing_url.as_deref() == Some(url)
            })
            .cloned())
    }

    async fn vehicle_by_vin(&self, vin: &str) -> Result<Option<VehicleRecord>> {
        let state = self.state.lock().unwrap();
        let mut hits: Vec<&VehicleRecord> =
            state.vehicles.iter().filter(|v| v.vin.as_deref() == Some(vin)).collect();
        hits.sort_by_key(|v| v.created_at);
        Ok(hits.first().map(|v| (*v).clone()))
    }

    async fn vehicle_by_id(&self, id: Uuid) -> Result<Option<VehicleRecord>> {
        Ok(self.vehicle(id))
    }

    async fn vehicle_fuzzy(
        &self,
        year: i32,
        make: &str,
        model_first_token: &str,
    ) -> Result<Option<VehicleRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .vehicles
            .iter()
            .find(|v| {
                v.year == Some(year)
                    && v.make
                        .as_deref()
                        .is_some_and(|m| m.to_lowercase().contains(&make.to_lowercase()))
                    && v.model
                        .as_deref()
                        .and_then(|m| m.split_whitespace().next())
                        .is_some_and(|t| t.eq_ignore_ascii_case(model_first_token))
            })
            .cloned())
    }

    async fn create_vehicle(&self, source_url: &str) -> Result<VehicleRecord> {
        let now = self.now();
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state
            .vehicles
            .iter_mut()
            .find(|v| v.source_url.as_deref() == Some(source_url))
        {
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let mut vehicle = blank_vehicle();
        vehicle.source_url = Some(source_url.to_string());
        vehicle.created_at = now;
        vehicle.updated_at = now;
        state.vehicles.push(vehicle.clone());
        Ok(vehicle)
    }

    async fn apply_mutation(&self, id: Uuid, mutation: &VehicleMutation) -> Result<VehicleRecord> {
        let now = self.now();
        let mut state = self.state.lock().unwrap();
        let vehicle = state
            .vehicles
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or_else(|| anyhow!("no vehicle {id}"))?;

        fn keep<T: Clone>(new: &Option<T>, slot: &mut Option<T>) {
            if let Some(v) = new {
                *slot = Some(v.clone());
            }
        }
        fn ratchet(new: Option<i64>, slot: &mut Option<i64>) {
            if let Some(v) = new {
                *slot = Some(slot.unwrap_or(0).max(v));
            }
        }

        keep(&mutation.year, &mut vehicle.year);
        keep(&mutation.make, &mut vehicle.make);
        keep(&mutation.model, &mut vehicle.model);
        keep(&mutation.trim, &mut vehicle.trim);
        keep(&mutation.vin, &mut vehicle.vin);
        keep(&mutation.mileage, &mut vehicle.mileage);
        keep(&mutation.exterior_color, &mut vehicle.exterior_color);
        keep(&mutation.transmission, &mut vehicle.transmission);
        keep(&mutation.drivetrain, &mut vehicle.drivetrain);
        keep(&mutation.engine, &mut vehicle.engine);
        keep(&mutation.body_style, &mut vehicle.body_style);
        keep(&mutation.description, &mut vehicle.description);
        keep(&mutation.location, &mut vehicle.location);
        keep(&mutation.lot_number, &mut vehicle.lot_number);

        if let Some(status) = &mutation.sale_status {
            if !TERMINAL.contains(&vehicle.sale_status.as_str()) {
                vehicle.sale_status = status.clone();
            }
        }

        ratchet(mutation.high_bid, &mut vehicle.high_bid);
        ratchet(mutation.bid_count, &mut vehicle.bid_count);
        ratchet(mutation.watcher_count, &mut vehicle.watcher_count);
        ratchet(mutation.view_count, &mut vehicle.view_count);
        ratchet(mutation.comment_count, &mut vehicle.comment_count);

        if let Some(urls) = &mutation.image_urls {
            vehicle.image_urls = Json(urls.clone());
        }
        keep(&mutation.auction_start, &mut vehicle.auction_start);
        keep(&mutation.auction_end, &mut vehicle.auction_end);
        vehicle.updated_at = now;

        Ok(vehicle.clone())
    }

    async fn set_discovery_url(&self, id: Uuid, url: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(vehicle) = state.vehicles.iter_mut().find(|v| v.id == id) {
            if vehicle.discovery_url.is_none() {
                vehicle.discovery_url = Some(url.to_string());
            }
        }
        Ok(())
    }

    async fn append_provenance(&self, vehicle_id: Uuid, entries: &[ProvenanceEntry]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for entry in entries {
            state.provenance.push((vehicle_id, entry.clone()));
        }
        Ok(())
    }

    async fn upsert_identity(
        &self,
        platform: &str,
        handle: &str,
        profile_url: Option<&str>,
    ) -> Result<ExternalIdentity> {
        let now = self.now();
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state
            .identities
            .iter_mut()
            .find(|i| i.platform == platform && i.handle.eq_ignore_ascii_case(handle))
        {
            existing.last_seen = now;
            if existing.profile_url.is_none() {
                existing.profile_url = profile_url.map(String::from);
            }
            return Ok(existing.clone());
        }
        let identity = ExternalIdentity {
            id: Uuid::new_v4(),
            platform: platform.to_string(),
            handle: handle.to_string(),
            profile_url: profile_url.map(String::from),
            first_seen: now,
            last_seen: now,
        };
        state.identities.push(identity.clone());
        Ok(identity)
    }

    async fn touch_identity(&self, platform: &str, handle: &str) -> Result<()> {
        self.upsert_identity(platform, handle, None).await?;
        Ok(())
    }

    async fn upsert_auction_event(
        &self,
        vehicle_id: Uuid,
        source_url: &str,
        outcome: &str,
        high_bid: Option<i64>,
        bid_count: Option<i64>,
        auction_start: Option<DateTime<Utc>>,
        auction_end: Option<DateTime<Utc>>,
        metadata: serde_json::Value,
    ) -> Result<AuctionEvent> {
        let now = self.now();
        let mut state = self.state.lock().unwrap();
        if let Some(event) = state
            .events
            .iter_mut()
            .find(|e| e.vehicle_id == vehicle_id && e.source_url == source_url)
        {
            if !TERMINAL.contains(&event.outcome.as_str()) {
                event.outcome = outcome.to_string();
            }
            if let Some(v) = high_bid {
                event.high_bid = Some(event.high_bid.unwrap_or(0).max(v));
            }
            if let Some(v) = bid_count {
                event.bid_count = Some(event.bid_count.unwrap_or(0).max(v));
            }
            event.auction_start = auction_start.or(event.auction_start);
            event.auction_end = auction_end.or(event.auction_end);
            if let (serde_json::Value::Object(existing), serde_json::Value::Object(new)) =
                (&mut event.metadata.0, metadata)
            {
                existing.extend(new);
            }
            event.updated_at = now;
            return Ok(event.clone());
        }
        let event = AuctionEvent {
            id: Uuid::new_v4(),
            vehicle_id,
            source_url: source_url.to_string(),
            outcome: outcome.to_string(),
            high_bid,
            bid_count,
            auction_start,
            auction_end,
            metadata: Json(metadata),
            created_at: now,
            updated_at: now,
        };
        state.events.push(event.clone());
        Ok(event)
    }

    async fn flag_vehicle(
        &self,
        vehicle_id: Uuid,
        listing_url: Option<&str>,
        missing_fields: &[String],
        health_score: f32,
    ) -> Result<()> {
        let now = self.now();
        let mut state = self.state.lock().unwrap();
        let entry = state.queue.entry(vehicle_id).or_insert_with(|| QueueEntry {
            vehicle_id,
            listing_url: None,
            status: "pending".to_string(),
            priority: 0,
            missing_fields: Json(Vec::new()),
            health_score: 0.0,
            flagged: true,
            last_enqueued_at: None,
            updated_at: now,
        });
        if entry.listing_url.is_none() {
            entry.listing_url = listing_url.map(String::from);
        }
        entry.missing_fields = Json(missing_fields.to_vec());
        entry.health_score = health_score;
        entry.flagged = true;
        entry.updated_at = now;
        Ok(())
    }

    async fn clear_flag(&self, vehicle_id: Uuid) -> Result<()> {
        let now = self.now();
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.queue.get_mut(&vehicle_id) {
            entry.flagged = false;
            entry.missing_fields = Json(Vec::new());
            entry.health_score = 0.0;
            entry.status = "done".to_string();
            entry.updated_at = now;
        }
        Ok(())
    }

    async fn try_requeue(
        &self,
        vehicle_id: Uuid,
        priority: i32,
        cooldown_hours: i64,
    ) -> Result<bool> {
        let now = self.now();
        let mut state = self.state.lock().unwrap();
        let Some(entry) = state.queue.get_mut(&vehicle_id) else {
            return Ok(false);
        };
        if entry.status == "processing" {
            return Ok(false);
        }
        if let Some(last) = entry.last_enqueued_at {
            if last >= now - Duration::hours(cooldown_hours) {
                return Ok(false);
            }
        }
        entry.status = "pending".to_string();
        entry.priority = entry.priority.max(priority);
        entry.last_enqueued_at = Some(now);
        entry.updated_at = now;
        Ok(true)
    }

    async fn queue_entry(&self, vehicle_id: Uuid) -> Result<Option<QueueEntry>> {
        Ok(self.state.lock().unwrap().queue.get(&vehicle_id).cloned())
    }

    async fn vehicles_for_audit(
        &self,
        batch_size: i64,
        min_age_hours: i64,
        vehicle_filter: Option<Uuid>,
    ) -> Result<Vec<VehicleRecord>> {
        let cutoff = self.now() - Duration::hours(min_age_hours);
        let state = self.state.lock().unwrap();
        let mut due: Vec<VehicleRecord> = state
            .vehicles
            .iter()
            .filter(|v| vehicle_filter.map_or(true, |f| v.id == f))
            .filter(|v| v.updated_at < cutoff)
            .cloned()
            .collect();
        due.sort_by_key(|v| v.updated_at);
        due.truncate(batch_size as usize);
        Ok(due)
    }

    async fn enqueue_task(&self, kind: &str, payload: serde_json::Value) -> Result<i64> {
        let now = self.now();
        let mut state = self.state.lock().unwrap();
        let id = state.next_task_id;
        state.next_task_id += 1;
        state.tasks.push(OutboundTask {
            id,
            kind: kind.to_string(),
            payload: Json(payload),
            status: "pending".to_string(),
            attempts: 0,
            created_at: now,
            completed_at: None,
        });
        Ok(id)
    }

    async fn claim_tasks(&self, limit: i64) -> Result<Vec<OutboundTask>> {
        let mut state = self.state.lock().unwrap();
        let mut claimed = Vec::new();
        for task in state.tasks.iter_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            if task.status == "pending" {
                task.status = "in_flight".to_string();
                task.attempts += 1;
                claimed.push(task.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_task(&self, id: i64) -> Result<()> {
        let now = self.now();
        let mut state = self.state.lock().unwrap();
        if let Some(task) = state.tasks.iter_mut().find(|t| t.id == id) {
            task.status = "done".to_string();
            task.completed_at = Some(now);
        }
        Ok(())
    }

    async fn release_task(&self, id: i64, max_attempts: i32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(task) = state.tasks.iter_mut().find(|t| t.id == id) {
            task.status = if task.attempts >= max_attempts {
                "failed".to_string()
            } else {
                "pending".to_string()
            };
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Downstream collaborator doubles
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockBackfiller {
    pub fail: std::sync::atomic::AtomicBool,
    calls: Mutex<Vec<(Uuid, Vec<String>)>>,
}

impl MockBackfiller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let b = Self::default();
        b.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        b
    }

    pub fn calls(&self) -> Vec<(Uuid, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageBackfiller for MockBackfiller {
    async fn backfill(&self, vehicle_id: Uuid, image_urls: &[String]) -> Result<BackfillOutcome> {
        self.calls
            .lock()
            .unwrap()
            .push((vehicle_id, image_urls.to_vec()));
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(anyhow!("backfill service unavailable"));
        }
        Ok(BackfillOutcome {
            uploaded: image_urls.len() as u32,
            skipped: 0,
            failed: 0,
        })
    }
}

#[derive(Default)]
pub struct MockCommentIngestor {
    pub fail: std::sync::atomic::AtomicBool,
    calls: Mutex<Vec<(Uuid, Uuid, String)>>,
}

impl MockCommentIngestor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let c = Self::default();
        c.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        c
    }

    pub fn calls(&self) -> Vec<(Uuid, Uuid, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommentIngestor for MockCommentIngestor {
    async fn trigger(
        &self,
        auction_event_id: Uuid,
        vehicle_id: Uuid,
        source_url: &str,
    ) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((auction_event_id, vehicle_id, source_url.to_string()));
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(anyhow!("comment service unavailable"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockNotifier {
    calls: Mutex<Vec<(Uuid, Vec<Uuid>, String)>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(Uuid, Vec<Uuid>, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn notify_missing(
        &self,
        vehicle_id: Uuid,
        recipient_ids: &[Uuid],
        context: &str,
    ) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((vehicle_id, recipient_ids.to_vec(), context.to_string()));
        Ok(())
    }
}
