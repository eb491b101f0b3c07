// Trait abstractions for the ingestion pipeline's dependencies.
//
// PageFetcher hides the render-pool/raw-HTTP tiering. LotStore hides every
// Postgres write behind one trait. The downstream collaborators (image
// backfill, comment ingestion, notifications) are fire-and-forget services
// owned by other subsystems.
//
// These enable deterministic testing with MockFetcher and MockLotStore:
// no network, no database.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use lotledger_common::ListingDocument;
use lotledger_store::{
    AuctionEvent, ExternalIdentity, LotWriter, OutboundTask, ProvenanceEntry, QueueEntry,
    VehicleMutation, VehicleRecord,
};

// ---------------------------------------------------------------------------
// PageFetcher
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch a listing page. `Ok(None)` means every fetch tier failed —
    /// never an error, so the pipeline can proceed with an empty field set.
    async fn fetch(&self, url: &str) -> Result<Option<ListingDocument>>;

    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// LotStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LotStore: Send + Sync {
    // --- Vehicle lookup ---
    async fn vehicle_by_source_url(&self, url: &str) -> Result<Option<VehicleRecord>>;
    async fn vehicle_by_alias_url(&self, url: &str) -> Result<Option<VehicleRecord>>;
    async fn vehicle_by_vin(&self, vin: &str) -> Result<Option<VehicleRecord>>;
    async fn vehicle_by_id(&self, id: Uuid) -> Result<Option<VehicleRecord>>;
    async fn vehicle_fuzzy(
        &self,
        year: i32,
        make: &str,
        model_first_token: &str,
    ) -> Result<Option<VehicleRecord>>;

    // --- Vehicle mutation ---
    async fn create_vehicle(&self, source_url: &str) -> Result<VehicleRecord>;
    async fn apply_mutation(&self, id: Uuid, mutation: &VehicleMutation) -> Result<VehicleRecord>;
    async fn set_discovery_url(&self, id: Uuid, url: &str) -> Result<()>;
    async fn append_provenance(&self, vehicle_id: Uuid, entries: &[ProvenanceEntry]) -> Result<()>;

    // --- Identities ---
    async fn upsert_identity(
        &self,
        platform: &str,
        handle: &str,
        profile_url: Option<&str>,
    ) -> Result<ExternalIdentity>;
    async fn touch_identity(&self, platform: &str, handle: &str) -> Result<()>;

    // --- Auction events ---
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<AuctionEvent>;

    // --- Audit/requeue ---
    async fn flag_vehicle(
        &self,
        vehicle_id: Uuid,
        listing_url: Option<&str>,
        missing_fields: &[String],
        health_score: f32,
    ) -> Result<()>;
    async fn clear_flag(&self, vehicle_id: Uuid) -> Result<()>;
    async fn try_requeue(&self, vehicle_id: Uuid, priority: i32, cooldown_hours: i64)
        -> Result<bool>;
    async fn queue_entry(&self, vehicle_id: Uuid) -> Result<Option<QueueEntry>>;
    async fn vehicles_for_audit(
        &self,
        batch_size: i64,
        min_age_hours: i64,
        vehicle_filter: Option<Uuid>,
    ) -> Result<Vec<VehicleRecord>>;

    // --- Outbound tasks ---
    async fn enqueue_task(&self, kind: &str, payload: serde_json::Value) -> Result<i64>;
    async fn claim_tasks(&self, limit: i64) -> Result<Vec<OutboundTask>>;
    async fn complete_task(&self, id: i64) -> Result<()>;
    async fn release_task(&self, id: i64, max_attempts: i32) -> Result<()>;
}

#[async_trait]
impl LotStore for LotWriter {
    async fn vehicle_by_source_url(&self, url: &str) -> Result<Option<VehicleRecord>> {
        LotWriter::vehicle_by_source_url(self, url).await
    }

    async fn vehicle_by_alias_url(&self, url: &str) -> Result<Option<VehicleRecord>> {
        LotWriter::vehicle_by_alias_url(self, url).await
    }

    async fn vehicle_by_vin(&self, vin: &str) -> Result<Option<VehicleRecord>> {
        LotWriter::vehicle_by_vin(self, vin).await
    }

    async fn vehicle_by_id(&self, id: Uuid) -> Result<Option<VehicleRecord>> {
        LotWriter::vehicle_by_id(self, id).await
    }

    async fn vehicle_fuzzy(
        &self,
        year: i32,
        make: &str,
        model_first_token: &str,
    ) -> Result<Option<VehicleRecord>> {
        LotWriter::vehicle_fuzzy(self, year, make, model_first_token).await
    }

    async fn create_vehicle(&self, source_url: &str) -> Result<VehicleRecord> {
        LotWriter::create_vehicle(self, source_url).await
    }

    async fn apply_mutation(&self, id: Uuid, mutation: &VehicleMutation) -> Result<VehicleRecord> {
        LotWriter::apply_mutation(self, id, mutation).await
    }

    async fn set_discovery_url(&self, id: Uuid, url: &str) -> Result<()> {
        LotWriter::set_discovery_url(self, id, url).await
    }

    async fn append_provenance(&self, vehicle_id: Uuid, entries: &[ProvenanceEntry]) -> Result<()> {
        LotWriter::append_provenance(self, vehicle_id, entries).await
    }

    async fn upsert_identity(
        &self,
        platform: &str,
        handle: &str,
        profile_url: Option<&str>,
    ) -> Result<ExternalIdentity> {
        LotWriter::upsert_identity(self, platform, handle, profile_url).await
    }

    async fn touch_identity(&self, platform: &str, handle: &str) -> Result<()> {
        LotWriter::touch_identity(self, platform, handle).await
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
        LotWriter::upsert_auction_event(
            self,
            vehicle_id,
            source_url,
            outcome,
            high_bid,
            bid_count,
            auction_start,
            auction_end,
            metadata,
        )
        .await
    }

    async fn flag_vehicle(
        &self,
        vehicle_id: Uuid,
        listing_url: Option<&str>,
        missing_fields: &[String],
        health_score: f32,
    ) -> Result<()> {
        LotWriter::flag_vehicle(self, vehicle_id, listing_url, missing_fields, health_score).await
    }

    async fn clear_flag(&self, vehicle_id: Uuid) -> Result<()> {
        LotWriter::clear_flag(self, vehicle_id).await
    }

    async fn try_requeue(
        &self,
        vehicle_id: Uuid,
        priority: i32,
        cooldown_hours: i64,
    ) -> Result<bool> {
        LotWriter::try_requeue(self, vehicle_id, priority, cooldown_hours).await
    }

    async fn queue_entry(&self, vehicle_id: Uuid) -> Result<Option<QueueEntry>> {
        LotWriter::queue_entry(self, vehicle_id).await
    }

    async fn vehicles_for_audit(
        &self,
        batch_size: i64,
        min_age_hours: i64,
        vehicle_filter: Option<Uuid>,
    ) -> Result<Vec<VehicleRecord>> {
        LotWriter::vehicles_for_audit(self, batch_size, min_age_hours, vehicle_filter).await
    }

    async fn enqueue_task(&self, kind: &str, payload: serde_json::Value) -> Result<i64> {
        LotWriter::enqueue_task(self, kind, payload).await
    }

    async fn claim_tasks(&self, limit: i64) -> Result<Vec<OutboundTask>> {
        LotWriter::claim_tasks(self, limit).await
    }

    async fn complete_task(&self, id: i64) -> Result<()> {
        LotWriter::complete_task(self, id).await
    }

    async fn release_task(&self, id: i64, max_attempts: i32) -> Result<()> {
        LotWriter::release_task(self, id, max_attempts).await
    }
}

// ---------------------------------------------------------------------------
// Downstream collaborators (fire-and-forget)
// ---------------------------------------------------------------------------

/// Counters returned by the image-backfill service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BackfillOutcome {
    pub uploaded: u32,
    pub skipped: u32,
    pub failed: u32,
}

#[async_trait]
pub trait ImageBackfiller: Send + Sync {
    async fn backfill(&self, vehicle_id: Uuid, image_urls: &[String]) -> Result<BackfillOutcome>;
}

#[async_trait]
pub trait CommentIngestor: Send + Sync {
    async fn trigger(
        &self,
        auction_event_id: Uuid,
        vehicle_id: Uuid,
        source_url: &str,
    ) -> Result<()>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_missing(
        &self,
        vehicle_id: Uuid,
        recipient_ids: &[Uuid],
        context: &str,
    ) -> Result<()>;
}
