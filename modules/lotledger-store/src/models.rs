use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use lotledger_common::{AuctionOutcome, ExtractionMethod};

/// Canonical vehicle entity. Created on first unmatched ingestion, mutated by
/// every later ingestion that matches it, never deleted by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VehicleRecord {
    pub id: Uuid,
    pub year: Option<i32>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub trim: Option<String>,
    pub vin: Option<String>,
    pub mileage: Option<i64>,
    pub exterior_color: Option<String>,
    pub transmission: Option<String>,
    pub drivetrain: Option<String>,
    pub engine: Option<String>,
    pub body_style: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub lot_number: Option<String>,
    pub source_url: Option<String>,
    pub discovery_url: Option<String>,
    pub legacy_listing_url: Option<String>,
    pub sale_status: String,
    pub high_bid: Option<i64>,
    pub bid_count: Option<i64>,
    pub watcher_count: Option<i64>,
    pub view_count: Option<i64>,
    pub comment_count: Option<i64>,
    pub image_urls: Json<Vec<String>>,
    pub provenance: Json<serde_json::Value>,
    pub auction_start: Option<DateTime<Utc>>,
    pub auction_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VehicleRecord {
    pub fn outcome(&self) -> AuctionOutcome {
        AuctionOutcome::parse(&self.sale_status).unwrap_or(AuctionOutcome::Active)
    }
}

/// Stable (platform, handle) identity. `first_seen` is immutable once set.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExternalIdentity {
    pub id: Uuid,
    pub platform: String,
    pub handle: String,
    pub profile_url: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// One auction event per (vehicle, source URL). Anchor row for downstream
/// comment/bid ingestion.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuctionEvent {
    pub id: Uuid,
    pub vehicle_id: Uuid,
    pub source_url: String,
    pub outcome: String,
    pub high_bid: Option<i64>,
    pub bid_count: Option<i64>,
    pub auction_start: Option<DateTime<Utc>>,
    pub auction_end: Option<DateTime<Utc>>,
    pub metadata: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AuctionEvent {
    pub fn outcome(&self) -> AuctionOutcome {
        AuctionOutcome::parse(&self.outcome).unwrap_or(AuctionOutcome::Active)
    }
}

/// Per-vehicle audit/requeue state.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueueEntry {
    pub vehicle_id: Uuid,
    pub listing_url: Option<String>,
    pub status: String,
    pub priority: i32,
    pub missing_fields: Json<Vec<String>>,
    pub health_score: f32,
    pub flagged: bool,
    pub last_enqueued_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// At-least-once side-effect outbox row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboundTask {
    pub id: i64,
    pub kind: String,
    pub payload: Json<serde_json::Value>,
    pub status: String,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Field-level changes the merge engine decided to write. `None` leaves the
/// column untouched; ratchet columns are additionally guarded in SQL so a
/// concurrent larger value is never regressed.
#[derive(Debug, Clone, Default)]
pub struct VehicleMutation {
    pub year: Option<i32>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub trim: Option<String>,
    pub vin: Option<String>,
    pub mileage: Option<i64>,
    pub exterior_color: Option<String>,
    pub transmission: Option<String>,
    pub drivetrain: Option<String>,
    pub engine: Option<String>,
    pub body_style: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub lot_number: Option<String>,
    pub sale_status: Option<String>,
    pub high_bid: Option<i64>,
    pub bid_count: Option<i64>,
    pub watcher_count: Option<i64>,
    pub view_count: Option<i64>,
    pub comment_count: Option<i64>,
    pub image_urls: Option<Vec<String>>,
    pub auction_start: Option<DateTime<Utc>>,
    pub auction_end: Option<DateTime<Utc>>,
}

impl VehicleMutation {
    pub fn is_empty(&self) -> bool {
        self.year.is_none()
            && self.make.is_none()
            && self.model.is_none()
            && self.trim.is_none()
            && self.vin.is_none()
            && self.mileage.is_none()
            && self.exterior_color.is_none()
            && self.transmission.is_none()
            && self.drivetrain.is_none()
            && self.engine.is_none()
            && self.body_style.is_none()
            && self.description.is_none()
            && self.location.is_none()
            && self.lot_number.is_none()
            && self.sale_status.is_none()
            && self.high_bid.is_none()
            && self.bid_count.is_none()
            && self.watcher_count.is_none()
            && self.view_count.is_none()
            && self.comment_count.is_none()
            && self.image_urls.is_none()
            && self.auction_start.is_none()
            && self.auction_end.is_none()
    }
}

/// Append-only audit row for a single written field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub field: String,
    pub value: String,
    pub method: ExtractionMethod,
    pub confidence: f32,
    pub source_url: String,
}
