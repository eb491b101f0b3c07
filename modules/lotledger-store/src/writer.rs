use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::models::{
    AuctionEvent, ExternalIdentity, OutboundTask, ProvenanceEntry, QueueEntry, VehicleMutation,
    VehicleRecord,
};

/// All store mutations for the ingestion pipeline.
///
/// Concurrency correctness is store-level: every uniqueness invariant is an
/// `ON CONFLICT` target, ratchet columns use `GREATEST`, and terminal outcome
/// stickiness is a `CASE` guard. Two simultaneous ingestions of the same
/// source URL converge on one row without application locks.
#[derive(Clone)]
pub struct LotWriter {
    pool: PgPool,
}

impl LotWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // --- Vehicle lookup (matcher strategies) ---

    pub async fn vehicle_by_source_url(&self, url: &str) -> Result<Option<VehicleRecord>> {
        sqlx::query_as::<_, VehicleRecord>("SELECT * FROM vehicles WHERE source_url = $1")
            .bind(url)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    pub async fn vehicle_by_alias_url(&self, url: &str) -> Result<Option<VehicleRecord>> {
        sqlx::query_as::<_, VehicleRecord>(
            "SELECT * FROM vehicles WHERE discovery_url = $1 OR legacy_listing_url = $1 LIMIT 1",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn vehicle_by_vin(&self, vin: &str) -> Result<Option<VehicleRecord>> {
        sqlx::query_as::<_, VehicleRecord>(
            "SELECT * FROM vehicles WHERE vin = $1 ORDER BY created_at LIMIT 1",
        )
        .bind(vin)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn vehicle_by_id(&self, id: Uuid) -> Result<Option<VehicleRecord>> {
        sqlx::query_as::<_, VehicleRecord>("SELECT * FROM vehicles WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    /// Fuzzy probe: same year, case-insensitive partial make, first model
    /// token. Only consulted when the caller opts in.
    pub async fn vehicle_fuzzy(
        &self,
        year: i32,
        make: &str,
        model_first_token: &str,
    ) -> Result<Option<VehicleRecord>> {
        sqlx::query_as::<_, VehicleRecord>(
            r#"
            SELECT * FROM vehicles
            WHERE year = $1
              AND make ILIKE '%' || $2 || '%'
              AND lower(split_part(model, ' ', 1)) = lower($3)
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(year)
        .bind(make)
        .bind(model_first_token)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    // --- Vehicle mutation ---

    /// Find-or-create by canonical source URL. Concurrent ingestions of the
    /// same URL both get the single surviving row.
    pub async fn create_vehicle(&self, source_url: &str) -> Result<VehicleRecord> {
        sqlx::query_as::<_, VehicleRecord>(
            r#"
            INSERT INTO vehicles (source_url)
            VALUES ($1)
            ON CONFLICT (source_url) DO UPDATE SET updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(source_url)
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Apply a merge-engine mutation in one atomic UPDATE. `None` fields are
    /// left untouched; ratchets and outcome stickiness are re-checked in SQL
    /// so a concurrent writer can never be regressed.
    pub async fn apply_mutation(
        &self,
        id: Uuid,
        mutation: &VehicleMutation,
    ) -> Result<VehicleRecord> {
        sqlx::query_as::<_, VehicleRecord>(
            r#"
            UPDATE vehicles SET
                year = COALESCE($2, year),
                make = COALESCE($3, make),
                model = COALESCE($4, model),
                "trim" = COALESCE($5, "trim"),
                vin = COALESCE($6, vin),
                mileage = COALESCE($7, mileage),
                exterior_color = COALESCE($8, exterior_color),
                transmission = COALESCE($9, transmission),
                drivetrain = COALESCE($10, drivetrain),
                engine = COALESCE($11, engine),
                body_style = COALESCE($12, body_style),
                description = COALESCE($13, description),
                location = COALESCE($14, location),
                lot_number = COALESCE($15, lot_number),
                sale_status = CASE
                    WHEN sale_status IN ('sold', 'ended', 'reserve_not_met') THEN sale_status
                    ELSE COALESCE($16, sale_status)
                END,
                high_bid = CASE WHEN $17::BIGINT IS NULL THEN high_bid
                    ELSE GREATEST(COALESCE(high_bid, 0), $17) END,
                bid_count = CASE WHEN $18::BIGINT IS NULL THEN bid_count
                    ELSE GREATEST(COALESCE(bid_count, 0), $18) END,
                watcher_count = CASE WHEN $19::BIGINT IS NULL THEN watcher_count
                    ELSE GREATEST(COALESCE(watcher_count, 0), $19) END,
                view_count = CASE WHEN $20::BIGINT IS NULL THEN view_count
                    ELSE GREATEST(COALESCE(view_count, 0), $20) END,
                comment_count = CASE WHEN $21::BIGINT IS NULL THEN comment_count
                    ELSE GREATEST(COALESCE(comment_count, 0), $21) END,
                image_urls = COALESCE($22, image_urls),
                auction_start = COALESCE($23, auction_start),
                auction_end = COALESCE($24, auction_end),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(mutation.year)
        .bind(&mutation.make)
        .bind(&mutation.model)
        .bind(&mutation.trim)
        .bind(&mutation.vin)
        .bind(mutation.mileage)
        .bind(&mutation.exterior_color)
        .bind(&mutation.transmission)
        .bind(&mutation.drivetrain)
        .bind(&mutation.engine)
        .bind(&mutation.body_style)
        .bind(&mutation.description)
        .bind(&mutation.location)
        .bind(&mutation.lot_number)
        .bind(&mutation.sale_status)
        .bind(mutation.high_bid)
        .bind(mutation.bid_count)
        .bind(mutation.watcher_count)
        .bind(mutation.view_count)
        .bind(mutation.comment_count)
        .bind(mutation.image_urls.clone().map(Json))
        .bind(mutation.auction_start)
        .bind(mutation.auction_end)
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Record an alias URL discovered for an existing vehicle.
    pub async fn set_discovery_url(&self, id: Uuid, url: &str) -> Result<()> {
        sqlx::query("UPDATE vehicles SET discovery_url = COALESCE(discovery_url, $2) WHERE id = $1")
            .bind(id)
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Provenance ---

    /// Append one provenance row per written field and fold a summary into
    /// the vehicle's provenance blob. Auxiliary: callers log-and-swallow.
    pub async fn append_provenance(
        &self,
        vehicle_id: Uuid,
        entries: &[ProvenanceEntry],
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        let mut blob = serde_json::Map::new();
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO field_provenance (vehicle_id, field, value, method, confidence, source_url)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(vehicle_id)
            .bind(&entry.field)
            .bind(&entry.value)
            .bind(entry.method.as_str())
            .bind(entry.confidence)
            .bind(&entry.source_url)
            .execute(&mut *tx)
            .await?;

            blob.insert(
                entry.field.clone(),
                serde_json::json!({
                    "method": entry.method.as_str(),
                    "confidence": entry.confidence,
                    "source_url": entry.source_url,
                }),
            );
        }

        sqlx::query("UPDATE vehicles SET provenance = provenance || $2 WHERE id = $1")
            .bind(vehicle_id)
            .bind(Json(serde_json::Value::Object(blob)))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn provenance_for(&self, vehicle_id: Uuid, field: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT value FROM field_provenance WHERE vehicle_id = $1 AND field = $2 ORDER BY id",
        )
        .bind(vehicle_id)
        .bind(field)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(v,)| v).collect())
    }

    // --- External identities ---

    /// Atomic upsert on (platform, lower(handle)). Concurrent resolves of the
    /// same handle converge; first_seen is set once and never overwritten.
    pub async fn upsert_identity(
        &self,
        platform: &str,
        handle: &str,
        profile_url: Option<&str>,
    ) -> Result<ExternalIdentity> {
        sqlx::query_as::<_, ExternalIdentity>(
            r#"
            INSERT INTO external_identities (platform, handle, profile_url)
            VALUES ($1, $2, $3)
            ON CONFLICT (platform, lower(handle)) DO UPDATE
                SET last_seen = NOW(),
                    profile_url = COALESCE(external_identities.profile_url, EXCLUDED.profile_url)
            RETURNING *
            "#,
        )
        .bind(platform)
        .bind(handle)
        .bind(profile_url)
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Bump last_seen only. If the row does not exist yet, insert it; losing
    /// that insert race to a concurrent winner is non-fatal.
    pub async fn touch_identity(&self, platform: &str, handle: &str) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE external_identities SET last_seen = NOW()
            WHERE platform = $1 AND lower(handle) = lower($2)
            "#,
        )
        .bind(platform)
        .bind(handle)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            let inserted = sqlx::query(
                r#"
                INSERT INTO external_identities (platform, handle)
                VALUES ($1, $2)
                ON CONFLICT (platform, lower(handle)) DO NOTHING
                "#,
            )
            .bind(platform)
            .bind(handle)
            .execute(&self.pool)
            .await;
            if let Err(e) = inserted {
                warn!(platform, handle, error = %e, "Identity touch-insert lost a race");
            }
        }
        Ok(())
    }

    pub async fn identity(&self, platform: &str, handle: &str) -> Result<Option<ExternalIdentity>> {
        sqlx::query_as::<_, ExternalIdentity>(
            "SELECT * FROM external_identities WHERE platform = $1 AND lower(handle) = lower($2)",
        )
        .bind(platform)
        .bind(handle)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    // --- Auction events ---

    /// Merge-upsert on (vehicle_id, source_url). Outcome never regresses from
    /// a terminal state; bid figures ratchet.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_auction_event(
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
        sqlx::query_as::<_, AuctionEvent>(
            r#"
            INSERT INTO auction_events
                (vehicle_id, source_url, outcome, high_bid, bid_count, auction_start, auction_end, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (vehicle_id, source_url) DO UPDATE SET
                outcome = CASE
                    WHEN auction_events.outcome IN ('sold', 'ended', 'reserve_not_met')
                        THEN auction_events.outcome
                    ELSE EXCLUDED.outcome
                END,
                high_bid = CASE WHEN EXCLUDED.high_bid IS NULL THEN auction_events.high_bid
                    ELSE GREATEST(COALESCE(auction_events.high_bid, 0), EXCLUDED.high_bid) END,
                bid_count = CASE WHEN EXCLUDED.bid_count IS NULL THEN auction_events.bid_count
                    ELSE GREATEST(COALESCE(auction_events.bid_count, 0), EXCLUDED.bid_count) END,
                auction_start = COALESCE(EXCLUDED.auction_start, auction_events.auction_start),
                auction_end = COALESCE(EXCLUDED.auction_end, auction_events.auction_end),
                metadata = auction_events.metadata || EXCLUDED.metadata,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(vehicle_id)
        .bind(source_url)
        .bind(outcome)
        .bind(high_bid)
        .bind(bid_count)
        .bind(auction_start)
        .bind(auction_end)
        .bind(Json(metadata))
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    // --- Extraction queue (audit/requeue) ---

    /// Record an audit result. Updates missing_fields/score/flagged without
    /// touching last_enqueued_at — flagging and enqueueing are separate.
    pub async fn flag_vehicle(
        &self,
        vehicle_id: Uuid,
        listing_url: Option<&str>,
        missing_fields: &[String],
        health_score: f32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO extraction_queue (vehicle_id, listing_url, missing_fields, health_score, flagged)
            VALUES ($1, $2, $3, $4, TRUE)
            ON CONFLICT (vehicle_id) DO UPDATE SET
                listing_url = COALESCE(EXCLUDED.listing_url, extraction_queue.listing_url),
                missing_fields = EXCLUDED.missing_fields,
                health_score = EXCLUDED.health_score,
                flagged = TRUE,
                updated_at = NOW()
            "#,
        )
        .bind(vehicle_id)
        .bind(listing_url)
        .bind(Json(missing_fields.to_vec()))
        .bind(health_score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Clear the flag for a record that now passes the audit.
    pub async fn clear_flag(&self, vehicle_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE extraction_queue SET
                flagged = FALSE,
                missing_fields = '[]',
                health_score = 0,
                status = 'done',
                updated_at = NOW()
            WHERE vehicle_id = $1
            "#,
        )
        .bind(vehicle_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Conditionally re-enqueue a flagged record. Skips rows currently
    /// `processing` and rows inside the cooldown window; priority only ever
    /// increases. Returns whether the row was actually enqueued.
    pub async fn try_requeue(
        &self,
        vehicle_id: Uuid,
        priority: i32,
        cooldown_hours: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE extraction_queue SET
                status = 'pending',
                priority = GREATEST(priority, $2),
                last_enqueued_at = NOW(),
                updated_at = NOW()
            WHERE vehicle_id = $1
              AND status <> 'processing'
              AND (last_enqueued_at IS NULL
                   OR last_enqueued_at < NOW() - make_interval(hours => $3::INT))
            "#,
        )
        .bind(vehicle_id)
        .bind(priority)
        .bind(cooldown_hours)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn queue_entry(&self, vehicle_id: Uuid) -> Result<Option<QueueEntry>> {
        sqlx::query_as::<_, QueueEntry>("SELECT * FROM extraction_queue WHERE vehicle_id = $1")
            .bind(vehicle_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    /// Batch of vehicles due for a completeness audit, oldest first.
    pub async fn vehicles_for_audit(
        &self,
        batch_size: i64,
        min_age_hours: i64,
        vehicle_filter: Option<Uuid>,
    ) -> Result<Vec<VehicleRecord>> {
        sqlx::query_as::<_, VehicleRecord>(
            r#"
            SELECT * FROM vehicles
            WHERE ($3::UUID IS NULL OR id = $3)
              AND updated_at < NOW() - make_interval(hours => $2::INT)
            ORDER BY updated_at
            LIMIT $1
            "#,
        )
        .bind(batch_size)
        .bind(min_age_hours)
        .bind(vehicle_filter)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    // --- Outbound task queue ---

    pub async fn enqueue_task(&self, kind: &str, payload: serde_json::Value) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO outbound_tasks (kind, payload) VALUES ($1, $2) RETURNING id",
        )
        .bind(kind)
        .bind(Json(payload))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Claim a batch of pending tasks. SKIP LOCKED so concurrent drainers
    /// never double-claim.
    pub async fn claim_tasks(&self, limit: i64) -> Result<Vec<OutboundTask>> {
        sqlx::query_as::<_, OutboundTask>(
            r#"
            UPDATE outbound_tasks SET status = 'in_flight', attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM outbound_tasks
                WHERE status = 'pending'
                ORDER BY id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn complete_task(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE outbound_tasks SET status = 'done', completed_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Return a failed task to the pending pool, or park it after too many
    /// attempts. Consumers are idempotent, so at-least-once is safe.
    pub async fn release_task(&self, id: i64, max_attempts: i32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbound_tasks SET
                status = CASE WHEN attempts >= $2 THEN 'failed' ELSE 'pending' END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(max_attempts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
