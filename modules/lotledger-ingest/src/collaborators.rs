// HTTP implementations of the downstream collaborator traits, plus no-op
// stands-ins for deployments that run without those services. Each service
// owns its own retry/idempotency behavior; we only deliver the trigger.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::traits::{BackfillOutcome, CommentIngestor, ImageBackfiller, Notifier};

/// Client for the object-storage image-backfill service.
pub struct HttpImageBackfiller {
    client: reqwest::Client,
    base_url: String,
    batch_size: usize,
}

impl HttpImageBackfiller {
    pub fn new(base_url: &str, timeout: Duration, batch_size: usize) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("Failed to build HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            batch_size,
        }
    }
}

#[async_trait]
impl ImageBackfiller for HttpImageBackfiller {
    async fn backfill(&self, vehicle_id: Uuid, image_urls: &[String]) -> Result<BackfillOutcome> {
        let mut total = BackfillOutcome::default();
        for batch in image_urls.chunks(self.batch_size.max(1)) {
            let response = self
                .client
                .post(format!("{}/backfill", self.base_url))
                .json(&json!({ "vehicle_id": vehicle_id, "image_urls": batch }))
                .send()
                .await
                .context("image backfill request")?;

            if !response.status().is_success() {
                return Err(anyhow!("image backfill returned {}", response.status()));
            }

            let outcome: BackfillOutcome =
                response.json().await.context("decoding backfill response")?;
            total.uploaded += outcome.uploaded;
            total.skipped += outcome.skipped;
            total.failed += outcome.failed;
        }
        Ok(total)
    }
}

/// Client for the downstream comment/bid ingestion service.
pub struct HttpCommentIngestor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCommentIngestor {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("Failed to build HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CommentIngestor for HttpCommentIngestor {
    async fn trigger(
        &self,
        auction_event_id: Uuid,
        vehicle_id: Uuid,
        source_url: &str,
    ) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/ingest-comments", self.base_url))
            .json(&json!({
                "auction_event_id": auction_event_id,
                "vehicle_id": vehicle_id,
                "source_url": source_url,
            }))
            .send()
            .await
            .context("comment ingestion request")?;

        if !response.status().is_success() {
            return Err(anyhow!("comment ingestion returned {}", response.status()));
        }
        Ok(())
    }
}

/// Used when the corresponding service URL is not configured.
pub struct NoopBackfiller;

#[async_trait]
impl ImageBackfiller for NoopBackfiller {
    async fn backfill(&self, vehicle_id: Uuid, image_urls: &[String]) -> Result<BackfillOutcome> {
        info!(%vehicle_id, count = image_urls.len(), "Image backfill disabled; skipping");
        Ok(BackfillOutcome {
            uploaded: 0,
            skipped: image_urls.len() as u32,
            failed: 0,
        })
    }
}

pub struct NoopCommentIngestor;

#[async_trait]
impl CommentIngestor for NoopCommentIngestor {
    async fn trigger(&self, _auction_event_id: Uuid, vehicle_id: Uuid, _source_url: &str) -> Result<()> {
        info!(%vehicle_id, "Comment ingestion disabled; skipping");
        Ok(())
    }
}

/// Missing-field notifications land in the log until a delivery channel is
/// wired up.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_missing(
        &self,
        vehicle_id: Uuid,
        recipient_ids: &[Uuid],
        context: &str,
    ) -> Result<()> {
        info!(
            %vehicle_id,
            recipients = recipient_ids.len(),
            missing = context,
            "Vehicle flagged with missing fields"
        );
        Ok(())
    }
}
