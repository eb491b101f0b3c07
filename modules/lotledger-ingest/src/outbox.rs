// Outbound side-effect queue. Image backfill and comment-ingestion triggers
// are recorded as tasks in the same transaction domain as the merge, then
// delivered at-least-once by the drain loop. Consumers are idempotent, so a
// redelivery after a crash between delivery and completion is harmless.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use lotledger_store::OutboundTask;

use crate::traits::{CommentIngestor, ImageBackfiller, LotStore};

/// Attempts before a task is parked as `failed` for manual inspection.
pub const MAX_TASK_ATTEMPTS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    ImageBackfill,
    CommentIngestion,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::ImageBackfill => "image_backfill",
            TaskKind::CommentIngestion => "comment_ingestion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image_backfill" => Some(TaskKind::ImageBackfill),
            "comment_ingestion" => Some(TaskKind::CommentIngestion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBackfillPayload {
    pub vehicle_id: Uuid,
    pub image_urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentIngestionPayload {
    pub auction_event_id: Uuid,
    pub vehicle_id: Uuid,
    pub source_url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub claimed: u32,
    pub delivered: u32,
    pub retried: u32,
}

pub struct OutboxDrain {
    store: Arc<dyn LotStore>,
    backfiller: Arc<dyn ImageBackfiller>,
    comments: Arc<dyn CommentIngestor>,
}

impl OutboxDrain {
    pub fn new(
        store: Arc<dyn LotStore>,
        backfiller: Arc<dyn ImageBackfiller>,
        comments: Arc<dyn CommentIngestor>,
    ) -> Self {
        Self { store, backfiller, comments }
    }

    /// Claim and deliver one batch. Delivery failures release the task back
    /// to the pending pool; the primary merge that enqueued it is long done.
    pub async fn drain(&self, limit: i64) -> Result<DrainStats> {
        let tasks = self.store.claim_tasks(limit).await.context("claiming outbound tasks")?;

        let mut stats = DrainStats { claimed: tasks.len() as u32, ..Default::default() };
        for task in tasks {
            let id = task.id;
            match self.deliver(&task).await {
                Ok(()) => {
                    self.store.complete_task(id).await?;
                    stats.delivered += 1;
                }
                Err(e) => {
                    warn!(
                        task_id = id,
                        kind = task.kind,
                        attempts = task.attempts,
                        error = %e,
                        "Outbound task delivery failed"
                    );
                    self.store.release_task(id, MAX_TASK_ATTEMPTS).await?;
                    stats.retried += 1;
                }
            }
        }

        if stats.claimed > 0 {
            info!(
                claimed = stats.claimed,
                delivered = stats.delivered,
                retried = stats.retried,
                "Outbox drain pass complete"
            );
        }
        Ok(stats)
    }

    async fn deliver(&self, task: &OutboundTask) -> Result<()> {
        match TaskKind::parse(&task.kind) {
            Some(TaskKind::ImageBackfill) => {
                let payload: ImageBackfillPayload =
                    serde_json::from_value(task.payload.0.clone())
                        .context("decoding image_backfill payload")?;
                let outcome = self
                    .backfiller
                    .backfill(payload.vehicle_id, &payload.image_urls)
                    .await?;
                info!(
                    vehicle_id = %payload.vehicle_id,
                    uploaded = outcome.uploaded,
                    skipped = outcome.skipped,
                    failed = outcome.failed,
                    "Image backfill delivered"
                );
                Ok(())
            }
            Some(TaskKind::CommentIngestion) => {
                let payload: CommentIngestionPayload =
                    serde_json::from_value(task.payload.0.clone())
                        .context("decoding comment_ingestion payload")?;
                self.comments
                    .trigger(payload.auction_event_id, payload.vehicle_id, &payload.source_url)
                    .await
            }
            None => Err(anyhow!("unknown task kind {}", task.kind)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBackfiller, MockCommentIngestor, MockLotStore};
    use std::sync::atomic::Ordering;

    fn drain_with(
        store: Arc<MockLotStore>,
        backfiller: Arc<MockBackfiller>,
        comments: Arc<MockCommentIngestor>,
    ) -> OutboxDrain {
        OutboxDrain::new(store, backfiller, comments)
    }

    #[tokio::test]
    async fn image_task_is_delivered_and_completed() {
        let store = Arc::new(MockLotStore::new());
        let backfiller = Arc::new(MockBackfiller::new());
        let comments = Arc::new(MockCommentIngestor::new());

        let vehicle_id = Uuid::new_v4();
        let payload = ImageBackfillPayload {
            vehicle_id,
            image_urls: vec!["https://cdn.example.com/1.jpg".to_string()],
        };
        store
            .enqueue_task(
                TaskKind::ImageBackfill.as_str(),
                serde_json::to_value(&payload).unwrap(),
            )
            .await
            .unwrap();

        let drain = drain_with(store.clone(), backfiller.clone(), comments);
        let stats = drain.drain(10).await.unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(backfiller.calls().len(), 1);
        assert_eq!(backfiller.calls()[0].0, vehicle_id);
        assert_eq!(store.tasks()[0].status, "done");
    }

    #[tokio::test]
    async fn failed_delivery_returns_task_to_pending() {
        let store = Arc::new(MockLotStore::new());
        let backfiller = Arc::new(MockBackfiller::failing());
        let comments = Arc::new(MockCommentIngestor::new());

        let payload = ImageBackfillPayload {
            vehicle_id: Uuid::new_v4(),
            image_urls: vec!["https://cdn.example.com/1.jpg".to_string()],
        };
        store
            .enqueue_task(
                TaskKind::ImageBackfill.as_str(),
                serde_json::to_value(&payload).unwrap(),
            )
            .await
            .unwrap();

        let drain = drain_with(store.clone(), backfiller.clone(), comments);
        let stats = drain.drain(10).await.unwrap();
        assert_eq!(stats.retried, 1);
        let task = &store.tasks()[0];
        assert_eq!(task.status, "pending");
        assert_eq!(task.attempts, 1);

        // The consumer recovers: the next pass delivers the same task.
        backfiller.fail.store(false, Ordering::SeqCst);
        let stats = drain.drain(10).await.unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(store.tasks()[0].status, "done");
    }

    #[tokio::test]
    async fn task_parks_as_failed_after_max_attempts() {
        let store = Arc::new(MockLotStore::new());
        let backfiller = Arc::new(MockBackfiller::failing());
        let comments = Arc::new(MockCommentIngestor::new());

        let payload = ImageBackfillPayload { vehicle_id: Uuid::new_v4(), image_urls: vec![] };
        store
            .enqueue_task(
                TaskKind::ImageBackfill.as_str(),
                serde_json::to_value(&payload).unwrap(),
            )
            .await
            .unwrap();

        let drain = drain_with(store.clone(), backfiller, comments);
        for _ in 0..MAX_TASK_ATTEMPTS {
            drain.drain(10).await.unwrap();
        }
        let task = &store.tasks()[0];
        assert_eq!(task.status, "failed");
        assert_eq!(task.attempts, MAX_TASK_ATTEMPTS);

        // Parked tasks are never reclaimed.
        let stats = drain.drain(10).await.unwrap();
        assert_eq!(stats.claimed, 0);
    }

    #[tokio::test]
    async fn comment_task_reaches_the_ingestor() {
        let store = Arc::new(MockLotStore::new());
        let backfiller = Arc::new(MockBackfiller::new());
        let comments = Arc::new(MockCommentIngestor::new());

        let payload = CommentIngestionPayload {
            auction_event_id: Uuid::new_v4(),
            vehicle_id: Uuid::new_v4(),
            source_url: "https://bringatrailer.com/listing/a/".to_string(),
        };
        store
            .enqueue_task(
                TaskKind::CommentIngestion.as_str(),
                serde_json::to_value(&payload).unwrap(),
            )
            .await
            .unwrap();

        let drain = drain_with(store, backfiller, comments.clone());
        drain.drain(10).await.unwrap();
        let calls = comments.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2, "https://bringatrailer.com/listing/a/");
    }
}
