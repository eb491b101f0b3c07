// Orchestration for one listing ingestion: fetch, extract, resolve
// identities, match, merge, record the auction event, then trigger side
// effects. The request is stateless; all cross-request correctness lives in
// the store's conflict handling.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use lotledger_common::{
    AuctionOutcome, ExtractedFields, ImageImportStats, LotLedgerError, Platform,
};
use lotledger_store::VehicleRecord;

use crate::extract::{extract_listing, ExtractionOutput};
use crate::health::audit;
use crate::identity::IdentityResolver;
use crate::matcher::{MatchStrategy, VehicleMatcher};
use crate::merge;
use crate::outbox::{CommentIngestionPayload, ImageBackfillPayload, TaskKind};
use crate::traits::{CommentIngestor, ImageBackfiller, LotStore, PageFetcher};

#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub url: String,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub allow_fuzzy_match: Option<bool>,
    #[serde(default)]
    pub force_dealer_link: Option<bool>,
    #[serde(default)]
    pub image_batch_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub vehicle_id: Uuid,
    pub created: bool,
    pub matched_by: Option<MatchStrategy>,
    pub seller: Option<String>,
    pub buyer: Option<String>,
    pub auction_event_id: Uuid,
    pub images: ImageImportStats,
}

pub struct IngestPipeline {
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn LotStore>,
    backfiller: Arc<dyn ImageBackfiller>,
    comments: Arc<dyn CommentIngestor>,
    allow_fuzzy_default: bool,
}

impl IngestPipeline {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn LotStore>,
        backfiller: Arc<dyn ImageBackfiller>,
        comments: Arc<dyn CommentIngestor>,
        allow_fuzzy_default: bool,
    ) -> Self {
        Self { fetcher, store, backfiller, comments, allow_fuzzy_default }
    }

    pub async fn ingest(&self, request: &IngestRequest) -> Result<IngestReport, LotLedgerError> {
        let url = validate_url(&request.url)?;
        let allow_fuzzy = request.allow_fuzzy_match.unwrap_or(self.allow_fuzzy_default);

        // Fetch failure is never fatal: matching and merging still run
        // against prior data with an empty field set.
        let document = self.fetcher.fetch(&url).await.unwrap_or_else(|e| {
            warn!(url, error = %e, "Fetcher errored; continuing without a document");
            None
        });

        let extraction = match &document {
            Some(doc) => extract_listing(doc, Utc::now()),
            None => ExtractionOutput::default(),
        };
        let fields = &extraction.fields;

        let (seller, buyer) = self.resolve_participants(&url, fields, request).await;

        let matcher = VehicleMatcher::new(self.store.clone());
        let matched = matcher
            .find(&url, fields, allow_fuzzy)
            .await
            .context("matching vehicle")?;

        let (vehicle, created, matched_by) = match matched {
            Some(result) => {
                // A non-URL match means this URL is a new alias for the
                // vehicle; remember it so the next ingest matches directly.
                if result.vehicle.source_url.as_deref() != Some(url.as_str()) {
                    if let Err(e) = self.store.set_discovery_url(result.vehicle.id, &url).await {
                        warn!(vehicle_id = %result.vehicle.id, error = %e, "Recording alias URL failed");
                    }
                }
                (result.vehicle, false, Some(result.strategy))
            }
            None => {
                let vehicle = self
                    .store
                    .create_vehicle(&url)
                    .await
                    .context("creating vehicle")?;
                (vehicle, true, None)
            }
        };

        let vehicle = self.merge_and_persist(&vehicle, fields, &url).await?;

        let event = self
            .record_auction_event(&vehicle, fields, &url, &extraction, document.is_some())
            .await?;

        let images = self
            .backfill_images(&vehicle, fields, request.image_batch_size)
            .await;
        self.trigger_comment_ingestion(event.id, vehicle.id, &url).await;
        self.refresh_audit_state(&vehicle).await;

        info!(
            url,
            vehicle_id = %vehicle.id,
            created,
            matched_by = matched_by.map(|m| m.as_str()).unwrap_or("none"),
            organization = request.organization.as_deref().unwrap_or(""),
            "Listing ingested"
        );

        Ok(IngestReport {
            vehicle_id: vehicle.id,
            created,
            matched_by,
            seller,
            buyer,
            auction_event_id: event.id,
            images,
        })
    }

    async fn resolve_participants(
        &self,
        url: &str,
        fields: &ExtractedFields,
        request: &IngestRequest,
    ) -> (Option<String>, Option<String>) {
        let Some(platform) = Platform::for_listing_url(url) else {
            return (None, None);
        };
        let resolver = IdentityResolver::new(self.store.clone());

        let mut seller = None;
        if let Some(handle) = fields.seller_handle.value() {
            match resolver.resolve(platform, handle).await {
                Ok(identity) => seller = Some(identity.handle),
                Err(e) => warn!(url, handle, error = %e, "Seller identity resolution failed"),
            }
        }
        // Dealer-managed listings often carry no member link; the caller can
        // ask for the organization hint to stand in as the seller. It never
        // overrides a handle the page itself named.
        if seller.is_none() && request.force_dealer_link.unwrap_or(false) {
            if let Some(org) = request.organization.as_deref() {
                match resolver.resolve(platform, org).await {
                    Ok(identity) => seller = Some(identity.handle),
                    Err(e) => {
                        warn!(url, organization = org, error = %e, "Dealer identity resolution failed")
                    }
                }
            }
        }
        let mut buyer = None;
        if let Some(handle) = fields.buyer_handle.value() {
            match resolver.resolve(platform, handle).await {
                Ok(identity) => buyer = Some(identity.handle),
                Err(e) => warn!(url, handle, error = %e, "Buyer identity resolution failed"),
            }
        }
        (seller, buyer)
    }

    /// The one fatal write: the canonical vehicle upsert. Provenance is
    /// auxiliary and swallowed on failure.
    async fn merge_and_persist(
        &self,
        vehicle: &VehicleRecord,
        fields: &ExtractedFields,
        url: &str,
    ) -> Result<VehicleRecord, LotLedgerError> {
        let outcome = merge::merge(vehicle, fields, url);
        for conflict in &outcome.conflicts {
            warn!(vehicle_id = %vehicle.id, url, conflict, "Merge conflict left unresolved");
        }

        let updated = if outcome.mutation.is_empty() {
            vehicle.clone()
        } else {
            self.store
                .apply_mutation(vehicle.id, &outcome.mutation)
                .await
                .context("applying vehicle mutation")?
        };

        if let Err(e) = self.store.append_provenance(vehicle.id, &outcome.provenance).await {
            warn!(vehicle_id = %vehicle.id, error = %e, "Provenance write failed");
        }
        Ok(updated)
    }

    async fn record_auction_event(
        &self,
        vehicle: &VehicleRecord,
        fields: &ExtractedFields,
        url: &str,
        extraction: &ExtractionOutput,
        fetched: bool,
    ) -> Result<lotledger_store::AuctionEvent, LotLedgerError> {
        let observed = fields
            .outcome
            .value()
            .copied()
            .unwrap_or(AuctionOutcome::Active);
        let high_bid = fields
            .sale_price
            .clone()
            .or(fields.high_bid.clone())
            .or(fields.current_bid.clone())
            .into_value();

        let metadata = json!({
            "fetched": fetched,
            "template_version": extraction.template_version,
            "extraction_score": extraction.health.overall_score(),
        });

        self.store
            .upsert_auction_event(
                vehicle.id,
                url,
                observed.as_str(),
                high_bid,
                fields.bid_count.clone().into_value(),
                fields.auction_start.clone().into_value(),
                fields.auction_end.clone().into_value(),
                metadata,
            )
            .await
            .context("recording auction event")
            .map_err(Into::into)
    }

    /// Direct attempt first; on failure the work is parked in the outbox so
    /// the drain loop retries it. Either way the merge already succeeded.
    async fn backfill_images(
        &self,
        vehicle: &VehicleRecord,
        fields: &ExtractedFields,
        batch_limit: Option<usize>,
    ) -> ImageImportStats {
        let Some(all) = fields.image_urls.value() else {
            return ImageImportStats::default();
        };
        if all.is_empty() {
            return ImageImportStats::default();
        }
        let urls: Vec<String> = match batch_limit {
            Some(limit) => all.iter().take(limit).cloned().collect(),
            None => all.clone(),
        };

        let found = urls.len() as u32;
        match self.backfiller.backfill(vehicle.id, &urls).await {
            Ok(outcome) => ImageImportStats {
                found,
                uploaded: outcome.uploaded,
                skipped: outcome.skipped,
                failed: outcome.failed,
            },
            Err(e) => {
                warn!(vehicle_id = %vehicle.id, error = %e, "Image backfill failed; queuing for retry");
                let payload = ImageBackfillPayload {
                    vehicle_id: vehicle.id,
                    image_urls: urls,
                };
                if let Err(e) = self
                    .store
                    .enqueue_task(
                        TaskKind::ImageBackfill.as_str(),
                        serde_json::to_value(&payload).unwrap_or_default(),
                    )
                    .await
                {
                    warn!(vehicle_id = %vehicle.id, error = %e, "Queuing image backfill failed");
                }
                ImageImportStats { found, ..Default::default() }
            }
        }
    }

    async fn trigger_comment_ingestion(&self, event_id: Uuid, vehicle_id: Uuid, url: &str) {
        if let Err(e) = self.comments.trigger(event_id, vehicle_id, url).await {
            warn!(%vehicle_id, error = %e, "Comment ingestion trigger failed; queuing for retry");
            let payload = CommentIngestionPayload {
                auction_event_id: event_id,
                vehicle_id,
                source_url: url.to_string(),
            };
            if let Err(e) = self
                .store
                .enqueue_task(
                    TaskKind::CommentIngestion.as_str(),
                    serde_json::to_value(&payload).unwrap_or_default(),
                )
                .await
            {
                warn!(%vehicle_id, error = %e, "Queuing comment ingestion failed");
            }
        }
    }

    /// Promote-on-complete: a record that now passes the audit sheds its
    /// flag immediately instead of waiting for the next monitor pass.
    async fn refresh_audit_state(&self, vehicle: &VehicleRecord) {
        let report = audit(vehicle);
        let result = if report.flagged {
            self.store
                .flag_vehicle(
                    vehicle.id,
                    vehicle.source_url.as_deref(),
                    &report.missing_fields,
                    report.score,
                )
                .await
        } else {
            self.store.clear_flag(vehicle.id).await
        };
        if let Err(e) = result {
            warn!(vehicle_id = %vehicle.id, error = %e, "Audit state refresh failed");
        }
    }
}

fn validate_url(raw: &str) -> Result<String, LotLedgerError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(LotLedgerError::Validation("url is required".to_string()));
    }
    let parsed = Url::parse(trimmed)
        .map_err(|e| LotLedgerError::Validation(format!("invalid url: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(LotLedgerError::Validation(format!(
            "unsupported url scheme: {}",
            parsed.scheme()
        )));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBackfiller, MockCommentIngestor, MockFetcher, MockLotStore};
    use lotledger_common::{FetchMethod, ListingDocument};

    const URL_A: &str = "https://bringatrailer.com/listing/1972-bmw-2002tii/";
    const URL_B: &str = "https://bringatrailer.com/listing/1972-bmw-2002tii-relist/";

    fn listing_html(vin: &str) -> String {
        format!(
            r#"<html><head><title>1972 BMW 2002tii for sale on BaT Auctions</title></head>
            <body>
            <div class="essentials">
              <a href="/member/wagonfan/">wagonfan</a>
              <ul class="listing-essentials-items">
                <li>Chassis: {vin}</li>
                <li>41,000 Miles Shown</li>
              </ul>
            </div>
            <div data-gallery-items='[{{"url":"https://cdn.example.com/1.jpg"}},{{"url":"https://cdn.example.com/2.jpg"}}]'></div>
            <p>Current Bid: USD $12,000</p>
            </body></html>"#
        )
    }

    fn doc(url: &str, vin: &str) -> ListingDocument {
        ListingDocument {
            url: url.to_string(),
            html: listing_html(vin),
            title: Some("1972 BMW 2002tii for sale on BaT Auctions".to_string()),
            fetch_method: FetchMethod::Rendered,
        }
    }

    fn pipeline(
        fetcher: Arc<MockFetcher>,
        store: Arc<MockLotStore>,
    ) -> (IngestPipeline, Arc<MockBackfiller>, Arc<MockCommentIngestor>) {
        let backfiller = Arc::new(MockBackfiller::new());
        let comments = Arc::new(MockCommentIngestor::new());
        let pipeline = IngestPipeline::new(
            fetcher,
            store,
            backfiller.clone(),
            comments.clone(),
            false,
        );
        (pipeline, backfiller, comments)
    }

    fn request(url: &str) -> IngestRequest {
        IngestRequest {
            url: url.to_string(),
            organization: None,
            allow_fuzzy_match: None,
            force_dealer_link: None,
            image_batch_size: None,
        }
    }

    fn doc_without_seller(url: &str) -> ListingDocument {
        let html = r#"<html><body>
            <div class="essentials">
              <ul class="listing-essentials-items"><li>Chassis: 1HGCM82633A004352</li></ul>
            </div>
            <p>Current Bid: USD $9,000</p>
            </body></html>"#
            .to_string();
        ListingDocument {
            url: url.to_string(),
            html,
            title: Some("1972 BMW 2002tii for sale on BaT Auctions".to_string()),
            fetch_method: FetchMethod::Rendered,
        }
    }

    #[tokio::test]
    async fn same_url_twice_is_idempotent() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.stub(URL_A, doc(URL_A, "1HGCM82633A004352"));
        let store = Arc::new(MockLotStore::new());
        let (pipeline, _, _) = pipeline(fetcher, store.clone());

        let first = pipeline.ingest(&request(URL_A)).await.unwrap();
        assert!(first.created);
        assert_eq!(first.matched_by, None);

        let second = pipeline.ingest(&request(URL_A)).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.matched_by, Some(MatchStrategy::SourceUrl));
        assert_eq!(first.vehicle_id, second.vehicle_id);

        assert_eq!(store.vehicle_count(), 1);
        assert_eq!(store.events_for(first.vehicle_id).len(), 1);
        assert_eq!(first.auction_event_id, second.auction_event_id);
    }

    #[tokio::test]
    async fn same_vin_under_two_urls_resolves_to_one_vehicle() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.stub(URL_A, doc(URL_A, "1HGCM82633A004352"));
        fetcher.stub(URL_B, doc(URL_B, "1HGCM82633A004352"));
        let store = Arc::new(MockLotStore::new());
        let (pipeline, _, _) = pipeline(fetcher, store.clone());

        let first = pipeline.ingest(&request(URL_A)).await.unwrap();
        let second = pipeline.ingest(&request(URL_B)).await.unwrap();

        assert_eq!(first.vehicle_id, second.vehicle_id);
        assert_eq!(second.matched_by, Some(MatchStrategy::Vin));
        assert_eq!(store.vehicle_count(), 1);
        // One auction event per source URL.
        assert_eq!(store.events_for(first.vehicle_id).len(), 2);

        // The relist URL is remembered as an alias.
        let vehicle = store.vehicle(first.vehicle_id).unwrap();
        assert_eq!(vehicle.discovery_url.as_deref(), Some(URL_B));
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_with_no_side_effects() {
        let fetcher = Arc::new(MockFetcher::new());
        let store = Arc::new(MockLotStore::new());
        let (pipeline, _, _) = pipeline(fetcher.clone(), store.clone());

        let err = pipeline.ingest(&request("not-a-url")).await.unwrap_err();
        assert!(matches!(err, LotLedgerError::Validation(_)));
        assert_eq!(store.vehicle_count(), 0);
        assert!(fetcher.calls().is_empty());

        let err = pipeline.ingest(&request("   ")).await.unwrap_err();
        assert!(matches!(err, LotLedgerError::Validation(_)));
    }

    #[tokio::test]
    async fn fetch_failure_still_creates_and_merges() {
        // No stubbed page: every fetch tier fails.
        let fetcher = Arc::new(MockFetcher::new());
        let store = Arc::new(MockLotStore::new());
        let (pipeline, _, _) = pipeline(fetcher, store.clone());

        let report = pipeline.ingest(&request(URL_A)).await.unwrap();
        assert!(report.created);
        assert_eq!(report.images, ImageImportStats::default());

        let vehicle = store.vehicle(report.vehicle_id).unwrap();
        assert_eq!(vehicle.source_url.as_deref(), Some(URL_A));
        // The record is immediately flagged for re-extraction.
        let entry = store.queue_entry(report.vehicle_id).await.unwrap().unwrap();
        assert!(entry.flagged);
    }

    #[tokio::test]
    async fn seller_identity_is_resolved_and_reported() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.stub(URL_A, doc(URL_A, "1HGCM82633A004352"));
        let store = Arc::new(MockLotStore::new());
        let (pipeline, _, _) = pipeline(fetcher, store.clone());

        let report = pipeline.ingest(&request(URL_A)).await.unwrap();
        assert_eq!(report.seller.as_deref(), Some("wagonfan"));
        assert!(store.identity_row("bring_a_trailer", "wagonfan").is_some());
    }

    #[tokio::test]
    async fn dealer_hint_stands_in_for_a_missing_seller() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.stub(URL_A, doc_without_seller(URL_A));
        let store = Arc::new(MockLotStore::new());
        let (pipeline, _, _) = pipeline(fetcher, store.clone());

        let mut req = request(URL_A);
        req.organization = Some("velocemotors".to_string());
        req.force_dealer_link = Some(true);

        let report = pipeline.ingest(&req).await.unwrap();
        assert_eq!(report.seller.as_deref(), Some("velocemotors"));
        assert!(store.identity_row("bring_a_trailer", "velocemotors").is_some());
    }

    #[tokio::test]
    async fn dealer_hint_without_the_flag_is_informational_only() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.stub(URL_A, doc_without_seller(URL_A));
        let store = Arc::new(MockLotStore::new());
        let (pipeline, _, _) = pipeline(fetcher, store.clone());

        let mut req = request(URL_A);
        req.organization = Some("velocemotors".to_string());

        let report = pipeline.ingest(&req).await.unwrap();
        assert_eq!(report.seller, None);
        assert!(store.identity_row("bring_a_trailer", "velocemotors").is_none());
    }

    #[tokio::test]
    async fn dealer_hint_never_overrides_a_page_named_seller() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.stub(URL_A, doc(URL_A, "1HGCM82633A004352"));
        let store = Arc::new(MockLotStore::new());
        let (pipeline, _, _) = pipeline(fetcher, store.clone());

        let mut req = request(URL_A);
        req.organization = Some("velocemotors".to_string());
        req.force_dealer_link = Some(true);

        let report = pipeline.ingest(&req).await.unwrap();
        assert_eq!(report.seller.as_deref(), Some("wagonfan"));
    }

    #[tokio::test]
    async fn merged_fields_land_on_the_vehicle_with_provenance() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.stub(URL_A, doc(URL_A, "1HGCM82633A004352"));
        let store = Arc::new(MockLotStore::new());
        let (pipeline, _, _) = pipeline(fetcher, store.clone());

        let report = pipeline.ingest(&request(URL_A)).await.unwrap();
        let vehicle = store.vehicle(report.vehicle_id).unwrap();
        assert_eq!(vehicle.year, Some(1972));
        assert_eq!(vehicle.make.as_deref(), Some("BMW"));
        assert_eq!(vehicle.vin.as_deref(), Some("1HGCM82633A004352"));
        assert_eq!(vehicle.mileage, Some(41_000));
        assert_eq!(vehicle.high_bid, Some(12_000));
        assert_eq!(vehicle.image_urls.0.len(), 2);

        let fields = store.provenance_fields(report.vehicle_id);
        assert!(fields.contains(&"vin".to_string()));
        assert!(fields.contains(&"year".to_string()));
    }

    #[tokio::test]
    async fn backfill_failure_parks_an_outbox_task_and_does_not_fail_ingest() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.stub(URL_A, doc(URL_A, "1HGCM82633A004352"));
        let store = Arc::new(MockLotStore::new());
        let backfiller = Arc::new(MockBackfiller::failing());
        let comments = Arc::new(MockCommentIngestor::new());
        let pipeline = IngestPipeline::new(
            fetcher,
            store.clone(),
            backfiller,
            comments,
            false,
        );

        let report = pipeline.ingest(&request(URL_A)).await.unwrap();
        assert_eq!(report.images.found, 2);
        assert_eq!(report.images.uploaded, 0);

        let tasks = store.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind, "image_backfill");
        assert_eq!(tasks[0].status, "pending");
    }

    #[tokio::test]
    async fn comment_trigger_receives_the_auction_event() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.stub(URL_A, doc(URL_A, "1HGCM82633A004352"));
        let store = Arc::new(MockLotStore::new());
        let (pipeline, _, comments) = pipeline(fetcher, store.clone());

        let report = pipeline.ingest(&request(URL_A)).await.unwrap();
        let calls = comments.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, report.auction_event_id);
        assert_eq!(calls[0].1, report.vehicle_id);
    }

    #[tokio::test]
    async fn stale_active_reading_never_reverts_a_sold_event() {
        let fetcher = Arc::new(MockFetcher::new());
        let sold_html = r#"<html><body><p>Sold for USD $25,000</p>
            <div class="essentials"><ul class="listing-essentials-items">
            <li>Chassis: 1HGCM82633A004352</li></ul></div></body></html>"#
            .to_string();
        fetcher.stub(
            URL_A,
            ListingDocument {
                url: URL_A.to_string(),
                html: sold_html,
                title: Some("1972 BMW 2002tii".to_string()),
                fetch_method: FetchMethod::Rendered,
            },
        );
        let store = Arc::new(MockLotStore::new());
        let (pipeline, _, _) = pipeline(fetcher.clone(), store.clone());

        let report = pipeline.ingest(&request(URL_A)).await.unwrap();
        assert_eq!(store.events_for(report.vehicle_id)[0].outcome, "sold");

        // A stale cache serves the pre-sale page on re-ingest.
        fetcher.stub(URL_A, doc(URL_A, "1HGCM82633A004352"));
        pipeline.ingest(&request(URL_A)).await.unwrap();

        let events = store.events_for(report.vehicle_id);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, "sold");
        let vehicle = store.vehicle(report.vehicle_id).unwrap();
        assert_eq!(vehicle.sale_status, "sold");
    }
}
