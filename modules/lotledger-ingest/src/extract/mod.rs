// Extraction layer: structural DOM template first, text-pattern corpus
// second. Text results only fill fields the template missed; the DOM
// extractor's image list is never supplemented by the legacy regex scan.

pub mod dom;
pub mod text;

use chrono::{DateTime, Utc};
use scraper::Html;

use lotledger_common::{Extracted, ExtractedFields, ExtractionHealth, ExtractionMethod, ListingDocument};

use dom::DomExtractor;

#[derive(Debug, Clone, Default)]
pub struct ExtractionOutput {
    pub fields: ExtractedFields,
    pub health: ExtractionHealth,
    pub template_version: Option<u32>,
}

/// Run both extractors over a fetched listing and layer the results.
pub fn extract_listing(doc: &ListingDocument, now: DateTime<Utc>) -> ExtractionOutput {
    let dom = DomExtractor::extract(doc);

    let corpus = build_corpus(doc);
    let text_fields = text::extract_from_text(&corpus, doc.title.as_deref(), now);

    let mut fields = layer(dom.fields, text_fields);

    // Legacy regex image scan: contamination-prone (related-listings widget),
    // so it is consulted only when the structural gallery failed outright.
    if !fields.image_urls.is_present() {
        let urls = dom::legacy_image_scan(&doc.html);
        if !urls.is_empty() {
            fields.image_urls = Extracted::present(urls, ExtractionMethod::TextPattern, 0.2);
        }
    }

    ExtractionOutput {
        fields,
        health: dom.health,
        template_version: dom.template_version,
    }
}

/// Concatenation of all text-bearing sources: title, visible text, raw HTML.
fn build_corpus(doc: &ListingDocument) -> String {
    let visible = visible_text(&doc.html);
    let mut corpus =
        String::with_capacity(visible.len() + doc.html.len() + doc.title.as_ref().map_or(0, String::len) + 2);
    if let Some(title) = &doc.title {
        corpus.push_str(title);
        corpus.push('\n');
    }
    corpus.push_str(&visible);
    corpus.push('\n');
    corpus.push_str(&doc.html);
    corpus
}

fn visible_text(html: &str) -> String {
    let parsed = Html::parse_document(html);
    let mut out = String::new();
    for chunk in parsed.root_element().text() {
        let trimmed = chunk.trim();
        if trimmed.is_empty() {
            continue;
        }
        out.push_str(trimmed);
        out.push(' ');
    }
    out
}

/// DOM results win per field; text-pattern results fill the gaps.
fn layer(dom: ExtractedFields, text: ExtractedFields) -> ExtractedFields {
    ExtractedFields {
        year: dom.year.or(text.year),
        make: dom.make.or(text.make),
        model: dom.model.or(text.model),
        trim: dom.trim.or(text.trim),
        vin: dom.vin.or(text.vin),
        mileage: dom.mileage.or(text.mileage),
        exterior_color: dom.exterior_color.or(text.exterior_color),
        transmission: dom.transmission.or(text.transmission),
        drivetrain: dom.drivetrain.or(text.drivetrain),
        engine: dom.engine.or(text.engine),
        body_style: dom.body_style.or(text.body_style),
        description: dom.description.or(text.description),
        location: dom.location.or(text.location),
        lot_number: dom.lot_number.or(text.lot_number),
        seller_handle: dom.seller_handle.or(text.seller_handle),
        buyer_handle: dom.buyer_handle.or(text.buyer_handle),
        image_urls: dom.image_urls.or(text.image_urls),
        current_bid: dom.current_bid.or(text.current_bid),
        high_bid: dom.high_bid.or(text.high_bid),
        sale_price: dom.sale_price.or(text.sale_price),
        bid_count: dom.bid_count.or(text.bid_count),
        watcher_count: dom.watcher_count.or(text.watcher_count),
        view_count: dom.view_count.or(text.view_count),
        comment_count: dom.comment_count.or(text.comment_count),
        outcome: dom.outcome.or(text.outcome),
        auction_start: dom.auction_start.or(text.auction_start),
        auction_end: dom.auction_end.or(text.auction_end),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lotledger_common::FetchMethod;

    #[test]
    fn dom_vin_wins_over_text_vin() {
        let html = r#"
            <html><body>
            <div class="essentials">
              <ul class="listing-essentials-items"><li>Chassis: WDBBA48D8KA094352</li></ul>
            </div>
            <p>VIN 1HGCM82633A004352 mentioned in a comment</p>
            </body></html>
        "#;
        let doc = ListingDocument {
            url: "https://bringatrailer.com/listing/x/".to_string(),
            html: html.to_string(),
            title: None,
            fetch_method: FetchMethod::Rendered,
        };
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let out = extract_listing(&doc, now);
        assert_eq!(
            out.fields.vin.value().map(String::as_str),
            Some("WDBBA48D8KA094352")
        );
        assert_eq!(out.fields.vin.method(), Some(ExtractionMethod::DomTemplate));
    }

    #[test]
    fn legacy_scan_used_only_when_gallery_missing() {
        let html = r#"
            <html><body>
            <img src="https://cdn.example.com/loose1.jpg">
            <p>Current Bid: USD $5,000</p>
            </body></html>
        "#;
        let doc = ListingDocument {
            url: "https://bringatrailer.com/listing/x/".to_string(),
            html: html.to_string(),
            title: None,
            fetch_method: FetchMethod::Rendered,
        };
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let out = extract_listing(&doc, now);
        assert_eq!(out.fields.image_urls.value().map(Vec::len), Some(1));
        assert_eq!(out.fields.image_urls.confidence(), 0.2);

        // With a structural gallery present, the loose match is ignored.
        let html_with_gallery = r#"<html><body><div data-gallery-items='[{"url":"https://cdn.example.com/real.jpg"}]'></div>
               <img src="https://cdn.example.com/loose1.jpg"></body></html>"#
            .to_string();
        let doc = ListingDocument {
            url: "https://bringatrailer.com/listing/x/".to_string(),
            html: html_with_gallery,
            title: None,
            fetch_method: FetchMethod::Rendered,
        };
        let out = extract_listing(&doc, now);
        assert_eq!(
            out.fields.image_urls.value().map(|v| v[0].as_str()),
            Some("https://cdn.example.com/real.jpg")
        );
        assert_eq!(out.fields.image_urls.value().map(Vec::len), Some(1));
    }

    #[test]
    fn title_parse_fills_identity_fields() {
        let doc = ListingDocument {
            url: "https://bringatrailer.com/listing/x/".to_string(),
            html: "<html><body><p>Current Bid: USD $9,800</p></body></html>".to_string(),
            title: Some("1972 BMW 2002tii for sale on BaT Auctions".to_string()),
            fetch_method: FetchMethod::Rendered,
        };
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let out = extract_listing(&doc, now);
        assert_eq!(out.fields.year.value(), Some(&1972));
        assert_eq!(out.fields.make.value().map(String::as_str), Some("BMW"));
        assert_eq!(out.fields.current_bid.value(), Some(&9_800));
    }
}
