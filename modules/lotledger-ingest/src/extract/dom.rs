// Structural extraction against fixed, versioned per-source templates.
//
// Extraction is total over the field set: a missing structural element
// records `ok: false` for that field in the health report and never errors.

use chrono::{DateTime, TimeZone, Utc};
use scraper::{Html, Selector};
use tracing::warn;

use lotledger_common::{
    Extracted, ExtractedFields, ExtractionHealth, ExtractionMethod, ListingDocument, Platform,
};

/// Bring a Trailer structural template version.
const BAT_TEMPLATE_VERSION: u32 = 2;
/// Cars & Bids structural template version.
const CAB_TEMPLATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default)]
pub struct DomExtraction {
    pub fields: ExtractedFields,
    pub health: ExtractionHealth,
    pub template_version: Option<u32>,
}

pub struct DomExtractor;

impl DomExtractor {
    pub fn extract(doc: &ListingDocument) -> DomExtraction {
        match Platform::for_listing_url(&doc.url) {
            Some(Platform::BringATrailer) => extract_bring_a_trailer(doc),
            Some(Platform::CarsAndBids) => extract_cars_and_bids(doc),
            _ => {
                warn!(url = %doc.url, "No structural template for source");
                DomExtraction::default()
            }
        }
    }
}

fn sel(s: &str) -> Selector {
    Selector::parse(s).expect("static selector")
}

fn first_text(html: &Html, selector: &str) -> Option<String> {
    let text: String = html
        .select(&sel(selector))
        .next()?
        .text()
        .collect::<String>()
        .trim()
        .to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Handle portion of a member-profile href, e.g. `/member/wagonfan/`.
fn handle_from_href(href: &str, marker: &str) -> Option<String> {
    let idx = href.find(marker)?;
    let rest = &href[idx + marker.len()..];
    let handle = rest.split(['/', '?', '#']).next()?.trim();
    if handle.is_empty() {
        None
    } else {
        Some(handle.to_string())
    }
}

fn record_opt(
    health: &mut ExtractionHealth,
    target: &mut Extracted<String>,
    name: &str,
    value: Option<String>,
    confidence: f32,
) {
    match value {
        Some(v) => {
            *target = Extracted::present(v, ExtractionMethod::DomTemplate, confidence);
            health.record(name, true, ExtractionMethod::DomTemplate);
        }
        None => health.record(name, false, ExtractionMethod::DomTemplate),
    }
}

// ---------------------------------------------------------------------------
// Bring a Trailer
// ---------------------------------------------------------------------------

fn extract_bring_a_trailer(doc: &ListingDocument) -> DomExtraction {
    let html = Html::parse_document(&doc.html);
    let mut fields = ExtractedFields::default();
    let mut health = ExtractionHealth::default();

    record_opt(
        &mut health,
        &mut fields.description,
        "description",
        first_text(&html, "div.post-excerpt"),
        0.9,
    );

    // Seller: first member link inside the essentials block.
    let seller = html
        .select(&sel("div.essentials a[href*='/member/']"))
        .next()
        .and_then(|el| el.value().attr("href"))
        .and_then(|href| handle_from_href(href, "/member/"));
    record_opt(&mut health, &mut fields.seller_handle, "seller", seller, 0.9);

    // Buyer: member link inside the result banner, distinct from the seller.
    let buyer = html
        .select(&sel("div.listing-available-info a[href*='/member/']"))
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| handle_from_href(href, "/member/"))
        .find(|h| Some(h.as_str()) != fields.seller_handle.value().map(String::as_str));
    record_opt(&mut health, &mut fields.buyer_handle, "buyer", buyer, 0.8);

    // Essentials detail list: lot number, chassis (VIN), location, mileage,
    // transmission.
    let mut lot = None;
    let mut vin = None;
    let mut location = None;
    let mut mileage = None;
    let mut transmission = None;
    for item in html.select(&sel("div.essentials ul.listing-essentials-items li")) {
        let text = item.text().collect::<String>().trim().to_string();
        let lower = text.to_lowercase();
        if let Some(rest) = lower.strip_prefix("lot #") {
            lot = Some(rest.replace([',', ' '], ""));
        } else if lower.starts_with("chassis:") {
            let raw = text[8..].trim();
            let cleaned: String = raw
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_ascii_uppercase();
            if !cleaned.is_empty() {
                vin = Some(cleaned);
            }
        } else if lower.starts_with("location:") {
            let v = text[9..].trim().to_string();
            if !v.is_empty() {
                location = Some(v);
            }
        } else if lower.contains("miles") && mileage.is_none() {
            mileage = parse_mileage(&lower);
        } else if lower.contains("transmission") || lower.contains("-speed") {
            transmission.get_or_insert(text.clone());
        }
    }
    record_opt(&mut health, &mut fields.lot_number, "lot_number", lot, 0.9);
    record_opt(&mut health, &mut fields.location, "location", location, 0.9);
    record_opt(
        &mut health,
        &mut fields.transmission,
        "transmission",
        transmission,
        0.7,
    );
    match vin {
        Some(v) => {
            fields.vin = Extracted::present(v, ExtractionMethod::DomTemplate, 0.95);
            health.record("vin", true, ExtractionMethod::DomTemplate);
        }
        None => health.record("vin", false, ExtractionMethod::DomTemplate),
    }
    match mileage {
        Some(m) => {
            fields.mileage = Extracted::present(m, ExtractionMethod::DomTemplate, 0.7);
            health.record("mileage", true, ExtractionMethod::DomTemplate);
        }
        None => health.record("mileage", false, ExtractionMethod::DomTemplate),
    }

    // Gallery: JSON payload in the data-gallery-items attribute. This is the
    // only trusted image source; the legacy regex scan pulls unrelated images
    // from the related-listings widget.
    let images = html
        .select(&sel("[data-gallery-items]"))
        .next()
        .and_then(|el| el.value().attr("data-gallery-items"))
        .and_then(parse_gallery_items);
    match images {
        Some(urls) if !urls.is_empty() => {
            fields.image_urls = Extracted::present(urls, ExtractionMethod::DomTemplate, 0.95);
            health.record("images", true, ExtractionMethod::DomTemplate);
        }
        _ => health.record("images", false, ExtractionMethod::DomTemplate),
    }

    // Countdown element carries the auction end as epoch seconds.
    let end = html
        .select(&sel(".listing-available-countdown[data-until]"))
        .next()
        .and_then(|el| el.value().attr("data-until"))
        .and_then(parse_epoch_secs);
    match end {
        Some(ts) => {
            fields.auction_end = Extracted::present(ts, ExtractionMethod::DomTemplate, 0.9);
            health.record("auction_end", true, ExtractionMethod::DomTemplate);
        }
        None => health.record("auction_end", false, ExtractionMethod::DomTemplate),
    }

    DomExtraction {
        fields,
        health,
        template_version: Some(BAT_TEMPLATE_VERSION),
    }
}

// ---------------------------------------------------------------------------
// Cars & Bids
// ---------------------------------------------------------------------------

fn extract_cars_and_bids(doc: &ListingDocument) -> DomExtraction {
    let html = Html::parse_document(&doc.html);
    let mut fields = ExtractedFields::default();
    let mut health = ExtractionHealth::default();

    record_opt(
        &mut health,
        &mut fields.description,
        "description",
        first_text(&html, "div.detail-description"),
        0.8,
    );

    let seller = html
        .select(&sel("a[href*='/user/']"))
        .next()
        .and_then(|el| el.value().attr("href"))
        .and_then(|href| handle_from_href(href, "/user/"));
    record_opt(&mut health, &mut fields.seller_handle, "seller", seller, 0.8);

    let images: Vec<String> = html
        .select(&sel("div.gallery img[src]"))
        .filter_map(|el| el.value().attr("src"))
        .filter(|src| src.starts_with("http"))
        .map(String::from)
        .collect();
    if images.is_empty() {
        health.record("images", false, ExtractionMethod::DomTemplate);
    } else {
        fields.image_urls = Extracted::present(images, ExtractionMethod::DomTemplate, 0.85);
        health.record("images", true, ExtractionMethod::DomTemplate);
    }

    // Quick-facts list: VIN, mileage, transmission, drivetrain, color.
    for row in html.select(&sel("div.quick-facts dl")) {
        let mut label = None;
        for child in row.text() {
            let text = child.trim();
            if text.is_empty() {
                continue;
            }
            match label.take() {
                None => label = Some(text.to_lowercase()),
                Some(l) => {
                    apply_quick_fact(&mut fields, &l, text);
                }
            }
        }
    }
    health.record("vin", fields.vin.is_present(), ExtractionMethod::DomTemplate);
    health.record(
        "mileage",
        fields.mileage.is_present(),
        ExtractionMethod::DomTemplate,
    );

    DomExtraction {
        fields,
        health,
        template_version: Some(CAB_TEMPLATE_VERSION),
    }
}

fn apply_quick_fact(fields: &mut ExtractedFields, label: &str, value: &str) {
    let present = |v: &str| {
        Extracted::present(v.trim().to_string(), ExtractionMethod::DomTemplate, 0.85)
    };
    match label {
        l if l.starts_with("vin") => {
            let cleaned: String = value
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_ascii_uppercase();
            if !cleaned.is_empty() {
                fields.vin = Extracted::present(cleaned, ExtractionMethod::DomTemplate, 0.9);
            }
        }
        l if l.starts_with("mileage") => {
            if let Some(m) = parse_mileage(&value.to_lowercase()) {
                fields.mileage = Extracted::present(m, ExtractionMethod::DomTemplate, 0.85);
            }
        }
        l if l.starts_with("transmission") => fields.transmission = present(value),
        l if l.starts_with("drivetrain") => fields.drivetrain = present(value),
        l if l.starts_with("engine") => fields.engine = present(value),
        l if l.starts_with("exterior color") => fields.exterior_color = present(value),
        l if l.starts_with("body style") => fields.body_style = present(value),
        l if l.starts_with("location") => fields.location = present(value),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Shared parsers
// ---------------------------------------------------------------------------

/// "7k miles shown" -> 7000; "41,000 miles" -> 41000.
fn parse_mileage(lower: &str) -> Option<i64> {
    let miles_at = lower.find("miles")?;
    let head = &lower[..miles_at];
    let token = head.split_whitespace().last()?;
    if let Some(thousands) = token.strip_suffix('k') {
        let n: f64 = thousands.replace(',', "").parse().ok()?;
        return Some((n * 1000.0) as i64);
    }
    token.replace(',', "").parse().ok()
}

fn parse_epoch_secs(raw: &str) -> Option<DateTime<Utc>> {
    let secs: i64 = raw.trim().parse().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

/// Gallery attribute payload: a JSON array of objects carrying image URLs.
fn parse_gallery_items(raw: &str) -> Option<Vec<String>> {
    let items: Vec<serde_json::Value> = serde_json::from_str(raw).ok()?;
    let urls: Vec<String> = items
        .iter()
        .filter_map(|item| {
            item.get("url")
                .or_else(|| item.get("large"))
                .or_else(|| item.get("src"))
                .and_then(|v| v.as_str())
                .map(String::from)
        })
        .collect();
    Some(urls)
}

/// Legacy regex image scan. Known to pull unrelated images from adjacent
/// "related listings" widgets; only ever consulted when the structural
/// gallery extraction failed, never to supplement it.
pub fn legacy_image_scan(html: &str) -> Vec<String> {
    let re = regex::Regex::new(r#"https?://[^\s"'<>]+\.(?:jpe?g|png|webp)"#).expect("static regex");
    let mut seen = std::collections::HashSet::new();
    re.find_iter(html)
        .map(|m| m.as_str().to_string())
        .filter(|u| seen.insert(u.clone()))
        .collect()
}
