use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

// --- Extraction provenance ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Structural extraction against a versioned per-source DOM template.
    DomTemplate,
    /// Regex/heuristic extraction over the full text corpus.
    TextPattern,
    /// Year/make/model recovered from the page title.
    TitleParse,
    /// Value supplied by the caller rather than extracted.
    Supplied,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::DomTemplate => "dom_template",
            ExtractionMethod::TextPattern => "text_pattern",
            ExtractionMethod::TitleParse => "title_parse",
            ExtractionMethod::Supplied => "supplied",
        }
    }
}

/// Per-field extraction result. `Absent` means "not found", which is distinct
/// from a present-but-zero value; merge rules match exhaustively on this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum Extracted<T> {
    Present {
        value: T,
        method: ExtractionMethod,
        confidence: f32,
    },
    Absent,
}

impl<T> Default for Extracted<T> {
    fn default() -> Self {
        Extracted::Absent
    }
}

impl<T> Extracted<T> {
    pub fn present(value: T, method: ExtractionMethod, confidence: f32) -> Self {
        Extracted::Present {
            value,
            method,
            confidence,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Extracted::Present { .. })
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Extracted::Present { value, .. } => Some(value),
            Extracted::Absent => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Extracted::Present { value, .. } => Some(value),
            Extracted::Absent => None,
        }
    }

    pub fn method(&self) -> Option<ExtractionMethod> {
        match self {
            Extracted::Present { method, .. } => Some(*method),
            Extracted::Absent => None,
        }
    }

    pub fn confidence(&self) -> f32 {
        match self {
            Extracted::Present { confidence, .. } => *confidence,
            Extracted::Absent => 0.0,
        }
    }

    /// Keep `self` if present, otherwise fall back to `other`.
    /// Used to layer text-pattern results under DOM-template results.
    pub fn or(self, other: Self) -> Self {
        match self {
            Extracted::Present { .. } => self,
            Extracted::Absent => other,
        }
    }
}

// --- Auction outcome ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuctionOutcome {
    Active,
    Sold,
    Ended,
    ReserveNotMet,
}

impl AuctionOutcome {
    /// Terminal outcomes are sticky: once reached, re-ingestion can never
    /// move an event back to `active` (a transient render failure must not
    /// read as "auction restarted").
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AuctionOutcome::Active)
    }

    /// Apply an incoming outcome observation to the current state.
    pub fn transition(self, incoming: AuctionOutcome) -> AuctionOutcome {
        if self.is_terminal() {
            self
        } else {
            incoming
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuctionOutcome::Active => "active",
            AuctionOutcome::Sold => "sold",
            AuctionOutcome::Ended => "ended",
            AuctionOutcome::ReserveNotMet => "reserve_not_met",
        }
    }

    pub fn parse(s: &str) -> Option<AuctionOutcome> {
        match s {
            "active" => Some(AuctionOutcome::Active),
            "sold" => Some(AuctionOutcome::Sold),
            "ended" => Some(AuctionOutcome::Ended),
            "reserve_not_met" => Some(AuctionOutcome::ReserveNotMet),
            _ => None,
        }
    }
}

// --- Fetch ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMethod {
    Rendered,
    RawHttp,
}

/// A fetched listing page. Transient; never persisted.
#[derive(Debug, Clone)]
pub struct ListingDocument {
    pub url: String,
    pub html: String,
    pub title: Option<String>,
    pub fetch_method: FetchMethod,
}

// --- Extracted field bag ---

#[derive(Debug, Clone, Default)]
pub struct ExtractedFields {
    pub year: Extracted<i32>,
    pub make: Extracted<String>,
    pub model: Extracted<String>,
    pub trim: Extracted<String>,
    pub vin: Extracted<String>,
    pub mileage: Extracted<i64>,
    pub exterior_color: Extracted<String>,
    pub transmission: Extracted<String>,
    pub drivetrain: Extracted<String>,
    pub engine: Extracted<String>,
    pub body_style: Extracted<String>,
    pub description: Extracted<String>,
    pub location: Extracted<String>,
    pub lot_number: Extracted<String>,
    pub seller_handle: Extracted<String>,
    pub buyer_handle: Extracted<String>,
    pub image_urls: Extracted<Vec<String>>,
    pub current_bid: Extracted<i64>,
    pub high_bid: Extracted<i64>,
    pub sale_price: Extracted<i64>,
    pub bid_count: Extracted<i64>,
    pub watcher_count: Extracted<i64>,
    pub view_count: Extracted<i64>,
    pub comment_count: Extracted<i64>,
    pub outcome: Extracted<AuctionOutcome>,
    pub auction_start: Extracted<chrono::DateTime<chrono::Utc>>,
    pub auction_end: Extracted<chrono::DateTime<chrono::Utc>>,
}

// --- Extraction health ---

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldHealth {
    pub ok: bool,
    pub method: ExtractionMethod,
}

/// Per-field health report emitted by the DOM extractor. Always total over
/// the field set: a missing structural element records `ok: false`, never an
/// error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionHealth {
    pub per_field: BTreeMap<String, FieldHealth>,
}

impl ExtractionHealth {
    pub fn record(&mut self, field: &str, ok: bool, method: ExtractionMethod) {
        self.per_field
            .insert(field.to_string(), FieldHealth { ok, method });
    }

    /// Fraction of tracked fields that extracted successfully.
    pub fn overall_score(&self) -> f32 {
        if self.per_field.is_empty() {
            return 0.0;
        }
        let ok = self.per_field.values().filter(|f| f.ok).count();
        ok as f32 / self.per_field.len() as f32
    }

    pub fn is_ok(&self, field: &str) -> bool {
        self.per_field.get(field).map(|f| f.ok).unwrap_or(false)
    }
}

// --- Identity ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    BringATrailer,
    CarsAndBids,
    BarrettJackson,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::BringATrailer => "bring_a_trailer",
            Platform::CarsAndBids => "cars_and_bids",
            Platform::BarrettJackson => "barrett_jackson",
        }
    }

    pub fn parse(s: &str) -> Option<Platform> {
        match s {
            "bring_a_trailer" => Some(Platform::BringATrailer),
            "cars_and_bids" => Some(Platform::CarsAndBids),
            "barrett_jackson" => Some(Platform::BarrettJackson),
            _ => None,
        }
    }

    /// Canonical profile URL for a handle on this platform.
    pub fn profile_url(&self, handle: &str) -> String {
        match self {
            Platform::BringATrailer => format!("https://bringatrailer.com/member/{handle}/"),
            Platform::CarsAndBids => format!("https://carsandbids.com/user/{handle}"),
            Platform::BarrettJackson => {
                format!("https://www.barrett-jackson.com/bidder/{handle}")
            }
        }
    }

    /// Platform owning a listing URL, by registrable domain. Subdomains of a
    /// platform domain count; lookalike hosts that merely end in the same
    /// characters do not.
    pub fn for_listing_url(url: &str) -> Option<Platform> {
        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?.to_ascii_lowercase();
        if host_matches(&host, "bringatrailer.com") {
            Some(Platform::BringATrailer)
        } else if host_matches(&host, "carsandbids.com") {
            Some(Platform::CarsAndBids)
        } else if host_matches(&host, "barrett-jackson.com") {
            Some(Platform::BarrettJackson)
        } else {
            None
        }
    }
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

// --- Image import counters ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageImportStats {
    pub found: u32,
    pub uploaded: u32,
    pub skipped: u32,
    pub failed: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_outcomes_are_sticky() {
        assert_eq!(
            AuctionOutcome::Sold.transition(AuctionOutcome::Active),
            AuctionOutcome::Sold
        );
        assert_eq!(
            AuctionOutcome::ReserveNotMet.transition(AuctionOutcome::Active),
            AuctionOutcome::ReserveNotMet
        );
        assert_eq!(
            AuctionOutcome::Active.transition(AuctionOutcome::Sold),
            AuctionOutcome::Sold
        );
        assert_eq!(
            AuctionOutcome::Active.transition(AuctionOutcome::Ended),
            AuctionOutcome::Ended
        );
    }

    #[test]
    fn extracted_or_prefers_present() {
        let dom = Extracted::present("WDB123".to_string(), ExtractionMethod::DomTemplate, 0.9);
        let text = Extracted::present("ZZZ999".to_string(), ExtractionMethod::TextPattern, 0.5);
        assert_eq!(dom.clone().or(text.clone()), dom);
        assert_eq!(Extracted::Absent.or(text.clone()), text);
    }

    #[test]
    fn health_score_is_fraction_of_ok_fields() {
        let mut health = ExtractionHealth::default();
        health.record("title", true, ExtractionMethod::DomTemplate);
        health.record("images", true, ExtractionMethod::DomTemplate);
        health.record("lot_number", false, ExtractionMethod::DomTemplate);
        health.record("seller", false, ExtractionMethod::DomTemplate);
        assert!((health.overall_score() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn platform_from_listing_url() {
        assert_eq!(
            Platform::for_listing_url("https://bringatrailer.com/listing/1972-bmw-2002tii/"),
            Some(Platform::BringATrailer)
        );
        assert_eq!(
            Platform::for_listing_url("https://www.carsandbids.com/auctions/abc/1990-miata"),
            Some(Platform::CarsAndBids)
        );
        assert_eq!(Platform::for_listing_url("https://example.com/x"), None);
    }

    #[test]
    fn host_matching_is_exact_on_the_registrable_domain() {
        // A host that merely ends in a platform's domain string is a
        // different site.
        assert_eq!(
            Platform::for_listing_url("https://notbringatrailer.com/listing/fake/"),
            None
        );
        // An explicit port does not hide the host.
        assert_eq!(
            Platform::for_listing_url("https://bringatrailer.com:443/listing/x/"),
            Some(Platform::BringATrailer)
        );
        assert_eq!(Platform::for_listing_url("not a url"), None);
    }
}
