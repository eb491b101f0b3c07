// Field-level consensus rules for writing extracted data onto a matched
// vehicle record. Pure: the decision runs against the snapshot the matcher
// returned, and the store re-checks ratchet/outcome guards in SQL.

use lotledger_common::{Extracted, ExtractedFields};
use lotledger_store::{ProvenanceEntry, VehicleMutation, VehicleRecord};

/// Minimum length for a description to be considered curated rather than an
/// auto-extracted snippet. New descriptions must exceed it; existing
/// descriptions at or above it are never overwritten.
const DESCRIPTION_FLOOR: usize = 40;

/// Upper bound for a sane make/model string.
const IDENTITY_MAX_LEN: usize = 32;

/// Boilerplate fragments that mark an identity field as polluted by listing
/// copy rather than holding an actual make/model.
const IDENTITY_BOILERPLATE: [&str; 4] = ["no reserve", "for sale", "lot #", "auction"];

#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub mutation: VehicleMutation,
    pub provenance: Vec<ProvenanceEntry>,
    /// Fields skipped because the new value conflicted with trusted data
    /// (currently only VIN). Logged by the caller.
    pub conflicts: Vec<String>,
}

/// Existing make/model strings that fail this heuristic are eligible for
/// repair; anything that passes is left untouched even when the new
/// extraction differs, so correct data never flaps.
pub fn identity_looks_wrong(value: &str) -> bool {
    let lower = value.to_lowercase();
    lower.contains("mile")
        || lower.contains(" km")
        || value.len() > IDENTITY_MAX_LEN
        || IDENTITY_BOILERPLATE.iter().any(|b| lower.contains(b))
}

pub fn year_looks_wrong(year: i32) -> bool {
    !(1885..=2035).contains(&year)
}

pub fn merge(existing: &VehicleRecord, extracted: &ExtractedFields, source_url: &str) -> MergeOutcome {
    let mut out = MergeOutcome::default();

    // --- Identity-repair fields ---
    if let Extracted::Present { value, method, confidence } = &extracted.year {
        let repairable = existing.year.map_or(true, year_looks_wrong);
        if repairable && !year_looks_wrong(*value) {
            out.mutation.year = Some(*value);
            out.provenance.push(entry("year", &value.to_string(), *method, *confidence, source_url));
        }
    }
    string_repair(&mut out, "make", existing.make.as_deref(), &extracted.make, source_url);
    string_repair(&mut out, "model", existing.model.as_deref(), &extracted.model, source_url);

    // --- Fill-if-empty fields ---
    string_fill(&mut out, "trim", existing.trim.as_deref(), &extracted.trim, source_url,
        |m, v| m.trim = Some(v));
    string_fill(&mut out, "exterior_color", existing.exterior_color.as_deref(),
        &extracted.exterior_color, source_url, |m, v| m.exterior_color = Some(v));
    string_fill(&mut out, "transmission", existing.transmission.as_deref(),
        &extracted.transmission, source_url, |m, v| m.transmission = Some(v));
    string_fill(&mut out, "drivetrain", existing.drivetrain.as_deref(),
        &extracted.drivetrain, source_url, |m, v| m.drivetrain = Some(v));
    string_fill(&mut out, "engine", existing.engine.as_deref(), &extracted.engine, source_url,
        |m, v| m.engine = Some(v));
    string_fill(&mut out, "body_style", existing.body_style.as_deref(),
        &extracted.body_style, source_url, |m, v| m.body_style = Some(v));
    string_fill(&mut out, "location", existing.location.as_deref(), &extracted.location,
        source_url, |m, v| m.location = Some(v));
    string_fill(&mut out, "lot_number", existing.lot_number.as_deref(),
        &extracted.lot_number, source_url, |m, v| m.lot_number = Some(v));

    if let Extracted::Present { value, method, confidence } = &extracted.mileage {
        if *value > 0 && existing.mileage.is_none() {
            out.mutation.mileage = Some(*value);
            out.provenance.push(entry("mileage", &value.to_string(), *method, *confidence, source_url));
        }
    }

    // --- Description: upgrade-only law ---
    if let Extracted::Present { value, method, confidence } = &extracted.description {
        let existing_len = existing.description.as_deref().map_or(0, str::len);
        if value.len() > DESCRIPTION_FLOOR && existing_len < DESCRIPTION_FLOOR {
            out.mutation.description = Some(value.clone());
            out.provenance.push(entry(
                "description",
                &format!("{} chars", value.len()),
                *method,
                *confidence,
                source_url,
            ));
        }
    }

    // --- VIN: write-once, never silently overwrite a conflicting value ---
    if let Extracted::Present { value, method, confidence } = &extracted.vin {
        match existing.vin.as_deref() {
            None => {
                out.mutation.vin = Some(value.clone());
                out.provenance.push(entry("vin", value, *method, *confidence, source_url));
            }
            Some(current) if current == value => {}
            Some(current) => {
                out.conflicts.push(format!("vin: existing {current} vs extracted {value}"));
            }
        }
    }

    // --- Outcome: sticky terminal states ---
    if let Extracted::Present { value, method, confidence } = &extracted.outcome {
        let current = existing.outcome();
        let next = current.transition(*value);
        if next != current {
            out.mutation.sale_status = Some(next.as_str().to_string());
            out.provenance.push(entry("sale_status", next.as_str(), *method, *confidence, source_url));
        }
    }

    // --- Numeric ratchets ---
    let high_bid_candidate = extracted
        .sale_price
        .clone()
        .or(extracted.high_bid.clone())
        .or(extracted.current_bid.clone());
    ratchet(&mut out, "high_bid", existing.high_bid, &high_bid_candidate, source_url,
        |m, v| m.high_bid = Some(v));
    ratchet(&mut out, "bid_count", existing.bid_count, &extracted.bid_count, source_url,
        |m, v| m.bid_count = Some(v));
    ratchet(&mut out, "watcher_count", existing.watcher_count, &extracted.watcher_count,
        source_url, |m, v| m.watcher_count = Some(v));
    ratchet(&mut out, "view_count", existing.view_count, &extracted.view_count, source_url,
        |m, v| m.view_count = Some(v));
    ratchet(&mut out, "comment_count", existing.comment_count, &extracted.comment_count,
        source_url, |m, v| m.comment_count = Some(v));

    // --- Images: trusted extractor output replaces, but never empties ---
    if let Extracted::Present { value, method, confidence } = &extracted.image_urls {
        if !value.is_empty() && existing.image_urls.0 != *value {
            out.provenance.push(entry(
                "image_urls",
                &format!("{} images", value.len()),
                *method,
                *confidence,
                source_url,
            ));
            out.mutation.image_urls = Some(value.clone());
        }
    }

    // --- Auction dates: fill-if-empty ---
    if let Extracted::Present { value, method, confidence } = &extracted.auction_start {
        if existing.auction_start.is_none() {
            out.mutation.auction_start = Some(*value);
            out.provenance.push(entry("auction_start", &value.to_rfc3339(), *method, *confidence, source_url));
        }
    }
    if let Extracted::Present { value, method, confidence } = &extracted.auction_end {
        if existing.auction_end.is_none() {
            out.mutation.auction_end = Some(*value);
            out.provenance.push(entry("auction_end", &value.to_rfc3339(), *method, *confidence, source_url));
        }
    }

    out
}

fn entry(
    field: &str,
    value: &str,
    method: lotledger_common::ExtractionMethod,
    confidence: f32,
    source_url: &str,
) -> ProvenanceEntry {
    ProvenanceEntry {
        field: field.to_string(),
        value: value.to_string(),
        method,
        confidence,
        source_url: source_url.to_string(),
    }
}

/// Write a string field only when the record has nothing there yet. A
/// non-empty existing value is never replaced, and an empty extraction never
/// lands.
fn string_fill(
    out: &mut MergeOutcome,
    name: &str,
    existing: Option<&str>,
    new: &Extracted<String>,
    source_url: &str,
    set: impl FnOnce(&mut VehicleMutation, String),
) {
    if let Extracted::Present { value, method, confidence } = new {
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        if existing.map_or(true, |e| e.trim().is_empty()) {
            set(&mut out.mutation, value.to_string());
            out.provenance.push(entry(name, value, *method, *confidence, source_url));
        }
    }
}

/// Identity fields (make/model): repaired only when the existing value fails
/// the looks-wrong heuristic; a plausible existing value is never touched.
fn string_repair(
    out: &mut MergeOutcome,
    name: &str,
    existing: Option<&str>,
    new: &Extracted<String>,
    source_url: &str,
) {
    if let Extracted::Present { value, method, confidence } = new {
        let value = value.trim();
        if value.is_empty() || identity_looks_wrong(value) {
            return;
        }
        let repairable = existing.map_or(true, |e| e.trim().is_empty() || identity_looks_wrong(e));
        if repairable {
            match name {
                "make" => out.mutation.make = Some(value.to_string()),
                "model" => out.mutation.model = Some(value.to_string()),
                _ => unreachable!("string_repair only handles make/model"),
            }
            out.provenance.push(entry(name, value, *method, *confidence, source_url));
        }
    }
}

/// Monotonically non-decreasing counters: a present, positive value is
/// written only when it exceeds what is already recorded.
fn ratchet(
    out: &mut MergeOutcome,
    name: &str,
    existing: Option<i64>,
    new: &Extracted<i64>,
    source_url: &str,
    set: impl FnOnce(&mut VehicleMutation, i64),
) {
    if let Extracted::Present { value, method, confidence } = new {
        if *value > 0 && existing.map_or(true, |e| *value > e) {
            set(&mut out.mutation, *value);
            out.provenance.push(entry(name, &value.to_string(), *method, *confidence, source_url));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::blank_vehicle;
    use lotledger_common::{AuctionOutcome, ExtractionMethod};

    const URL: &str = "https://bringatrailer.com/listing/test/";

    fn present_str(v: &str) -> Extracted<String> {
        Extracted::present(v.to_string(), ExtractionMethod::TextPattern, 0.8)
    }

    #[test]
    fn short_description_never_clobbers_long_one() {
        let mut existing = blank_vehicle();
        existing.description = Some("x".repeat(200));

        let mut extracted = ExtractedFields::default();
        extracted.description = present_str(&"y".repeat(35));

        let out = merge(&existing, &extracted, URL);
        assert!(out.mutation.description.is_none());
    }

    #[test]
    fn long_description_upgrades_short_one() {
        let mut existing = blank_vehicle();
        existing.description = Some("short blurb".to_string());

        let mut extracted = ExtractedFields::default();
        let long = "a".repeat(200);
        extracted.description = present_str(&long);

        let out = merge(&existing, &extracted, URL);
        assert_eq!(out.mutation.description.as_deref(), Some(long.as_str()));
    }

    #[test]
    fn long_description_never_replaces_another_long_one() {
        let mut existing = blank_vehicle();
        existing.description = Some("z".repeat(150));

        let mut extracted = ExtractedFields::default();
        extracted.description = present_str(&"a".repeat(500));

        let out = merge(&existing, &extracted, URL);
        assert!(out.mutation.description.is_none());
    }

    #[test]
    fn smaller_bid_count_never_overwrites_larger() {
        let mut existing = blank_vehicle();
        existing.bid_count = Some(7);

        let mut extracted = ExtractedFields::default();
        extracted.bid_count = Extracted::present(3, ExtractionMethod::TextPattern, 0.6);

        let out = merge(&existing, &extracted, URL);
        assert!(out.mutation.bid_count.is_none());
    }

    #[test]
    fn larger_bid_count_ratchets_up() {
        let mut existing = blank_vehicle();
        existing.bid_count = Some(7);

        let mut extracted = ExtractedFields::default();
        extracted.bid_count = Extracted::present(12, ExtractionMethod::TextPattern, 0.6);

        let out = merge(&existing, &extracted, URL);
        assert_eq!(out.mutation.bid_count, Some(12));
    }

    #[test]
    fn zero_counts_are_never_written() {
        let existing = blank_vehicle();
        let mut extracted = ExtractedFields::default();
        extracted.watcher_count = Extracted::present(0, ExtractionMethod::TextPattern, 0.6);

        let out = merge(&existing, &extracted, URL);
        assert!(out.mutation.watcher_count.is_none());
    }

    #[test]
    fn terminal_outcome_survives_stale_active_reading() {
        let mut existing = blank_vehicle();
        existing.sale_status = "sold".to_string();

        let mut extracted = ExtractedFields::default();
        extracted.outcome =
            Extracted::present(AuctionOutcome::Active, ExtractionMethod::TextPattern, 0.7);

        let out = merge(&existing, &extracted, URL);
        assert!(out.mutation.sale_status.is_none());
    }

    #[test]
    fn active_moves_to_sold() {
        let existing = blank_vehicle();
        let mut extracted = ExtractedFields::default();
        extracted.outcome =
            Extracted::present(AuctionOutcome::Sold, ExtractionMethod::TextPattern, 0.8);

        let out = merge(&existing, &extracted, URL);
        assert_eq!(out.mutation.sale_status.as_deref(), Some("sold"));
    }

    #[test]
    fn vin_written_once_and_conflicts_reported() {
        let existing = blank_vehicle();
        let mut extracted = ExtractedFields::default();
        extracted.vin = present_str("1HGCM82633A004352");

        let out = merge(&existing, &extracted, URL);
        assert_eq!(out.mutation.vin.as_deref(), Some("1HGCM82633A004352"));

        let mut with_vin = blank_vehicle();
        with_vin.vin = Some("WDBBA48D8KA094352".to_string());
        let out = merge(&with_vin, &extracted, URL);
        assert!(out.mutation.vin.is_none());
        assert_eq!(out.conflicts.len(), 1);

        // Re-extracting the same VIN is a no-op, not a conflict.
        let mut same = blank_vehicle();
        same.vin = Some("1HGCM82633A004352".to_string());
        let out = merge(&same, &extracted, URL);
        assert!(out.mutation.vin.is_none());
        assert!(out.conflicts.is_empty());
    }

    #[test]
    fn plausible_make_is_never_flapped() {
        let mut existing = blank_vehicle();
        existing.make = Some("BMW".to_string());

        let mut extracted = ExtractedFields::default();
        extracted.make = present_str("Bavarian Motor Works");

        let out = merge(&existing, &extracted, URL);
        assert!(out.mutation.make.is_none());
    }

    #[test]
    fn polluted_make_is_repaired() {
        let mut existing = blank_vehicle();
        existing.make = Some("41,000 Miles Shown".to_string());

        let mut extracted = ExtractedFields::default();
        extracted.make = present_str("BMW");

        let out = merge(&existing, &extracted, URL);
        assert_eq!(out.mutation.make.as_deref(), Some("BMW"));
    }

    #[test]
    fn implausible_extraction_never_lands_on_identity_fields() {
        let existing = blank_vehicle();
        let mut extracted = ExtractedFields::default();
        extracted.make = present_str("For Sale at No Reserve Auction");

        let out = merge(&existing, &extracted, URL);
        assert!(out.mutation.make.is_none());
    }

    #[test]
    fn bogus_year_is_rejected() {
        let existing = blank_vehicle();
        let mut extracted = ExtractedFields::default();
        extracted.year = Extracted::present(12, ExtractionMethod::TextPattern, 0.4);

        let out = merge(&existing, &extracted, URL);
        assert!(out.mutation.year.is_none());
    }

    #[test]
    fn provenance_rows_match_written_fields() {
        let existing = blank_vehicle();
        let mut extracted = ExtractedFields::default();
        extracted.vin = present_str("1HGCM82633A004352");
        extracted.bid_count = Extracted::present(4, ExtractionMethod::TextPattern, 0.6);
        extracted.make = present_str("BMW");

        let out = merge(&existing, &extracted, URL);
        let written: Vec<&str> = out.provenance.iter().map(|p| p.field.as_str()).collect();
        assert_eq!(written, vec!["make", "vin", "bid_count"]);
    }

    #[test]
    fn sale_price_feeds_high_bid_ratchet() {
        let mut existing = blank_vehicle();
        existing.high_bid = Some(15_000);

        let mut extracted = ExtractedFields::default();
        extracted.sale_price = Extracted::present(20_500, ExtractionMethod::TextPattern, 0.85);

        let out = merge(&existing, &extracted, URL);
        assert_eq!(out.mutation.high_bid, Some(20_500));
    }

    #[test]
    fn empty_extraction_is_a_no_op() {
        let mut existing = blank_vehicle();
        existing.make = Some("BMW".to_string());
        existing.description = Some("d".repeat(100));

        let out = merge(&existing, &ExtractedFields::default(), URL);
        assert!(out.mutation.is_empty());
        assert!(out.provenance.is_empty());
    }
}
