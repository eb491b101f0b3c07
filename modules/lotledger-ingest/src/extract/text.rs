// Regex/heuristic extraction over the full text corpus (description +
// metadata + raw HTML). Fallback and corroboration layer for the structural
// extractor. Every function here is total and pure; the clock is a parameter
// so year inference is testable.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use regex::Regex;

use lotledger_common::{AuctionOutcome, Extracted, ExtractedFields, ExtractionMethod};

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static regex")
}

// ---------------------------------------------------------------------------
// VIN
// ---------------------------------------------------------------------------

/// Window scanned after a "VIN" label for nearby candidates.
const VIN_LABEL_WINDOW: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VinReason {
    /// Found within the label window after a "VIN" marker.
    LabelProximity,
    /// Generic alphanumeric run in the corpus.
    AlnumRun,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VinCandidate {
    pub value: String,
    pub reason: VinReason,
}

/// Legal VIN charset: alphanumeric excluding I, O, Q.
pub fn is_vin_charset(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| matches!(c, 'A'..='H' | 'J'..='N' | 'P' | 'R'..='Z' | '0'..='9'))
}

/// Collect typed VIN candidates from both families, deduplicated by
/// (normalized value, reason), in first-seen order. A 17-character run in
/// either family must pass the charset check: at exactly VIN length, an
/// illegal character proves the run is not a VIN.
pub fn vin_candidates(corpus: &str) -> Vec<VinCandidate> {
    let mut out = Vec::new();
    let mut seen: HashSet<(String, VinReason)> = HashSet::new();
    let run_re = re(r"[A-Za-z0-9]{11,40}");

    // Family (a): label proximity.
    for label in re(r"(?i)\bVIN\b").find_iter(corpus) {
        let start = label.end();
        let mut end = (start + VIN_LABEL_WINDOW).min(corpus.len());
        while end < corpus.len() && !corpus.is_char_boundary(end) {
            end += 1;
        }
        for run in run_re.find_iter(&corpus[start..end]) {
            let value = run.as_str().to_ascii_uppercase();
            if value.len() == 17 && !is_vin_charset(&value) {
                continue;
            }
            if (11..=17).contains(&value.len())
                && seen.insert((value.clone(), VinReason::LabelProximity))
            {
                out.push(VinCandidate {
                    value,
                    reason: VinReason::LabelProximity,
                });
            }
        }
    }

    // Family (b): generic alphanumeric runs, filtered to VIN-plausible
    // lengths.
    for run in run_re.find_iter(corpus) {
        let value = run.as_str().to_ascii_uppercase();
        if !(11..=17).contains(&value.len()) {
            continue;
        }
        if value.len() == 17 && !is_vin_charset(&value) {
            continue;
        }
        if seen.insert((value.clone(), VinReason::AlnumRun)) {
            out.push(VinCandidate {
                value,
                reason: VinReason::AlnumRun,
            });
        }
    }

    out
}

/// Best-pick rule: first label-proximity 17-character candidate; else the
/// single longest survivor; ties broken by first-seen order. Charset-invalid
/// 17-character runs were already dropped at candidate collection.
pub fn best_vin(candidates: &[VinCandidate]) -> Option<String> {
    if let Some(c) = candidates
        .iter()
        .find(|c| c.reason == VinReason::LabelProximity && c.value.len() == 17)
    {
        return Some(c.value.clone());
    }

    let mut best: Option<&VinCandidate> = None;
    for c in candidates {
        if best.map_or(true, |b| c.value.len() > b.value.len()) {
            best = Some(c);
        }
    }
    best.map(|c| c.value.clone())
}

// ---------------------------------------------------------------------------
// Money
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoneyFields {
    pub current_bid: Option<i64>,
    pub high_bid: Option<i64>,
    pub sale_price: Option<i64>,
}

/// Dollar amounts outside this range are noise (shipping quotes, phone
/// numbers, monthly payments that slipped past the marker check).
const MONEY_MIN: i64 = 500;
const MONEY_MAX: i64 = 10_000_000;

/// Markers that flag a dollar figure as a monthly-payment estimate.
const PAYMENT_MARKERS: [&str; 3] = ["est. payment", "oac", "/mo"];

fn parse_amount(raw: &str) -> Option<i64> {
    raw.replace(',', "").parse().ok()
}

/// Label-scoped money patterns in fixed priority order; max-dollar fallback
/// over the whole corpus when none match.
pub fn extract_money(corpus: &str) -> MoneyFields {
    let mut money = MoneyFields::default();

    if let Some(cap) = re(r"(?i)sold for\s+(?:usd\s*)?\$\s*([\d,]+)").captures(corpus) {
        money.sale_price = parse_amount(&cap[1]);
        money.high_bid = money.sale_price;
    }
    if let Some(cap) = re(r"(?i)bid to\s+(?:usd\s*)?\$\s*([\d,]+)").captures(corpus) {
        money.high_bid = money.high_bid.or_else(|| parse_amount(&cap[1]));
    }
    if let Some(cap) = re(r"(?i)current bid[:\s]+(?:usd\s*)?\$\s*([\d,]+)").captures(corpus) {
        money.current_bid = parse_amount(&cap[1]);
    }
    if let Some(cap) = re(r"(?i)high bid[:\s]+(?:usd\s*)?\$\s*([\d,]+)").captures(corpus) {
        money.high_bid = money.high_bid.or_else(|| parse_amount(&cap[1]));
    }

    if money.current_bid.is_none() && money.high_bid.is_none() && money.sale_price.is_none() {
        money.high_bid = max_dollar_fallback(corpus);
    }

    money
}

/// Max `$`-prefixed number in the plausible range, skipping amounts that
/// co-occur with monthly-payment markers.
fn max_dollar_fallback(corpus: &str) -> Option<i64> {
    let lower = corpus.to_lowercase();
    let mut best: Option<i64> = None;
    for cap in re(r"\$\s*([\d,]+)").captures_iter(corpus) {
        let m = cap.get(0).expect("whole match");
        let Some(amount) = parse_amount(&cap[1]) else {
            continue;
        };
        if !(MONEY_MIN..=MONEY_MAX).contains(&amount) {
            continue;
        }
        if near_payment_marker(&lower, m.start(), m.end()) {
            continue;
        }
        if best.map_or(true, |b| amount > b) {
            best = Some(amount);
        }
    }
    best
}

fn near_payment_marker(lower: &str, start: usize, end: usize) -> bool {
    let mut w_start = start.saturating_sub(40);
    while w_start > 0 && !lower.is_char_boundary(w_start) {
        w_start -= 1;
    }
    let mut w_end = (end + 40).min(lower.len());
    while w_end < lower.len() && !lower.is_char_boundary(w_end) {
        w_end += 1;
    }
    let window = &lower[w_start..w_end];
    PAYMENT_MARKERS.iter().any(|marker| window.contains(marker))
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

/// A month/day with no explicit year more than this many days in the past is
/// assumed to belong to the next year (year-boundary imports).
const STALE_DATE_DAYS: i64 = 120;

const MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

/// Auction end date from textual month-name forms near ending anchors.
pub fn extract_end_date(corpus: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let pattern = re(
        r"(?i)(?:ending|ends|ended|bid to[^.\n]{0,60}? on|sold[^.\n]{0,60}? on)\s+(january|february|march|april|may|june|july|august|september|october|november|december)\s+(\d{1,2})(?:,?\s*(\d{4}))?",
    );
    let cap = pattern.captures(corpus)?;

    let month = MONTHS
        .iter()
        .position(|m| m.eq_ignore_ascii_case(&cap[1]))? as u32
        + 1;
    let day: u32 = cap[2].parse().ok()?;
    let explicit_year: Option<i32> = cap.get(3).and_then(|y| y.as_str().parse().ok());

    match explicit_year {
        Some(year) => Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).single(),
        None => {
            let this_year = Utc
                .with_ymd_and_hms(now.year(), month, day, 12, 0, 0)
                .single()?;
            if now - this_year > Duration::days(STALE_DATE_DAYS) {
                Utc.with_ymd_and_hms(now.year() + 1, month, day, 12, 0, 0)
                    .single()
            } else {
                Some(this_year)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Live metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveMetrics {
    pub watcher_count: Option<i64>,
    pub view_count: Option<i64>,
    pub comment_count: Option<i64>,
    pub bid_count: Option<i64>,
}

/// Marker phrase counted as a bid-count proxy when no labeled count exists.
const BID_MARKER: &str = "bid placed";

pub fn extract_metrics(corpus: &str) -> LiveMetrics {
    let labeled = |pattern: &str| -> Option<i64> {
        re(pattern)
            .captures(corpus)
            .and_then(|cap| parse_amount(&cap[1]))
    };

    let bid_count = labeled(r"(?i)([\d,]+)\s+bids\b").or_else(|| {
        // Proxy: count marker occurrences. Zero means "not found", never a
        // confirmed zero.
        let n = corpus.to_lowercase().matches(BID_MARKER).count() as i64;
        if n > 0 {
            Some(n)
        } else {
            None
        }
    });

    LiveMetrics {
        watcher_count: labeled(r"(?i)([\d,]+)\s+watchers\b"),
        view_count: labeled(r"(?i)([\d,]+)\s+views\b"),
        comment_count: labeled(r"(?i)([\d,]+)\s+comments\b")
            .or_else(|| labeled(r"(?i)comments\s*\((\d+)\)")),
        bid_count,
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Outcome signal from the result banner / corpus text.
pub fn extract_outcome(corpus: &str) -> Option<AuctionOutcome> {
    let lower = corpus.to_lowercase();
    if lower.contains("sold for") || lower.contains("sold to") {
        return Some(AuctionOutcome::Sold);
    }
    if lower.contains("reserve not met") {
        return Some(AuctionOutcome::ReserveNotMet);
    }
    // "Bid to $X on <date>" is the ended-under-reserve result line.
    if re(r"(?i)bid to\s+(?:usd\s*)?\$[\d,]+[^.\n]{0,60}\bon\b").is_match(corpus) {
        return Some(AuctionOutcome::ReserveNotMet);
    }
    if lower.contains("this auction has ended") || lower.contains("auction ended") {
        return Some(AuctionOutcome::Ended);
    }
    if lower.contains("current bid") {
        return Some(AuctionOutcome::Active);
    }
    None
}

// ---------------------------------------------------------------------------
// Title parsing
// ---------------------------------------------------------------------------

/// Marketplace suffixes cut off a listing title before year/make/model
/// parsing.
const TITLE_SUFFIXES: [&str; 4] = [
    " for sale on",
    " at no reserve",
    " | ",
    " - ",
];

/// "1972 BMW 2002tii for sale on ..." -> (1972, "BMW", "2002tii").
pub fn parse_title(title: &str) -> Option<(i32, String, String)> {
    let mut head = title;
    for suffix in TITLE_SUFFIXES {
        // ASCII lowercase keeps byte offsets aligned with the original.
        if let Some(idx) = head.to_ascii_lowercase().find(suffix) {
            head = &head[..idx];
        }
    }

    let tokens: Vec<&str> = head.split_whitespace().collect();
    let year_idx = tokens.iter().position(|t| {
        t.len() == 4 && t.parse::<i32>().map_or(false, |y| (1900..=2035).contains(&y))
    })?;
    let year: i32 = tokens[year_idx].parse().ok()?;
    let make = tokens.get(year_idx + 1)?.to_string();
    let model_tokens = &tokens[year_idx + 2..];
    if model_tokens.is_empty() {
        return None;
    }
    Some((year, make, model_tokens.join(" ")))
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

/// Run every text-pattern extractor over the corpus and pack the results
/// into an `ExtractedFields` bag (TextPattern / TitleParse methods).
pub fn extract_from_text(
    corpus: &str,
    title: Option<&str>,
    now: DateTime<Utc>,
) -> ExtractedFields {
    let mut fields = ExtractedFields::default();

    if let Some(vin) = best_vin(&vin_candidates(corpus)) {
        let confidence = if vin.len() == 17 && is_vin_charset(&vin) {
            0.85
        } else {
            0.5
        };
        fields.vin = Extracted::present(vin, ExtractionMethod::TextPattern, confidence);
    }

    let money = extract_money(corpus);
    if let Some(v) = money.current_bid {
        fields.current_bid = Extracted::present(v, ExtractionMethod::TextPattern, 0.8);
    }
    if let Some(v) = money.high_bid {
        let confidence = if money.sale_price.is_some() { 0.85 } else { 0.75 };
        fields.high_bid = Extracted::present(v, ExtractionMethod::TextPattern, confidence);
    }
    if let Some(v) = money.sale_price {
        fields.sale_price = Extracted::present(v, ExtractionMethod::TextPattern, 0.85);
    }

    let metrics = extract_metrics(corpus);
    if let Some(v) = metrics.watcher_count {
        fields.watcher_count = Extracted::present(v, ExtractionMethod::TextPattern, 0.7);
    }
    if let Some(v) = metrics.view_count {
        fields.view_count = Extracted::present(v, ExtractionMethod::TextPattern, 0.7);
    }
    if let Some(v) = metrics.comment_count {
        fields.comment_count = Extracted::present(v, ExtractionMethod::TextPattern, 0.7);
    }
    if let Some(v) = metrics.bid_count {
        fields.bid_count = Extracted::present(v, ExtractionMethod::TextPattern, 0.6);
    }

    if let Some(outcome) = extract_outcome(corpus) {
        fields.outcome = Extracted::present(outcome, ExtractionMethod::TextPattern, 0.75);
    }

    if let Some(end) = extract_end_date(corpus, now) {
        fields.auction_end = Extracted::present(end, ExtractionMethod::TextPattern, 0.6);
    }

    if let Some(cap) = re(r"(?i)\bsold to\s+([A-Za-z0-9_\-]{2,40})").captures(corpus) {
        fields.buyer_handle =
            Extracted::present(cap[1].to_string(), ExtractionMethod::TextPattern, 0.6);
    }

    if let Some((year, make, model)) = title.and_then(parse_title) {
        fields.year = Extracted::present(year, ExtractionMethod::TitleParse, 0.8);
        fields.make = Extracted::present(make, ExtractionMethod::TitleParse, 0.7);
        fields.model = Extracted::present(model, ExtractionMethod::TitleParse, 0.7);
    }

    fields
}
