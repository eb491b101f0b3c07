use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use lotledger_common::ExtractedFields;
use lotledger_store::VehicleRecord;

use crate::traits::LotStore;

/// Which strategy in the ordered chain produced the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    SourceUrl,
    AliasUrl,
    Vin,
    Fuzzy,
}

impl MatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStrategy::SourceUrl => "source_url",
            MatchStrategy::AliasUrl => "alias_url",
            MatchStrategy::Vin => "vin",
            MatchStrategy::Fuzzy => "fuzzy",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchResult {
    pub vehicle: VehicleRecord,
    pub strategy: MatchStrategy,
}

/// Ordered, short-circuiting strategy chain resolving a listing to at most
/// one canonical vehicle. Fuzzy matching is opt-in per request: it is the
/// dominant source of cross-vehicle contamination, so it never runs by
/// default.
pub struct VehicleMatcher {
    store: Arc<dyn LotStore>,
}

impl VehicleMatcher {
    pub fn new(store: Arc<dyn LotStore>) -> Self {
        Self { store }
    }

    pub async fn find(
        &self,
        source_url: &str,
        extracted: &ExtractedFields,
        allow_fuzzy: bool,
    ) -> Result<Option<MatchResult>> {
        if let Some(vehicle) = self.store.vehicle_by_source_url(source_url).await? {
            return Ok(Some(hit(vehicle, MatchStrategy::SourceUrl)));
        }

        if let Some(vehicle) = self.store.vehicle_by_alias_url(source_url).await? {
            return Ok(Some(hit(vehicle, MatchStrategy::AliasUrl)));
        }

        if let Some(vin) = extracted.vin.value() {
            if let Some(vehicle) = self.store.vehicle_by_vin(vin).await? {
                return Ok(Some(hit(vehicle, MatchStrategy::Vin)));
            }
        }

        if allow_fuzzy {
            if let (Some(year), Some(make), Some(model)) = (
                extracted.year.value(),
                extracted.make.value(),
                extracted.model.value(),
            ) {
                if let Some(token) = model.split_whitespace().next() {
                    if let Some(vehicle) = self.store.vehicle_fuzzy(*year, make, token).await? {
                        info!(
                            source_url,
                            vehicle_id = %vehicle.id,
                            "Fuzzy match accepted (opt-in)"
                        );
                        return Ok(Some(hit(vehicle, MatchStrategy::Fuzzy)));
                    }
                }
            }
        }

        Ok(None)
    }
}

fn hit(vehicle: VehicleRecord, strategy: MatchStrategy) -> MatchResult {
    MatchResult { vehicle, strategy }
}
