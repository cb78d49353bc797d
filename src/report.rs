//! Ensemble reporting over independently produced detections.
//!
//! Nothing here feeds back into a detector; the report only reads the scored
//! batch and the raw records it came from.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::info;

use crate::config::DetectorKind;
use crate::csv_reader::TransactionBatch;
use crate::error::{FraudError, Result};
use crate::features::{FeatureTable, UNKNOWN};
use crate::pipeline::ScoredBatch;

pub const TOP_VALUES: usize = 5;

/// Thresholds for the rule-of-thumb pattern counts.
pub const MANY_CARDS_PER_CUSTOMER: f64 = 3.0;
pub const MANY_ZIPS_PER_CARD: f64 = 2.0;
pub const HEAVY_CARD_USE: f64 = 10.0;
pub const SHARED_CARD_USERS: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueCount {
    pub value: String,
    pub count: usize,
}

/// Location and email characteristics of one detector's flagged rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectorSummary {
    pub detector: DetectorKind,
    pub flagged: usize,
    pub rate: f64,
    pub unique_countries: usize,
    pub unique_states: usize,
    pub unique_domains: usize,
    pub top_countries: Vec<ValueCount>,
    pub top_states: Vec<ValueCount>,
    pub top_domains: Vec<ValueCount>,
    /// Categorical values at least twice as frequent among flagged rows as among the rest.
    pub overrepresented: Vec<Overrepresented>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overrepresented {
    pub field: &'static str,
    pub value: String,
    pub flagged_share: f64,
    pub normal_share: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Overlap {
    pub first: DetectorKind,
    pub second: DetectorKind,
    pub first_flagged: usize,
    pub second_flagged: usize,
    pub both: usize,
}

/// Mean and sample standard deviation of one group; `None` when undefined.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GroupStats {
    pub mean: Option<f64>,
    pub std: Option<f64>,
}

impl GroupStats {
    fn of(values: &[f64]) -> Self {
        let n = values.len();
        if n == 0 {
            return Self { mean: None, std: None };
        }
        let mean = values.iter().sum::<f64>() / n as f64;
        let std = (n > 1).then(|| {
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
            var.sqrt()
        });
        Self { mean: Some(mean), std }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureProfile {
    pub feature: &'static str,
    pub normal: GroupStats,
    pub flagged: GroupStats,
}

/// Rows matching each rule over the whole batch. `None` when the feature
/// behind a rule was not computed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SuspiciousPatterns {
    pub multiple_cards_per_customer: Option<usize>,
    pub multiple_addresses_per_card: Option<usize>,
    pub high_frequency_cards: Option<usize>,
    pub multiple_users_per_card: Option<usize>,
}

impl SuspiciousPatterns {
    pub fn from_features(features: &FeatureTable) -> Self {
        let above = |name: &str, limit: f64| {
            features
                .column(name)
                .map(|values| values.iter().filter(|v| **v > limit).count())
        };
        Self {
            multiple_cards_per_customer: above("cards_per_customer", MANY_CARDS_PER_CUSTOMER),
            multiple_addresses_per_card: above("addresses_per_card", MANY_ZIPS_PER_CARD),
            high_frequency_cards: above("transactions_per_card", HEAVY_CARD_USE),
            multiple_users_per_card: above("users_per_card", SHARED_CARD_USERS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectorReport {
    pub summary: DetectorSummary,
    pub flagged_rows: Vec<usize>,
    pub profile: Vec<FeatureProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnsembleReport {
    pub total_records: usize,
    pub detectors: Vec<DetectorReport>,
    pub overlaps: Vec<Overlap>,
    pub patterns: SuspiciousPatterns,
}

impl EnsembleReport {
    pub fn build(batch: &TransactionBatch, scored: &ScoredBatch) -> Result<Self> {
        let total = scored.n_rows();
        if batch.len() != total {
            return Err(FraudError::RowMismatch {
                expected: batch.len(),
                actual: total,
            });
        }

        let countries = categorical_or_unknown(&scored.features, "address_country", total);
        let states = categorical_or_unknown(&scored.features, "address_state", total);
        let domains = categorical_or_unknown(&scored.features, "email_domain", total);
        let cities = scored.features.categorical("address_city");

        let mut detectors = Vec::with_capacity(scored.detections.len());
        for (kind, detection) in &scored.detections {
            detection.ensure_rows(total)?;
            let flags = &detection.flags;
            let flagged_rows = detection.flagged_indices();
            let flagged = flagged_rows.len();

            let mut overrepresented = Vec::new();
            for (field, column) in [
                ("address_state", Some(states.as_slice())),
                ("address_city", cities),
                ("address_country", Some(countries.as_slice())),
            ] {
                if let Some(column) = column {
                    overrepresented.extend(overrepresented_values(field, column, flags));
                }
            }

            let summary = DetectorSummary {
                detector: *kind,
                flagged,
                rate: if total == 0 { 0.0 } else { flagged as f64 / total as f64 },
                unique_countries: distinct(&countries, &flagged_rows),
                unique_states: distinct(&states, &flagged_rows),
                unique_domains: distinct(&domains, &flagged_rows),
                top_countries: top_values(&countries, &flagged_rows, TOP_VALUES),
                top_states: top_values(&states, &flagged_rows, TOP_VALUES),
                top_domains: top_values(&domains, &flagged_rows, TOP_VALUES),
                overrepresented,
            };
            info!(detector = kind.name(), flagged, rate = summary.rate, "summarized detector");

            detectors.push(DetectorReport {
                summary,
                profile: feature_profile(&scored.features, flags),
                flagged_rows,
            });
        }

        let mut overlaps = Vec::new();
        for (i, (first, a)) in scored.detections.iter().enumerate() {
            for (second, b) in &scored.detections[i + 1..] {
                let both = a.flags.iter().zip(&b.flags).filter(|(x, y)| **x && **y).count();
                overlaps.push(Overlap {
                    first: *first,
                    second: *second,
                    first_flagged: a.flagged(),
                    second_flagged: b.flagged(),
                    both,
                });
            }
        }

        Ok(Self {
            total_records: total,
            detectors,
            overlaps,
            patterns: SuspiciousPatterns::from_features(&scored.features),
        })
    }

    pub fn detector(&self, kind: DetectorKind) -> Option<&DetectorReport> {
        self.detectors.iter().find(|d| d.summary.detector == kind)
    }

    /// Indices of the rows `kind` flagged, in record order.
    pub fn subset(&self, kind: DetectorKind) -> Option<&[usize]> {
        self.detector(kind).map(|d| d.flagged_rows.as_slice())
    }

    pub fn overlap(&self, a: DetectorKind, b: DetectorKind) -> Option<&Overlap> {
        self.overlaps
            .iter()
            .find(|o| (o.first == a && o.second == b) || (o.first == b && o.second == a))
    }
}

fn categorical_or_unknown(features: &FeatureTable, field: &str, n_rows: usize) -> Vec<String> {
    features
        .categorical(field)
        .map(<[String]>::to_vec)
        .unwrap_or_else(|| vec![UNKNOWN.to_string(); n_rows])
}

fn distinct(column: &[String], rows: &[usize]) -> usize {
    rows.iter().map(|&i| column[i].as_str()).collect::<HashSet<_>>().len()
}

/// Most frequent values among `rows`, ties broken alphabetically.
fn top_values(column: &[String], rows: &[usize], limit: usize) -> Vec<ValueCount> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for &i in rows {
        *counts.entry(column[i].as_str()).or_default() += 1;
    }
    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(limit)
        .map(|(value, count)| ValueCount {
            value: value.to_string(),
            count,
        })
        .collect()
}

fn shares<'a>(column: &'a [String], flags: &[bool], flagged: bool) -> HashMap<&'a str, f64> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut total = 0usize;
    for (value, _) in column.iter().zip(flags).filter(|(_, f)| **f == flagged) {
        *counts.entry(value.as_str()).or_default() += 1;
        total += 1;
    }
    counts
        .into_iter()
        .map(|(v, c)| (v, c as f64 / total as f64))
        .collect()
}

fn overrepresented_values(field: &'static str, column: &[String], flags: &[bool]) -> Vec<Overrepresented> {
    let flagged = shares(column, flags, true);
    let normal = shares(column, flags, false);
    let mut out: Vec<Overrepresented> = flagged
        .into_iter()
        .filter_map(|(value, flagged_share)| {
            let normal_share = normal.get(value).copied().unwrap_or(0.0);
            (flagged_share > 2.0 * normal_share).then(|| Overrepresented {
                field,
                value: value.to_string(),
                flagged_share,
                normal_share,
            })
        })
        .collect();
    out.sort_by(|a, b| a.value.cmp(&b.value));
    out
}

fn feature_profile(features: &FeatureTable, flags: &[bool]) -> Vec<FeatureProfile> {
    features
        .numeric
        .iter()
        .map(|column| {
            let (flagged, normal): (Vec<(f64, bool)>, Vec<(f64, bool)>) = column
                .values
                .iter()
                .copied()
                .zip(flags.iter().copied())
                .partition(|(_, f)| *f);
            let values = |group: Vec<(f64, bool)>| group.into_iter().map(|(v, _)| v).collect::<Vec<_>>();
            FeatureProfile {
                feature: column.name,
                normal: GroupStats::of(&values(normal)),
                flagged: GroupStats::of(&values(flagged)),
            }
        })
        .collect()
}
