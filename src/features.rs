//! Batch-relative feature engineering.
//!
//! Every aggregate is computed over the whole batch, so a record's features
//! depend on which other records arrived with it. Missing categorical values
//! are replaced by sentinels *before* grouping; the sentinel then forms its
//! own group instead of being dropped.

use std::collections::{HashMap, HashSet};

use chrono::{Datelike, Local, NaiveDate};
use tracing::{debug, info};

use crate::csv_reader::{Transaction, TransactionBatch, REQUIRED_COLUMNS};
use crate::error::Result;

pub const UNKNOWN: &str = "Unknown";
pub const UNKNOWN_EMAIL: &str = "unknown@unknown.com";
pub const UNKNOWN_DOMAIN: &str = "unknown";
pub const DEFAULT_EXP_MONTH: f64 = 1.0;

/// Aggregate applied to a group of rows sharing a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    /// Rows per group.
    Count,
    /// Distinct non-null values of another field per group.
    NUnique,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureColumn {
    pub name: &'static str,
    pub values: Vec<f64>,
}

/// String column handed to the categorical encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoricalColumn {
    pub field: &'static str,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub numeric: Vec<FeatureColumn>,
    pub categorical: Vec<CategoricalColumn>,
    n_rows: usize,
}

impl FeatureTable {
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.numeric
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.values.as_slice())
    }

    pub fn categorical(&self, field: &str) -> Option<&[String]> {
        self.categorical
            .iter()
            .find(|c| c.field == field)
            .map(|c| c.values.as_slice())
    }

    /// Column names in matrix order: numeric features, then encoded categoricals.
    pub fn layout(&self) -> Vec<&'static str> {
        self.numeric
            .iter()
            .map(|c| c.name)
            .chain(self.categorical.iter().map(|c| c.field))
            .collect()
    }

    fn push(&mut self, name: &'static str, values: Vec<f64>) {
        debug_assert_eq!(values.len(), self.n_rows);
        self.numeric.push(FeatureColumn { name, values });
    }
}

/// Applies `aggregate` per group of `keys`. `values` is only read by `NUnique`.
pub fn aggregate(aggregate: Aggregate, keys: &[&str], values: &[Option<&str>]) -> Vec<f64> {
    match aggregate {
        Aggregate::Count => {
            let mut counts: HashMap<&str, usize> = HashMap::new();
            for &key in keys {
                *counts.entry(key).or_default() += 1;
            }
            keys.iter().map(|k| counts[k] as f64).collect()
        }
        Aggregate::NUnique => {
            let mut distinct: HashMap<&str, HashSet<&str>> = HashMap::new();
            for (&key, &value) in keys.iter().zip(values) {
                let set = distinct.entry(key).or_default();
                if let Some(v) = value {
                    set.insert(v);
                }
            }
            keys.iter().map(|k| distinct[k].len() as f64).collect()
        }
    }
}

/// Text after the last `@`, or `"unknown"` when the address has none.
pub fn email_domain(email: &str) -> &str {
    match email.rsplit_once('@') {
        Some((_, domain)) if !domain.is_empty() => domain,
        _ => UNKNOWN_DOMAIN,
    }
}

/// Parses an expiry month; anything outside 1..=12 falls back to January.
pub fn parse_exp_month(raw: Option<&str>) -> f64 {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|m| m.is_finite() && (1.0..=12.0).contains(m))
        .unwrap_or(DEFAULT_EXP_MONTH)
}

/// Parses an expiry year; unparseable text falls back to `reference_year`.
pub fn parse_exp_year(raw: Option<&str>, reference_year: i32) -> f64 {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|y| y.is_finite() && *y > 0.0)
        .unwrap_or(reference_year as f64)
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn keyed<'a>(records: &'a [Transaction], field: fn(&Transaction) -> &Option<String>) -> Vec<&'a str> {
    records
        .iter()
        .map(|t| present(field(t)).unwrap_or(UNKNOWN))
        .collect()
}

fn nullable<'a>(
    records: &'a [Transaction],
    field: fn(&Transaction) -> &Option<String>,
) -> Vec<Option<&'a str>> {
    records.iter().map(|t| present(field(t))).collect()
}

fn flag_above_one(values: Vec<f64>) -> Vec<f64> {
    values
        .into_iter()
        .map(|v| if v > 1.0 { 1.0 } else { 0.0 })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct FeatureEngine {
    reference: NaiveDate,
}

impl FeatureEngine {
    /// `reference` is the "current date" used for expiry features.
    pub fn new(reference: NaiveDate) -> Self {
        Self { reference }
    }

    pub fn today() -> Self {
        Self::new(Local::now().date_naive())
    }

    pub fn reference(&self) -> NaiveDate {
        self.reference
    }

    pub fn compute(&self, batch: &TransactionBatch) -> Result<FeatureTable> {
        batch.schema.require(&REQUIRED_COLUMNS)?;

        let records = &batch.records;
        let schema = &batch.schema;
        let mut table = FeatureTable {
            numeric: Vec::new(),
            categorical: Vec::new(),
            n_rows: records.len(),
        };

        let cards = keyed(records, |t| &t.card_number);
        let card_values = nullable(records, |t| &t.card_number);
        let states = keyed(records, |t| &t.address_state);
        let countries = keyed(records, |t| &t.address_country);
        let emails: Vec<&str> = records
            .iter()
            .map(|t| present(&t.email).unwrap_or(UNKNOWN_EMAIL))
            .collect();
        let domains: Vec<&str> = emails.iter().map(|e| email_domain(e)).collect();

        let customers = schema.has("customer_id").then(|| keyed(records, |t| &t.customer_id));
        let users = schema.has("user_id").then(|| {
            (keyed(records, |t| &t.user_id), nullable(records, |t| &t.user_id))
        });
        let zips = schema.has("address_zip").then(|| {
            (keyed(records, |t| &t.address_zip), nullable(records, |t| &t.address_zip))
        });

        table.push("transactions_per_card", aggregate(Aggregate::Count, &cards, &[]));
        if let Some(customers) = &customers {
            table.push(
                "transactions_per_customer",
                aggregate(Aggregate::Count, customers, &[]),
            );
        }
        table.push("transactions_per_state", aggregate(Aggregate::Count, &states, &[]));
        table.push("transactions_per_country", aggregate(Aggregate::Count, &countries, &[]));
        if let Some((zip_keys, _)) = &zips {
            table.push("transactions_per_zip", aggregate(Aggregate::Count, zip_keys, &[]));
        }
        table.push("email_domain_freq", aggregate(Aggregate::Count, &domains, &[]));

        if let Some(customers) = &customers {
            table.push(
                "cards_per_customer",
                aggregate(Aggregate::NUnique, customers, &card_values),
            );
        } else {
            debug!("customer_id absent, skipping customer aggregates");
        }
        if let Some((_, zip_values)) = &zips {
            table.push(
                "addresses_per_card",
                aggregate(Aggregate::NUnique, &cards, zip_values),
            );
        } else {
            debug!("address_zip absent, skipping zip aggregates");
        }
        if let Some((user_keys, user_values)) = &users {
            table.push("users_per_card", aggregate(Aggregate::NUnique, &cards, user_values));
            table.push("cards_per_user", aggregate(Aggregate::NUnique, user_keys, &card_values));
        } else {
            debug!("user_id absent, skipping user aggregates");
        }
        if let Some(customers) = &customers {
            let state_values: Vec<Option<&str>> = states.iter().map(|s| Some(*s)).collect();
            let country_values: Vec<Option<&str>> = countries.iter().map(|c| Some(*c)).collect();
            table.push(
                "multiple_states",
                flag_above_one(aggregate(Aggregate::NUnique, customers, &state_values)),
            );
            table.push(
                "multiple_countries",
                flag_above_one(aggregate(Aggregate::NUnique, customers, &country_values)),
            );
        }

        self.push_expiry(records, schema.has("exp_month"), schema.has("exp_year"), &mut table);

        table.categorical.push(CategoricalColumn {
            field: "address_country",
            values: countries.iter().map(|s| s.to_string()).collect(),
        });
        table.categorical.push(CategoricalColumn {
            field: "address_state",
            values: states.iter().map(|s| s.to_string()).collect(),
        });
        table.categorical.push(CategoricalColumn {
            field: "email_domain",
            values: domains.iter().map(|s| s.to_string()).collect(),
        });
        if schema.has("address_city") {
            table.categorical.push(CategoricalColumn {
                field: "address_city",
                values: keyed(records, |t| &t.address_city)
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            });
        }

        info!(
            rows = table.n_rows(),
            numeric = table.numeric.len(),
            categorical = table.categorical.len(),
            "computed features"
        );
        Ok(table)
    }

    fn push_expiry(&self, records: &[Transaction], has_month: bool, has_year: bool, table: &mut FeatureTable) {
        let reference_year = self.reference.year();
        let reference_month = self.reference.month() as f64;

        let months: Vec<f64> = records
            .iter()
            .map(|t| parse_exp_month(t.exp_month.as_deref()))
            .collect();
        let years: Vec<f64> = records
            .iter()
            .map(|t| parse_exp_year(t.exp_year.as_deref(), reference_year))
            .collect();

        if has_month && has_year {
            let remaining = years
                .iter()
                .zip(&months)
                .map(|(y, m)| (y - reference_year as f64) * 12.0 + m - reference_month)
                .collect();
            table.push("exp_month", months);
            table.push("exp_year", years);
            table.push("months_to_expiry", remaining);
        } else if has_month {
            table.push("exp_month", months);
        } else if has_year {
            table.push("exp_year", years);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csv_reader::Schema;

    fn tx(id: &str, card: &str, customer: &str, user: &str) -> Transaction {
        Transaction {
            id: id.to_string(),
            card_number: Some(card.to_string()),
            customer_id: Some(customer.to_string()),
            user_id: Some(user.to_string()),
            email: Some(format!("{customer}@shop.test")),
            address_country: Some("US".to_string()),
            address_state: Some("CA".to_string()),
            address_zip: Some("94105".to_string()),
            exp_month: Some("6".to_string()),
            exp_year: Some("2028".to_string()),
            ..Transaction::default()
        }
    }

    fn engine() -> FeatureEngine {
        FeatureEngine::new(NaiveDate::from_ymd_opt(2026, 3, 15).unwrap())
    }

    fn batch(records: Vec<Transaction>) -> TransactionBatch {
        TransactionBatch::from_records(records, Schema::full()).unwrap()
    }

    #[test]
    fn count_is_identical_within_group_and_equals_group_size() {
        let records = vec![
            tx("1", "A", "c1", "u1"),
            tx("2", "A", "c2", "u2"),
            tx("3", "B", "c1", "u1"),
            tx("4", "A", "c3", "u1"),
            tx("5", "C", "c4", "u4"),
        ];
        let table = engine().compute(&batch(records.clone())).unwrap();
        let per_card = table.column("transactions_per_card").unwrap();

        for (i, r) in records.iter().enumerate() {
            let group_size = records
                .iter()
                .filter(|o| o.card_number == r.card_number)
                .count();
            assert_eq!(per_card[i], group_size as f64);
        }
        assert_eq!(per_card, &[3.0, 3.0, 1.0, 3.0, 1.0]);
    }

    #[test]
    fn nunique_counts_distinct_values_per_group() {
        let records = vec![
            tx("1", "A", "c1", "u1"),
            tx("2", "A", "c2", "u2"),
            tx("3", "B", "c1", "u1"),
            tx("4", "A", "c3", "u1"),
        ];
        let table = engine().compute(&batch(records)).unwrap();
        assert_eq!(table.column("users_per_card").unwrap(), &[2.0, 2.0, 1.0, 2.0]);
        assert_eq!(table.column("cards_per_user").unwrap(), &[2.0, 1.0, 2.0, 2.0]);
        assert_eq!(table.column("cards_per_customer").unwrap(), &[2.0, 1.0, 2.0, 1.0]);
        assert_eq!(table.column("addresses_per_card").unwrap(), &[1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn nunique_ignores_null_values() {
        let keys = ["a", "a", "b"];
        let values = [Some("x"), None, None];
        assert_eq!(aggregate(Aggregate::NUnique, &keys, &values), vec![1.0, 1.0, 0.0]);
    }

    #[test]
    fn unparseable_expiry_uses_documented_defaults() {
        let mut bad = tx("1", "A", "c1", "u1");
        bad.exp_month = Some("??".to_string());
        bad.exp_year = Some("".to_string());
        let mut out_of_range = tx("2", "B", "c2", "u2");
        out_of_range.exp_month = Some("13".to_string());
        out_of_range.exp_year = None;

        let table = engine().compute(&batch(vec![bad, out_of_range])).unwrap();
        assert_eq!(table.column("exp_month").unwrap(), &[1.0, 1.0]);
        assert_eq!(table.column("exp_year").unwrap(), &[2026.0, 2026.0]);
        // (2026 - 2026) * 12 + 1 - 3
        assert_eq!(table.column("months_to_expiry").unwrap(), &[-2.0, -2.0]);
    }

    #[test]
    fn months_to_expiry_counts_from_reference_month() {
        let table = engine().compute(&batch(vec![tx("1", "A", "c1", "u1")])).unwrap();
        // (2028 - 2026) * 12 + 6 - 3
        assert_eq!(table.column("months_to_expiry").unwrap(), &[27.0]);
    }

    #[test]
    fn missing_country_column_forms_single_unknown_group() {
        let records = vec![tx("1", "A", "c1", "u1"), tx("2", "B", "c2", "u2")];
        let schema = Schema::full().without(&["address_country"]);
        let records: Vec<Transaction> = records
            .into_iter()
            .map(|mut t| {
                t.address_country = None;
                t
            })
            .collect();
        let batch = TransactionBatch::from_records(records, schema).unwrap();
        let table = engine().compute(&batch).unwrap();

        assert_eq!(table.categorical("address_country").unwrap(), &[UNKNOWN, UNKNOWN]);
        assert_eq!(table.column("transactions_per_country").unwrap(), &[2.0, 2.0]);
    }

    #[test]
    fn absent_optional_columns_skip_dependent_features() {
        let schema = Schema::full().without(&["customer_id", "user_id", "address_zip", "address_city"]);
        let batch = TransactionBatch::from_records(vec![tx("1", "A", "c1", "u1")], schema).unwrap();
        let table = engine().compute(&batch).unwrap();
        let layout = table.layout();

        for skipped in [
            "transactions_per_customer",
            "cards_per_customer",
            "users_per_card",
            "cards_per_user",
            "transactions_per_zip",
            "addresses_per_card",
            "multiple_states",
            "address_city",
        ] {
            assert!(!layout.contains(&skipped), "{skipped} should be skipped");
        }
        assert!(layout.contains(&"transactions_per_card"));
        assert!(layout.contains(&"email_domain_freq"));
    }

    #[test]
    fn missing_email_falls_into_placeholder_domain() {
        let mut a = tx("1", "A", "c1", "u1");
        a.email = None;
        let mut b = tx("2", "B", "c2", "u2");
        b.email = Some("not-an-address".to_string());
        let table = engine().compute(&batch(vec![a, b])).unwrap();
        assert_eq!(table.categorical("email_domain").unwrap(), &["unknown.com", "unknown"]);
        assert_eq!(email_domain("x@y@corp.example"), "corp.example");
    }

    #[test]
    fn multiple_location_flags() {
        let mut moved = tx("2", "A", "c1", "u1");
        moved.address_state = Some("NV".to_string());
        let records = vec![tx("1", "A", "c1", "u1"), moved, tx("3", "B", "c2", "u2")];
        let table = engine().compute(&batch(records)).unwrap();
        assert_eq!(table.column("multiple_states").unwrap(), &[1.0, 1.0, 0.0]);
        assert_eq!(table.column("multiple_countries").unwrap(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn aggregates_do_not_depend_on_row_order() {
        let records = vec![
            tx("1", "A", "c1", "u1"),
            tx("2", "A", "c2", "u2"),
            tx("3", "B", "c1", "u3"),
        ];
        let mut reversed = records.clone();
        reversed.reverse();

        let forward = engine().compute(&batch(records)).unwrap();
        let backward = engine().compute(&batch(reversed)).unwrap();
        for column in &forward.numeric {
            let mut other = backward.column(column.name).unwrap().to_vec();
            other.reverse();
            assert_eq!(column.values, other, "{} differs", column.name);
        }
    }
}
