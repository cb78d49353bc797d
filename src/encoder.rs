use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use crate::error::{FraudError, Result};

/// Code assignment for one categorical field. Codes follow sorted value order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingTable {
    codes: HashMap<String, usize>,
    values: Vec<String>,
}

impl EncodingTable {
    fn fit<S: AsRef<str>>(values: &[S]) -> Self {
        let distinct: BTreeSet<&str> = values.iter().map(|v| v.as_ref()).collect();
        let values: Vec<String> = distinct.into_iter().map(str::to_string).collect();
        let codes = values
            .iter()
            .enumerate()
            .map(|(code, value)| (value.clone(), code))
            .collect();
        Self { codes, values }
    }

    pub fn code(&self, value: &str) -> Option<usize> {
        self.codes.get(value).copied()
    }

    pub fn value(&self, code: usize) -> Option<&str> {
        self.values.get(code).map(String::as_str)
    }

    pub fn n_categories(&self) -> usize {
        self.values.len()
    }
}

/// Per-field categorical codes, learned once and reused for every later batch
/// of the same session.
#[derive(Debug, Clone, Default)]
pub struct CategoricalEncoder {
    tables: BTreeMap<String, EncodingTable>,
}

impl CategoricalEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a fresh table for `field` from `values` and returns their codes.
    pub fn fit_transform<S: AsRef<str>>(&mut self, field: &str, values: &[S]) -> Vec<usize> {
        let table = EncodingTable::fit(values);
        debug!(field, categories = table.n_categories(), "fitted encoding table");
        let codes = values
            .iter()
            .filter_map(|v| table.code(v.as_ref()))
            .collect();
        self.tables.insert(field.to_string(), table);
        codes
    }

    /// Codes `values` with the table learned at fit time. A value the table has
    /// never seen is an error, never a new code.
    pub fn transform<S: AsRef<str>>(&self, field: &str, values: &[S]) -> Result<Vec<usize>> {
        let table = self.tables.get(field).ok_or(FraudError::NotFitted("categorical encoder"))?;
        values
            .iter()
            .map(|v| {
                table.code(v.as_ref()).ok_or_else(|| FraudError::UnknownCategory {
                    field: field.to_string(),
                    value: v.as_ref().to_string(),
                })
            })
            .collect()
    }

    pub fn inverse_transform(&self, field: &str, codes: &[usize]) -> Result<Vec<String>> {
        let table = self.tables.get(field).ok_or(FraudError::NotFitted("categorical encoder"))?;
        codes
            .iter()
            .map(|&code| {
                table.value(code).map(str::to_string).ok_or_else(|| FraudError::UnknownCategory {
                    field: field.to_string(),
                    value: code.to_string(),
                })
            })
            .collect()
    }

    pub fn table(&self, field: &str) -> Option<&EncodingTable> {
        self.tables.get(field)
    }
}
