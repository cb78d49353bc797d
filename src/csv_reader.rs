// Data loading for transaction batches. CSV is the shipped source; a relational
// store plugs in behind `TransactionSource`.
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{FraudError, Result};

/// Columns that must exist for the pipeline to run at all.
pub const REQUIRED_COLUMNS: [&str; 2] = ["id", "card_number"];

/// Every column the loader understands, in export order.
pub const KNOWN_COLUMNS: [&str; 13] = [
    "id",
    "card_id",
    "card_number",
    "customer_id",
    "user_id",
    "email",
    "name_on_card",
    "address_country",
    "address_state",
    "address_city",
    "address_zip",
    "exp_month",
    "exp_year",
];

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct Transaction {
    pub id: String,
    #[serde(default)]
    pub card_id: Option<String>,
    #[serde(default)]
    pub card_number: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name_on_card: Option<String>,
    #[serde(default)]
    pub address_country: Option<String>,
    #[serde(default)]
    pub address_state: Option<String>,
    #[serde(default)]
    pub address_city: Option<String>,
    #[serde(default)]
    pub address_zip: Option<String>,
    // Stored as free text upstream; parsed by the feature engine.
    #[serde(default)]
    pub exp_month: Option<String>,
    #[serde(default)]
    pub exp_year: Option<String>,
}

impl Transaction {
    /// Field values in `KNOWN_COLUMNS` order, empty where absent.
    pub fn to_row(&self) -> Vec<String> {
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        vec![
            self.id.clone(),
            opt(&self.card_id),
            opt(&self.card_number),
            opt(&self.customer_id),
            opt(&self.user_id),
            opt(&self.email),
            opt(&self.name_on_card),
            opt(&self.address_country),
            opt(&self.address_state),
            opt(&self.address_city),
            opt(&self.address_zip),
            opt(&self.exp_month),
            opt(&self.exp_year),
        ]
    }
}

/// Column names present in a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: BTreeSet<String>,
}

impl Schema {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Schema carrying every known column.
    pub fn full() -> Self {
        Self::new(KNOWN_COLUMNS)
    }

    /// Same schema minus the given columns.
    #[cfg(test)]
    pub fn without(mut self, columns: &[&str]) -> Self {
        for c in columns {
            self.columns.remove(*c);
        }
        self
    }

    pub fn has(&self, column: &str) -> bool {
        self.columns.contains(column)
    }

    pub fn require(&self, columns: &[&str]) -> Result<()> {
        let missing: Vec<&str> = columns.iter().copied().filter(|c| !self.has(c)).collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(FraudError::Schema(format!(
                "missing required column(s): {}",
                missing.join(", ")
            )))
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransactionBatch {
    pub records: Vec<Transaction>,
    pub schema: Schema,
}

impl TransactionBatch {
    pub fn from_records(records: Vec<Transaction>, schema: Schema) -> Result<Self> {
        schema.require(&REQUIRED_COLUMNS)?;
        Ok(Self { records, schema })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Anything that can hand the pipeline a batch of raw records.
pub trait TransactionSource {
    fn load(&self) -> Result<TransactionBatch>;
}

pub struct CsvSource {
    path: PathBuf,
}

impl CsvSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl TransactionSource for CsvSource {
    fn load(&self) -> Result<TransactionBatch> {
        let file = File::open(&self.path)?;
        read_transactions(file)
    }
}

/// Reads a headered CSV. Unknown columns are ignored, missing optional columns
/// come through as `None`.
pub fn read_transactions<R: std::io::Read>(reader: R) -> Result<TransactionBatch> {
    let mut rdr = csv::Reader::from_reader(reader);

    let schema = Schema::new(rdr.headers()?.iter().map(|h| h.trim().to_string()));
    schema.require(&REQUIRED_COLUMNS)?;
    debug!(?schema, "resolved source schema");

    let records: Vec<Transaction> = rdr
        .deserialize()
        .collect::<std::result::Result<Vec<Transaction>, csv::Error>>()?;

    info!(records = records.len(), "loaded transactions");
    TransactionBatch::from_records(records, schema)
}
