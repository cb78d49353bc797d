//! Unsupervised anomaly detectors sharing one contract: a scaled feature
//! matrix in, one flag (and optionally a score) per row out.

pub mod density;
pub mod isolation;
pub mod reconstruction;

use ndarray::Array2;

pub use crate::config::DetectorKind;
use crate::config::PipelineConfig;
use crate::error::{FraudError, Result};

pub use density::DensityClusterDetector;
pub use isolation::IsolationForestDetector;
pub use reconstruction::AutoencoderDetector;

/// Per-row output of one detector, aligned with the input rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub flags: Vec<bool>,
    /// Continuous score where the detector has one; higher is more anomalous.
    pub scores: Option<Vec<f64>>,
}

impl Detection {
    pub fn flagged(&self) -> usize {
        self.flags.iter().filter(|f| **f).count()
    }

    pub fn flagged_indices(&self) -> Vec<usize> {
        self.flags
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.then_some(i))
            .collect()
    }

    /// Fails unless flags and scores both carry exactly `n_rows` entries.
    pub fn ensure_rows(&self, n_rows: usize) -> Result<()> {
        let lengths = std::iter::once(self.flags.len()).chain(self.scores.as_ref().map(Vec::len));
        for actual in lengths {
            if actual != n_rows {
                return Err(FraudError::RowMismatch {
                    expected: n_rows,
                    actual,
                });
            }
        }
        Ok(())
    }
}

pub trait AnomalyDetector {
    fn kind(&self) -> DetectorKind;

    /// Learns whatever the detector needs from the fit matrix.
    fn fit(&mut self, x: &Array2<f64>) -> Result<()>;

    /// Scores rows with the fitted state. Never mutates the detector.
    fn predict(&self, x: &Array2<f64>) -> Result<Detection>;
}

/// Builds the detectors enabled in `config`, in configuration order.
pub fn build_detectors(config: &PipelineConfig) -> Vec<Box<dyn AnomalyDetector>> {
    config
        .detectors
        .iter()
        .map(|kind| -> Box<dyn AnomalyDetector> {
            match kind {
                DetectorKind::DensityCluster => {
                    Box::new(DensityClusterDetector::new(config.density.clone()))
                }
                DetectorKind::IsolationForest => Box::new(IsolationForestDetector::new(
                    config.isolation.clone(),
                    config.seed,
                )),
                DetectorKind::Autoencoder => Box::new(AutoencoderDetector::new(
                    config.reconstruction.clone(),
                    config.seed,
                )),
            }
        })
        .collect()
}
