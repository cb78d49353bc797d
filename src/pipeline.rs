//! One fit-then-predict session.
//!
//! The session owns every piece of learned state: encoding tables, scaler
//! statistics, the fit-time feature layout and the fitted detectors. `fit`
//! learns all of it from one batch; `predict` only reads it.

use ndarray::Array2;
use tracing::info;

use crate::config::{DetectorKind, PipelineConfig};
use crate::csv_reader::TransactionBatch;
use crate::detectors::{build_detectors, AnomalyDetector, Detection};
use crate::encoder::CategoricalEncoder;
use crate::error::{FraudError, Result, Stage, StageExt};
use crate::features::{FeatureEngine, FeatureTable};
use crate::scaler::StandardScaler;

/// A batch after scoring: features, the scaled matrix and every detector's
/// output, all aligned with the batch's record order.
#[derive(Debug, Clone)]
pub struct ScoredBatch {
    pub features: FeatureTable,
    pub layout: Vec<&'static str>,
    pub matrix: Array2<f64>,
    pub detections: Vec<(DetectorKind, Detection)>,
}

impl ScoredBatch {
    pub fn n_rows(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn detection(&self, kind: DetectorKind) -> Option<&Detection> {
        self.detections
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, d)| d)
    }
}

pub struct FraudSession {
    engine: FeatureEngine,
    encoder: CategoricalEncoder,
    scaler: StandardScaler,
    layout: Option<Vec<&'static str>>,
    detectors: Vec<Box<dyn AnomalyDetector>>,
}

impl FraudSession {
    pub fn new(config: &PipelineConfig, engine: FeatureEngine) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_detectors(engine, build_detectors(config)))
    }

    /// Session over an explicit detector set.
    pub fn with_detectors(engine: FeatureEngine, detectors: Vec<Box<dyn AnomalyDetector>>) -> Self {
        Self {
            engine,
            encoder: CategoricalEncoder::new(),
            scaler: StandardScaler::new(),
            layout: None,
            detectors,
        }
    }

    pub fn encoder(&self) -> &CategoricalEncoder {
        &self.encoder
    }

    pub fn scaler(&self) -> &StandardScaler {
        &self.scaler
    }

    pub fn layout(&self) -> Option<&[&'static str]> {
        self.layout.as_deref()
    }

    pub fn is_fitted(&self) -> bool {
        self.layout.is_some()
    }

    // Learns encoder, scaler and detector state from a batch and scores it
    // Inputs: training batch
    // Outputs: ScoredBatch aligned with the batch's records
    // Key steps:
    // 1. Compute features and fit categorical codes
    // 2. Fit the scaler and standardize
    // 3. Fit every detector, then score the same matrix
    // 4. Record the feature layout only once scoring succeeded
    pub fn fit(&mut self, batch: &TransactionBatch) -> Result<ScoredBatch> {
        if batch.is_empty() {
            return Err(FraudError::EmptyBatch).stage(Stage::Load);
        }
        info!(records = batch.len(), detectors = self.detectors.len(), "fitting session");

        let features = self.engine.compute(batch).stage(Stage::Features)?;
        let layout = features.layout();

        let mut columns: Vec<Vec<f64>> = features.numeric.iter().map(|c| c.values.clone()).collect();
        for column in &features.categorical {
            let codes = self.encoder.fit_transform(column.field, &column.values);
            columns.push(codes.into_iter().map(|c| c as f64).collect());
        }

        let raw = assemble(&columns, features.n_rows());
        let matrix = self.scaler.fit_transform(&raw).stage(Stage::Scale)?;

        for detector in &mut self.detectors {
            let name = detector.kind().name();
            detector.fit(&matrix).stage(Stage::Detect(name))?;
        }
        let detections = self.detect(&matrix)?;
        self.layout = Some(layout.clone());

        Ok(ScoredBatch {
            features,
            layout,
            matrix,
            detections,
        })
    }

    // Scores a new batch with the state learned in fit; nothing is re-fitted
    // Inputs: batch with the same columns as the training batch
    // Outputs: ScoredBatch aligned with the batch's records
    // Key steps:
    // 1. Check the feature layout against the fit-time layout
    // 2. Encode with the fitted tables (unseen values fail)
    // 3. Standardize with fit-time statistics and run every detector
    pub fn predict(&self, batch: &TransactionBatch) -> Result<ScoredBatch> {
        let expected = self
            .layout
            .as_ref()
            .ok_or(FraudError::NotFitted("session"))
            .stage(Stage::Features)?;
        if batch.is_empty() {
            return Err(FraudError::EmptyBatch).stage(Stage::Load);
        }
        info!(records = batch.len(), "scoring batch");

        let features = self.engine.compute(batch).stage(Stage::Features)?;
        let layout = features.layout();
        if &layout != expected {
            return Err(FraudError::Schema(format!(
                "feature layout {layout:?} differs from fit-time layout {expected:?}"
            )))
            .stage(Stage::Features);
        }

        let mut columns: Vec<Vec<f64>> = features.numeric.iter().map(|c| c.values.clone()).collect();
        for column in &features.categorical {
            let codes = self
                .encoder
                .transform(column.field, &column.values)
                .stage(Stage::Encode)?;
            columns.push(codes.into_iter().map(|c| c as f64).collect());
        }

        let raw = assemble(&columns, features.n_rows());
        let matrix = self.scaler.transform(&raw).stage(Stage::Scale)?;
        let detections = self.detect(&matrix)?;

        Ok(ScoredBatch {
            features,
            layout,
            matrix,
            detections,
        })
    }

    fn detect(&self, matrix: &Array2<f64>) -> Result<Vec<(DetectorKind, Detection)>> {
        self.detectors
            .iter()
            .map(|detector| {
                let kind = detector.kind();
                let detection = detector.predict(matrix).stage(Stage::Detect(kind.name()))?;
                detection
                    .ensure_rows(matrix.nrows())
                    .stage(Stage::Detect(kind.name()))?;
                Ok((kind, detection))
            })
            .collect()
    }
}

/// Column vectors into a row-major `(n_rows, n_columns)` matrix.
fn assemble(columns: &[Vec<f64>], n_rows: usize) -> Array2<f64> {
    Array2::from_shape_fn((n_rows, columns.len()), |(i, j)| columns[j][i])
}
