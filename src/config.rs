use std::fs;
use std::path::Path;

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::error::{FraudError, Result};

/// Which detectors a run scores with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    #[value(name = "dbscan")]
    #[serde(rename = "dbscan")]
    DensityCluster,
    IsolationForest,
    Autoencoder,
}

impl DetectorKind {
    pub const ALL: [DetectorKind; 3] = [
        DetectorKind::DensityCluster,
        DetectorKind::IsolationForest,
        DetectorKind::Autoencoder,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DetectorKind::DensityCluster => "dbscan",
            DetectorKind::IsolationForest => "isolation_forest",
            DetectorKind::Autoencoder => "autoencoder",
        }
    }

    /// Column name of the continuous score, for detectors that produce one.
    pub fn score_column(self) -> Option<&'static str> {
        match self {
            DetectorKind::DensityCluster => None,
            DetectorKind::IsolationForest => Some("isolation_forest_score"),
            DetectorKind::Autoencoder => Some("autoencoder_error"),
        }
    }
}

/// How the density detector picks among swept parameter combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DensitySelection {
    /// Noise count closest to `target_anomalies`.
    TargetCount,
    /// Highest silhouette score of the labelling.
    Silhouette,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DensityConfig {
    pub eps: f64,
    pub min_samples: usize,
    pub search: bool,
    pub eps_grid: Vec<f64>,
    pub min_samples_grid: Vec<usize>,
    pub selection: DensitySelection,
    pub target_anomalies: usize,
}

impl Default for DensityConfig {
    fn default() -> Self {
        Self {
            eps: 0.5,
            min_samples: 5,
            search: false,
            eps_grid: vec![0.3, 0.5, 0.7],
            min_samples_grid: vec![3, 5, 7],
            selection: DensitySelection::TargetCount,
            target_anomalies: 20,
        }
    }
}

/// Rows drawn per isolation tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxSamples {
    /// min(256, n)
    Auto,
    Count(usize),
}

impl MaxSamples {
    pub fn resolve(self, n_samples: usize) -> usize {
        match self {
            MaxSamples::Auto => n_samples.min(256),
            MaxSamples::Count(n) => n.min(n_samples),
        }
        .max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    pub n_estimators: usize,
    pub contamination: f64,
    pub max_samples: MaxSamples,
    pub search: bool,
    pub n_estimators_grid: Vec<usize>,
    pub contamination_grid: Vec<f64>,
    pub max_samples_grid: Vec<MaxSamples>,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            n_estimators: 200,
            contamination: 0.01,
            max_samples: MaxSamples::Auto,
            search: false,
            n_estimators_grid: vec![100, 200, 300],
            contamination_grid: vec![0.01, 0.02, 0.03],
            max_samples_grid: vec![MaxSamples::Auto, MaxSamples::Count(100), MaxSamples::Count(200)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructionConfig {
    /// Hidden widths from the input towards the bottleneck; the decoder mirrors them.
    pub encoder_layers: Vec<usize>,
    pub bottleneck: usize,
    pub learning_rate: f64,
    pub momentum: f64,
    /// L2 weight decay.
    pub alpha: f64,
    pub max_epochs: usize,
    pub batch_size: usize,
    pub validation_split: f64,
    pub patience: usize,
    pub min_delta: f64,
    pub threshold_percentile: f64,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            encoder_layers: vec![32, 16],
            bottleneck: 8,
            learning_rate: 0.01,
            momentum: 0.9,
            alpha: 0.0001,
            max_epochs: 100,
            batch_size: 32,
            validation_split: 0.2,
            patience: 10,
            min_delta: 0.001,
            threshold_percentile: 95.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub detectors: Vec<DetectorKind>,
    pub seed: u64,
    pub density: DensityConfig,
    pub isolation: IsolationConfig,
    pub reconstruction: ReconstructionConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detectors: DetectorKind::ALL.to_vec(),
            seed: 42,
            density: DensityConfig::default(),
            isolation: IsolationConfig::default(),
            reconstruction: ReconstructionConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(FraudError::Config(msg));

        if self.detectors.is_empty() {
            return invalid("at least one detector must be enabled".into());
        }

        let d = &self.density;
        if !(d.eps > 0.0) || d.eps_grid.iter().any(|e| !(*e > 0.0)) {
            return invalid("density eps values must be positive".into());
        }
        if d.min_samples < 2 || d.min_samples_grid.iter().any(|m| *m < 2) {
            return invalid("density min_samples values must be at least 2".into());
        }
        if d.search && (d.eps_grid.is_empty() || d.min_samples_grid.is_empty()) {
            return invalid("density search grids must not be empty".into());
        }

        let i = &self.isolation;
        let contamination_ok = |c: f64| c > 0.0 && c <= 0.5;
        if !contamination_ok(i.contamination) || !i.contamination_grid.iter().all(|c| contamination_ok(*c)) {
            return invalid("contamination must be within (0, 0.5]".into());
        }
        if i.n_estimators == 0 || i.n_estimators_grid.contains(&0) {
            return invalid("isolation forest needs at least one tree".into());
        }
        if i.search
            && (i.n_estimators_grid.is_empty()
                || i.contamination_grid.is_empty()
                || i.max_samples_grid.is_empty())
        {
            return invalid("isolation search grids must not be empty".into());
        }

        let r = &self.reconstruction;
        if !(r.threshold_percentile > 0.0 && r.threshold_percentile <= 100.0) {
            return invalid(format!(
                "threshold percentile {} must be within (0, 100]",
                r.threshold_percentile
            ));
        }
        if !(0.0..1.0).contains(&r.validation_split) {
            return invalid("validation split must be within [0, 1)".into());
        }
        if r.bottleneck == 0 || r.encoder_layers.contains(&0) {
            return invalid("autoencoder layers must be non-empty".into());
        }
        if r.batch_size == 0 || r.max_epochs == 0 {
            return invalid("batch size and epoch count must be positive".into());
        }
        if !(r.learning_rate > 0.0) {
            return invalid("learning rate must be positive".into());
        }

        Ok(())
    }
}

/// Command-line values layered over a loaded configuration. Unset flags leave
/// the file (or default) value alone.
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Detectors to run, comma separated.
    #[arg(long, value_delimiter = ',', env = "FRAUD_DETECTORS")]
    pub detectors: Vec<DetectorKind>,

    /// Expected share of anomalies for the isolation forest.
    #[arg(long, env = "FRAUD_CONTAMINATION")]
    pub contamination: Option<f64>,

    /// DBSCAN neighbourhood radius.
    #[arg(long)]
    pub eps: Option<f64>,

    /// DBSCAN minimum neighbourhood size.
    #[arg(long)]
    pub min_samples: Option<usize>,

    /// Sweep DBSCAN parameters instead of using --eps/--min-samples.
    #[arg(long)]
    pub density_search: bool,

    /// Noise count the DBSCAN sweep aims for.
    #[arg(long)]
    pub target_anomalies: Option<usize>,

    /// Grid-search isolation forest parameters.
    #[arg(long)]
    pub isolation_search: bool,

    /// Reconstruction error percentile used as the autoencoder threshold.
    #[arg(long, env = "FRAUD_PERCENTILE")]
    pub percentile: Option<f64>,

    #[arg(long, env = "FRAUD_SEED")]
    pub seed: Option<u64>,

    #[arg(long)]
    pub validation_split: Option<f64>,

    /// Epochs without validation improvement before training stops.
    #[arg(long)]
    pub patience: Option<usize>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut PipelineConfig) {
        if !self.detectors.is_empty() {
            config.detectors = self.detectors.clone();
        }
        if let Some(c) = self.contamination {
            config.isolation.contamination = c;
        }
        if let Some(eps) = self.eps {
            config.density.eps = eps;
        }
        if let Some(m) = self.min_samples {
            config.density.min_samples = m;
        }
        if self.density_search {
            config.density.search = true;
        }
        if let Some(t) = self.target_anomalies {
            config.density.target_anomalies = t;
        }
        if self.isolation_search {
            config.isolation.search = true;
        }
        if let Some(p) = self.percentile {
            config.reconstruction.threshold_percentile = p;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(split) = self.validation_split {
            config.reconstruction.validation_split = split;
        }
        if let Some(patience) = self.patience {
            config.reconstruction.patience = patience;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.detectors.len(), 3);
        assert_eq!(config.isolation.contamination, 0.01);
        assert_eq!(config.density.target_anomalies, 20);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            detectors = ["dbscan", "autoencoder"]
            seed = 7

            [density]
            search = true
            selection = "silhouette"

            [isolation]
            max_samples = { count = 64 }

            [reconstruction]
            threshold_percentile = 99.0
            "#,
        )
        .unwrap();

        assert_eq!(
            config.detectors,
            vec![DetectorKind::DensityCluster, DetectorKind::Autoencoder]
        );
        assert_eq!(config.seed, 7);
        assert!(config.density.search);
        assert_eq!(config.density.selection, DensitySelection::Silhouette);
        assert_eq!(config.density.eps, 0.5);
        assert_eq!(config.isolation.max_samples, MaxSamples::Count(64));
        assert_eq!(config.reconstruction.threshold_percentile, 99.0);
        assert_eq!(config.reconstruction.patience, 10);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = PipelineConfig::default();
        config.isolation.contamination = 0.9;
        assert!(matches!(config.validate(), Err(FraudError::Config(_))));

        let mut config = PipelineConfig::default();
        config.reconstruction.threshold_percentile = 120.0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.density.min_samples = 1;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.detectors.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn overrides_only_touch_set_values() {
        let mut config = PipelineConfig::default();
        let overrides = ConfigOverrides {
            detectors: vec![DetectorKind::IsolationForest],
            contamination: Some(0.05),
            density_search: true,
            percentile: Some(99.0),
            ..ConfigOverrides::default()
        };
        overrides.apply(&mut config);

        assert_eq!(config.detectors, vec![DetectorKind::IsolationForest]);
        assert_eq!(config.isolation.contamination, 0.05);
        assert!(config.density.search);
        assert_eq!(config.reconstruction.threshold_percentile, 99.0);
        assert_eq!(config.density.eps, 0.5);
        assert_eq!(config.seed, 42);
        config.validate().unwrap();
    }

    #[test]
    fn max_samples_resolution() {
        assert_eq!(MaxSamples::Auto.resolve(100), 100);
        assert_eq!(MaxSamples::Auto.resolve(1000), 256);
        assert_eq!(MaxSamples::Count(200).resolve(100), 100);
        assert_eq!(MaxSamples::Count(0).resolve(100), 1);
    }
}
