use linfa::traits::Transformer;
use linfa_clustering::Dbscan;
use ndarray::Array2;
use tracing::{debug, info, warn};

use crate::config::{DensityConfig, DensitySelection, DetectorKind};
use crate::detectors::{AnomalyDetector, Detection};
use crate::error::{FraudError, Result};
use crate::search::{distinct_labels, select_best, silhouette_score};

/// Parameters used when a sweep yields nothing usable.
pub const FALLBACK_EPS: f64 = 0.5;
pub const FALLBACK_MIN_SAMPLES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DensityParams {
    pub eps: f64,
    pub min_samples: usize,
}

impl DensityParams {
    pub const FALLBACK: DensityParams = DensityParams {
        eps: FALLBACK_EPS,
        min_samples: FALLBACK_MIN_SAMPLES,
    };
}

/// Cluster label per row; `None` is noise.
pub fn cluster(x: &Array2<f64>, params: DensityParams) -> Result<Vec<Option<usize>>> {
    let memberships = Dbscan::params(params.min_samples)
        .tolerance(params.eps)
        .transform(x)
        .map_err(|e| FraudError::Detector(format!("dbscan {params:?}: {e}")))?;
    Ok(memberships.to_vec())
}

fn noise_count(labels: &[Option<usize>]) -> usize {
    labels.iter().filter(|l| l.is_none()).count()
}

/// DBSCAN outlier detector. Rows outside every dense region are anomalies.
///
/// Fitting only selects `(eps, min_samples)`; DBSCAN has no out-of-sample
/// model, so `predict` clusters whatever matrix it is given with the selected
/// parameters.
#[derive(Debug, Clone)]
pub struct DensityClusterDetector {
    config: DensityConfig,
    params: Option<DensityParams>,
}

impl DensityClusterDetector {
    pub fn new(config: DensityConfig) -> Self {
        Self { config, params: None }
    }

    /// Selected parameters, once fitted.
    pub fn params(&self) -> Option<DensityParams> {
        self.params
    }

    fn sweep(&self, x: &Array2<f64>) -> Result<DensityParams> {
        let candidates: Vec<DensityParams> = self
            .config
            .eps_grid
            .iter()
            .flat_map(|&eps| {
                self.config
                    .min_samples_grid
                    .iter()
                    .map(move |&min_samples| DensityParams { eps, min_samples })
            })
            .collect();

        let target = self.config.target_anomalies as f64;
        let selection = self.config.selection;
        let best = select_best(candidates, |params| {
            let labels = cluster(x, *params)?;
            let outliers = noise_count(&labels);
            debug!(eps = params.eps, min_samples = params.min_samples, outliers, "dbscan candidate");
            if distinct_labels(&labels) < 2 {
                return Ok(None);
            }
            Ok(match selection {
                DensitySelection::TargetCount => Some(-(outliers as f64 - target).abs()),
                DensitySelection::Silhouette => silhouette_score(x, &labels),
            })
        })?;

        match best {
            Some(best) => {
                info!(
                    eps = best.candidate.eps,
                    min_samples = best.candidate.min_samples,
                    score = best.score,
                    "selected dbscan parameters"
                );
                Ok(best.candidate)
            }
            None => {
                warn!("no dbscan candidate produced two groups, using fallback parameters");
                Ok(DensityParams::FALLBACK)
            }
        }
    }
}

impl AnomalyDetector for DensityClusterDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::DensityCluster
    }

    fn fit(&mut self, x: &Array2<f64>) -> Result<()> {
        let params = if self.config.search {
            self.sweep(x)?
        } else {
            DensityParams {
                eps: self.config.eps,
                min_samples: self.config.min_samples,
            }
        };
        self.params = Some(params);
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Detection> {
        let params = self.params.ok_or(FraudError::NotFitted("dbscan detector"))?;
        let labels = cluster(x, params)?;
        let flags: Vec<bool> = labels.iter().map(Option::is_none).collect();
        info!(
            outliers = noise_count(&labels),
            clusters = distinct_labels(&labels) - usize::from(flags.iter().any(|f| *f)),
            "dbscan finished"
        );
        Ok(Detection { flags, scores: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two tight blobs of ten points plus one far outlier.
    fn blobs_with_outlier() -> Array2<f64> {
        let mut rows = Vec::new();
        for i in 0..10 {
            let d = i as f64 * 0.01;
            rows.extend_from_slice(&[d, d]);
        }
        for i in 0..10 {
            let d = i as f64 * 0.01;
            rows.extend_from_slice(&[5.0 + d, 5.0 - d]);
        }
        rows.extend_from_slice(&[20.0, -20.0]);
        Array2::from_shape_vec((21, 2), rows).unwrap()
    }

    #[test]
    fn fixed_parameters_flag_isolated_point() {
        let x = blobs_with_outlier();
        let mut detector = DensityClusterDetector::new(DensityConfig::default());
        detector.fit(&x).unwrap();
        let detection = detector.predict(&x).unwrap();

        assert_eq!(detection.flagged_indices(), vec![20]);
        assert!(detection.scores.is_none());
        assert_eq!(detector.params(), Some(DensityParams::FALLBACK));
    }

    #[test]
    fn predict_before_fit_fails() {
        let detector = DensityClusterDetector::new(DensityConfig::default());
        assert!(matches!(
            detector.predict(&blobs_with_outlier()),
            Err(FraudError::NotFitted(_))
        ));
    }

    #[test]
    fn sweep_prefers_count_closest_to_target() {
        let x = blobs_with_outlier();
        let config = DensityConfig {
            search: true,
            eps_grid: vec![0.001, 0.5],
            min_samples_grid: vec![3],
            target_anomalies: 1,
            ..DensityConfig::default()
        };
        let mut detector = DensityClusterDetector::new(config);
        detector.fit(&x).unwrap();
        let chosen = detector.params().unwrap();
        assert_eq!(chosen.eps, 0.5);
        assert_eq!(detector.predict(&x).unwrap().flagged(), 1);
    }

    #[test]
    fn sweep_falls_back_when_everything_is_one_group() {
        // Identical rows: every candidate yields a single cluster.
        let x = Array2::from_elem((12, 2), 1.0);
        let config = DensityConfig {
            search: true,
            eps_grid: vec![0.3, 0.7],
            min_samples_grid: vec![3],
            ..DensityConfig::default()
        };
        let mut detector = DensityClusterDetector::new(config);
        detector.fit(&x).unwrap();
        assert_eq!(detector.params(), Some(DensityParams::FALLBACK));
    }

    #[test]
    fn silhouette_selection_picks_a_separating_radius() {
        let x = blobs_with_outlier();
        let config = DensityConfig {
            search: true,
            eps_grid: vec![0.5, 100.0],
            min_samples_grid: vec![3],
            selection: DensitySelection::Silhouette,
            ..DensityConfig::default()
        };
        let mut detector = DensityClusterDetector::new(config);
        detector.fit(&x).unwrap();
        // eps = 100 merges everything into one group and is ineligible.
        assert_eq!(detector.params().unwrap().eps, 0.5);
    }
}
