//! Isolation Forest anomaly scoring

use ndarray::{Array2, ArrayView1};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use tracing::{debug, info, warn};

use crate::config::{DetectorKind, IsolationConfig, MaxSamples};
use crate::detectors::{AnomalyDetector, Detection};
use crate::error::{FraudError, Result};
use crate::search::{select_best, silhouette_score};

/// Isolation tree node
#[derive(Debug, Clone)]
pub enum IsolationTree {
    Internal {
        feature: usize,
        threshold: f64,
        /// Rows with value < threshold
        left: Box<IsolationTree>,
        right: Box<IsolationTree>,
    },
    External {
        size: usize,
    },
}

impl IsolationTree {
    pub fn build(
        x: &Array2<f64>,
        indices: &[usize],
        height: usize,
        max_height: usize,
        rng: &mut impl Rng,
    ) -> Self {
        let n_samples = indices.len();
        if height >= max_height || n_samples <= 1 {
            return IsolationTree::External { size: n_samples };
        }

        // Only features that still vary within this node can split it
        let splittable: Vec<(usize, f64, f64)> = (0..x.ncols())
            .filter_map(|feature| {
                let (lo, hi) = indices
                    .iter()
                    .map(|&i| x[[i, feature]])
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
                (hi - lo > 1e-10).then_some((feature, lo, hi))
            })
            .collect();
        let Some(&(feature, min_val, max_val)) = splittable.choose(rng) else {
            return IsolationTree::External { size: n_samples };
        };

        let threshold = rng.gen_range(min_val..max_val);
        let (left_indices, right_indices): (Vec<usize>, Vec<usize>) =
            indices.iter().partition(|&&i| x[[i, feature]] < threshold);

        if left_indices.is_empty() || right_indices.is_empty() {
            return IsolationTree::External { size: n_samples };
        }

        IsolationTree::Internal {
            feature,
            threshold,
            left: Box::new(Self::build(x, &left_indices, height + 1, max_height, rng)),
            right: Box::new(Self::build(x, &right_indices, height + 1, max_height, rng)),
        }
    }

    pub fn path_length(&self, sample: ArrayView1<f64>, current_height: usize) -> f64 {
        match self {
            IsolationTree::External { size } => current_height as f64 + average_path_length(*size),
            IsolationTree::Internal {
                feature,
                threshold,
                left,
                right,
            } => {
                if sample[*feature] < *threshold {
                    left.path_length(sample, current_height + 1)
                } else {
                    right.path_length(sample, current_height + 1)
                }
            }
        }
    }
}

/// Average path length of an unsuccessful BST search over `n` items:
/// c(n) = 2 H(n-1) - 2(n-1)/n
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n_f = n as f64;
            2.0 * ((n_f - 1.0).ln() + 0.5772156649) - 2.0 * (n_f - 1.0) / n_f
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IsolationParams {
    pub n_estimators: usize,
    pub contamination: f64,
    pub max_samples: MaxSamples,
}

/// A fitted forest plus its decision threshold.
#[derive(Debug, Clone)]
pub struct IsolationForest {
    params: IsolationParams,
    trees: Vec<IsolationTree>,
    samples_per_tree: usize,
    threshold: f64,
}

impl IsolationForest {
    pub fn fit(x: &Array2<f64>, params: IsolationParams, seed: u64) -> Result<Self> {
        let n_samples = x.nrows();
        if n_samples == 0 {
            return Err(FraudError::EmptyBatch);
        }
        let samples_per_tree = params.max_samples.resolve(n_samples);
        let max_height = (samples_per_tree as f64).log2().ceil() as usize;
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);

        let trees = (0..params.n_estimators)
            .map(|_| {
                // Bootstrap sample
                let indices: Vec<usize> = (0..samples_per_tree)
                    .map(|_| rng.gen_range(0..n_samples))
                    .collect();
                IsolationTree::build(x, &indices, 0, max_height, &mut rng)
            })
            .collect();

        let mut forest = Self {
            params,
            trees,
            samples_per_tree,
            threshold: f64::INFINITY,
        };

        let mut sorted = forest.score_samples(x);
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        let n_flagged = ((params.contamination * n_samples as f64).ceil() as usize).clamp(1, n_samples);
        forest.threshold = sorted[n_flagged - 1];

        Ok(forest)
    }

    /// s(x) = 2^(-E[h(x)] / c(psi)); higher is more anomalous.
    pub fn score_samples(&self, x: &Array2<f64>) -> Vec<f64> {
        let c_n = average_path_length(self.samples_per_tree).max(f64::EPSILON);
        x.rows()
            .into_iter()
            .map(|row| {
                let avg_path_length = self
                    .trees
                    .iter()
                    .map(|tree| tree.path_length(row, 0))
                    .sum::<f64>()
                    / self.trees.len() as f64;
                2.0_f64.powf(-avg_path_length / c_n)
            })
            .collect()
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn params(&self) -> IsolationParams {
        self.params
    }

    pub fn detect(&self, x: &Array2<f64>) -> Detection {
        let scores = self.score_samples(x);
        let flags = scores.iter().map(|&s| s >= self.threshold).collect();
        Detection {
            flags,
            scores: Some(scores),
        }
    }
}

/// Isolation Forest detector, optionally grid-searching its hyperparameters.
#[derive(Debug, Clone)]
pub struct IsolationForestDetector {
    config: IsolationConfig,
    seed: u64,
    forest: Option<IsolationForest>,
}

impl IsolationForestDetector {
    pub fn new(config: IsolationConfig, seed: u64) -> Self {
        Self {
            config,
            seed,
            forest: None,
        }
    }

    pub fn forest(&self) -> Option<&IsolationForest> {
        self.forest.as_ref()
    }

    fn configured(&self) -> IsolationParams {
        IsolationParams {
            n_estimators: self.config.n_estimators,
            contamination: self.config.contamination,
            max_samples: self.config.max_samples,
        }
    }

    /// Grid search maximizing the silhouette of the inlier/outlier split.
    fn search(&self, x: &Array2<f64>) -> Result<IsolationParams> {
        let mut candidates = Vec::new();
        for &n_estimators in &self.config.n_estimators_grid {
            for &contamination in &self.config.contamination_grid {
                for &max_samples in &self.config.max_samples_grid {
                    candidates.push(IsolationParams {
                        n_estimators,
                        contamination,
                        max_samples,
                    });
                }
            }
        }

        let best = select_best(candidates, |params| {
            let forest = IsolationForest::fit(x, *params, self.seed)?;
            Ok(silhouette_score(x, &forest.detect(x).flags))
        })?;

        Ok(match best {
            Some(best) => {
                info!(params = ?best.candidate, silhouette = best.score, "selected isolation forest parameters");
                best.candidate
            }
            None => {
                warn!("isolation forest search found no two-group split, using configured parameters");
                self.configured()
            }
        })
    }
}

impl AnomalyDetector for IsolationForestDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::IsolationForest
    }

    fn fit(&mut self, x: &Array2<f64>) -> Result<()> {
        let params = if self.config.search {
            self.search(x)?
        } else {
            self.configured()
        };
        let forest = IsolationForest::fit(x, params, self.seed)?;
        debug!(threshold = forest.threshold(), trees = params.n_estimators, "fitted isolation forest");
        self.forest = Some(forest);
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Detection> {
        let forest = self
            .forest
            .as_ref()
            .ok_or(FraudError::NotFitted("isolation forest detector"))?;
        let detection = forest.detect(x);
        info!(outliers = detection.flagged(), "isolation forest finished");
        Ok(detection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_with_outliers() -> Array2<f64> {
        let mut data = Vec::new();
        for i in 0..50 {
            data.push((i % 10) as f64);
            data.push(((i % 10) + 1) as f64);
        }
        data.extend_from_slice(&[100.0, 100.0]);
        data.extend_from_slice(&[-50.0, -50.0]);
        Array2::from_shape_vec((52, 2), data).unwrap()
    }

    fn config(contamination: f64) -> IsolationConfig {
        IsolationConfig {
            n_estimators: 50,
            contamination,
            ..IsolationConfig::default()
        }
    }

    #[test]
    fn outliers_score_higher_and_are_flagged() {
        let x = cluster_with_outliers();
        let mut detector = IsolationForestDetector::new(config(0.04), 42);
        detector.fit(&x).unwrap();
        let detection = detector.predict(&x).unwrap();
        let scores = detection.scores.as_ref().unwrap();

        assert!(scores[50] > scores[0]);
        assert!(scores[51] > scores[0]);
        assert!(scores.iter().all(|s| *s > 0.0 && *s <= 1.0));
        let flagged = detection.flagged_indices();
        assert!(flagged.contains(&50) && flagged.contains(&51), "flagged {flagged:?}");
    }

    #[test]
    fn same_seed_same_scores() {
        let x = cluster_with_outliers();
        let mut a = IsolationForestDetector::new(config(0.01), 7);
        let mut b = IsolationForestDetector::new(config(0.01), 7);
        a.fit(&x).unwrap();
        b.fit(&x).unwrap();
        assert_eq!(a.predict(&x).unwrap(), b.predict(&x).unwrap());
    }

    #[test]
    fn contamination_sets_flag_count() {
        let x = cluster_with_outliers();
        let mut detector = IsolationForestDetector::new(config(0.01), 42);
        detector.fit(&x).unwrap();
        // ceil(0.01 * 52) = 1 row at or above the threshold, ties aside
        assert!(detector.predict(&x).unwrap().flagged() >= 1);
        let threshold = detector.forest().unwrap().threshold();
        let top = detector
            .predict(&x)
            .unwrap()
            .scores
            .unwrap()
            .into_iter()
            .fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(threshold, top);
    }

    #[test]
    fn path_length_is_positive() {
        let x = Array2::from_shape_vec((10, 2), (1..=10).flat_map(|v| [v as f64, v as f64]).collect()).unwrap();
        let indices: Vec<usize> = (0..10).collect();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        let tree = IsolationTree::build(&x, &indices, 0, 10, &mut rng);
        let sample = ndarray::arr1(&[5.0, 5.0]);
        assert!(tree.path_length(sample.view(), 0) > 0.0);
    }

    #[test]
    fn average_path_length_edge_cases() {
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        assert!(average_path_length(256) > average_path_length(16));
    }

    #[test]
    fn search_picks_from_grid() {
        let x = cluster_with_outliers();
        let config = IsolationConfig {
            search: true,
            n_estimators_grid: vec![20, 40],
            contamination_grid: vec![0.02, 0.05],
            max_samples_grid: vec![MaxSamples::Auto],
            ..IsolationConfig::default()
        };
        let mut detector = IsolationForestDetector::new(config, 42);
        detector.fit(&x).unwrap();
        let chosen = detector.forest().unwrap().params();
        assert!([20, 40].contains(&chosen.n_estimators));
        assert!([0.02, 0.05].contains(&chosen.contamination));
    }

    #[test]
    fn predict_before_fit_fails() {
        let detector = IsolationForestDetector::new(IsolationConfig::default(), 42);
        assert!(detector.predict(&cluster_with_outliers()).is_err());
    }
}
