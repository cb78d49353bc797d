//! Autoencoder reconstruction-error detector.
//!
//! A small dense network learns to reproduce its input through a bottleneck.
//! Rows it reproduces badly are anomalous. Trained with mini-batch SGD with
//! momentum and L2 decay; validation loss drives early stopping and the best
//! weights seen are kept.

use ndarray::{s, Array1, Array2, Axis};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use tracing::{debug, info};

use crate::config::{DetectorKind, ReconstructionConfig};
use crate::detectors::{AnomalyDetector, Detection};
use crate::error::{FraudError, Result};

/// Linear-interpolated percentile (`p` in 0..=100) of `values`.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64))
}

/// How training ended.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub epochs: usize,
    pub best_epoch: usize,
    pub best_val_loss: Option<f64>,
    pub final_train_loss: f64,
    pub stopped_early: bool,
}

#[derive(Debug, Clone)]
pub struct Autoencoder {
    config: ReconstructionConfig,
    weights: Vec<Array2<f64>>,
    biases: Vec<Array1<f64>>,
    n_features: usize,
}

impl Autoencoder {
    pub fn new(config: ReconstructionConfig) -> Self {
        Self {
            config,
            weights: Vec::new(),
            biases: Vec::new(),
            n_features: 0,
        }
    }

    /// Layer widths from input to output, e.g. `[d, 32, 16, 8, 16, 32, d]`.
    fn layer_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![self.n_features];
        sizes.extend(&self.config.encoder_layers);
        sizes.push(self.config.bottleneck);
        sizes.extend(self.config.encoder_layers.iter().rev());
        sizes.push(self.n_features);
        sizes
    }

    fn initialize_weights(&mut self, rng: &mut impl Rng) {
        self.weights.clear();
        self.biases.clear();

        let sizes = self.layer_sizes();
        for pair in sizes.windows(2) {
            let (n_in, n_out) = (pair[0], pair[1]);
            // Xavier/Glorot uniform
            let scale = (6.0 / (n_in + n_out) as f64).sqrt();
            self.weights
                .push(Array2::from_shape_fn((n_in, n_out), |_| rng.gen_range(-scale..scale)));
            self.biases.push(Array1::zeros(n_out));
        }
    }

    pub fn fit(&mut self, x: &Array2<f64>, rng: &mut impl Rng) -> Result<TrainingSummary> {
        let n_samples = x.nrows();
        if n_samples == 0 {
            return Err(FraudError::EmptyBatch);
        }
        self.n_features = x.ncols();
        self.initialize_weights(rng);

        let mut order: Vec<usize> = (0..n_samples).collect();
        order.shuffle(rng);
        let mut val_size = (n_samples as f64 * self.config.validation_split) as usize;
        if val_size >= n_samples {
            val_size = 0;
        }
        let (val_idx, train_idx) = order.split_at(val_size);
        let x_train = gather_rows(x, train_idx);
        let x_val = gather_rows(x, val_idx);
        let train_size = x_train.nrows();

        let mut velocities_w: Vec<Array2<f64>> =
            self.weights.iter().map(|w| Array2::zeros(w.raw_dim())).collect();
        let mut velocities_b: Vec<Array1<f64>> =
            self.biases.iter().map(|b| Array1::zeros(b.len())).collect();

        let mut best_val_loss = f64::INFINITY;
        let mut best_weights = (self.weights.clone(), self.biases.clone());
        let mut best_epoch = 0;
        let mut patience_counter = 0;
        let mut stopped_early = false;
        let mut epochs = 0;
        let lr = self.config.learning_rate;

        for epoch in 0..self.config.max_epochs {
            epochs = epoch + 1;
            let mut indices: Vec<usize> = (0..train_size).collect();
            indices.shuffle(rng);

            for batch in indices.chunks(self.config.batch_size) {
                let x_batch = gather_rows(&x_train, batch);
                let (activations, z_values) = self.forward(&x_batch);
                let gradients = self.backward(&x_batch, &activations, &z_values);

                for (i, (grad_w, grad_b)) in gradients.into_iter().enumerate() {
                    velocities_w[i] = &velocities_w[i] * self.config.momentum - &grad_w * lr;
                    velocities_b[i] = &velocities_b[i] * self.config.momentum - &grad_b * lr;
                    self.weights[i] = &self.weights[i] + &velocities_w[i];
                    self.biases[i] = &self.biases[i] + &velocities_b[i];
                    self.weights[i] *= 1.0 - self.config.alpha * lr;
                }
            }

            if val_size == 0 {
                continue;
            }

            let val_loss = mean(&self.reconstruction_errors(&x_val));
            debug!(epoch, val_loss, "autoencoder epoch");
            if val_loss < best_val_loss - self.config.min_delta {
                best_val_loss = val_loss;
                best_weights = (self.weights.clone(), self.biases.clone());
                best_epoch = epoch + 1;
                patience_counter = 0;
            } else {
                patience_counter += 1;
                if patience_counter >= self.config.patience {
                    stopped_early = true;
                    break;
                }
            }
        }

        if val_size > 0 && best_val_loss.is_finite() {
            (self.weights, self.biases) = best_weights;
        } else {
            best_epoch = epochs;
        }

        Ok(TrainingSummary {
            epochs,
            best_epoch,
            best_val_loss: best_val_loss.is_finite().then_some(best_val_loss),
            final_train_loss: mean(&self.reconstruction_errors(&x_train)),
            stopped_early,
        })
    }

    pub fn reconstruct(&self, x: &Array2<f64>) -> Array2<f64> {
        let (mut activations, _) = self.forward(x);
        activations.pop().unwrap_or_else(|| x.clone())
    }

    /// Mean squared difference between each row and its reconstruction.
    pub fn reconstruction_errors(&self, x: &Array2<f64>) -> Vec<f64> {
        if x.nrows() == 0 {
            return Vec::new();
        }
        let diff = x - &self.reconstruct(x);
        (&diff * &diff)
            .mean_axis(Axis(1))
            .map(|m| m.to_vec())
            .unwrap_or_default()
    }

    fn forward(&self, x: &Array2<f64>) -> (Vec<Array2<f64>>, Vec<Array2<f64>>) {
        let mut activations = vec![x.clone()];
        let mut z_values = Vec::with_capacity(self.weights.len());
        let last = self.weights.len().saturating_sub(1);

        for (i, (w, b)) in self.weights.iter().zip(&self.biases).enumerate() {
            let input = &activations[activations.len() - 1];
            let z = input.dot(w) + b;
            // ReLU hidden layers, linear output to match standardized inputs
            let a = if i < last { z.mapv(|v| v.max(0.0)) } else { z.clone() };
            z_values.push(z);
            activations.push(a);
        }

        (activations, z_values)
    }

    fn backward(
        &self,
        x: &Array2<f64>,
        activations: &[Array2<f64>],
        z_values: &[Array2<f64>],
    ) -> Vec<(Array2<f64>, Array1<f64>)> {
        let n = x.nrows() as f64;
        let mut gradients = Vec::with_capacity(self.weights.len());

        let output = &activations[activations.len() - 1];
        let mut delta = (output - x) / n;

        for i in (0..self.weights.len()).rev() {
            let a_prev = &activations[i];
            gradients.push((a_prev.t().dot(&delta), delta.sum_axis(Axis(0))));

            if i > 0 {
                let relu_grad = z_values[i - 1].mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
                delta = delta.dot(&self.weights[i].t()) * relu_grad;
            }
        }

        gradients.reverse();
        gradients
    }
}

fn gather_rows(x: &Array2<f64>, indices: &[usize]) -> Array2<f64> {
    if indices.is_empty() {
        return x.slice(s![0..0, ..]).to_owned();
    }
    x.select(Axis(0), indices)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Flags rows whose reconstruction error exceeds a percentile of the fit-set
/// errors.
#[derive(Debug, Clone)]
pub struct AutoencoderDetector {
    config: ReconstructionConfig,
    seed: u64,
    model: Option<Autoencoder>,
    threshold: Option<f64>,
    summary: Option<TrainingSummary>,
}

impl AutoencoderDetector {
    pub fn new(config: ReconstructionConfig, seed: u64) -> Self {
        Self {
            config,
            seed,
            model: None,
            threshold: None,
            summary: None,
        }
    }

    pub fn threshold(&self) -> Option<f64> {
        self.threshold
    }

    pub fn training_summary(&self) -> Option<&TrainingSummary> {
        self.summary.as_ref()
    }
}

impl AnomalyDetector for AutoencoderDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Autoencoder
    }

    fn fit(&mut self, x: &Array2<f64>) -> Result<()> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.seed);
        let mut model = Autoencoder::new(self.config.clone());
        let summary = model.fit(x, &mut rng)?;

        let errors = model.reconstruction_errors(x);
        let threshold = percentile(&errors, self.config.threshold_percentile).ok_or(FraudError::EmptyBatch)?;
        info!(
            epochs = summary.epochs,
            best_epoch = summary.best_epoch,
            stopped_early = summary.stopped_early,
            threshold,
            "trained autoencoder"
        );

        self.model = Some(model);
        self.threshold = Some(threshold);
        self.summary = Some(summary);
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Detection> {
        let (model, threshold) = match (&self.model, self.threshold) {
            (Some(model), Some(threshold)) => (model, threshold),
            _ => return Err(FraudError::NotFitted("autoencoder detector")),
        };
        if x.ncols() != model.n_features {
            return Err(FraudError::DimensionMismatch {
                expected: model.n_features,
                actual: x.ncols(),
            });
        }

        let scores = model.reconstruction_errors(x);
        let flags: Vec<bool> = scores.iter().map(|&e| e > threshold).collect();
        info!(outliers = flags.iter().filter(|f| **f).count(), "autoencoder finished");
        Ok(Detection {
            flags,
            scores: Some(scores),
        })
    }
}
