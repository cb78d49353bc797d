use ndarray::{Array1, Array2, Axis};
use tracing::warn;

use crate::error::{FraudError, Result};

/// Per-column statistics learned at fit time.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalerState {
    pub mean: Array1<f64>,
    pub std: Array1<f64>,
}

/// Zero-mean, unit-variance standardization.
#[derive(Debug, Clone, Default)]
pub struct StandardScaler {
    state: Option<ScalerState>,
}

impl StandardScaler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Learns column means and population standard deviations, replacing any
    /// earlier statistics. Constant columns get a std of 1.
    pub fn fit(&mut self, x: &Array2<f64>) -> Result<()> {
        let mean = x
            .mean_axis(Axis(0))
            .ok_or(FraudError::EmptyBatch)?;
        let mut std = x.std_axis(Axis(0), 0.0);

        for (column, s) in std.iter_mut().enumerate() {
            if s.is_nan() || *s <= f64::EPSILON {
                warn!(column, "zero variance column, scaling with std=1");
                *s = 1.0;
            }
        }

        self.state = Some(ScalerState { mean, std });
        Ok(())
    }

    pub fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let state = self.state.as_ref().ok_or(FraudError::NotFitted("feature scaler"))?;
        if x.ncols() != state.mean.len() {
            return Err(FraudError::DimensionMismatch {
                expected: state.mean.len(),
                actual: x.ncols(),
            });
        }
        Ok((x - &state.mean) / &state.std)
    }

    pub fn fit_transform(&mut self, x: &Array2<f64>) -> Result<Array2<f64>> {
        self.fit(x)?;
        self.transform(x)
    }

    pub fn state(&self) -> Option<&ScalerState> {
        self.state.as_ref()
    }
}
