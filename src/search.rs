//! Evaluate-candidates-keep-the-best search shared by the detectors that sweep
//! hyperparameters.

use std::collections::HashMap;

use ndarray::{Array2, ArrayView1};
use tracing::debug;

use crate::error::Result;

/// A candidate and the score it earned.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluated<C> {
    pub candidate: C,
    pub score: f64,
}

/// Runs `evaluate` on every candidate and keeps the highest score.
///
/// `evaluate` returns `Ok(None)` for a candidate that is not eligible (for
/// instance a clustering that collapsed into one group). On ties the earlier
/// candidate wins. Returns `Ok(None)` when nothing was eligible.
pub fn select_best<C, I, F>(candidates: I, mut evaluate: F) -> Result<Option<Evaluated<C>>>
where
    C: std::fmt::Debug,
    I: IntoIterator<Item = C>,
    F: FnMut(&C) -> Result<Option<f64>>,
{
    let mut best: Option<Evaluated<C>> = None;
    for candidate in candidates {
        let Some(score) = evaluate(&candidate)? else {
            debug!(?candidate, "candidate not eligible");
            continue;
        };
        debug!(?candidate, score, "evaluated candidate");
        if !score.is_finite() {
            continue;
        }
        if best.as_ref().map_or(true, |b| score > b.score) {
            best = Some(Evaluated { candidate, score });
        }
    }
    Ok(best)
}

/// Number of distinct labels, counting every label value (noise included).
pub fn distinct_labels<L: Eq + std::hash::Hash>(labels: &[L]) -> usize {
    labels.iter().collect::<std::collections::HashSet<_>>().len()
}

fn euclidean(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// Mean silhouette coefficient of a labelling, in [-1, 1].
///
/// Returns `None` when fewer than two labels are present or every label is a
/// singleton, where the coefficient is undefined. Singleton points score 0.
pub fn silhouette_score<L: Eq + std::hash::Hash + Copy>(x: &Array2<f64>, labels: &[L]) -> Option<f64> {
    let n = x.nrows();
    if n != labels.len() || distinct_labels(labels) < 2 || distinct_labels(labels) == n {
        return None;
    }

    let mut sizes: HashMap<L, usize> = HashMap::new();
    for &l in labels {
        *sizes.entry(l).or_default() += 1;
    }

    let mut total = 0.0;
    for i in 0..n {
        let own = labels[i];
        if sizes[&own] == 1 {
            continue;
        }

        let mut sums: HashMap<L, f64> = HashMap::new();
        for j in 0..n {
            if i != j {
                *sums.entry(labels[j]).or_default() += euclidean(x.row(i), x.row(j));
            }
        }

        let a = sums.get(&own).copied().unwrap_or(0.0) / (sizes[&own] - 1) as f64;
        let b = sums
            .iter()
            .filter(|(l, _)| **l != own)
            .map(|(l, s)| s / sizes[l] as f64)
            .fold(f64::INFINITY, f64::min);

        let denom = a.max(b);
        if denom > 0.0 {
            total += (b - a) / denom;
        }
    }

    Some(total / n as f64)
}
