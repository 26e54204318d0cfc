//! Component H: likelihood.
//!
//! Compares a simulated outcome series against ground truth under a
//! declared observation distribution, after resampling both series onto
//! a common reporting period (daily, weekly, ...) with an aggregator.
//! Returns one log-likelihood per subpopulation rather than a single
//! pooled scalar, since the inference controller accepts or rejects
//! per-subpop ("chimeric") proposals independently.

use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, Discrete, Normal, Poisson};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LikelihoodError {
    #[error("statistic '{0}' has a zero-length data series")]
    EmptySeries(String),

    #[error("statistic '{name}' simulated and ground-truth series differ in length after resampling ({sim} vs {gt})")]
    LengthMismatch { name: String, sim: usize, gt: usize },

    #[error("statistic '{0}' has non-positive scale parameter")]
    InvalidScale(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregator {
    Sum,
    Mean,
    Max,
}

impl Aggregator {
    fn reduce(&self, values: &[f64]) -> f64 {
        match self {
            Aggregator::Sum => values.iter().sum(),
            Aggregator::Mean => values.iter().sum::<f64>() / values.len().max(1) as f64,
            Aggregator::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplePeriod {
    Daily,
    Weekly,
    Monthly,
}

impl ResamplePeriod {
    fn bucket_size(&self) -> usize {
        match self {
            ResamplePeriod::Daily => 1,
            ResamplePeriod::Weekly => 7,
            ResamplePeriod::Monthly => 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "distribution", rename_all = "snake_case")]
pub enum LikelihoodDistribution {
    Pois,
    Norm { sd: f64 },
    NormCov { coefficient_of_variation: f64 },
    SqrtNorm { sd: f64 },
    LogNorm { sdlog: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistic {
    pub name: String,
    pub period: ResamplePeriod,
    pub aggregator: Aggregator,
    pub distribution: LikelihoodDistribution,
    #[serde(default)]
    pub zero_to_one: bool,
    #[serde(default)]
    pub skipna: bool,
    #[serde(default)]
    pub regularizers: Option<Regularizers>,
}

fn resample(series: &[f64], period: ResamplePeriod, aggregator: Aggregator, skipna: bool) -> Vec<f64> {
    let bucket = period.bucket_size();
    series
        .chunks(bucket)
        .map(|chunk| {
            let values: Vec<f64> = if skipna {
                chunk.iter().copied().filter(|v| v.is_finite()).collect()
            } else {
                chunk.to_vec()
            };
            if values.is_empty() {
                f64::NAN
            } else {
                aggregator.reduce(&values)
            }
        })
        .collect()
}

/// Replaces an exact-zero simulated value with `1.0` so a distribution
/// like `Pois` or `LogNorm` that's undefined or degenerate at zero still
/// scores a point where the simulator produced none of something.
/// Ground truth is never touched: a true zero observation is real data,
/// not a simulator artifact.
fn apply_zero_to_one(value: f64, zero_to_one: bool) -> f64 {
    if zero_to_one && value == 0.0 {
        1.0
    } else {
        value
    }
}

impl Statistic {
    /// Per-day log-likelihood contributions after resampling; the
    /// caller sums the relevant subset for its own regularizer.
    pub fn log_likelihood(&self, simulated: &[f64], ground_truth: &[f64]) -> Result<f64, LikelihoodError> {
        if simulated.is_empty() || ground_truth.is_empty() {
            return Err(LikelihoodError::EmptySeries(self.name.clone()));
        }

        let sim_resampled = resample(simulated, self.period, self.aggregator, self.skipna);
        let gt_resampled = resample(ground_truth, self.period, self.aggregator, self.skipna);

        if sim_resampled.len() != gt_resampled.len() {
            return Err(LikelihoodError::LengthMismatch {
                name: self.name.clone(),
                sim: sim_resampled.len(),
                gt: gt_resampled.len(),
            });
        }

        let mut total = 0.0;
        for (sim, gt) in sim_resampled.iter().zip(gt_resampled.iter()) {
            if self.skipna && (gt.is_nan() || sim.is_nan()) {
                continue;
            }
            let sim = apply_zero_to_one(*sim, self.zero_to_one);
            total += self.point_log_likelihood(sim, *gt)?;
        }
        Ok(total)
    }

    fn point_log_likelihood(&self, sim: f64, gt: f64) -> Result<f64, LikelihoodError> {
        match &self.distribution {
            LikelihoodDistribution::Pois => {
                let lambda = sim.max(1e-9);
                let dist = Poisson::new(lambda).map_err(|_| LikelihoodError::InvalidScale(self.name.clone()))?;
                Ok(dist.ln_pmf(gt.round() as u64))
            }
            LikelihoodDistribution::Norm { sd } => {
                if *sd <= 0.0 {
                    return Err(LikelihoodError::InvalidScale(self.name.clone()));
                }
                let dist = Normal::new(sim, *sd).map_err(|_| LikelihoodError::InvalidScale(self.name.clone()))?;
                Ok(dist.ln_pdf(gt))
            }
            LikelihoodDistribution::NormCov { coefficient_of_variation } => {
                let sd = (sim.abs() * coefficient_of_variation).max(1e-6);
                let dist = Normal::new(sim, sd).map_err(|_| LikelihoodError::InvalidScale(self.name.clone()))?;
                Ok(dist.ln_pdf(gt))
            }
            LikelihoodDistribution::SqrtNorm { sd } => {
                if *sd <= 0.0 {
                    return Err(LikelihoodError::InvalidScale(self.name.clone()));
                }
                let dist = Normal::new(sim.max(0.0).sqrt(), *sd).map_err(|_| LikelihoodError::InvalidScale(self.name.clone()))?;
                Ok(dist.ln_pdf(gt.max(0.0).sqrt()))
            }
            LikelihoodDistribution::LogNorm { sdlog } => {
                if *sdlog <= 0.0 {
                    return Err(LikelihoodError::InvalidScale(self.name.clone()));
                }
                let dist = Normal::new(sim.max(1e-9).ln(), *sdlog).map_err(|_| LikelihoodError::InvalidScale(self.name.clone()))?;
                Ok(dist.ln_pdf(gt.max(1e-9).ln()))
            }
        }
    }
}

/// Additive penalty terms applied on top of the raw statistic
/// log-likelihoods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Regularizers {
    /// Penalizes proposals whose forecast tail diverges from the most
    /// recent observed trend, weighted by `forecast_weight`.
    #[serde(default)]
    pub forecast_weight: f64,
    /// Penalizes a subpop's likelihood more harshly when other
    /// subpopulations fit poorly too, encouraging globally coherent fits.
    #[serde(default)]
    pub allsubpop_weight: f64,
}

impl Default for Regularizers {
    fn default() -> Self {
        Self { forecast_weight: 0.0, allsubpop_weight: 0.0 }
    }
}

impl Regularizers {
    pub fn forecast_penalty(&self, simulated_tail: &[f64], observed_tail: &[f64]) -> f64 {
        if self.forecast_weight == 0.0 || simulated_tail.is_empty() || observed_tail.is_empty() {
            return 0.0;
        }
        let n = simulated_tail.len().min(observed_tail.len());
        let mse: f64 = simulated_tail[..n]
            .iter()
            .zip(observed_tail[..n].iter())
            .map(|(s, o)| (s - o).powi(2))
            .sum::<f64>()
            / n as f64;
        -self.forecast_weight * mse
    }

    pub fn allsubpop_penalty(&self, per_subpop_loglik: &[f64]) -> f64 {
        if self.allsubpop_weight == 0.0 || per_subpop_loglik.is_empty() {
            return 0.0;
        }
        let mean = per_subpop_loglik.iter().sum::<f64>() / per_subpop_loglik.len() as f64;
        self.allsubpop_weight * mean
    }
}

/// Number of trailing days `forecast_penalty` compares against, matching
/// the two-week window the outcomes pipeline typically reports over.
const FORECAST_TAIL_DAYS: usize = 14;

fn tail(series: &[f64]) -> &[f64] {
    let start = series.len().saturating_sub(FORECAST_TAIL_DAYS);
    &series[start..]
}

/// Computes one log-likelihood per subpop across a set of statistics,
/// folding in each statistic's declared regularizer penalties: a
/// forecast-tail penalty added per subpop, and an all-subpop penalty
/// (computed from that statistic's raw log-likelihoods across every
/// subpop) added identically to each.
pub fn per_subpop_log_likelihood(
    statistics: &[Statistic],
    simulated: impl Fn(&str, usize) -> Vec<f64>,
    ground_truth: impl Fn(&str, usize) -> Vec<f64>,
    n_subpop: usize,
) -> Result<Vec<f64>, LikelihoodError> {
    let mut out = vec![0.0; n_subpop];
    for statistic in statistics {
        let mut per_subpop = Vec::with_capacity(n_subpop);
        for subpop in 0..n_subpop {
            let sim = simulated(&statistic.name, subpop);
            let gt = ground_truth(&statistic.name, subpop);
            let mut ll = statistic.log_likelihood(&sim, &gt)?;
            if let Some(regularizers) = &statistic.regularizers {
                ll += regularizers.forecast_penalty(tail(&sim), tail(&gt));
            }
            per_subpop.push(ll);
        }
        if let Some(regularizers) = &statistic.regularizers {
            let allsubpop = regularizers.allsubpop_penalty(&per_subpop);
            for ll in per_subpop.iter_mut() {
                *ll += allsubpop;
            }
        }
        for (subpop, ll) in per_subpop.into_iter().enumerate() {
            out[subpop] += ll;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_series_maximizes_normal_likelihood() {
        let statistic = Statistic {
            name: "hosp".to_string(),
            period: ResamplePeriod::Daily,
            aggregator: Aggregator::Sum,
            distribution: LikelihoodDistribution::Norm { sd: 1.0 },
            zero_to_one: false,
            skipna: false,
            regularizers: None,
        };
        let identical = statistic.log_likelihood(&[10.0, 20.0, 30.0], &[10.0, 20.0, 30.0]).unwrap();
        let off = statistic.log_likelihood(&[10.0, 20.0, 30.0], &[15.0, 25.0, 35.0]).unwrap();
        assert!(identical > off);
    }

    #[test]
    fn weekly_resampling_sums_into_buckets() {
        let statistic = Statistic {
            name: "cases".to_string(),
            period: ResamplePeriod::Weekly,
            aggregator: Aggregator::Sum,
            distribution: LikelihoodDistribution::Pois,
            zero_to_one: false,
            skipna: false,
            regularizers: None,
        };
        let daily = vec![1.0; 14];
        let loglik = statistic.log_likelihood(&daily, &daily).unwrap();
        assert!(loglik.is_finite());
    }

    #[test]
    fn empty_series_is_rejected() {
        let statistic = Statistic {
            name: "cases".to_string(),
            period: ResamplePeriod::Daily,
            aggregator: Aggregator::Sum,
            distribution: LikelihoodDistribution::Pois,
            zero_to_one: false,
            skipna: false,
            regularizers: None,
        };
        let err = statistic.log_likelihood(&[], &[1.0]).unwrap_err();
        assert!(matches!(err, LikelihoodError::EmptySeries(_)));
    }

    #[test]
    fn per_subpop_likelihood_returns_one_value_per_subpop() {
        let statistic = Statistic {
            name: "cases".to_string(),
            period: ResamplePeriod::Daily,
            aggregator: Aggregator::Sum,
            distribution: LikelihoodDistribution::Norm { sd: 2.0 },
            zero_to_one: false,
            skipna: false,
            regularizers: None,
        };
        let result = per_subpop_log_likelihood(
            &[statistic],
            |_, _| vec![1.0, 2.0, 3.0],
            |_, _| vec![1.0, 2.0, 3.0],
            2,
        )
        .unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn zero_to_one_replaces_only_exact_zero_simulated_values() {
        assert_eq!(apply_zero_to_one(0.0, true), 1.0);
        assert_eq!(apply_zero_to_one(0.3, true), 0.3);
        assert_eq!(apply_zero_to_one(0.3, false), 0.3);
    }

    #[test]
    fn allsubpop_penalty_pulls_every_subpop_toward_the_group_mean_fit() {
        let statistic = Statistic {
            name: "cases".to_string(),
            period: ResamplePeriod::Daily,
            aggregator: Aggregator::Sum,
            distribution: LikelihoodDistribution::Norm { sd: 2.0 },
            zero_to_one: false,
            skipna: false,
            regularizers: Some(Regularizers { forecast_weight: 0.0, allsubpop_weight: 1.0 }),
        };
        // subpop 0 fits well, subpop 1 fits poorly; the allsubpop penalty
        // (the group mean raw log-likelihood) is added to both, so the
        // well-fit subpop's total is pulled down by the other's bad fit.
        let without_penalty = statistic.log_likelihood(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]).unwrap();
        let result = per_subpop_log_likelihood(
            &[statistic],
            |_, subpop| if subpop == 0 { vec![1.0, 2.0, 3.0] } else { vec![1.0, 2.0, 3.0] },
            |_, subpop| if subpop == 0 { vec![1.0, 2.0, 3.0] } else { vec![100.0, 200.0, 300.0] },
            2,
        )
        .unwrap();
        assert!(result[0] < without_penalty);
    }
}
