//! Ambient module: MCMC diagnostics.
//!
//! Computes real acceptance rates and trace stability from a chain's
//! recorded history, rather than the placeholder goodness-of-fit block
//! a single-individual NLME fit would report; this crate calibrates a
//! population model against aggregate time series, so "goodness of
//! fit" is expressed per-statistic through the likelihood module
//! instead of a single AIC/BIC pair.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDiagnostics {
    pub chain_id: usize,
    pub global_acceptance_rate: f64,
    pub chimeric_acceptance_rate: f64,
    pub log_likelihood_trace_stability: f64,
    pub iterations_completed: usize,
}

/// `global_accepted`/`chimeric_accepted` are per-iteration booleans
/// recording whether that iteration's proposal was accepted;
/// `log_likelihood_trace` is the running global log-likelihood after
/// each iteration.
pub fn chain_diagnostics(
    chain_id: usize,
    global_accepted: &[bool],
    chimeric_accepted: &[bool],
    log_likelihood_trace: &[f64],
) -> ChainDiagnostics {
    let global_acceptance_rate = acceptance_rate(global_accepted);
    let chimeric_acceptance_rate = acceptance_rate(chimeric_accepted);
    let log_likelihood_trace_stability = trace_stability(log_likelihood_trace);

    ChainDiagnostics {
        chain_id,
        global_acceptance_rate,
        chimeric_acceptance_rate,
        log_likelihood_trace_stability,
        iterations_completed: global_accepted.len(),
    }
}

fn acceptance_rate(accepted: &[bool]) -> f64 {
    if accepted.is_empty() {
        return 0.0;
    }
    accepted.iter().filter(|&&a| a).count() as f64 / accepted.len() as f64
}

/// Coefficient of variation of the trailing window of the trace, a
/// cheap proxy for "has the chain settled": small values mean the
/// recent log-likelihood has stopped drifting.
fn trace_stability(trace: &[f64]) -> f64 {
    let window = 50.min(trace.len());
    if window < 2 {
        return f64::INFINITY;
    }
    let recent = &trace[trace.len() - window..];
    let mean = recent.iter().sum::<f64>() / window as f64;
    if mean.abs() < 1e-9 {
        return f64::INFINITY;
    }
    let variance = recent.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (window - 1) as f64;
    variance.sqrt() / mean.abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptance_rate_counts_true_fraction() {
        let diagnostics = chain_diagnostics(0, &[true, true, false, false], &[true, false, false, false], &[1.0, 1.0, 1.0]);
        assert_eq!(diagnostics.global_acceptance_rate, 0.5);
        assert_eq!(diagnostics.chimeric_acceptance_rate, 0.25);
    }

    #[test]
    fn stable_trace_has_low_stability_value() {
        let trace: Vec<f64> = vec![-100.0; 60];
        let diagnostics = chain_diagnostics(0, &[], &[], &trace);
        assert!(diagnostics.log_likelihood_trace_stability < 1e-6);
    }

    #[test]
    fn empty_trace_is_reported_as_unstable() {
        let diagnostics = chain_diagnostics(0, &[], &[], &[]);
        assert_eq!(diagnostics.log_likelihood_trace_stability, f64::INFINITY);
    }
}
