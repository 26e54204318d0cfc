//! Component I: inference controller.
//!
//! Runs independent MCMC chains (each its own rayon task, each
//! strictly sequential within itself) that perturb a global parameter
//! vector and, per subpopulation, an independently-perturbed "chimeric"
//! override vector. Each iteration perturbs and resimulates every
//! subpop's chimeric vector one at a time (each against an assignment
//! that holds every other subpop at its last accepted value), accepting
//! or rejecting each independently against that subpop's own
//! log-likelihood; it then perturbs and resimulates a single shared
//! global vector (every subpop set to the same proposal) and accepts or
//! rejects it against the pooled total plus each free parameter's prior
//! log-density.

pub mod mcmc;
pub mod resume;

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use rand_distr::{Distribution as RandDistribution, Normal};
use thiserror::Error;

use crate::params::ParamDistribution;

pub use mcmc::{ChainState, ParameterVector};
pub use resume::ResumeSlot;

/// A complete per-subpop parameter assignment for one simulation: every
/// subpop's name mapped to the parameter vector it should be simulated
/// with. A "global" evaluation maps every subpop to the same vector; a
/// "chimeric" evaluation differs from the chain's last accepted
/// chimeric state in exactly one subpop's entry.
pub type SubpopAssignment = HashMap<String, ParameterVector>;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("chain {chain} failed {count} consecutive integration errors and was aborted: {last}")]
    Fatal { chain: usize, count: usize, last: String },

    #[error("resume artifact missing or malformed: {0}")]
    Resume(String),
}

/// Hyperparameters governing the MCMC loop itself, independent of the
/// model being fit.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub iterations_per_slot: usize,
    pub n_chains: usize,
    pub step_size: f64,
    /// When a global proposal is accepted, whether every subpop's
    /// chimeric override is reset back to the (now-updated) global
    /// value, or left independently perturbed. The spec leaves this an
    /// open question; this crate defaults to `true`, matching the usual
    /// convention that a globally accepted step represents consensus
    /// and should not be immediately re-diverged by stale per-subpop
    /// state.
    pub reset_chimeric_on_accept: bool,
    /// Number of consecutive `IntegrationError`s on a single chain
    /// before that chain is abandoned as fatal.
    pub max_consecutive_integration_errors: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            iterations_per_slot: 100,
            n_chains: 4,
            step_size: 0.1,
            reset_chimeric_on_accept: true,
            max_consecutive_integration_errors: 3,
        }
    }
}

/// What a single simulate-and-score callback returns for one proposal:
/// a per-subpop log-likelihood vector, ordered the same as the chain's
/// `subpop_names`. Chimeric acceptance acts on a single entry; global
/// acceptance acts on the sum plus the proposal's prior log-density.
pub struct ScoredProposal {
    pub per_subpop_log_likelihood: Vec<f64>,
}

impl ScoredProposal {
    pub fn total(&self, log_prior: f64) -> f64 {
        self.per_subpop_log_likelihood.iter().sum::<f64>() + log_prior
    }
}

/// Which proposal a `simulate_and_score` call is scoring: the shared
/// global vector, or a single subpop's independently-perturbed
/// chimeric override. Lets the caller key per-iteration artifact
/// writes by block and, for chimeric calls, by which subpop the
/// proposal belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalKind {
    Global,
    Chimeric { subpop: String },
}

/// Runs one chain to completion. `simulate_and_score` is called once
/// per subpop per iteration for that subpop's independently-perturbed
/// chimeric proposal, and once more for the shared global proposal;
/// each call returns `Err` to signal a (recoverable) integration
/// failure, counted across both chimeric and global calls. After
/// `max_consecutive_integration_errors` in a row the chain aborts with
/// `InferenceError::Fatal`.
pub fn run_chain<E: std::fmt::Display>(
    chain_id: usize,
    config: &InferenceConfig,
    free_params: &[ParamDistribution],
    subpop_names: &[String],
    mut rng: impl Rng,
    mut simulate_and_score: impl FnMut(usize, ProposalKind, &SubpopAssignment) -> Result<ScoredProposal, E>,
) -> Result<ChainState, InferenceError> {
    let mut state = ChainState::seed(free_params, subpop_names, &mut rng);
    let mut consecutive_errors = 0usize;

    let initial_assignment: SubpopAssignment = subpop_names.iter().map(|s| (s.clone(), state.global.clone())).collect();
    let initial_score = match simulate_and_score(0, ProposalKind::Global, &initial_assignment) {
        Ok(scored) => scored,
        Err(e) => return Err(InferenceError::Fatal { chain: chain_id, count: 1, last: e.to_string() }),
    };
    state.global_log_likelihood = initial_score.total(log_prior(free_params, &state.global));
    for (subpop, &ll) in subpop_names.iter().zip(initial_score.per_subpop_log_likelihood.iter()) {
        state.chimeric_log_likelihood.insert(subpop.clone(), ll);
    }

    for iteration in 0..config.iterations_per_slot {
        // Chimeric step: perturb one subpop's override at a time,
        // holding every other subpop at its last accepted chimeric
        // vector, so each subpop's proposal is genuinely its own rather
        // than a shared global draw re-scored per subpop.
        for (idx, subpop) in subpop_names.iter().enumerate() {
            let mut proposal = state.chimeric[subpop].clone();
            perturb(&mut proposal, config.step_size, free_params, &mut rng);

            let mut assignment = state.chimeric.clone();
            assignment.insert(subpop.clone(), proposal.clone());

            match simulate_and_score(iteration, ProposalKind::Chimeric { subpop: subpop.clone() }, &assignment) {
                Ok(scored) => {
                    consecutive_errors = 0;
                    let proposed_ll = scored.per_subpop_log_likelihood[idx];
                    let current_ll = *state.chimeric_log_likelihood.get(subpop).unwrap_or(&f64::NEG_INFINITY);
                    if metropolis_accept(current_ll, proposed_ll, &mut rng) {
                        state.chimeric.insert(subpop.clone(), proposal);
                        state.chimeric_log_likelihood.insert(subpop.clone(), proposed_ll);
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= config.max_consecutive_integration_errors {
                        return Err(InferenceError::Fatal { chain: chain_id, count: consecutive_errors, last: e.to_string() });
                    }
                }
            }
        }

        // Global step: a single shared proposal evaluated with every
        // subpop set to it, accepted against the pooled total plus the
        // proposal's prior log-density.
        let mut global_proposal = state.global.clone();
        perturb(&mut global_proposal, config.step_size, free_params, &mut rng);
        let global_assignment: SubpopAssignment = subpop_names.iter().map(|s| (s.clone(), global_proposal.clone())).collect();

        match simulate_and_score(iteration, ProposalKind::Global, &global_assignment) {
            Ok(scored) => {
                consecutive_errors = 0;
                let proposed_total = scored.total(log_prior(free_params, &global_proposal));
                if metropolis_accept(state.global_log_likelihood, proposed_total, &mut rng) {
                    state.global = global_proposal;
                    state.global_log_likelihood = proposed_total;
                    if config.reset_chimeric_on_accept {
                        for (s_idx, subpop) in subpop_names.iter().enumerate() {
                            state.chimeric.insert(subpop.clone(), state.global.clone());
                            state.chimeric_log_likelihood.insert(subpop.clone(), scored.per_subpop_log_likelihood[s_idx]);
                        }
                    }
                }
            }
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors >= config.max_consecutive_integration_errors {
                    return Err(InferenceError::Fatal { chain: chain_id, count: consecutive_errors, last: e.to_string() });
                }
            }
        }

        state.iterations_completed = iteration + 1;
    }

    Ok(state)
}

/// Sum of each free parameter's prior log-density at the given vector's
/// corresponding entry, used as the prior term in global acceptance.
fn log_prior(free_params: &[ParamDistribution], params: &ParameterVector) -> f64 {
    free_params.iter().zip(params.values.iter()).map(|(dist, &value)| dist.log_density(value)).sum()
}

/// Truncated-normal proposal: each entry is redrawn from a normal
/// distribution centered on its current value with scale `step_size`,
/// rejection-sampled against that parameter's declared support so a
/// proposal never leaves the region its prior assigns nonzero density.
/// Parameters with degenerate support (e.g. a fixed value) are left
/// unperturbed.
fn perturb(params: &mut ParameterVector, step_size: f64, free_params: &[ParamDistribution], rng: &mut impl Rng) {
    for (value, dist) in params.values.iter_mut().zip(free_params.iter()) {
        let (lo, hi) = dist.support();
        if hi <= lo {
            continue;
        }
        let normal = Normal::new(*value, step_size).expect("step_size must be positive");
        loop {
            let draw = normal.sample(rng);
            if draw >= lo && draw <= hi {
                *value = draw;
                break;
            }
        }
    }
}

fn metropolis_accept(current_log_likelihood: f64, proposed_log_likelihood: f64, rng: &mut impl Rng) -> bool {
    if !proposed_log_likelihood.is_finite() {
        return false;
    }
    let log_alpha = proposed_log_likelihood - current_log_likelihood;
    let alpha = log_alpha.exp().min(1.0);
    rng.gen::<f64>() < alpha
}

/// Runs `config.n_chains` independent chains in parallel, seeding each
/// chain's RNG by mixing the controller seed with the chain index so
/// runs are reproducible regardless of how rayon schedules the work.
pub fn run_all_chains<E: std::fmt::Display + Send>(
    config: Arc<InferenceConfig>,
    free_params: Arc<Vec<ParamDistribution>>,
    subpop_names: Arc<Vec<String>>,
    controller_seed: u64,
    simulate_and_score: impl Fn(usize, usize, ProposalKind, &SubpopAssignment) -> Result<ScoredProposal, E> + Sync,
) -> Vec<Result<ChainState, InferenceError>> {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rayon::prelude::*;

    (0..config.n_chains)
        .into_par_iter()
        .map(|chain_id| {
            let seed = controller_seed ^ ((chain_id as u64).wrapping_mul(0x9E3779B97F4A7C15));
            let rng = ChaCha8Rng::seed_from_u64(seed);
            run_chain(chain_id, &config, &free_params, &subpop_names, rng, |iteration, kind, assignment| {
                simulate_and_score(chain_id, iteration, kind, assignment)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[derive(Debug)]
    struct NeverFails;
    impl std::fmt::Display for NeverFails {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "never fails")
        }
    }

    #[test]
    fn chain_converges_toward_target_mean() {
        let config = InferenceConfig { iterations_per_slot: 200, step_size: 0.3, ..Default::default() };
        let subpops = vec!["regionA".to_string()];
        let free_params = vec![ParamDistribution::Uniform { low: -10.0, high: 10.0 }];
        let rng = ChaCha8Rng::seed_from_u64(123);

        let target = 2.0;
        let state = run_chain(0, &config, &free_params, &subpops, rng, |_iteration, _kind, assignment: &SubpopAssignment| {
            let diff = assignment["regionA"].values[0] - target;
            Ok::<_, NeverFails>(ScoredProposal { per_subpop_log_likelihood: vec![-0.5 * diff * diff] })
        })
        .unwrap();

        assert!((state.global.values[0] - target).abs() < 2.0);
        assert_eq!(state.iterations_completed, 200);
    }

    #[test]
    fn chimeric_proposals_diverge_independently_per_subpop() {
        let config = InferenceConfig { iterations_per_slot: 80, step_size: 0.5, reset_chimeric_on_accept: false, ..Default::default() };
        let subpops = vec!["north".to_string(), "south".to_string()];
        let free_params = vec![ParamDistribution::Uniform { low: -10.0, high: 10.0 }];
        let rng = ChaCha8Rng::seed_from_u64(7);

        // north's target is 3.0, south's is -3.0: a single shared global
        // vector can satisfy at most one of them, so only genuinely
        // independent chimeric overrides can score well on both.
        let state = run_chain(0, &config, &free_params, &subpops, rng, |_iteration, _kind, assignment: &SubpopAssignment| {
            let diff_n = assignment["north"].values[0] - 3.0;
            let diff_s = assignment["south"].values[0] - (-3.0);
            Ok::<_, NeverFails>(ScoredProposal { per_subpop_log_likelihood: vec![-0.5 * diff_n * diff_n, -0.5 * diff_s * diff_s] })
        })
        .unwrap();

        assert!(state.chimeric["north"].values[0] > state.chimeric["south"].values[0]);
    }

    #[test]
    fn fatal_after_consecutive_integration_errors() {
        #[derive(Debug)]
        struct AlwaysFails;
        impl std::fmt::Display for AlwaysFails {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "integration failed")
            }
        }

        let config = InferenceConfig { iterations_per_slot: 10, max_consecutive_integration_errors: 3, ..Default::default() };
        let subpops = vec!["regionA".to_string()];
        let free_params = vec![ParamDistribution::Fixed { value: 0.0 }];
        let rng = ChaCha8Rng::seed_from_u64(1);

        let mut call = 0;
        let result = run_chain(0, &config, &free_params, &subpops, rng, |_iteration, _kind, _: &SubpopAssignment| {
            call += 1;
            if call == 1 {
                Ok::<_, AlwaysFails>(ScoredProposal { per_subpop_log_likelihood: vec![0.0] })
            } else {
                Err(AlwaysFails)
            }
        });

        assert!(matches!(result, Err(InferenceError::Fatal { .. })));
    }
}
