use std::collections::BTreeMap;

use ndarray::Array2;
use rand::Rng;
use rand_distr::{Binomial, Distribution as RandDistribution};

use super::FlowModel;

/// Discrete stochastic stepper: draws the number of individuals leaving
/// each compartment via sequential binomial thinning so that
/// compartments with several competing outflows never emit more
/// individuals than they hold, then apportions that draw among the
/// competing transitions in proportion to their instantaneous rate.
pub struct StochasticStepper {
    pub dt: f64,
}

impl StochasticStepper {
    pub fn step(&self, flow_model: &FlowModel, day: usize, state: &Array2<f64>, rng: &mut (impl Rng + ?Sized)) -> Array2<f64> {
        let (n_c, n_s) = (flow_model.n_compartments, flow_model.n_subpop);
        let mut next = state.clone();

        for s in 0..n_s {
            // Group transitions by source compartment so that competing
            // outflows from the same source are thinned sequentially
            // against the population remaining after earlier draws,
            // rather than independently (which could overdraw it).
            // A BTreeMap keeps iteration order (hence the order the
            // shared rng is consumed) deterministic across runs.
            let mut by_source: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
            for (idx, transition) in flow_model.transitions.entries.iter().enumerate() {
                by_source.entry(transition.source).or_default().push(idx);
            }

            for (&source, transition_idxs) in &by_source {
                let mut remaining = state[[source, s]];
                if remaining <= 0.0 {
                    continue;
                }

                for &idx in transition_idxs {
                    if remaining <= 0.0 {
                        break;
                    }
                    let coefficient = flow_model.per_capita_coefficient(idx, day, s, state);
                    let p = (coefficient * self.dt).clamp(0.0, 1.0);
                    let n = remaining.round() as u64;
                    let draw = if p <= 0.0 || n == 0 {
                        0.0
                    } else {
                        Binomial::new(n, p).expect("thinning probability must be in [0, 1]").sample(rng) as f64
                    };

                    let transition = &flow_model.transitions.entries[idx];
                    next[[transition.source, s]] -= draw;
                    next[[transition.dest, s]] += draw;
                    remaining -= draw;
                }
            }
        }

        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrator::RateTable;
    use crate::transitions::{CompiledTransition, CompiledTransitions};
    use ndarray::Array3;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn thinning_never_draws_more_than_the_source_holds() {
        let transitions = CompiledTransitions {
            entries: vec![
                CompiledTransition {
                    name: "out_a".to_string(),
                    source: 0,
                    dest: 1,
                    rate_parameter: "r1".to_string(),
                    proportional_to: vec![],
                },
                CompiledTransition {
                    name: "out_b".to_string(),
                    source: 0,
                    dest: 2,
                    rate_parameter: "r2".to_string(),
                    proportional_to: vec![],
                },
            ],
        };
        let rates = RateTable { rates: Array3::from_elem((2, 1, 1), 5.0) };
        let mut state = Array2::<f64>::zeros((3, 1));
        state[[0, 0]] = 10.0;

        let flow_model = FlowModel { transitions: &transitions, rates: &rates, n_compartments: 3, n_subpop: 1 };
        let stepper = StochasticStepper { dt: 1.0 };
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let next = stepper.step(&flow_model, 0, &state, &mut rng);

        assert!(next[[0, 0]] >= 0.0);
        let total: f64 = next.sum();
        assert!((total - 10.0).abs() < 1e-9);
    }
}
