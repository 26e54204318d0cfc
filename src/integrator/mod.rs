//! Component F: integrator.
//!
//! Advances the (compartment x subpop) state forward in time, applying
//! seeding events at the start of each daily step and either
//! integrating the compiled transition table deterministically (Euler
//! or RK4, generalized from a single-individual solver to a flattened
//! multi-compartment, multi-subpop state vector) or simulating it
//! stochastically (Poisson-thinned flows, with sequential binomial
//! splitting when several transitions share a source compartment).

pub mod euler;
pub mod ode;
pub mod runge_kutta;
pub mod stochastic;

use nalgebra::DVector;
use ndarray::{Array2, Array3};
use rand::Rng;
use thiserror::Error;

use crate::seeding::SeedingEvent;
use crate::transitions::CompiledTransitions;

pub use euler::EulerSolver;
pub use ode::{OdeSolver, OdeSystem, SolverConfig};
pub use runge_kutta::RungeKuttaSolver;
pub use stochastic::StochasticStepper;

#[derive(Error, Debug)]
pub enum IntegrationError {
    #[error("state became non-finite at t={t}")]
    NonFinite { t: f64 },

    #[error("invalid time step: {0}")]
    InvalidTimeStep(f64),

    #[error("maximum iterations exceeded")]
    MaxIterationsExceeded,

    #[error("compartment population went negative beyond tolerance in subpop {subpop} at day {day}")]
    NegativePrevalence { subpop: usize, day: usize },

    #[error("mass balance violated: subpop {subpop} population drifted by {delta} at day {day}")]
    MassImbalance { subpop: usize, delta: f64, day: usize },
}

/// Which fixed-step deterministic method to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationMethod {
    Euler,
    RungeKutta4,
}

/// Per-(transition, subpop, day) rate coefficients, precomputed by the
/// caller from the resolved `ParameterEngine` values and the modifier
/// arena's net multiplier so the integrator's hot loop only does
/// arithmetic on plain floats.
pub struct RateTable {
    /// `rates[[transition_idx, day, subpop]]`: the per-capita rate
    /// coefficient (before multiplying by the proportional-to sum and
    /// the source compartment's population).
    pub rates: Array3<f64>,
}

impl RateTable {
    pub fn rate(&self, transition_idx: usize, day: usize, subpop: usize) -> f64 {
        self.rates[[transition_idx, day, subpop]]
    }
}

/// Computes, for a given day and state snapshot, the absolute per-day
/// flow along every compiled transition and every subpop. Shared
/// between the deterministic `CompartmentOdeSystem` (which only needs
/// the instantaneous rate) and the stochastic stepper (which needs the
/// rate to drive a Poisson draw).
pub struct FlowModel<'a> {
    pub transitions: &'a CompiledTransitions,
    pub rates: &'a RateTable,
    pub n_compartments: usize,
    pub n_subpop: usize,
}

impl<'a> FlowModel<'a> {
    /// The per-capita coefficient for one transition/subpop/day: the
    /// rate parameter times the product of its proportional-to group
    /// sums (each raised to the transition's exponent), normalized by
    /// the subpop's total population so that force-of-infection terms
    /// are frequency- rather than density-dependent.
    pub fn per_capita_coefficient(&self, transition_idx: usize, day: usize, subpop: usize, state: &Array2<f64>) -> f64 {
        let transition = &self.transitions.entries[transition_idx];
        let base_rate = self.rates.rate(transition_idx, day, subpop);

        if transition.proportional_to.is_empty() {
            return base_rate;
        }

        let total_pop: f64 = (0..self.n_compartments).map(|c| state[[c, subpop]]).sum();
        if total_pop <= 0.0 {
            return 0.0;
        }

        let mut coefficient = base_rate;
        for (group, exponent) in &transition.proportional_to {
            let group_sum: f64 = group.iter().map(|&c| state[[c, subpop]]).sum();
            coefficient *= (group_sum / total_pop).powf(*exponent);
        }
        coefficient
    }

    /// Absolute flow (individuals/day) for one transition/subpop/day:
    /// the per-capita coefficient times the source compartment's
    /// current population.
    pub fn absolute_flow(&self, transition_idx: usize, day: usize, subpop: usize, state: &Array2<f64>) -> f64 {
        let transition = &self.transitions.entries[transition_idx];
        self.per_capita_coefficient(transition_idx, day, subpop, state) * state[[transition.source, subpop]]
    }
}

/// Wraps a `FlowModel` as an `OdeSystem` over the flattened
/// (compartment, subpop) state, for use by the deterministic solvers.
/// The flattening convention is row-major in compartment index:
/// `flat[c * n_subpop + s] == state[[c, s]]`.
pub struct CompartmentOdeSystem<'a> {
    pub flow_model: FlowModel<'a>,
    pub day: usize,
}

impl<'a> CompartmentOdeSystem<'a> {
    fn unflatten(&self, y: &DVector<f64>) -> Array2<f64> {
        let n_c = self.flow_model.n_compartments;
        let n_s = self.flow_model.n_subpop;
        Array2::from_shape_fn((n_c, n_s), |(c, s)| y[c * n_s + s])
    }
}

impl<'a> OdeSystem for CompartmentOdeSystem<'a> {
    fn derivatives(&self, _t: f64, y: &DVector<f64>) -> DVector<f64> {
        let n_c = self.flow_model.n_compartments;
        let n_s = self.flow_model.n_subpop;
        let state = self.unflatten(y);
        let mut d = Array2::<f64>::zeros((n_c, n_s));

        for (idx, transition) in self.flow_model.transitions.entries.iter().enumerate() {
            for s in 0..n_s {
                let flow = self.flow_model.absolute_flow(idx, self.day, s, &state);
                d[[transition.source, s]] -= flow;
                d[[transition.dest, s]] += flow;
            }
        }

        DVector::from_iterator(n_c * n_s, (0..n_c).flat_map(|c| (0..n_s).map(move |s| (c, s))).map(|(c, s)| d[[c, s]]))
    }

    fn dimension(&self) -> usize {
        self.flow_model.n_compartments * self.flow_model.n_subpop
    }
}

fn flatten(state: &Array2<f64>) -> DVector<f64> {
    let (n_c, n_s) = state.dim();
    DVector::from_iterator(n_c * n_s, (0..n_c).flat_map(|c| (0..n_s).map(move |s| (c, s))).map(|(c, s)| state[[c, s]]))
}

fn unflatten(y: &DVector<f64>, n_c: usize, n_s: usize) -> Array2<f64> {
    Array2::from_shape_fn((n_c, n_s), |(c, s)| y[c * n_s + s])
}

fn apply_seeding(state: &mut Array2<f64>, transitions_space_lookup: &dyn Fn(&str) -> usize, events: &[SeedingEvent], subpop_lookup: &dyn Fn(&str) -> usize, day: usize) {
    for event in events {
        if event.time.floor() as usize != day {
            continue;
        }
        let source = transitions_space_lookup(&event.source);
        let dest = transitions_space_lookup(&event.dest);
        let subpop = subpop_lookup(&event.subpop);
        let moved = event.amount.min(state[[source, subpop]].max(0.0));
        state[[source, subpop]] -= moved;
        state[[dest, subpop]] += moved;
    }
}

/// High-level day-stepped integration driver: advances `initial_state`
/// across `n_days` one day at a time, applying seeding events that land
/// on each day before integrating, and returns the full (day,
/// compartment, subpop) trajectory.
pub struct Integrator {
    pub method: IntegrationMethod,
    pub dt: f64,
    pub stochastic: bool,
}

impl Integrator {
    pub fn run(
        &self,
        transitions: &CompiledTransitions,
        rates: &RateTable,
        initial_state: Array2<f64>,
        n_days: usize,
        seeding_events: &[SeedingEvent],
        compartment_index: impl Fn(&str) -> usize,
        subpop_index: impl Fn(&str) -> usize,
        rng: &mut (impl Rng + ?Sized),
    ) -> Result<Array3<f64>, IntegrationError> {
        let (n_c, n_s) = initial_state.dim();
        let mut trajectory = Array3::<f64>::zeros((n_days + 1, n_c, n_s));
        let mut state = initial_state;
        trajectory.index_axis_mut(ndarray::Axis(0), 0).assign(&state);

        for day in 0..n_days {
            apply_seeding(&mut state, &compartment_index, seeding_events, &subpop_index, day);

            let flow_model = FlowModel { transitions, rates, n_compartments: n_c, n_subpop: n_s };

            state = if self.stochastic {
                stochastic::StochasticStepper { dt: self.dt }.step(&flow_model, day, &state, rng)
            } else {
                let system = CompartmentOdeSystem { flow_model, day };
                let y0 = flatten(&state);
                let config = SolverConfig { dt: self.dt, max_iterations: 100_000 };
                let y1 = match self.method {
                    IntegrationMethod::Euler => EulerSolver::new().solve_to_time(&system, day as f64, (day + 1) as f64, &y0, &config)?,
                    IntegrationMethod::RungeKutta4 => RungeKuttaSolver::new().solve_to_time(&system, day as f64, (day + 1) as f64, &y0, &config)?,
                };
                unflatten(&y1, n_c, n_s)
            };

            for s in 0..n_s {
                for c in 0..n_c {
                    if state[[c, s]] < -1e-6 {
                        return Err(IntegrationError::NegativePrevalence { subpop: s, day });
                    }
                    if state[[c, s]] < 0.0 {
                        state[[c, s]] = 0.0;
                    }
                }
            }

            trajectory.index_axis_mut(ndarray::Axis(0), day + 1).assign(&state);
        }

        Ok(trajectory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transitions::{CompiledTransition, CompiledTransitions};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn sir_transitions() -> CompiledTransitions {
        CompiledTransitions {
            entries: vec![
                CompiledTransition {
                    name: "infection".to_string(),
                    source: 0,
                    dest: 1,
                    rate_parameter: "beta".to_string(),
                    proportional_to: vec![(vec![1], 1.0)],
                },
                CompiledTransition {
                    name: "recovery".to_string(),
                    source: 1,
                    dest: 2,
                    rate_parameter: "gamma".to_string(),
                    proportional_to: vec![],
                },
            ],
        }
    }

    #[test]
    fn deterministic_sir_conserves_total_population() {
        let transitions = sir_transitions();
        let n_days = 30;
        let rates = RateTable {
            rates: Array3::from_shape_fn((2, n_days, 1), |(t, _, _)| if t == 0 { 0.4 } else { 0.1 }),
        };
        let mut state = Array2::<f64>::zeros((3, 1));
        state[[0, 0]] = 990.0;
        state[[1, 0]] = 10.0;

        let integrator = Integrator { method: IntegrationMethod::RungeKutta4, dt: 0.1, stochastic: false };
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let trajectory = integrator
            .run(&transitions, &rates, state.clone(), n_days, &[], |_| 0, |_| 0, &mut rng)
            .unwrap();

        for day in 0..=n_days {
            let total: f64 = trajectory.index_axis(ndarray::Axis(0), day).sum();
            assert!((total - 1000.0).abs() < 1e-3, "day {day}: total {total}");
        }
    }

    #[test]
    fn stochastic_sir_keeps_populations_nonnegative() {
        let transitions = sir_transitions();
        let n_days = 20;
        let rates = RateTable {
            rates: Array3::from_shape_fn((2, n_days, 1), |(t, _, _)| if t == 0 { 0.4 } else { 0.1 }),
        };
        let mut state = Array2::<f64>::zeros((3, 1));
        state[[0, 0]] = 990.0;
        state[[1, 0]] = 10.0;

        let integrator = Integrator { method: IntegrationMethod::Euler, dt: 1.0, stochastic: true };
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let trajectory = integrator
            .run(&transitions, &rates, state.clone(), n_days, &[], |_| 0, |_| 0, &mut rng)
            .unwrap();

        for day in 0..=n_days {
            for c in 0..3 {
                assert!(trajectory[[day, c, 0]] >= 0.0);
            }
        }
    }
}
