use nalgebra::DVector;

use super::ode::{OdeSolver, OdeSystem, SolverConfig};
use super::IntegrationError;

/// Explicit forward Euler, fixed step size. Cheaper and less accurate
/// than RK4 per step; offered because the compartment counts it
/// produces stay exactly linear combinations of the per-step flows,
/// which the stochastic stepper (built on the same flow evaluation)
/// relies on for its Poisson/binomial thinning to reduce to the
/// deterministic mean in expectation.
pub struct EulerSolver;

impl EulerSolver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EulerSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl OdeSolver for EulerSolver {
    fn solve(
        &self,
        system: &dyn OdeSystem,
        t_span: (f64, f64),
        y0: &DVector<f64>,
        config: &SolverConfig,
    ) -> Result<(Vec<f64>, Vec<DVector<f64>>), IntegrationError> {
        let dt = t_span.1 - t_span.0;
        if dt <= 0.0 {
            return Err(IntegrationError::InvalidTimeStep(dt));
        }

        let n_steps = ((dt / config.dt).round() as usize).max(1);
        if n_steps > config.max_iterations {
            return Err(IntegrationError::MaxIterationsExceeded);
        }
        let step_size = dt / n_steps as f64;

        let mut times = Vec::with_capacity(n_steps + 1);
        let mut solutions = Vec::with_capacity(n_steps + 1);

        let mut t = t_span.0;
        let mut y = y0.clone();

        times.push(t);
        solutions.push(y.clone());

        for _ in 0..n_steps {
            let dy = system.derivatives(t, &y);
            y = &y + dy * step_size;
            t += step_size;

            if y.as_slice().iter().any(|v| !v.is_finite()) {
                return Err(IntegrationError::NonFinite { t });
            }

            times.push(t);
            solutions.push(y.clone());
        }

        Ok((times, solutions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Decay;

    impl OdeSystem for Decay {
        fn derivatives(&self, _t: f64, y: &DVector<f64>) -> DVector<f64> {
            -y.clone()
        }
        fn dimension(&self) -> usize {
            1
        }
    }

    #[test]
    fn converges_toward_analytic_decay_with_small_step() {
        let solver = EulerSolver::new();
        let y0 = DVector::from_vec(vec![1.0]);
        let config = SolverConfig { dt: 1e-4, max_iterations: 1_000_000 };

        let (_times, solutions) = solver.solve(&Decay, (0.0, 1.0), &y0, &config).unwrap();
        let final_solution = solutions.last().unwrap()[0];
        assert!((final_solution - (-1.0_f64).exp()).abs() < 1e-3);
    }
}
