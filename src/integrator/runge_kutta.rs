use nalgebra::DVector;

use super::ode::{OdeSolver, OdeSystem, SolverConfig};
use super::IntegrationError;

/// Classical 4-stage Runge-Kutta, fixed step size.
pub struct RungeKuttaSolver;

impl RungeKuttaSolver {
    pub fn new() -> Self {
        Self
    }

    fn rk4_step(&self, system: &dyn OdeSystem, t: f64, y: &DVector<f64>, h: f64) -> DVector<f64> {
        let k1 = system.derivatives(t, y);
        let k2 = system.derivatives(t + h / 2.0, &(y + &k1 * (h / 2.0)));
        let k3 = system.derivatives(t + h / 2.0, &(y + &k2 * (h / 2.0)));
        let k4 = system.derivatives(t + h, &(y + &k3 * h));

        y + (&k1 + &k2 * 2.0 + &k3 * 2.0 + &k4) * (h / 6.0)
    }
}

impl Default for RungeKuttaSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl OdeSolver for RungeKuttaSolver {
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
            y = self.rk4_step(system, t, &y, step_size);
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
    fn matches_analytic_exponential_decay() {
        let solver = RungeKuttaSolver::new();
        let y0 = DVector::from_vec(vec![1.0]);
        let config = SolverConfig { dt: 0.01, max_iterations: 10_000 };

        let (_times, solutions) = solver.solve(&Decay, (0.0, 1.0), &y0, &config).unwrap();
        let final_solution = solutions.last().unwrap()[0];
        assert!((final_solution - (-1.0_f64).exp()).abs() < 1e-4);
    }
}
