use nalgebra::DVector;

use super::IntegrationError;

/// A system of ODEs expressed as a derivative function over a flat
/// state vector. The integrator module's `CompartmentOdeSystem` is the
/// only production implementor; the trait boundary itself is kept
/// exactly as in a single-individual solver so both the deterministic
/// steppers and their tests stay solver-agnostic.
pub trait OdeSystem {
    fn derivatives(&self, t: f64, y: &DVector<f64>) -> DVector<f64>;
    fn dimension(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct SolverConfig {
    pub dt: f64,
    pub max_iterations: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self { dt: 1.0, max_iterations: 100_000 }
    }
}

pub trait OdeSolver {
    fn solve(
        &self,
        system: &dyn OdeSystem,
        t_span: (f64, f64),
        y0: &DVector<f64>,
        config: &SolverConfig,
    ) -> Result<(Vec<f64>, Vec<DVector<f64>>), IntegrationError>;

    fn solve_to_time(
        &self,
        system: &dyn OdeSystem,
        t_start: f64,
        t_end: f64,
        y0: &DVector<f64>,
        config: &SolverConfig,
    ) -> Result<DVector<f64>, IntegrationError> {
        let (_, solutions) = self.solve(system, (t_start, t_end), y0, config)?;
        Ok(solutions.into_iter().last().unwrap_or_else(|| y0.clone()))
    }
}
