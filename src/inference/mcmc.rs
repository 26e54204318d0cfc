//! Chain-local state carried across iterations: the last globally
//! accepted parameter vector and, per subpopulation, the last
//! chimeric-accepted vector.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::params::ParamDistribution;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterVector {
    pub values: Vec<f64>,
}

impl ParameterVector {
    pub fn zeros(n: usize) -> Self {
        Self { values: vec![0.0; n] }
    }
}

#[derive(Debug, Clone)]
pub struct ChainState {
    pub global: ParameterVector,
    pub global_log_likelihood: f64,
    pub chimeric: HashMap<String, ParameterVector>,
    pub chimeric_log_likelihood: HashMap<String, f64>,
    pub iterations_completed: usize,
}

impl ChainState {
    /// Seeds a fresh chain by drawing each free parameter once from its
    /// declared distribution, rather than starting every chain at zero
    /// regardless of what the parameter's prior actually allows.
    pub fn seed(free_params: &[ParamDistribution], subpop_names: &[String], rng: &mut impl Rng) -> Self {
        let global = ParameterVector { values: free_params.iter().map(|dist| dist.sample(rng)).collect() };
        let chimeric = subpop_names.iter().map(|s| (s.clone(), global.clone())).collect();
        let chimeric_log_likelihood = subpop_names.iter().map(|s| (s.clone(), f64::NEG_INFINITY)).collect();
        Self {
            global,
            global_log_likelihood: f64::NEG_INFINITY,
            chimeric,
            chimeric_log_likelihood,
            iterations_completed: 0,
        }
    }
}
