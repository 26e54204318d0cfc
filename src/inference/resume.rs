//! Resuming a calibration run from a previously written slot's
//! artifacts: the last accepted global and chimeric parameter vectors,
//! plus the iteration count already completed, so a new slot continues
//! the chain instead of restarting it from the prior.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ChainState;
use super::ParameterVector;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeSlot {
    pub chain_id: usize,
    pub global: ParameterVector,
    pub global_log_likelihood: f64,
    pub chimeric: HashMap<String, ParameterVector>,
    pub chimeric_log_likelihood: HashMap<String, f64>,
    pub iterations_completed: usize,
}

impl ResumeSlot {
    pub fn from_chain_state(chain_id: usize, state: &ChainState) -> Self {
        Self {
            chain_id,
            global: state.global.clone(),
            global_log_likelihood: state.global_log_likelihood,
            chimeric: state.chimeric.clone(),
            chimeric_log_likelihood: state.chimeric_log_likelihood.clone(),
            iterations_completed: state.iterations_completed,
        }
    }

    pub fn into_chain_state(self) -> ChainState {
        ChainState {
            global: self.global,
            global_log_likelihood: self.global_log_likelihood,
            chimeric: self.chimeric,
            chimeric_log_likelihood: self.chimeric_log_likelihood,
            iterations_completed: 0,
        }
    }
}
