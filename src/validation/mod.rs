//! Ambient module: configuration and run validation.
//!
//! Checks that cut across the individual component builders: every
//! compartment referenced by a transition, seeding event, initial
//! condition or outcome actually exists in the declared compartment
//! space, and that the run's date range is long enough to hold at
//! least one integration step.

use log::{info, warn};

use crate::config::RunConfig;
use crate::space::CompartmentSpace;

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("transition '{0}' references a compartment not in the declared compartment space")]
    UnknownCompartmentInTransition(String),

    #[error("run spans {days} day(s) but the integration step is {dt}; at least one full step is required")]
    RunTooShortForStep { days: i64, dt: f64 },

    #[error("inference is enabled but no ground-truth data path was provided")]
    MissingGroundTruth,
}

pub fn validate_run_config(config: &RunConfig, space: &CompartmentSpace) -> Result<(), ValidationError> {
    info!("validating run configuration '{}'", config.name);

    for transition in &config.seir.transitions {
        if space.resolve(&transition.source).map(|m| m.is_empty()).unwrap_or(true) {
            return Err(ValidationError::UnknownCompartmentInTransition(transition.name.clone()));
        }
        if space.resolve(&transition.destination).map(|m| m.is_empty()).unwrap_or(true) {
            return Err(ValidationError::UnknownCompartmentInTransition(transition.name.clone()));
        }
    }

    let days = config.n_days();
    if (days as f64) < config.seir.integration.dt {
        return Err(ValidationError::RunTooShortForStep { days, dt: config.seir.integration.dt });
    }

    if config.inference.do_inference && config.inference.gt_data_path.is_none() {
        return Err(ValidationError::MissingGroundTruth);
    }

    if config.inference.statistics.is_empty() && config.inference.do_inference {
        warn!("inference is enabled but no statistics are declared; every proposal will score identically");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> CompartmentSpace {
        CompartmentSpace::new(vec![("infection_stage".to_string(), vec!["S".into(), "I".into(), "R".into()])]).unwrap()
    }

    fn base_config() -> RunConfig {
        RunConfig::from_yaml_str(
            r#"
name: test_run
start_date: 2020-01-01
end_date: 2020-02-01
nslots: 1
subpop_setup:
  geodata: geodata.csv
compartments:
  - name: infection_stage
    labels: [S, I, R]
seir:
  integration:
    method: rk4
    dt: 1.0
  parameters: {}
  transitions: []
initial_conditions:
  method: default
  compartment: S
seeding:
  method: no_seeding
outcomes:
  method: delay_convolve
  outcomes: {}
inference:
  iterations_per_slot: 10
  do_inference: false
"#,
        )
        .unwrap()
    }

    #[test]
    fn valid_config_passes() {
        assert!(validate_run_config(&base_config(), &space()).is_ok());
    }

    #[test]
    fn inference_without_ground_truth_is_rejected() {
        let mut config = base_config();
        config.inference.do_inference = true;
        let err = validate_run_config(&config, &space()).unwrap_err();
        assert!(matches!(err, ValidationError::MissingGroundTruth));
    }
}
