//! Ambient module: configuration.
//!
//! `RunConfig` mirrors the hierarchical run document: subpop setup,
//! compartments, transitions, modifiers, initial conditions, seeding,
//! outcomes, outcome modifiers and inference hyperparameters. It is
//! deserialized from YAML (`serde_yaml`), matching the layered
//! structure the rest of the crate's components consume.

use std::collections::HashMap;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::modifiers::Modifier;
use crate::outcomes::OutcomeNode;
use crate::params::ParamDecl;
use crate::seeding::{InitialConditions, SeedingMethod};
use crate::transitions::Transition;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file '{path}': {source}")]
    Io { path: String, source: std::io::Error },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("configuration is missing required field '{0}'")]
    MissingField(String),

    #[error("start_date {start} is not before end_date {end}")]
    InvalidDateRange { start: NaiveDate, end: NaiveDate },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubpopSetup {
    pub geodata: String,
    pub mobility: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompartmentAxis {
    pub name: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationSettings {
    pub method: String,
    pub dt: f64,
    #[serde(default)]
    pub stochastic: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeirSection {
    pub integration: IntegrationSettings,
    pub parameters: HashMap<String, ParamDecl>,
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifiersSection {
    #[serde(default)]
    pub scenarios: Vec<String>,
    pub modifiers: HashMap<String, Modifier>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomesSection {
    pub method: String,
    pub outcomes: HashMap<String, OutcomeNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceSection {
    pub iterations_per_slot: usize,
    #[serde(default)]
    pub do_inference: bool,
    pub gt_data_path: Option<String>,
    #[serde(default)]
    pub statistics: Vec<crate::likelihood::Statistic>,
    #[serde(default = "default_n_chains")]
    pub n_chains: usize,
    /// Names of declared `seir.parameters` entries the MCMC controller
    /// is allowed to perturb; `ParameterVector` values align 1:1 with
    /// this list, in order.
    #[serde(default)]
    pub free_parameters: Vec<String>,
}

fn default_n_chains() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub nslots: usize,
    pub subpop_setup: SubpopSetup,
    pub compartments: Vec<CompartmentAxis>,
    pub seir: SeirSection,
    #[serde(default)]
    pub seir_modifiers: Option<ModifiersSection>,
    pub initial_conditions: InitialConditions,
    pub seeding: SeedingMethod,
    pub outcomes: OutcomesSection,
    #[serde(default)]
    pub outcome_modifiers: Option<ModifiersSection>,
    pub inference: InferenceSection,
}

impl RunConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let text = std::fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.start_date >= self.end_date {
            return Err(ConfigError::InvalidDateRange { start: self.start_date, end: self.end_date });
        }
        if self.compartments.is_empty() {
            return Err(ConfigError::MissingField("compartments".to_string()));
        }
        Ok(())
    }

    pub fn n_days(&self) -> i64 {
        (self.end_date - self.start_date).num_days()
    }
}

/// Merge `patch` onto `base`: every field `patch` sets wins, honoring
/// the `patch` CLI subcommand's layered-override semantics. Only the
/// sections that reasonably support partial overrides are merged field
/// by field; everything else in `patch` replaces `base` wholesale.
pub fn patch_config(mut base: RunConfig, patch: RunConfig) -> RunConfig {
    base.name = patch.name;
    base.seir.parameters.extend(patch.seir.parameters);
    if let Some(patch_modifiers) = patch.seir_modifiers {
        match &mut base.seir_modifiers {
            Some(base_modifiers) => base_modifiers.modifiers.extend(patch_modifiers.modifiers),
            None => base.seir_modifiers = Some(patch_modifiers),
        }
    }
    base.inference = patch.inference;
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
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
  parameters:
    beta:
      distribution: fixed
      value: 0.3
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
"#
    }

    #[test]
    fn parses_minimal_config() {
        let config = RunConfig::from_yaml_str(minimal_yaml()).unwrap();
        assert_eq!(config.name, "test_run");
        assert_eq!(config.n_days(), 31);
    }

    #[test]
    fn rejects_inverted_date_range() {
        let bad = minimal_yaml().replace("start_date: 2020-01-01", "start_date: 2020-03-01");
        let err = RunConfig::from_yaml_str(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDateRange { .. }));
    }
}
