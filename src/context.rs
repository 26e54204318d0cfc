//! Ambient module: the run context.
//!
//! Everything derived once from a validated `RunConfig` (the compartment
//! space, compiled transitions, modifier arenas, outcome pipeline,
//! subpop roster) lives in a single `RunContext` value, built once and
//! handed to the integrator, outcomes pipeline and inference controller
//! explicitly; nothing reaches back into a global.

use std::collections::HashMap;
use std::path::Path;

use chrono::Duration;
use ndarray::{Array2, Array3};
use rand::Rng;
use serde::Deserialize;

use crate::config::RunConfig;
use crate::error::CoreError;
use crate::integrator::{IntegrationMethod, Integrator, RateTable};
use crate::modifiers::ModifierArena;
use crate::outcomes::OutcomePipeline;
use crate::params::{ParamDecl, ParamDistribution, ParameterEngine};
use crate::seeding::{InitialConditions, SeedingEvent};
use crate::space::CompartmentSpace;
use crate::transitions::CompiledTransitions;
use crate::validation;

/// A subpopulation's static metadata: name and total population, one
/// row per subpop in the geodata CSV.
#[derive(Debug, Clone)]
pub struct Subpop {
    pub name: String,
    pub population: f64,
}

#[derive(Deserialize)]
struct GeodataRow {
    subpop_id: String,
    population: f64,
}

#[derive(Deserialize)]
struct InitialConditionsRow {
    compartment: String,
    subpop: String,
    amount: f64,
}

pub fn load_geodata(path: impl AsRef<Path>) -> Result<Vec<Subpop>, CoreError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut subpops = Vec::new();
    for record in reader.deserialize() {
        let row: GeodataRow = record?;
        subpops.push(Subpop { name: row.subpop_id, population: row.population });
    }
    Ok(subpops)
}

fn load_csv_matrix(path: &str) -> Result<Array2<f64>, std::io::Error> {
    let mut reader = csv::Reader::from_path(path).map_err(to_io_error)?;
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for record in reader.records() {
        let record = record.map_err(to_io_error)?;
        rows.push(record.iter().map(|v| v.parse().unwrap_or(0.0)).collect());
    }
    let n_times = rows.len();
    let n_subpop = rows.first().map(|r| r.len()).unwrap_or(0);
    Ok(Array2::from_shape_fn((n_times, n_subpop), |(t, s)| rows[t][s]))
}

fn to_io_error(err: csv::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err)
}

fn load_seeding_csv(path: &str) -> Result<Vec<SeedingEvent>, crate::seeding::SeedingError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut events = Vec::new();
    for record in reader.deserialize() {
        events.push(record?);
    }
    Ok(events)
}

fn list_csv_files(folder: &str) -> Result<Vec<String>, crate::seeding::SeedingError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        if entry.path().extension().and_then(|e| e.to_str()) == Some("csv") {
            files.push(entry.path().display().to_string());
        }
    }
    Ok(files)
}

/// Everything derived once from a validated `RunConfig`, shared across
/// every replicate and every inference chain.
pub struct RunContext {
    pub config: RunConfig,
    pub space: CompartmentSpace,
    pub subpops: Vec<Subpop>,
    pub transitions: CompiledTransitions,
    pub seir_modifiers: ModifierArena,
    pub outcome_modifiers: ModifierArena,
    pub outcomes: OutcomePipeline,
}

impl RunContext {
    pub fn build(config: RunConfig) -> Result<Self, CoreError> {
        let axes = config.compartments.iter().map(|a| (a.name.clone(), a.labels.clone())).collect();
        let space = CompartmentSpace::new(axes)?;
        validation::validate_run_config(&config, &space).map_err(|e| CoreError::Config(e.to_string()))?;

        let subpops = load_geodata(&config.subpop_setup.geodata)?;
        let transitions = CompiledTransitions::compile(&config.seir.transitions, &space)?;

        let seir_modifiers = ModifierArena::build(
            config
                .seir_modifiers
                .as_ref()
                .map(|m| m.modifiers.clone().into_iter().collect())
                .unwrap_or_default(),
        )?;
        let outcome_modifiers = ModifierArena::build(
            config
                .outcome_modifiers
                .as_ref()
                .map(|m| m.modifiers.clone().into_iter().collect())
                .unwrap_or_default(),
        )?;
        let outcomes = OutcomePipeline::build(config.outcomes.outcomes.clone().into_iter().collect())?;

        Ok(Self { config, space, subpops, transitions, seir_modifiers, outcome_modifiers, outcomes })
    }

    pub fn n_days(&self) -> usize {
        self.config.n_days().max(0) as usize
    }

    pub fn n_subpop(&self) -> usize {
        self.subpops.len()
    }

    pub fn subpop_names(&self) -> Vec<String> {
        self.subpops.iter().map(|s| s.name.clone()).collect()
    }

    pub fn subpop_index(&self, name: &str) -> usize {
        self.subpops.iter().position(|s| s.name == name).unwrap_or(0)
    }

    pub fn compartment_index(&self, name: &str) -> usize {
        self.space.compartments().iter().position(|c| c.name() == name).unwrap_or(0)
    }

    /// Builds the initial (compartment x subpop) state from the
    /// declared `InitialConditions`.
    pub fn initial_state(&self) -> Result<Array2<f64>, CoreError> {
        let n_c = self.space.n_compartments();
        let n_s = self.n_subpop();
        let mut state = Array2::<f64>::zeros((n_c, n_s));
        match &self.config.initial_conditions {
            InitialConditions::Default { compartment } => {
                let idx = self.compartment_index(compartment);
                for (s, subpop) in self.subpops.iter().enumerate() {
                    state[[idx, s]] = subpop.population;
                }
            }
            InitialConditions::SetInitialConditions { amounts } => {
                // Any (compartment, subpop) pair not explicitly listed is
                // tolerated by filling it from S: every subpop starts
                // fully susceptible, then each explicit amount is placed
                // and subtracted back out of that subpop's S count.
                let s_idx = self.compartment_index("S");
                for (s, subpop) in self.subpops.iter().enumerate() {
                    state[[s_idx, s]] = subpop.population;
                }
                for (compartment, per_subpop) in amounts {
                    let c = self.compartment_index(compartment);
                    for (subpop, amount) in per_subpop {
                        let s = self.subpop_index(subpop);
                        state[[c, s]] = *amount;
                        if c != s_idx {
                            state[[s_idx, s]] -= *amount;
                        }
                    }
                }
            }
            InitialConditions::FromFile { path } => {
                let mut reader = csv::Reader::from_path(path)?;
                for record in reader.deserialize() {
                    let row: InitialConditionsRow = record?;
                    let c = self.compartment_index(&row.compartment);
                    let s = self.subpop_index(&row.subpop);
                    state[[c, s]] = row.amount;
                }
            }
        }
        Ok(state)
    }

    /// Resolves every declared parameter once for a simulation
    /// replicate, then folds in the seir modifier arena's net
    /// multiplier to build the per-(transition, day, subpop) rate
    /// table the integrator consumes.
    pub fn resolve_rates(&self, rng: &mut impl Rng) -> Result<RateTable, CoreError> {
        self.resolve_rates_with_overrides(rng, &HashMap::new(), &HashMap::new())
    }

    /// Like [`resolve_rates`], but after the parameter engine resolves
    /// every declaration it overwrites the named entries in
    /// `parameter_overrides` on a per-subpop basis, binding an MCMC
    /// proposal (global or chimeric) onto the declared parameter set,
    /// and binds `modifier_overrides` (keyed by modifier name) onto the
    /// seir modifier arena's once-per-simulation draw instead of
    /// resampling it. `parameter_overrides` maps parameter name to a
    /// per-subpop-name value map; a subpop absent from a parameter's
    /// inner map keeps that parameter's originally resolved value.
    pub fn resolve_rates_with_overrides(
        &self,
        rng: &mut impl Rng,
        parameter_overrides: &HashMap<String, HashMap<String, f64>>,
        modifier_overrides: &HashMap<String, f64>,
    ) -> Result<RateTable, CoreError> {
        let n_days = self.n_days();
        let n_subpop = self.n_subpop();
        let mut engine = ParameterEngine::resolve(&self.config.seir.parameters, n_days + 1, n_subpop, rng, load_csv_matrix)?;
        for (name, subpop_values) in parameter_overrides {
            engine.set_per_subpop(name, subpop_values, |s| self.subpop_index(s));
        }
        let realized_modifiers = self.seir_modifiers.realize(rng, modifier_overrides);

        let mut rates = Array3::<f64>::zeros((self.transitions.len(), n_days.max(1), n_subpop));
        let start_date = self.config.start_date;
        for (t_idx, transition) in self.transitions.entries.iter().enumerate() {
            let base = engine.get(&transition.rate_parameter).ok_or_else(|| {
                CoreError::Config(format!(
                    "transition '{}' references undeclared parameter '{}'",
                    transition.name, transition.rate_parameter
                ))
            })?;
            for day in 0..n_days {
                let date = start_date + Duration::days(day as i64);
                for (s, subpop) in self.subpops.iter().enumerate() {
                    let multiplier = self.seir_modifiers.net_multiplier(&transition.rate_parameter, date, &subpop.name, &realized_modifiers);
                    rates[[t_idx, day, s]] = base.at(day, s) * multiplier;
                }
            }
        }
        Ok(RateTable { rates })
    }

    pub fn seeding_events(&self, rng: &mut impl Rng) -> Result<Vec<SeedingEvent>, CoreError> {
        self.config
            .seeding
            .generate(rng, load_seeding_csv, list_csv_files)
            .map_err(|e| CoreError::Data(e.to_string()))
    }

    /// Runs one full forward simulation replicate and returns the
    /// (day, compartment, subpop) trajectory.
    pub fn run_simulation(&self, method: IntegrationMethod, rng: &mut impl Rng) -> Result<Array3<f64>, CoreError> {
        self.run_simulation_with_overrides(method, rng, &HashMap::new(), &HashMap::new())
    }

    /// Like [`run_simulation`], but binds `parameter_overrides` and
    /// `modifier_overrides` onto the declared parameter set and seir
    /// modifier arena before integrating, for use by the MCMC proposal
    /// loop. See [`resolve_rates_with_overrides`] for the shape of both
    /// maps.
    pub fn run_simulation_with_overrides(
        &self,
        method: IntegrationMethod,
        rng: &mut impl Rng,
        parameter_overrides: &HashMap<String, HashMap<String, f64>>,
        modifier_overrides: &HashMap<String, f64>,
    ) -> Result<Array3<f64>, CoreError> {
        let rates = self.resolve_rates_with_overrides(rng, parameter_overrides, modifier_overrides)?;
        let initial = self.initial_state()?;
        let seeding = self.seeding_events(rng)?;
        let integrator = Integrator {
            method,
            dt: self.config.seir.integration.dt,
            stochastic: self.config.seir.integration.stochastic,
        };
        let space = &self.space;
        let subpops = &self.subpops;
        let trajectory = integrator.run(
            &self.transitions,
            &rates,
            initial,
            self.n_days(),
            &seeding,
            |name| space.compartments().iter().position(|c| c.name() == name).unwrap_or(0),
            |name| subpops.iter().position(|s| s.name == name).unwrap_or(0),
            rng,
        )?;
        Ok(trajectory)
    }

    pub fn free_parameter_names(&self) -> &[String] {
        &self.config.inference.free_parameters
    }

    /// The declared `ParamDistribution` backing each name in
    /// `free_parameter_names`, in the same order, used to seed chains
    /// from their priors and to bound/weight MCMC proposals. A name may
    /// refer either to a `seir.parameters` distribution or to a
    /// `seir_modifiers` entry's own value draw, letting a modifier's
    /// realized value be calibrated the same way a declared parameter
    /// is. Errors if a free parameter is undeclared anywhere, or
    /// declared as something other than a distribution (a `from_file` or
    /// `expression` parameter has no prior to draw from or support to
    /// bound a proposal with; a `Stacked` modifier has no value of its
    /// own, only its components').
    pub fn free_parameter_distributions(&self) -> Result<Vec<ParamDistribution>, CoreError> {
        self.config
            .inference
            .free_parameters
            .iter()
            .map(|name| match self.config.seir.parameters.get(name) {
                Some(ParamDecl::Distribution(dist)) => Ok(dist.clone()),
                Some(_) => Err(CoreError::Config(format!(
                    "free parameter '{name}' must be declared as a distribution, not a file or expression"
                ))),
                None => self.seir_modifiers.distribution_of(name).ok_or_else(|| {
                    CoreError::Config(format!(
                        "free parameter '{name}' is not declared in seir.parameters or seir_modifiers"
                    ))
                }),
            })
            .collect()
    }

    /// Whether a free parameter name refers to a `seir_modifiers` entry
    /// rather than a `seir.parameters` declaration, used to route an
    /// MCMC proposal's entry into `modifier_overrides` instead of
    /// `parameter_overrides`.
    pub fn is_modifier_name(&self, name: &str) -> bool {
        !self.config.seir.parameters.contains_key(name) && self.seir_modifiers.distribution_of(name).is_some()
    }

    /// Evaluates the outcomes DAG for every subpop against a simulated
    /// trajectory, returning each outcome's daily series per subpop.
    pub fn evaluate_outcomes(
        &self,
        trajectory: &Array3<f64>,
        rng: Option<&mut (impl Rng + ?Sized)>,
    ) -> Result<Vec<HashMap<String, Vec<f64>>>, CoreError> {
        let n_days = self.n_days();
        let mut per_subpop = Vec::with_capacity(self.n_subpop());
        let mut rng = rng;
        for s in 0..self.n_subpop() {
            let series = self.outcomes.evaluate(
                |compartment_name| {
                    let c = self.compartment_index(compartment_name);
                    Some((0..n_days).map(|day| trajectory[[day, c, s]]).collect())
                },
                n_days,
                rng.as_deref_mut(),
            )?;
            per_subpop.push(series);
        }
        Ok(per_subpop)
    }
}
