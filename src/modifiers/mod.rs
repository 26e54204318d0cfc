//! Component C: modifier stack.
//!
//! Modifiers perturb a base parameter's value over a time window and/or
//! a subset of subpopulations. They are stored in a flat arena (a `Vec`
//! indexed by `ModifierId`, with a name lookup table) rather than as a
//! tree of trait objects, per the "dispatch is a pattern match" design
//! note; `Stacked` modifiers reference other modifiers by name, so the
//! arena is validated for cycles at build time, once, rather than on
//! every evaluation.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::params::ParamDistribution;

#[derive(Error, Debug)]
pub enum ModifierError {
    #[error("modifier '{0}' is declared more than once")]
    Duplicate(String),

    #[error("modifier '{modifier}' references unknown modifier '{reference}'")]
    UnknownReference { modifier: String, reference: String },

    #[error("cyclic modifier reference detected, starting at '{0}'")]
    Cycle(String),

    #[error("modifier '{0}' has an empty time period list")]
    EmptyPeriods(String),
}

/// How multiple active modifiers on the same parameter combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackMethod {
    Product,
    Sum,
    ReductionProduct,
}

impl StackMethod {
    pub fn combine(&self, values: &[f64]) -> f64 {
        match self {
            StackMethod::Product => values.iter().product(),
            StackMethod::Sum => values.iter().sum(),
            // Each factor is interpreted as a fractional reduction
            // applied multiplicatively: 1 - prod(1 - v_i).
            StackMethod::ReductionProduct => 1.0 - values.iter().map(|v| 1.0 - v).product::<f64>(),
        }
    }
}

/// A single active window: [start_date, end_date] inclusive, affecting
/// the named subpopulation group (empty = all subpopulations).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Period {
    pub start_date: chrono::NaiveDate,
    pub end_date: chrono::NaiveDate,
    #[serde(default)]
    pub subpop_groups: Vec<String>,
}

impl Period {
    pub fn covers(&self, date: chrono::NaiveDate) -> bool {
        date >= self.start_date && date <= self.end_date
    }

    pub fn applies_to(&self, subpop: &str) -> bool {
        self.subpop_groups.is_empty() || self.subpop_groups.iter().any(|g| g == subpop)
    }
}

/// A modifier's value: either a bare literal (`value: 0.5`, the common
/// case, treated as a point mass) or a declared distribution (`value:
/// {distribution: uniform, low: 0.3, high: 0.7}`), the same shape a
/// `seir.parameters` entry uses. Keeping the literal shorthand means
/// existing configs with a plain number keep working unchanged while
/// still letting a modifier be drawn from a prior and calibrated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModifierValue {
    Literal(f64),
    Distribution(ParamDistribution),
}

impl ModifierValue {
    pub fn as_distribution(&self) -> ParamDistribution {
        match self {
            ModifierValue::Literal(value) => ParamDistribution::Fixed { value: *value },
            ModifierValue::Distribution(dist) => dist.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Modifier {
    /// `value` is drawn once per simulation from its declared
    /// distribution (or held fixed, for a bare literal); the inference
    /// controller may perturb the draw under calibration the same way
    /// it perturbs a declared parameter.
    SinglePeriod { parameter: String, value: ModifierValue, period: Period },
    MultiPeriod { parameter: String, value: ModifierValue, periods: Vec<Period> },
    Stacked { parameter: String, stack_method: StackMethod, components: Vec<String> },
}

impl Modifier {
    pub fn parameter(&self) -> &str {
        match self {
            Modifier::SinglePeriod { parameter, .. } => parameter,
            Modifier::MultiPeriod { parameter, .. } => parameter,
            Modifier::Stacked { parameter, .. } => parameter,
        }
    }
}

pub type ModifierId = usize;

/// Arena of modifiers, validated for internal consistency (no dangling
/// `Stacked` references, no reference cycles) when built.
pub struct ModifierArena {
    modifiers: Vec<Modifier>,
    names: Vec<String>,
    by_name: HashMap<String, ModifierId>,
}

impl ModifierArena {
    pub fn build(decls: Vec<(String, Modifier)>) -> Result<Self, ModifierError> {
        let mut by_name = HashMap::new();
        let mut names = Vec::with_capacity(decls.len());
        let mut modifiers = Vec::with_capacity(decls.len());

        for (name, modifier) in decls {
            if by_name.contains_key(&name) {
                return Err(ModifierError::Duplicate(name));
            }
            if let Modifier::MultiPeriod { periods, .. } = &modifier {
                if periods.is_empty() {
                    return Err(ModifierError::EmptyPeriods(name));
                }
            }
            let id = modifiers.len();
            by_name.insert(name.clone(), id);
            names.push(name);
            modifiers.push(modifier);
        }

        let arena = Self { modifiers, names, by_name };
        arena.validate_references()?;
        arena.validate_acyclic()?;
        Ok(arena)
    }

    fn validate_references(&self) -> Result<(), ModifierError> {
        for (id, modifier) in self.modifiers.iter().enumerate() {
            if let Modifier::Stacked { components, .. } = modifier {
                for component in components {
                    if !self.by_name.contains_key(component) {
                        return Err(ModifierError::UnknownReference {
                            modifier: self.names[id].clone(),
                            reference: component.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_acyclic(&self) -> Result<(), ModifierError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Temporary,
            Permanent,
        }

        fn visit(
            id: ModifierId,
            arena: &ModifierArena,
            marks: &mut HashMap<ModifierId, Mark>,
        ) -> Result<(), ModifierError> {
            match marks.get(&id) {
                Some(Mark::Permanent) => return Ok(()),
                Some(Mark::Temporary) => return Err(ModifierError::Cycle(arena.names[id].clone())),
                None => {}
            }
            marks.insert(id, Mark::Temporary);
            if let Modifier::Stacked { components, .. } = &arena.modifiers[id] {
                for component in components {
                    let dep_id = arena.by_name[component];
                    visit(dep_id, arena, marks)?;
                }
            }
            marks.insert(id, Mark::Permanent);
            Ok(())
        }

        let mut marks = HashMap::new();
        for id in 0..self.modifiers.len() {
            visit(id, self, &mut marks)?;
        }
        Ok(())
    }

    pub fn get(&self, id: ModifierId) -> &Modifier {
        &self.modifiers[id]
    }

    pub fn id_of(&self, name: &str) -> Option<ModifierId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.modifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modifiers.is_empty()
    }

    /// The declared distribution backing a `SinglePeriod`/`MultiPeriod`
    /// modifier's value draw, looked up by the modifier's own name (not
    /// the base parameter it targets). Used so a modifier's realized
    /// value can be calibrated the same way a declared parameter is:
    /// seeded from its prior and perturbed within its support.
    pub fn distribution_of(&self, name: &str) -> Option<ParamDistribution> {
        match self.modifiers.get(*self.by_name.get(name)?)? {
            Modifier::SinglePeriod { value, .. } | Modifier::MultiPeriod { value, .. } => Some(value.as_distribution()),
            Modifier::Stacked { .. } => None,
        }
    }

    /// All modifiers (by id) that target the given base parameter name,
    /// in declaration order.
    pub fn for_parameter(&self, parameter: &str) -> Vec<ModifierId> {
        self.modifiers
            .iter()
            .enumerate()
            .filter(|(_, m)| m.parameter() == parameter)
            .map(|(id, _)| id)
            .collect()
    }

    /// Draws each `SinglePeriod`/`MultiPeriod` modifier's realized value
    /// once for a simulation replicate: an entry in `overrides` (keyed
    /// by modifier name) binds an MCMC proposal onto that draw instead
    /// of resampling it, the same role `overrides` plays for declared
    /// parameters in `ParameterEngine`.
    pub fn realize(&self, rng: &mut impl Rng, overrides: &HashMap<String, f64>) -> HashMap<ModifierId, f64> {
        let mut realized = HashMap::with_capacity(self.modifiers.len());
        for (id, modifier) in self.modifiers.iter().enumerate() {
            let value = match modifier {
                Modifier::SinglePeriod { value, .. } | Modifier::MultiPeriod { value, .. } => value,
                Modifier::Stacked { .. } => continue,
            };
            let name = &self.names[id];
            let drawn = overrides.get(name).copied().unwrap_or_else(|| value.as_distribution().sample(rng));
            realized.insert(id, drawn);
        }
        realized
    }

    /// Evaluate a single modifier's contributed multiplier/offset for a
    /// given date and subpop against a set of realized values (from
    /// [`realize`]). Returns `None` if the modifier is inactive (out of
    /// window, or doesn't cover the subpop).
    pub fn evaluate(&self, id: ModifierId, date: chrono::NaiveDate, subpop: &str, realized: &HashMap<ModifierId, f64>) -> Option<f64> {
        match &self.modifiers[id] {
            Modifier::SinglePeriod { period, .. } => {
                (period.covers(date) && period.applies_to(subpop)).then(|| realized[&id])
            }
            Modifier::MultiPeriod { periods, .. } => periods
                .iter()
                .any(|p| p.covers(date) && p.applies_to(subpop))
                .then(|| realized[&id]),
            Modifier::Stacked { stack_method, components, .. } => {
                let values: Vec<f64> = components
                    .iter()
                    .filter_map(|c| {
                        let id = self.by_name[c];
                        self.evaluate(id, date, subpop, realized)
                    })
                    .collect();
                if values.is_empty() {
                    None
                } else {
                    Some(stack_method.combine(&values))
                }
            }
        }
    }

    /// Net multiplier for a base parameter at a given date and subpop,
    /// combining every modifier that targets it with `Product` (the
    /// default cross-modifier combination rule; `Stacked` modifiers
    /// handle their own internal combination rule explicitly).
    pub fn net_multiplier(&self, parameter: &str, date: chrono::NaiveDate, subpop: &str, realized: &HashMap<ModifierId, f64>) -> f64 {
        self.for_parameter(parameter)
            .into_iter()
            .filter_map(|id| self.evaluate(id, date, subpop, realized))
            .product()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}
