//! Component G: outcomes pipeline.
//!
//! Observable outcomes (hospitalizations, deaths, reported cases, ...)
//! are derived from the simulated compartment trajectory by a small DAG
//! of operator nodes, evaluated once per outcome in topological order
//! over the same daily grid the integrator produced.

use std::collections::{HashMap, HashSet};

use ndarray::Array2;
use rand::Rng;
use rand_distr::{Binomial, Distribution as RandDistribution};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutcomeError {
    #[error("outcome '{0}' is declared more than once")]
    Duplicate(String),

    #[error("outcome '{outcome}' references unknown source '{source}'")]
    UnknownSource { outcome: String, source: String },

    #[error("cyclic outcome dependency detected, starting at '{0}'")]
    Cycle(String),

    #[error("delay distribution for outcome '{0}' has no support")]
    EmptyDelayDistribution(String),
}

/// An outcome node's dependency: either a named compartment incidence
/// (summed flow into a compartment on a given day, supplied by the
/// caller) or another, already-evaluated outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeNode {
    /// Pulls daily incidence straight from a named compartment-inflow
    /// series computed by the integrator.
    Source { compartment_inflow: String },
    /// Thins the parent series by a Bernoulli draw with probability
    /// `probability` per individual (e.g. case-to-hospitalization
    /// ratio).
    Probability { parent: String, probability: f64 },
    /// Convolves the parent series with a delay distribution (e.g.
    /// symptom-onset-to-hospitalization).
    Delay { parent: String, delay_pmf: Vec<f64> },
    /// Running sum of inflow minus outflow, i.e. a prevalence derived
    /// from an incidence series (current census rather than daily
    /// admissions).
    Duration { inflow: String, outflow: String },
    /// Elementwise sum of multiple parent series.
    Sum { parents: Vec<String> },
}

impl OutcomeNode {
    fn dependencies(&self) -> Vec<String> {
        match self {
            OutcomeNode::Source { .. } => vec![],
            OutcomeNode::Probability { parent, .. } => vec![parent.clone()],
            OutcomeNode::Delay { parent, .. } => vec![parent.clone()],
            OutcomeNode::Duration { inflow, outflow } => vec![inflow.clone(), outflow.clone()],
            OutcomeNode::Sum { parents } => parents.clone(),
        }
    }
}

/// Ordered outcome DAG, evaluated once per subpop over `n_days` days.
pub struct OutcomePipeline {
    order: Vec<String>,
    nodes: HashMap<String, OutcomeNode>,
}

impl OutcomePipeline {
    pub fn build(declarations: Vec<(String, OutcomeNode)>) -> Result<Self, OutcomeError> {
        let mut nodes = HashMap::new();
        for (name, node) in declarations {
            if nodes.contains_key(&name) {
                return Err(OutcomeError::Duplicate(name));
            }
            if let OutcomeNode::Delay { delay_pmf, .. } = &node {
                if delay_pmf.is_empty() {
                    return Err(OutcomeError::EmptyDelayDistribution(name));
                }
            }
            nodes.insert(name, node);
        }

        let order = topological_order(&nodes)?;
        Ok(Self { order, nodes })
    }

    /// Evaluate the full DAG for one subpop. `source` supplies named
    /// compartment-inflow series (daily, length `n_days`) referenced by
    /// `OutcomeNode::Source` nodes; stochastic thinning, if `rng` is
    /// `Some`, uses binomial draws instead of expected values.
    pub fn evaluate(
        &self,
        source: impl Fn(&str) -> Option<Vec<f64>>,
        n_days: usize,
        mut rng: Option<&mut (impl Rng + ?Sized)>,
    ) -> Result<HashMap<String, Vec<f64>>, OutcomeError> {
        let mut series: HashMap<String, Vec<f64>> = HashMap::new();

        for name in &self.order {
            let node = &self.nodes[name];
            let value = match node {
                OutcomeNode::Source { compartment_inflow } => source(compartment_inflow).ok_or_else(|| OutcomeError::UnknownSource {
                    outcome: name.clone(),
                    source: compartment_inflow.clone(),
                })?,
                OutcomeNode::Probability { parent, probability } => {
                    let parent_series = series.get(parent).ok_or_else(|| OutcomeError::UnknownSource {
                        outcome: name.clone(),
                        source: parent.clone(),
                    })?;
                    parent_series
                        .iter()
                        .map(|&count| match &mut rng {
                            Some(rng) if count >= 1.0 => {
                                Binomial::new(count.round() as u64, probability.clamp(0.0, 1.0))
                                    .expect("probability must be in [0, 1]")
                                    .sample(*rng) as f64
                            }
                            _ => count * probability,
                        })
                        .collect()
                }
                OutcomeNode::Delay { parent, delay_pmf } => {
                    let parent_series = series.get(parent).ok_or_else(|| OutcomeError::UnknownSource {
                        outcome: name.clone(),
                        source: parent.clone(),
                    })?;
                    convolve(parent_series, delay_pmf, n_days)
                }
                OutcomeNode::Duration { inflow, outflow } => {
                    let inflow_series = series.get(inflow).ok_or_else(|| OutcomeError::UnknownSource {
                        outcome: name.clone(),
                        source: inflow.clone(),
                    })?;
                    let outflow_series = series.get(outflow).ok_or_else(|| OutcomeError::UnknownSource {
                        outcome: name.clone(),
                        source: outflow.clone(),
                    })?;
                    let mut census = Vec::with_capacity(n_days);
                    let mut running = 0.0;
                    for day in 0..n_days {
                        running += inflow_series.get(day).copied().unwrap_or(0.0) - outflow_series.get(day).copied().unwrap_or(0.0);
                        census.push(running.max(0.0));
                    }
                    census
                }
                OutcomeNode::Sum { parents } => {
                    let mut total = vec![0.0; n_days];
                    for parent in parents {
                        let parent_series = series.get(parent).ok_or_else(|| OutcomeError::UnknownSource {
                            outcome: name.clone(),
                            source: parent.clone(),
                        })?;
                        for day in 0..n_days {
                            total[day] += parent_series.get(day).copied().unwrap_or(0.0);
                        }
                    }
                    total
                }
            };
            series.insert(name.clone(), value);
        }

        Ok(series)
    }

    pub fn also_exposes(&self, _parameter: &str) -> bool {
        // Outcome modifiers address nodes by name directly; this hook is
        // kept distinct from the modifier arena's own parameter lookup
        // so outcome-only knobs (e.g. reporting probability) don't leak
        // into the seir modifier namespace.
        self.nodes.contains_key(_parameter)
    }
}

fn convolve(series: &[f64], pmf: &[f64], n_days: usize) -> Vec<f64> {
    let mut out = vec![0.0; n_days];
    for (day, &value) in series.iter().enumerate() {
        for (delay, &weight) in pmf.iter().enumerate() {
            let target = day + delay;
            if target < n_days {
                out[target] += value * weight;
            }
        }
    }
    out
}

fn topological_order(nodes: &HashMap<String, OutcomeNode>) -> Result<Vec<String>, OutcomeError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Temporary,
        Permanent,
    }

    fn visit(
        name: &str,
        nodes: &HashMap<String, OutcomeNode>,
        marks: &mut HashMap<String, Mark>,
        order: &mut Vec<String>,
    ) -> Result<(), OutcomeError> {
        match marks.get(name) {
            Some(Mark::Permanent) => return Ok(()),
            Some(Mark::Temporary) => return Err(OutcomeError::Cycle(name.to_string())),
            None => {}
        }
        let Some(node) = nodes.get(name) else { return Ok(()) };
        marks.insert(name.to_string(), Mark::Temporary);
        for dep in node.dependencies() {
            if nodes.contains_key(&dep) {
                visit(&dep, nodes, marks, order)?;
            }
        }
        marks.insert(name.to_string(), Mark::Permanent);
        order.push(name.to_string());
        Ok(())
    }

    let mut marks = HashMap::new();
    let mut order = Vec::new();
    let mut names: Vec<&String> = nodes.keys().collect();
    names.sort();
    for name in names {
        visit(name, nodes, &mut marks, &mut order)?;
    }
    let _: HashSet<&str> = HashSet::new();
    Ok(order)
}

/// Flattens a (day, compartment, subpop) trajectory's inflow into a
/// single compartment for one subpop into a per-day incidence series,
/// for feeding `OutcomeNode::Source` evaluation.
pub fn compartment_inflow_series(trajectory: &[Array2<f64>], compartment: usize, subpop: usize) -> Vec<f64> {
    (1..trajectory.len())
        .map(|day| (trajectory[day][[compartment, subpop]] - trajectory[day - 1][[compartment, subpop]]).max(0.0))
        .collect()
}
