//! Component E: transition compiler.
//!
//! Declarative transitions reference compartments by axis-label filters
//! (e.g. "every `I` compartment, regardless of age") and couplings by
//! parameter name and a list of "proportional to" compartment groups.
//! The compiler expands each declaration against the `CompartmentSpace`
//! into a flat table of concrete (source index, dest index, rate
//! parameter, proportional-to index sets) tuples, so the integrator's
//! hot loop never touches axis labels or filters.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::space::{CompartmentSpace, SpaceError};

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("transition '{name}' source filter matched no compartments")]
    EmptySource { name: String },

    #[error("transition '{name}' destination filter matched no compartments")]
    EmptyDest { name: String },

    #[error("transition '{name}' source and destination filters matched different numbers of compartments ({source} vs {dest}); they must pair up one-to-one")]
    SourceDestArityMismatch { name: String, source: usize, dest: usize },

    #[error("transition '{name}' proportional_to names unknown shorthand '{shorthand}' (only \"source\" is recognized)")]
    UnknownShorthand { name: String, shorthand: String },

    #[error("transition '{name}': {source}")]
    Space {
        name: String,
        #[source]
        source: SpaceError,
    },
}

fn default_exponent() -> f64 {
    1.0
}

/// One entry of a transition's `proportional_to` list: either the
/// literal shorthand `"source"` (proportional to the source compartment
/// alone, at exponent 1), or an explicit compartment-filter group paired
/// with its own exponent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProportionalToDecl {
    Shorthand(String),
    Group(ProportionalToGroup),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProportionalToGroup {
    #[serde(default = "default_exponent")]
    pub exponent: f64,
    #[serde(flatten)]
    pub filter: HashMap<String, Vec<String>>,
}

/// A single declared transition pattern, as it appears in configuration.
/// `source`/`destination` are axis-label filters (omitted axis = "all
/// labels"); `proportional_to` is an ordered list of (compartment-filter
/// group, exponent) pairs whose summed, exponentiated populations the
/// per-capita rate is multiplied by (e.g. `[{infection_stage: [I]}]`
/// for simple mass action, or one group per age-class for an
/// age-structured force of infection with per-group exponents).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub name: String,
    pub source: HashMap<String, Vec<String>>,
    pub destination: HashMap<String, Vec<String>>,
    pub rate: String,
    #[serde(default)]
    pub proportional_to: Vec<ProportionalToDecl>,
}

/// One compiled, concrete transition: a source/dest compartment index
/// pair plus the resolved (index set, exponent) pairs it is
/// proportional to.
#[derive(Debug, Clone)]
pub struct CompiledTransition {
    pub name: String,
    pub source: usize,
    pub dest: usize,
    pub rate_parameter: String,
    pub proportional_to: Vec<(Vec<usize>, f64)>,
}

/// The full flat table produced by compiling every declared transition
/// against a `CompartmentSpace`.
pub struct CompiledTransitions {
    pub entries: Vec<CompiledTransition>,
}

impl CompiledTransitions {
    pub fn compile(declarations: &[Transition], space: &CompartmentSpace) -> Result<Self, CompileError> {
        let mut entries = Vec::new();

        for decl in declarations {
            let sources = space.resolve(&decl.source).map_err(|source| CompileError::Space {
                name: decl.name.clone(),
                source,
            })?;
            if sources.is_empty() {
                return Err(CompileError::EmptySource { name: decl.name.clone() });
            }

            let dests = space.resolve(&decl.destination).map_err(|source| CompileError::Space {
                name: decl.name.clone(),
                source,
            })?;
            if dests.is_empty() {
                return Err(CompileError::EmptyDest { name: decl.name.clone() });
            }

            if sources.len() != dests.len() {
                return Err(CompileError::SourceDestArityMismatch {
                    name: decl.name.clone(),
                    source: sources.len(),
                    dest: dests.len(),
                });
            }

            let mut proportional_to = Vec::with_capacity(decl.proportional_to.len());
            for entry in &decl.proportional_to {
                match entry {
                    ProportionalToDecl::Shorthand(word) if word == "source" => {
                        proportional_to.push((sources.clone(), 1.0));
                    }
                    ProportionalToDecl::Shorthand(other) => {
                        return Err(CompileError::UnknownShorthand { name: decl.name.clone(), shorthand: other.clone() });
                    }
                    ProportionalToDecl::Group(group) => {
                        let idxs = space.resolve(&group.filter).map_err(|source| CompileError::Space {
                            name: decl.name.clone(),
                            source,
                        })?;
                        proportional_to.push((idxs, group.exponent));
                    }
                }
            }

            for (src, dst) in sources.iter().copied().zip(dests.iter().copied()) {
                entries.push(CompiledTransition {
                    name: decl.name.clone(),
                    source: src,
                    dest: dst,
                    rate_parameter: decl.rate.clone(),
                    proportional_to: proportional_to.clone(),
                });
            }
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seir_space() -> CompartmentSpace {
        CompartmentSpace::new(vec![("infection_stage".to_string(), vec!["S".into(), "E".into(), "I".into(), "R".into()])]).unwrap()
    }

    fn filter(axis: &str, label: &str) -> HashMap<String, Vec<String>> {
        let mut f = HashMap::new();
        f.insert(axis.to_string(), vec![label.to_string()]);
        f
    }

    fn group(axis: &str, label: &str, exponent: f64) -> ProportionalToDecl {
        ProportionalToDecl::Group(ProportionalToGroup { exponent, filter: filter(axis, label) })
    }

    #[test]
    fn compiles_simple_seir_transitions() {
        let space = seir_space();
        let decls = vec![
            Transition {
                name: "infection".to_string(),
                source: filter("infection_stage", "S"),
                destination: filter("infection_stage", "E"),
                rate: "beta".to_string(),
                proportional_to: vec![group("infection_stage", "I", 1.0)],
            },
            Transition {
                name: "progression".to_string(),
                source: filter("infection_stage", "E"),
                destination: filter("infection_stage", "I"),
                rate: "sigma".to_string(),
                proportional_to: vec![],
            },
        ];

        let compiled = CompiledTransitions::compile(&decls, &space).unwrap();
        assert_eq!(compiled.len(), 2);
        assert_eq!(compiled.entries[0].proportional_to.len(), 1);
        assert_eq!(compiled.entries[0].proportional_to[0].1, 1.0);
    }

    #[test]
    fn source_shorthand_resolves_to_the_transitions_own_source() {
        let space = seir_space();
        let decls = vec![Transition {
            name: "infection".to_string(),
            source: filter("infection_stage", "S"),
            destination: filter("infection_stage", "E"),
            rate: "beta".to_string(),
            proportional_to: vec![ProportionalToDecl::Shorthand("source".to_string())],
        }];

        let compiled = CompiledTransitions::compile(&decls, &space).unwrap();
        let (idxs, exponent) = &compiled.entries[0].proportional_to[0];
        assert_eq!(idxs, &vec![compiled.entries[0].source]);
        assert_eq!(*exponent, 1.0);
    }

    #[test]
    fn unknown_shorthand_is_rejected() {
        let space = seir_space();
        let decls = vec![Transition {
            name: "infection".to_string(),
            source: filter("infection_stage", "S"),
            destination: filter("infection_stage", "E"),
            rate: "beta".to_string(),
            proportional_to: vec![ProportionalToDecl::Shorthand("destination".to_string())],
        }];

        let err = CompiledTransitions::compile(&decls, &space).unwrap_err();
        assert!(matches!(err, CompileError::UnknownShorthand { .. }));
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        let space = CompartmentSpace::new(vec![
            ("infection_stage".to_string(), vec!["S".into(), "I".into()]),
            ("age".to_string(), vec!["young".into(), "old".into()]),
        ])
        .unwrap();

        let mut source = HashMap::new();
        source.insert("infection_stage".to_string(), vec!["S".to_string()]);
        // Destination matches both ages but source filter above (all
        // ages implicitly, since "age" is omitted) actually matches 2 as
        // well, so force a real mismatch by constraining dest age too.
        let mut dest = HashMap::new();
        dest.insert("infection_stage".to_string(), vec!["I".to_string()]);
        dest.insert("age".to_string(), vec!["young".to_string()]);

        let decls = vec![Transition {
            name: "bad".to_string(),
            source,
            destination: dest,
            rate: "r".to_string(),
            proportional_to: vec![],
        }];

        let err = CompiledTransitions::compile(&decls, &space).unwrap_err();
        assert!(matches!(err, CompileError::SourceDestArityMismatch { .. }));
    }

    #[test]
    fn empty_source_filter_is_rejected() {
        let space = seir_space();
        let decls = vec![Transition {
            name: "ghost".to_string(),
            source: filter("infection_stage", "X"),
            destination: filter("infection_stage", "E"),
            rate: "beta".to_string(),
            proportional_to: vec![],
        }];
        let err = CompiledTransitions::compile(&decls, &space).unwrap_err();
        assert!(matches!(err, CompileError::Space { .. }));
    }
}
