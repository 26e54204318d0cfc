//! Component B: parameter engine.
//!
//! A parameter is declared once as fixed, drawn from a distribution,
//! loaded from a file, or computed from an expression over other
//! parameters. The engine resolves declaration order (failing on
//! cycles), samples stochastic parameters once per simulation replicate
//! with a seeded RNG, and evaluates expressions into dense (time ×
//! subpop) tensors up front so the integrator never re-evaluates them.

pub mod distribution;
pub mod expr;

use std::collections::{HashMap, HashSet};

use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use distribution::ParamDistribution;
pub use expr::Expr;

#[derive(Error, Debug)]
pub enum ParamError {
    #[error("parameter '{0}' is declared more than once")]
    Duplicate(String),

    #[error("parameter expression error in '{name}': {source}")]
    Expression {
        name: String,
        #[source]
        source: expr::ExprError,
    },

    #[error("parameter '{name}' references undefined symbol '{symbol}'")]
    UndefinedSymbol { name: String, symbol: String },

    #[error("cyclic dependency detected among parameters, starting at '{0}'")]
    Cycle(String),

    #[error("failed to read parameter file for '{name}': {source}")]
    File {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parameter file for '{name}' has the wrong shape: expected {expected_rows}x{expected_cols}, got {got_rows}x{got_cols}")]
    ShapeMismatch {
        name: String,
        expected_rows: usize,
        expected_cols: usize,
        got_rows: usize,
        got_cols: usize,
    },
}

/// How a single parameter's value is declared in the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamDecl {
    Distribution(ParamDistribution),
    /// A path to a CSV file of shape (time, subpop), read verbatim.
    FromFile { from_file: String },
    /// A symbolic expression over other declared parameter names.
    Expression { expression: String },
}

/// A parameter's resolved value: either a single scalar broadcast over
/// the whole run, or a dense (time x subpop) tensor.
#[derive(Debug, Clone)]
pub enum ParamValue {
    Scalar(f64),
    Tensor(Array2<f64>),
}

impl ParamValue {
    pub fn at(&self, t: usize, s: usize) -> f64 {
        match self {
            ParamValue::Scalar(v) => *v,
            ParamValue::Tensor(arr) => arr[[t, s]],
        }
    }

    fn broadcast_scalar(&self) -> Option<f64> {
        match self {
            ParamValue::Scalar(v) => Some(*v),
            ParamValue::Tensor(_) => None,
        }
    }
}

/// Resolves a set of named parameter declarations against a shared
/// (n_times, n_subpop) shape, sampling stochastic draws once from the
/// caller-supplied RNG and evaluating expressions over the resolved
/// scalar values of their dependencies.
pub struct ParameterEngine {
    n_times: usize,
    n_subpop: usize,
    values: HashMap<String, ParamValue>,
}

impl ParameterEngine {
    pub fn resolve<R: Rng + ?Sized>(
        decls: &HashMap<String, ParamDecl>,
        n_times: usize,
        n_subpop: usize,
        rng: &mut R,
        file_loader: impl Fn(&str) -> Result<Array2<f64>, std::io::Error>,
    ) -> Result<Self, ParamError> {
        let order = topological_order(decls)?;

        let mut values: HashMap<String, ParamValue> = HashMap::new();
        for name in order {
            let decl = &decls[&name];
            let value = match decl {
                ParamDecl::Distribution(dist) => ParamValue::Scalar(dist.sample(rng)),
                ParamDecl::FromFile { from_file } => {
                    let arr = file_loader(from_file).map_err(|source| ParamError::File {
                        name: name.clone(),
                        source,
                    })?;
                    if arr.shape() != [n_times, n_subpop] {
                        return Err(ParamError::ShapeMismatch {
                            name: name.clone(),
                            expected_rows: n_times,
                            expected_cols: n_subpop,
                            got_rows: arr.shape()[0],
                            got_cols: arr.shape()[1],
                        });
                    }
                    ParamValue::Tensor(arr)
                }
                ParamDecl::Expression { expression } => {
                    let ast = Expr::parse(expression).map_err(|source| ParamError::Expression {
                        name: name.clone(),
                        source,
                    })?;

                    let mut symbols = Vec::new();
                    ast.symbols(&mut symbols);

                    // If every referenced symbol is resolved to a scalar,
                    // the expression is itself a scalar; evaluated once.
                    let all_scalar = symbols
                        .iter()
                        .all(|s| values.get(s).and_then(ParamValue::broadcast_scalar).is_some());

                    if all_scalar {
                        let mut env = HashMap::new();
                        for s in &symbols {
                            let v = values
                                .get(s)
                                .and_then(ParamValue::broadcast_scalar)
                                .ok_or_else(|| ParamError::UndefinedSymbol {
                                    name: name.clone(),
                                    symbol: s.clone(),
                                })?;
                            env.insert(s.clone(), v);
                        }
                        let result = ast.eval(&env).map_err(|source| ParamError::Expression {
                            name: name.clone(),
                            source,
                        })?;
                        ParamValue::Scalar(result)
                    } else {
                        let mut arr = Array2::<f64>::zeros((n_times, n_subpop));
                        for t in 0..n_times {
                            for s_idx in 0..n_subpop {
                                let mut env = HashMap::new();
                                for sym in &symbols {
                                    let v = values.get(sym).ok_or_else(|| ParamError::UndefinedSymbol {
                                        name: name.clone(),
                                        symbol: sym.clone(),
                                    })?;
                                    env.insert(sym.clone(), v.at(t, s_idx));
                                }
                                arr[[t, s_idx]] = ast.eval(&env).map_err(|source| ParamError::Expression {
                                    name: name.clone(),
                                    source,
                                })?;
                            }
                        }
                        ParamValue::Tensor(arr)
                    }
                }
            };
            values.insert(name.clone(), value);
        }

        Ok(Self { n_times, n_subpop, values })
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.n_times, self.n_subpop)
    }

    /// Overrides an already-resolved parameter with a flat scalar,
    /// replacing whatever it last resolved to. Used by the inference
    /// controller to bind a calibrated proposal onto the declared
    /// parameter set without re-running distribution sampling.
    pub fn set_scalar(&mut self, name: &str, value: f64) {
        self.values.insert(name.to_string(), ParamValue::Scalar(value));
    }

    /// Overrides a parameter's value independently per subpop, leaving
    /// any subpop not named in `subpop_values` at whatever it last
    /// resolved to. Used by the inference controller to bind a
    /// "chimeric" per-subpop proposal onto the declared parameter set
    /// without disturbing the other subpops' accepted values.
    pub fn set_per_subpop(&mut self, name: &str, subpop_values: &HashMap<String, f64>, subpop_index: impl Fn(&str) -> usize) {
        let mut arr = match self.values.get(name) {
            Some(ParamValue::Scalar(v)) => Array2::from_elem((self.n_times, self.n_subpop), *v),
            Some(ParamValue::Tensor(t)) => t.clone(),
            None => Array2::<f64>::zeros((self.n_times, self.n_subpop)),
        };
        for (subpop, value) in subpop_values {
            let s = subpop_index(subpop);
            for t in 0..self.n_times {
                arr[[t, s]] = *value;
            }
        }
        self.values.insert(name.to_string(), ParamValue::Tensor(arr));
    }
}

/// DFS-based topological sort of expression dependencies. Non-expression
/// declarations have no dependencies and come first in no particular
/// order; this only needs to order expressions relative to the
/// parameters (expression or otherwise) they reference.
fn topological_order(decls: &HashMap<String, ParamDecl>) -> Result<Vec<String>, ParamError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Temporary,
        Permanent,
    }

    fn deps_of(decl: &ParamDecl) -> Vec<String> {
        match decl {
            ParamDecl::Expression { expression } => match Expr::parse(expression) {
                Ok(ast) => {
                    let mut syms = Vec::new();
                    ast.symbols(&mut syms);
                    syms
                }
                Err(_) => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    fn visit(
        name: &str,
        decls: &HashMap<String, ParamDecl>,
        marks: &mut HashMap<String, Mark>,
        order: &mut Vec<String>,
    ) -> Result<(), ParamError> {
        match marks.get(name) {
            Some(Mark::Permanent) => return Ok(()),
            Some(Mark::Temporary) => return Err(ParamError::Cycle(name.to_string())),
            None => {}
        }
        let Some(decl) = decls.get(name) else {
            // Symbol isn't a declared parameter at all; leave resolution
            // of "undefined" to the evaluator, which has the declaring
            // parameter's name for a better error message.
            return Ok(());
        };
        marks.insert(name.to_string(), Mark::Temporary);
        for dep in deps_of(decl) {
            visit(&dep, decls, marks, order)?;
        }
        marks.insert(name.to_string(), Mark::Permanent);
        order.push(name.to_string());
        Ok(())
    }

    let mut marks = HashMap::new();
    let mut order = Vec::new();
    let mut names: Vec<&String> = decls.keys().collect();
    names.sort();
    for name in names {
        visit(name, decls, &mut marks, &mut order)?;
    }

    let _: HashSet<&str> = HashSet::new();
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn no_files(_: &str) -> Result<Array2<f64>, std::io::Error> {
        Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no files in this test"))
    }

    #[test]
    fn fixed_and_expression_resolve() {
        let mut decls = HashMap::new();
        decls.insert(
            "R0".to_string(),
            ParamDecl::Distribution(ParamDistribution::Fixed { value: 2.0 }),
        );
        decls.insert(
            "gamma".to_string(),
            ParamDecl::Distribution(ParamDistribution::Fixed { value: 0.2 }),
        );
        decls.insert(
            "beta".to_string(),
            ParamDecl::Expression { expression: "R0 * gamma".to_string() },
        );

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let engine = ParameterEngine::resolve(&decls, 10, 3, &mut rng, no_files).unwrap();
        match engine.get("beta").unwrap() {
            ParamValue::Scalar(v) => assert!((*v - 0.4).abs() < 1e-12),
            ParamValue::Tensor(_) => panic!("expected scalar"),
        }
    }

    #[test]
    fn cyclic_expressions_are_rejected() {
        let mut decls = HashMap::new();
        decls.insert("a".to_string(), ParamDecl::Expression { expression: "b + 1".to_string() });
        decls.insert("b".to_string(), ParamDecl::Expression { expression: "a + 1".to_string() });

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let err = ParameterEngine::resolve(&decls, 1, 1, &mut rng, no_files).unwrap_err();
        assert!(matches!(err, ParamError::Cycle(_)));
    }

    #[test]
    fn undefined_symbol_in_expression_is_an_error() {
        let mut decls = HashMap::new();
        decls.insert("beta".to_string(), ParamDecl::Expression { expression: "R0 * gamma".to_string() });

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let err = ParameterEngine::resolve(&decls, 1, 1, &mut rng, no_files).unwrap_err();
        assert!(matches!(err, ParamError::UndefinedSymbol { .. }));
    }

    #[test]
    fn set_per_subpop_overrides_only_named_subpops() {
        let mut decls = HashMap::new();
        decls.insert("beta".to_string(), ParamDecl::Distribution(ParamDistribution::Fixed { value: 1.0 }));

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut engine = ParameterEngine::resolve(&decls, 2, 3, &mut rng, no_files).unwrap();

        let mut overrides = HashMap::new();
        overrides.insert("north".to_string(), 9.0);
        let subpop_index = |name: &str| match name {
            "north" => 0,
            "south" => 1,
            _ => 2,
        };
        engine.set_per_subpop("beta", &overrides, subpop_index);

        match engine.get("beta").unwrap() {
            ParamValue::Tensor(arr) => {
                assert_eq!(arr[[0, 0]], 9.0);
                assert_eq!(arr[[0, 1]], 1.0);
                assert_eq!(arr[[1, 0]], 9.0);
            }
            ParamValue::Scalar(_) => panic!("expected tensor after per-subpop override"),
        }
    }

    #[test]
    fn deterministic_seed_gives_deterministic_distribution_draw() {
        let mut decls = HashMap::new();
        decls.insert(
            "beta".to_string(),
            ParamDecl::Distribution(ParamDistribution::Uniform { low: 0.0, high: 1.0 }),
        );

        let mut rng_a = ChaCha8Rng::seed_from_u64(99);
        let mut rng_b = ChaCha8Rng::seed_from_u64(99);
        let engine_a = ParameterEngine::resolve(&decls, 1, 1, &mut rng_a, no_files).unwrap();
        let engine_b = ParameterEngine::resolve(&decls, 1, 1, &mut rng_b, no_files).unwrap();
        match (engine_a.get("beta").unwrap(), engine_b.get("beta").unwrap()) {
            (ParamValue::Scalar(a), ParamValue::Scalar(b)) => assert_eq!(a, b),
            _ => panic!("expected scalars"),
        }
    }
}
