//! Component A: compartment space.
//!
//! Materializes the Cartesian product of named strata into an indexed
//! set of compartments, and resolves user filters (partial axis-label
//! maps) to the set of matching compartment indices.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpaceError {
    #[error("axis '{0}' has no labels")]
    EmptyAxis(String),

    #[error("unknown axis '{axis}'")]
    UnknownAxis { axis: String },

    #[error("axis '{axis}' has no label '{label}'")]
    UnknownLabel { axis: String, label: String },
}

/// A single compartment: one label per axis, in declared axis order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compartment {
    pub labels: Vec<String>,
}

impl Compartment {
    pub fn name(&self) -> String {
        self.labels.join("_")
    }
}

/// The full compartment space: the Cartesian product of the axes, with a
/// stable row-major index assigned to each compartment.
#[derive(Debug, Clone)]
pub struct CompartmentSpace {
    axis_names: Vec<String>,
    axis_labels: Vec<Vec<String>>,
    compartments: Vec<Compartment>,
    /// Row-major strides, one per axis, used to compute an index from an
    /// axis-label tuple without rescanning `compartments`.
    strides: Vec<usize>,
}

impl CompartmentSpace {
    /// `axes` is an ordered mapping from axis name to its ordered list of
    /// labels, exactly as it appears in the declarative configuration.
    pub fn new(axes: Vec<(String, Vec<String>)>) -> Result<Self, SpaceError> {
        for (name, labels) in &axes {
            if labels.is_empty() {
                return Err(SpaceError::EmptyAxis(name.clone()));
            }
        }

        let axis_names: Vec<String> = axes.iter().map(|(n, _)| n.clone()).collect();
        let axis_labels: Vec<Vec<String>> = axes.into_iter().map(|(_, l)| l).collect();

        // Row-major strides: stride[i] = product of sizes of axes after i.
        let mut strides = vec![1usize; axis_labels.len()];
        for i in (0..axis_labels.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * axis_labels[i + 1].len();
        }

        let mut compartments = Vec::new();
        let mut indices = vec![0usize; axis_labels.len()];
        if axis_labels.is_empty() {
            compartments.push(Compartment { labels: Vec::new() });
        } else {
            let total: usize = axis_labels.iter().map(|l| l.len()).product();
            for _ in 0..total {
                let labels = indices
                    .iter()
                    .enumerate()
                    .map(|(axis, &idx)| axis_labels[axis][idx].clone())
                    .collect();
                compartments.push(Compartment { labels });

                // Odometer increment, least-significant (last) axis first.
                for axis in (0..indices.len()).rev() {
                    indices[axis] += 1;
                    if indices[axis] < axis_labels[axis].len() {
                        break;
                    }
                    indices[axis] = 0;
                }
            }
        }

        Ok(Self {
            axis_names,
            axis_labels,
            compartments,
            strides,
        })
    }

    pub fn n_compartments(&self) -> usize {
        self.compartments.len()
    }

    pub fn axis_names(&self) -> &[String] {
        &self.axis_names
    }

    pub fn compartments(&self) -> &[Compartment] {
        &self.compartments
    }

    pub fn compartment(&self, index: usize) -> &Compartment {
        &self.compartments[index]
    }

    /// Resolve a filter (axis name -> allowed labels; omitted axes match
    /// all labels) to the set of matching compartment indices, in
    /// ascending order.
    pub fn resolve(&self, filter: &HashMap<String, Vec<String>>) -> Result<Vec<usize>, SpaceError> {
        for axis in filter.keys() {
            if !self.axis_names.contains(axis) {
                return Err(SpaceError::UnknownAxis { axis: axis.clone() });
            }
        }

        // Per axis: the set of allowed label indices (None = all).
        let mut allowed_idx: Vec<Option<Vec<usize>>> = Vec::with_capacity(self.axis_names.len());
        for (axis_pos, axis_name) in self.axis_names.iter().enumerate() {
            match filter.get(axis_name) {
                None => allowed_idx.push(None),
                Some(labels) => {
                    let mut idxs = Vec::with_capacity(labels.len());
                    for label in labels {
                        let pos = self.axis_labels[axis_pos]
                            .iter()
                            .position(|l| l == label)
                            .ok_or_else(|| SpaceError::UnknownLabel {
                                axis: axis_name.clone(),
                                label: label.clone(),
                            })?;
                        idxs.push(pos);
                    }
                    allowed_idx.push(Some(idxs));
                }
            }
        }

        let mut matches = Vec::new();
        for (idx, compartment) in self.compartments.iter().enumerate() {
            let mut ok = true;
            for (axis_pos, label) in compartment.labels.iter().enumerate() {
                if let Some(allowed) = &allowed_idx[axis_pos] {
                    let label_idx = self.axis_labels[axis_pos]
                        .iter()
                        .position(|l| l == label)
                        .expect("compartment label must exist in its own axis");
                    if !allowed.contains(&label_idx) {
                        ok = false;
                        break;
                    }
                }
            }
            if ok {
                matches.push(idx);
            }
        }

        Ok(matches)
    }

    /// Shorthand for a single-axis, single-label filter.
    pub fn resolve_one(&self, axis: &str, label: &str) -> Result<Vec<usize>, SpaceError> {
        let mut filter = HashMap::new();
        filter.insert(axis.to_string(), vec![label.to_string()]);
        self.resolve(&filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seir_space() -> CompartmentSpace {
        CompartmentSpace::new(vec![(
            "infection_stage".to_string(),
            vec!["S".into(), "E".into(), "I".into(), "R".into()],
        )])
        .unwrap()
    }

    #[test]
    fn product_space_has_expected_size() {
        let space = CompartmentSpace::new(vec![
            ("infection_stage".to_string(), vec!["S".into(), "I".into(), "R".into()]),
            ("age".to_string(), vec!["young".into(), "old".into()]),
        ])
        .unwrap();
        assert_eq!(space.n_compartments(), 6);
    }

    #[test]
    fn index_is_stable_row_major() {
        let space = CompartmentSpace::new(vec![
            ("infection_stage".to_string(), vec!["S".into(), "I".into()]),
            ("age".to_string(), vec!["young".into(), "old".into()]),
        ])
        .unwrap();
        // Row-major: last axis varies fastest.
        assert_eq!(space.compartment(0).labels, vec!["S", "young"]);
        assert_eq!(space.compartment(1).labels, vec!["S", "old"]);
        assert_eq!(space.compartment(2).labels, vec!["I", "young"]);
        assert_eq!(space.compartment(3).labels, vec!["I", "old"]);
    }

    #[test]
    fn resolve_omitted_axis_matches_all() {
        let space = CompartmentSpace::new(vec![
            ("infection_stage".to_string(), vec!["S".into(), "I".into()]),
            ("age".to_string(), vec!["young".into(), "old".into()]),
        ])
        .unwrap();
        let mut filter = HashMap::new();
        filter.insert("infection_stage".to_string(), vec!["I".to_string()]);
        let matches = space.resolve(&filter).unwrap();
        assert_eq!(matches, vec![2, 3]);
    }

    #[test]
    fn empty_axis_is_rejected() {
        let err = CompartmentSpace::new(vec![("infection_stage".to_string(), vec![])]).unwrap_err();
        assert!(matches!(err, SpaceError::EmptyAxis(_)));
    }

    #[test]
    fn unknown_label_is_rejected() {
        let space = seir_space();
        let err = space.resolve_one("infection_stage", "X").unwrap_err();
        assert!(matches!(err, SpaceError::UnknownLabel { .. }));
    }
}
