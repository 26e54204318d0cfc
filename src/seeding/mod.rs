//! Component D: initial conditions and seeding.
//!
//! Mirrors the shape of a dosing record from a single-individual PK
//! model (a flat event: time, compartment, amount) but generalized to
//! the metapopulation setting: a seeding event additionally names a
//! source compartment, a destination compartment and a subpopulation,
//! since a "seeding" is a forced instantaneous transition (e.g.
//! susceptible -> exposed) rather than a plain mass addition.

use std::collections::HashMap;

use rand::Rng;
use rand_distr::{Distribution as RandDistribution, Poisson};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SeedingError {
    #[error("seeding event at time {time} references unknown subpop '{subpop}'")]
    UnknownSubpop { time: f64, subpop: String },

    #[error("seeding event at time {time} references unknown compartment '{compartment}'")]
    UnknownCompartment { time: f64, compartment: String },

    #[error("failed to read seeding file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse seeding csv: {0}")]
    Csv(#[from] csv::Error),
}

/// How the initial state of each compartment is populated before any
/// integration happens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum InitialConditions {
    /// The entire population of each subpop starts in a single named
    /// compartment (conventionally the fully-susceptible compartment).
    Default { compartment: String },
    /// Explicit per-(compartment, subpop) starting amounts.
    SetInitialConditions { amounts: HashMap<String, HashMap<String, f64>> },
    FromFile { path: String },
}

/// A single forced instantaneous transition: `amount` individuals move
/// from `source` to `dest` within `subpop` at `time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedingEvent {
    pub time: f64,
    pub source: String,
    pub dest: String,
    pub subpop: String,
    pub amount: f64,
}

impl SeedingEvent {
    pub fn is_valid(&self) -> bool {
        self.time >= 0.0 && self.amount > 0.0
    }
}

/// How seeding events are generated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SeedingMethod {
    NoSeeding,
    /// One Poisson-distributed introduction per subpop per period.
    PoissonDraw { source: String, dest: String, subpops: Vec<String>, time: f64, lambda: f64 },
    /// Every CSV file under `folder` is a candidate realization; one is
    /// chosen uniformly at random per replicate (used to resample
    /// historical seeding scenarios).
    FolderDraw { folder: String },
    FromFile { path: String },
}

impl SeedingMethod {
    /// Materialize concrete seeding events for one simulation replicate.
    /// `file_loader` reads a CSV of seeding events from a path (used by
    /// `FromFile` and `FolderDraw`); `folder_lister` lists candidate
    /// files under a folder (used only by `FolderDraw`).
    pub fn generate<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        file_loader: impl Fn(&str) -> Result<Vec<SeedingEvent>, SeedingError>,
        folder_lister: impl Fn(&str) -> Result<Vec<String>, SeedingError>,
    ) -> Result<Vec<SeedingEvent>, SeedingError> {
        match self {
            SeedingMethod::NoSeeding => Ok(Vec::new()),
            SeedingMethod::PoissonDraw { source, dest, subpops, time, lambda } => {
                let dist = Poisson::new(*lambda).expect("seeding lambda must be positive");
                Ok(subpops
                    .iter()
                    .map(|subpop| SeedingEvent {
                        time: *time,
                        source: source.clone(),
                        dest: dest.clone(),
                        subpop: subpop.clone(),
                        amount: dist.sample(rng),
                    })
                    .filter(|e| e.amount > 0.0)
                    .collect())
            }
            SeedingMethod::FromFile { path } => file_loader(path),
            SeedingMethod::FolderDraw { folder } => {
                let candidates = folder_lister(folder)?;
                if candidates.is_empty() {
                    return Ok(Vec::new());
                }
                let idx = rng.gen_range(0..candidates.len());
                file_loader(&candidates[idx])
            }
        }
    }
}

/// Validate that every event references a known subpop and compartment
/// name, using the resolved sets from `CompartmentSpace`/subpop setup.
pub fn validate_events(
    events: &[SeedingEvent],
    known_subpops: &[String],
    known_compartments: &[String],
) -> Result<(), SeedingError> {
    for event in events {
        if !known_subpops.iter().any(|s| s == &event.subpop) {
            return Err(SeedingError::UnknownSubpop { time: event.time, subpop: event.subpop.clone() });
        }
        if !known_compartments.iter().any(|c| c == &event.source) {
            return Err(SeedingError::UnknownCompartment { time: event.time, compartment: event.source.clone() });
        }
        if !known_compartments.iter().any(|c| c == &event.dest) {
            return Err(SeedingError::UnknownCompartment { time: event.time, compartment: event.dest.clone() });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn no_seeding_produces_no_events() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let events = SeedingMethod::NoSeeding
            .generate(&mut rng, |_| Ok(vec![]), |_| Ok(vec![]))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn poisson_draw_produces_one_event_per_subpop() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let method = SeedingMethod::PoissonDraw {
            source: "S".to_string(),
            dest: "E".to_string(),
            subpops: vec!["regionA".to_string(), "regionB".to_string()],
            time: 10.0,
            lambda: 5.0,
        };
        let events = method.generate(&mut rng, |_| Ok(vec![]), |_| Ok(vec![])).unwrap();
        assert!(events.len() <= 2);
        for event in &events {
            assert_eq!(event.time, 10.0);
            assert!(event.amount > 0.0);
        }
    }

    #[test]
    fn validate_events_catches_unknown_subpop() {
        let events = vec![SeedingEvent {
            time: 1.0,
            source: "S".to_string(),
            dest: "E".to_string(),
            subpop: "ghost".to_string(),
            amount: 5.0,
        }];
        let err = validate_events(&events, &["regionA".to_string()], &["S".to_string(), "E".to_string()]).unwrap_err();
        assert!(matches!(err, SeedingError::UnknownSubpop { .. }));
    }

    #[test]
    fn event_validity_rejects_nonpositive_amount() {
        let event = SeedingEvent { time: 0.0, source: "S".to_string(), dest: "E".to_string(), subpop: "regionA".to_string(), amount: 0.0 };
        assert!(!event.is_valid());
    }
}
