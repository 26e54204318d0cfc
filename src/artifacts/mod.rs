//! Ambient module: artifact output.
//!
//! Writes simulation and inference artifacts under the layout
//! `model_output/<name>_<seir_scen>_<outcome_scen>/<run_id>/<artifact_kind>/{global|chimeric}/{intermediate|final}/<chain>.<iter>.<kind>.<ext>`,
//! with a directory-per-concern split: parameter trajectories as CSV,
//! diagnostics and summaries as JSON.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::Serialize;
use thiserror::Error;

use crate::inference::ParameterVector;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("failed to create artifact directory '{path}': {source}")]
    CreateDir { path: String, source: std::io::Error },

    #[error("csv error writing artifact: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error writing artifact: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error writing artifact: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    Global,
    Chimeric,
}

impl Block {
    fn dirname(&self) -> &'static str {
        match self {
            Block::Global => "global",
            Block::Chimeric => "chimeric",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Intermediate,
    Final,
}

impl Stage {
    fn dirname(&self) -> &'static str {
        match self {
            Stage::Intermediate => "intermediate",
            Stage::Final => "final",
        }
    }
}

/// Resolves the directory layout for a single run; every artifact write
/// goes through this so the layout only needs expressing once.
pub struct ArtifactWriter {
    pub root: PathBuf,
}

impl ArtifactWriter {
    pub fn new(output_root: impl AsRef<Path>, name: &str, seir_scenario: &str, outcome_scenario: &str, run_id: &str) -> Self {
        let root = output_root
            .as_ref()
            .join("model_output")
            .join(format!("{name}_{seir_scenario}_{outcome_scenario}"))
            .join(run_id);
        Self { root }
    }

    fn artifact_dir(&self, kind: &str, block: Block, stage: Stage) -> PathBuf {
        self.root.join(kind).join(block.dirname()).join(stage.dirname())
    }

    fn ensure_dir(&self, dir: &Path) -> Result<(), ArtifactError> {
        fs::create_dir_all(dir).map_err(|source| ArtifactError::CreateDir { path: dir.display().to_string(), source })
    }

    /// Writes a parameter vector (`spar`/`hpar`) artifact as JSON.
    pub fn write_parameters(&self, kind: &str, block: Block, stage: Stage, chain: usize, iter: usize, params: &ParameterVector) -> Result<PathBuf, ArtifactError> {
        let dir = self.artifact_dir(kind, block, stage);
        self.ensure_dir(&dir)?;
        let path = dir.join(format!("{chain}.{iter}.{kind}.parquet.json"));
        let json = serde_json::to_string_pretty(params)?;
        fs::write(&path, json)?;
        info!("wrote {kind} artifact to {}", path.display());
        Ok(path)
    }

    /// Writes a (day, compartment, subpop) trajectory (`seir`/`hosp`) as
    /// a long-format CSV.
    pub fn write_trajectory(
        &self,
        kind: &str,
        block: Block,
        stage: Stage,
        chain: usize,
        iter: usize,
        compartment_names: &[String],
        subpop_names: &[String],
        trajectory: &ndarray::Array3<f64>,
    ) -> Result<PathBuf, ArtifactError> {
        let dir = self.artifact_dir(kind, block, stage);
        self.ensure_dir(&dir)?;
        let path = dir.join(format!("{chain}.{iter}.{kind}.csv"));
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(["day", "compartment", "subpop", "value"])?;

        let (n_days, n_compartments, n_subpop) = trajectory.dim();
        for day in 0..n_days {
            for c in 0..n_compartments {
                for s in 0..n_subpop {
                    writer.write_record([
                        day.to_string(),
                        compartment_names[c].clone(),
                        subpop_names[s].clone(),
                        trajectory[[day, c, s]].to_string(),
                    ])?;
                }
            }
        }
        writer.flush()?;
        info!("wrote {kind} artifact to {}", path.display());
        Ok(path)
    }

    /// Writes any serializable record (`llik`, `init`, `seed` summaries)
    /// as pretty JSON.
    pub fn write_json<T: Serialize>(&self, kind: &str, block: Block, stage: Stage, chain: usize, iter: usize, value: &T) -> Result<PathBuf, ArtifactError> {
        let dir = self.artifact_dir(kind, block, stage);
        self.ensure_dir(&dir)?;
        let path = dir.join(format!("{chain}.{iter}.{kind}.json"));
        let json = serde_json::to_string_pretty(value)?;
        fs::write(&path, json)?;
        Ok(path)
    }
}
