//! Files written to a run directory

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::config::{PCA_FILE, RECALLS_FILE};
use crate::core::{Pca, Recalls};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Summary of one evaluation run, saved as JSON
#[derive(Debug, Serialize, Deserialize)]
pub struct RecallReport {
	pub version: String,
	pub timestamp: String,
	pub dataset: String,
	pub test_method: String,
	pub model: String,
	pub features_dim: usize,
	pub recalls: Recalls,
	/// Second model and ensemble of a comparison run
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub comparison: Option<ComparisonRecalls>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ComparisonRecalls {
	pub model: String,
	pub recalls: Recalls,
	pub ensemble: Recalls,
}

impl RecallReport {
	pub fn new(dataset: &str, test_method: &str, model: String, features_dim: usize, recalls: Recalls) -> Self {
		Self {
			version: VERSION.to_string(),
			timestamp: chrono::Local::now().to_rfc3339(),
			dataset: dataset.to_string(),
			test_method: test_method.to_string(),
			model,
			features_dim,
			recalls,
			comparison: None,
		}
	}
}

pub fn save_report(report: &RecallReport, run_dir: &Path) -> Result<()> {
	fs::create_dir_all(run_dir).with_context(|| format!("Failed to create {}", run_dir.display()))?;
	let json = serde_json::to_string_pretty(report).context("Failed to serialize recalls")?;
	let path = run_dir.join(RECALLS_FILE);
	fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))
}

pub fn save_pca(pca: &Pca, run_dir: &Path) -> Result<()> {
	fs::create_dir_all(run_dir).with_context(|| format!("Failed to create {}", run_dir.display()))?;
	let bytes = rmp_serde::to_vec(pca).context("Failed to serialize PCA")?;
	let path = run_dir.join(PCA_FILE);
	fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))
}

pub fn load_pca(path: &Path) -> Result<Pca> {
	let bytes = fs::read(path).with_context(|| format!("Failed to read PCA {}", path.display()))?;
	rmp_serde::from_slice(&bytes).context("Failed to deserialize PCA")
}
