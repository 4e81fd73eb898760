//! Test datasets on disk
//!
//! `<datasets_folder>/<name>/images/test/{database,queries}` holds `*.jpg`
//! files whose names carry UTM coordinates (`@<east>@<north>@...`).

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::IMAGE_EXTENSION;
use crate::core::{positives_within, Utm};
use crate::ui;

pub struct TestDataset {
	pub name: String,
	pub database_paths: Vec<PathBuf>,
	pub queries_paths: Vec<PathBuf>,
	/// Database indices within the positive threshold of each query
	pub positives: Vec<Vec<usize>>,
}

impl TestDataset {
	pub fn open(datasets_folder: &Path, name: &str, positive_threshold: f64) -> Result<Self> {
		let folder = datasets_folder.join(name).join("images").join("test");
		if !folder.is_dir() {
			bail!("Folder {} does not exist", folder.display());
		}

		let database_paths = list_images(&folder.join("database"))?;
		let queries_paths = list_images(&folder.join("queries"))?;
		if database_paths.is_empty() || queries_paths.is_empty() {
			bail!(
				"{} needs images in both database/ and queries/ (found {} and {})",
				folder.display(),
				database_paths.len(),
				queries_paths.len()
			);
		}

		let database_utms = parse_utms(&database_paths)?;
		let queries_utms = parse_utms(&queries_paths)?;
		let positives = positives_within(&database_utms, &queries_utms, positive_threshold);

		let without = positives.iter().filter(|p| p.is_empty()).count();
		if without > 0 {
			ui::warn(&format!(
				"{} of {} queries have no database image within {} m",
				without,
				queries_paths.len(),
				positive_threshold
			));
		}

		Ok(Self {
			name: name.to_string(),
			database_paths,
			queries_paths,
			positives,
		})
	}

	pub fn database_num(&self) -> usize {
		self.database_paths.len()
	}

	pub fn queries_num(&self) -> usize {
		self.queries_paths.len()
	}
}

impl fmt::Display for TestDataset {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"< TestDataset, {} - #database: {}; #queries: {} >",
			self.name,
			self.database_num(),
			self.queries_num()
		)
	}
}

fn parse_utms(paths: &[PathBuf]) -> Result<Vec<Utm>> {
	paths.iter().map(|p| Utm::from_path(p)).collect()
}

/// All `*.jpg` files below `dir`, sorted
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
	if !dir.is_dir() {
		bail!("Folder {} does not exist", dir.display());
	}

	let mut paths: Vec<PathBuf> = WalkDir::new(dir)
		.into_iter()
		.filter_map(|e| e.ok())
		.filter(|e| e.file_type().is_file())
		.map(|e| e.into_path())
		.filter(|p| {
			p.extension()
				.and_then(|e| e.to_str())
				.is_some_and(|e| e.eq_ignore_ascii_case(IMAGE_EXTENSION))
		})
		.collect();
	paths.sort();
	Ok(paths)
}

/// Up to `max` images of `dir`, drawn without replacement with `seed`
pub fn sample_images(dir: &Path, max: usize, seed: u64) -> Result<Vec<PathBuf>> {
	let paths = list_images(dir).with_context(|| format!("Cannot read PCA images from {}", dir.display()))?;
	if paths.len() <= max {
		return Ok(paths);
	}
	let mut rng = StdRng::seed_from_u64(seed);
	let mut picked = rand::seq::index::sample(&mut rng, paths.len(), max).into_vec();
	picked.sort_unstable();
	Ok(picked.into_iter().map(|i| paths[i].clone()).collect())
}
