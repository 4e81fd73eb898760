//! Application configuration and constants

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::cli::{Aggregation, Backbone, EvalArgs, L2Policy};
use crate::models::zoo::WeightsSource;

static CUSTOM_WEIGHTS_DIR: OnceLock<PathBuf> = OnceLock::new();

// === Weights ===
pub const OFF_THE_SHELF_DIR: &str = "data/off_the_shelf_nets";
pub const WEIGHTS_DIR_ENV: &str = "GEORECALL_WEIGHTS_DIR";

// === Preprocessing ===
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
pub const IMAGE_EXTENSION: &str = "jpg";

// === Layers ===
pub const GEM_P: f32 = 3.0;
pub const GEM_EPS: f64 = 1e-6;
pub const L2_EPS: f64 = 1e-12;
pub const BN_EPS: f64 = 1e-5;
pub const RMAC_LEVELS: usize = 3;

// === PCA ===
pub const PCA_MAX_IMAGES: usize = 1 << 14;
pub const PCA_POWER_ITERATIONS: usize = 4;
pub const PCA_OVERSAMPLING: usize = 16;

// === Outputs ===
pub const OUTPUT_ROOT: &str = "test";
pub const RUN_TIMESTAMP: &str = "%Y-%m-%d_%H-%M-%S";
pub const RECALLS_FILE: &str = "recalls.json";
pub const PCA_FILE: &str = "pca.msgpack";

pub fn set_weights_dir(path: PathBuf) {
	let _ = CUSTOM_WEIGHTS_DIR.set(path);
}

/// Directory holding downloaded weights (flag, GEORECALL_WEIGHTS_DIR, or default)
pub fn weights_dir() -> PathBuf {
	if let Some(custom) = CUSTOM_WEIGHTS_DIR.get() {
		return custom.clone();
	}

	if let Ok(env_path) = std::env::var(WEIGHTS_DIR_ENV) {
		crate::ui::debug(&format!("Using {}: {}", WEIGHTS_DIR_ENV, env_path));
		return PathBuf::from(env_path);
	}

	PathBuf::from(OFF_THE_SHELF_DIR)
}

fn warn_ignored_resume(weights: &WeightsSource, resume: Option<&Path>, flag: &str) {
	if let (true, Some(path)) = (weights.is_off_the_shelf(), resume) {
		crate::ui::warn(&format!(
			"{} {} is ignored, {} weights take precedence",
			flag,
			path.display(),
			weights.describe()
		));
	}
}

/// Everything needed to build one model and its descriptor post-processing
#[derive(Debug, Clone)]
pub struct ModelConfig {
	pub backbone: Backbone,
	pub aggregation: Aggregation,
	pub l2: L2Policy,
	pub fc_output_dim: Option<usize>,
	pub netvlad_clusters: usize,
	pub weights: WeightsSource,
	pub pca_dim: Option<usize>,
}

impl ModelConfig {
	pub fn from_args(args: &EvalArgs) -> Result<Self> {
		let weights = WeightsSource::resolve(&args.off_the_shelf, args.resume.as_deref(), args.backbone)?;
		warn_ignored_resume(&weights, args.resume.as_deref(), "--resume");
		let config = Self {
			backbone: args.backbone,
			aggregation: args.aggregation,
			l2: args.l2,
			fc_output_dim: args.fc_output_dim,
			netvlad_clusters: args.netvlad_clusters,
			weights,
			pca_dim: args.pca_dim,
		};
		config.validate()?;
		Ok(config)
	}

	/// Second model of a comparison run: same arguments, GeM pooling, its own
	/// checkpoint and no PCA.
	pub fn comparison(args: &EvalArgs) -> Result<Self> {
		let weights = WeightsSource::resolve(&args.off_the_shelf, args.resume_compar.as_deref(), args.backbone)?;
		warn_ignored_resume(&weights, args.resume_compar.as_deref(), "--resume-compar");
		let config = Self {
			backbone: args.backbone,
			aggregation: Aggregation::Gem,
			l2: args.l2,
			fc_output_dim: args.fc_output_dim,
			netvlad_clusters: args.netvlad_clusters,
			weights,
			pca_dim: None,
		};
		config.validate()?;
		Ok(config)
	}

	fn validate(&self) -> Result<()> {
		if self.aggregation.is_vlad() {
			if self.fc_output_dim.is_some() {
				bail!("--fc-output-dim is only supported with gem, spoc, mac and rmac");
			}
			if self.netvlad_clusters == 0 {
				bail!("--netvlad-clusters must be positive");
			}
		}
		if self.fc_output_dim == Some(0) {
			bail!("--fc-output-dim must be positive");
		}
		if self.pca_dim == Some(0) {
			bail!("--pca-dim must be positive");
		}
		Ok(())
	}

	/// Channels of the backbone's last feature map
	pub fn base_dim(&self) -> usize {
		match self.backbone {
			Backbone::Resnet18Conv4 => 256,
			Backbone::Resnet18Conv5 => 512,
			Backbone::Resnet50Conv4 | Backbone::Resnet101Conv4 => 1024,
			Backbone::Resnet50Conv5 | Backbone::Resnet101Conv5 => 2048,
		}
	}

	/// Dimension of the descriptors the network outputs
	pub fn features_dim(&self) -> usize {
		if let Some(fc) = self.fc_output_dim {
			return fc;
		}
		if self.aggregation.is_vlad() {
			self.base_dim() * self.netvlad_clusters
		} else {
			self.base_dim()
		}
	}

	/// Dimension of the descriptors used for search
	pub fn effective_dim(&self) -> usize {
		self.pca_dim.unwrap_or_else(|| self.features_dim())
	}
}

/// Run directory `test/<save_dir>/<timestamp>`
pub fn run_dir(save_dir: &str, start: &chrono::DateTime<chrono::Local>) -> PathBuf {
	Path::new(OUTPUT_ROOT)
		.join(save_dir)
		.join(start.format(RUN_TIMESTAMP).to_string())
}
