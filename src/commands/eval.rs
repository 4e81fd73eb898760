//! Eval command - extract descriptors and report recall@N

use anyhow::{bail, Context, Result};
use candle_core::Device;
use std::path::Path;
use std::time::Instant;

use crate::cli::EvalArgs;
use crate::config::{self, ModelConfig, PCA_MAX_IMAGES};
use crate::core::{Pca, Recalls};
use crate::evaluation::{self, Features};
use crate::models::GeoLocalizationNet;
use crate::processing::{extract, View};
use crate::runtime::select_device;
use crate::storage::{self, ComparisonRecalls, RecallReport, TestDataset};
use crate::ui::{self, Log};

pub fn run(args: &EvalArgs) -> Result<()> {
	let start = Instant::now();
	if args.recall_values.is_empty() || args.recall_values.contains(&0) {
		bail!("--recall-values must be positive");
	}
	evaluation::resize_of(args)?;
	let model = ModelConfig::from_args(args)?;
	let second_model = if args.comparison {
		Some(ModelConfig::comparison(args)?)
	} else {
		None
	};

	let started_at = chrono::Local::now();
	let run_dir = config::run_dir(&args.save_dir, &started_at);
	Log::init_files(&run_dir)?;

	ui::header("georecall eval");
	ui::info(&format!("Arguments: {:?}", args));
	ui::info(&format!("The outputs are being saved in {}", run_dir.display()));

	let device = select_device(args.device);
	let net = GeoLocalizationNet::load(&model, &device, args.seed)?;
	let pca = prepare_pca(args, &model, &net, &device, &run_dir)?;

	let dataset = TestDataset::open(&args.datasets_folder, &args.dataset_name, args.val_positive_dist_threshold)?;
	ui::info(&format!("Test set: {}", dataset));

	let features = evaluation::extract_features(&net, &device, &dataset, args, pca.as_ref())?;
	drop(net);
	let recalls = score(&features, &dataset, args);
	let mut report = RecallReport::new(
		&dataset.name,
		args.test_method.name(),
		describe(&model),
		features.dim(),
		recalls.clone(),
	);

	if let Some(second_model) = &second_model {
		let alt_dir = config::run_dir(&args.save_alt_dir, &started_at);
		let second = compare(args, second_model, &device, &dataset, &features, &alt_dir)?;

		ui::info(&format!("Recalls on {} (model 1): {}", dataset, recalls));
		ui::info(&format!("Recalls on {} (model 2): {}", dataset, second.recalls));
		ui::info(&format!("Recalls on {}: {}", dataset, second.ensemble));
		ui::recall_table("Model 1", &recalls.pairs());
		ui::recall_table("Model 2", &second.recalls.pairs());
		ui::recall_table("Ensemble", &second.ensemble.pairs());
		ui::success(&format!(
			"Ensemble R@{}: {:.1} (model 1: {:.1}, model 2: {:.1})",
			recalls.values[0],
			second.ensemble.headline(),
			recalls.headline(),
			second.recalls.headline()
		));
		report.comparison = Some(second);
	} else {
		ui::info(&format!("Recalls on {}: {}", dataset, recalls));
		ui::recall_table(&format!("Recall on {}", dataset.name), &recalls.pairs());
	}

	storage::save_report(&report, &run_dir)?;
	ui::success(&format!("Finished in {}", ui::format_elapsed(start.elapsed())));
	Ok(())
}

fn score(features: &Features, dataset: &TestDataset, args: &EvalArgs) -> Recalls {
	evaluation::evaluate(features, &dataset.positives, &args.recall_values, args.majority_weight)
}

fn describe(model: &ModelConfig) -> String {
	format!(
		"{} + {:?} ({})",
		model.backbone,
		model.aggregation,
		model.weights.describe()
	)
}

/// Evaluate the GeM comparison model and its ensemble with the first model
fn compare(
	args: &EvalArgs,
	model: &ModelConfig,
	device: &Device,
	dataset: &TestDataset,
	first: &Features,
	alt_dir: &Path,
) -> Result<ComparisonRecalls> {
	ui::header("comparison model");
	let net = GeoLocalizationNet::load(model, device, args.seed)?;
	let features = evaluation::extract_features(&net, device, dataset, args, None)?;
	drop(net);

	let recalls = score(&features, dataset, args);
	let ensemble = score(&evaluation::ensemble(first, &features)?, dataset, args);

	let report = RecallReport::new(
		&dataset.name,
		args.test_method.name(),
		describe(model),
		features.dim(),
		recalls.clone(),
	);
	storage::save_report(&report, alt_dir)?;
	ui::debug(&format!("Second model results saved in {}", alt_dir.display()));

	Ok(ComparisonRecalls {
		model: describe(model),
		recalls,
		ensemble,
	})
}

/// Load a saved PCA or fit one on the PCA image folder, or none without
/// --pca-dim and --pca-path.
fn prepare_pca(
	args: &EvalArgs,
	model: &ModelConfig,
	net: &GeoLocalizationNet,
	device: &Device,
	run_dir: &Path,
) -> Result<Option<Pca>> {
	if let Some(path) = &args.pca_path {
		let pca = storage::load_pca(path)?;
		if pca.dim != net.features_dim() {
			bail!(
				"PCA in {} expects {}-dimensional descriptors, the model produces {}",
				path.display(),
				pca.dim,
				net.features_dim()
			);
		}
		if let Some(dim) = model.pca_dim {
			if dim != pca.n_components {
				bail!("--pca-dim {} does not match the {} components of {}", dim, pca.n_components, path.display());
			}
		}
		ui::info(&format!("Loaded PCA ({} -> {}) from {}", pca.dim, pca.n_components, path.display()));
		return Ok(Some(pca));
	}

	if model.pca_dim.is_none() {
		return Ok(None);
	}
	let folder = args
		.pca_dataset_folder
		.as_ref()
		.context("--pca-dim needs --pca-dataset-folder (or --pca-path)")?;

	let paths = storage::sample_images(&args.datasets_folder.join(folder), PCA_MAX_IMAGES, args.seed)?;
	ui::info(&format!("Computing PCA on {} images", paths.len()));
	let resize = evaluation::resize_of(args)?;
	let features = extract(net, device, &paths, View::database(resize), args.infer_batch_size, "PCA")?;
	let pca = Pca::fit(features.view(), model.effective_dim(), args.pca_whiten, args.seed)?;

	storage::save_pca(&pca, run_dir)?;
	ui::success(&format!(
		"PCA fitted: {} -> {}{}",
		pca.dim,
		pca.n_components,
		if pca.whiten { " (whitened)" } else { "" }
	));
	Ok(Some(pca))
}
