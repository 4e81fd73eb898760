//! Descriptor extraction for a test set and recall evaluation by test method

use anyhow::{bail, Result};
use candle_core::Device;
use ndarray::{concatenate, Array2, Axis};

use crate::cli::{EvalArgs, TestMethod};
use crate::core::{apply_majority_votes, knn, merge_nearest, Neighbors, Pca, Recalls};
use crate::models::GeoLocalizationNet;
use crate::processing::{average_groups, extract, normalize_rows, View};
use crate::storage::TestDataset;
use crate::ui;

/// Descriptors of a test set, one row per database image and one row per
/// query input (five per query for nearest_crop and maj_voting).
pub struct Features {
	pub database: Array2<f32>,
	pub queries: Array2<f32>,
	pub method: TestMethod,
}

impl Features {
	pub fn dim(&self) -> usize {
		self.database.ncols()
	}
}

pub fn resize_of(args: &EvalArgs) -> Result<(u32, u32)> {
	match args.resize.as_slice() {
		[h, w] if *h > 0 && *w > 0 => Ok((*h, *w)),
		other => bail!("--resize expects two positive values H W, got {:?}", other),
	}
}

pub fn extract_features(
	net: &GeoLocalizationNet,
	device: &Device,
	dataset: &TestDataset,
	args: &EvalArgs,
	pca: Option<&Pca>,
) -> Result<Features> {
	let resize = resize_of(args)?;
	let method = args.test_method;

	ui::info(&format!("Extracting database features for evaluation/testing ({} images)", dataset.database_num()));
	let database = extract(
		net,
		device,
		&dataset.database_paths,
		View::database(resize),
		args.infer_batch_size,
		"database",
	)?;

	let query_batch = if method == TestMethod::SingleQuery { 1 } else { args.infer_batch_size };
	ui::info(&format!(
		"Extracting queries features for evaluation/testing ({} images, {})",
		dataset.queries_num(),
		method.name()
	));
	let mut queries = extract(
		net,
		device,
		&dataset.queries_paths,
		View::queries(method, resize),
		query_batch,
		"queries",
	)?;
	if method == TestMethod::FiveCrops {
		queries = average_groups(&queries, method.crops_per_query());
	}

	let (database, queries) = match pca {
		Some(pca) => (pca.transform(database.view())?, pca.transform(queries.view())?),
		None => (database, queries),
	};

	Ok(Features {
		database,
		queries,
		method,
	})
}

/// Rank the database for every query and compute recall@N
pub fn evaluate(features: &Features, positives: &[Vec<usize>], recall_values: &[usize], majority_weight: f32) -> Recalls {
	let k = recall_values.iter().copied().max().unwrap_or(1);
	let neighbors = knn(features.database.view(), features.queries.view(), k);

	let predictions: Vec<Vec<usize>> = match features.method {
		TestMethod::NearestCrop | TestMethod::MajVoting => neighbors
			.chunks(features.method.crops_per_query())
			.map(|crops| {
				let mut crops: Vec<Neighbors> = crops.to_vec();
				if features.method == TestMethod::MajVoting {
					apply_majority_votes(&mut crops, majority_weight);
				}
				indices(&merge_nearest(&crops, k))
			})
			.collect(),
		_ => neighbors.iter().map(|n| indices(n)).collect(),
	};

	Recalls::compute(&predictions, positives, recall_values)
}

fn indices(neighbors: &Neighbors) -> Vec<usize> {
	neighbors.iter().map(|(i, _)| *i).collect()
}

/// Concatenate two models' L2-normalized descriptors
pub fn ensemble(first: &Features, second: &Features) -> Result<Features> {
	if first.method != second.method || first.queries.nrows() != second.queries.nrows() {
		bail!("Ensembled features must come from the same queries and test method");
	}
	let join = |a: &Array2<f32>, b: &Array2<f32>| -> Result<Array2<f32>> {
		let (mut a, mut b) = (a.clone(), b.clone());
		normalize_rows(&mut a);
		normalize_rows(&mut b);
		Ok(concatenate(Axis(1), &[a.view(), b.view()])?)
	};
	Ok(Features {
		database: join(&first.database, &second.database)?,
		queries: join(&first.queries, &second.queries)?,
		method: first.method,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use ndarray::array;

	fn features(method: TestMethod, queries: Array2<f32>) -> Features {
		Features {
			database: array![[0.0f32, 0.0], [1.0, 0.0], [0.0, 1.0], [5.0, 5.0]],
			queries,
			method,
		}
	}

	#[test]
	fn hard_resize_uses_one_row_per_query() {
		let f = features(TestMethod::HardResize, array![[0.9f32, 0.1], [4.0, 4.0]]);
		let recalls = evaluate(&f, &[vec![1], vec![0]], &[1, 2], 0.01);
		// second query's positive ranks fourth
		assert_eq!(recalls.percentages, vec![50.0, 50.0]);
	}

	#[test]
	fn nearest_crop_merges_five_rows_per_query() {
		let crops = array![[5.0f32, 5.0], [0.0, 0.9], [0.1, 1.0], [0.0, 1.1], [0.0, 0.8]];
		let f = features(TestMethod::NearestCrop, crops);
		let recalls = evaluate(&f, &[vec![3]], &[1, 5], 0.01);
		assert_eq!(recalls.percentages, vec![100.0, 100.0]);
	}

	#[test]
	fn ensemble_concatenates_normalized_rows() {
		let a = features(TestMethod::HardResize, array![[3.0f32, 4.0]]);
		let b = Features {
			database: array![[2.0f32], [2.0], [2.0], [2.0]],
			queries: array![[-1.0f32]],
			method: TestMethod::HardResize,
		};
		let joined = ensemble(&a, &b).unwrap();
		assert_eq!(joined.dim(), 3);
		assert_eq!(joined.queries, array![[0.6f32, 0.8, -1.0]]);
		let row = joined.database.row(3).to_vec();
		let half = std::f32::consts::FRAC_1_SQRT_2;
		assert!((row[0] - half).abs() < 1e-6 && (row[1] - half).abs() < 1e-6 && row[2] == 1.0, "{:?}", row);
	}
}
