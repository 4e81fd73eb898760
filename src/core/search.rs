//! Exact nearest-neighbour search over descriptors

use ndarray::{ArrayView2, Axis};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};

/// Database index and squared L2 distance, closest first
pub type Neighbors = Vec<(usize, f32)>;

/// Windows over which crop predictions vote
const VOTING_WINDOWS: [usize; 3] = [1, 5, 10];

/// The `k` database rows closest to each query row (squared L2, brute force)
pub fn knn(database: ArrayView2<f32>, queries: ArrayView2<f32>, k: usize) -> Vec<Neighbors> {
	let k = k.min(database.nrows());
	let db_norms: Vec<f32> = database
		.axis_iter(Axis(0))
		.map(|row| row.dot(&row))
		.collect();

	(0..queries.nrows())
		.into_par_iter()
		.map(|i| {
			let query = queries.row(i);
			let query_norm = query.dot(&query);
			let products = database.dot(&query);

			let mut distances: Neighbors = products
				.iter()
				.zip(&db_norms)
				.enumerate()
				.map(|(j, (dot, norm))| (j, (query_norm + norm - 2.0 * dot).max(0.0)))
				.collect();

			if k < distances.len() {
				distances.select_nth_unstable_by(k, |a, b| a.1.total_cmp(&b.1));
				distances.truncate(k);
			}
			distances.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
			distances
		})
		.collect()
}

/// Merge the lists of several crops of one query: closest first, each
/// database item kept once at its smallest distance, `k` at most.
pub fn merge_nearest(per_crop: &[Neighbors], k: usize) -> Neighbors {
	let mut all: Neighbors = per_crop.iter().flatten().copied().collect();
	all.sort_by(|a, b| a.1.total_cmp(&b.1));

	let mut seen = HashSet::new();
	all.retain(|(index, _)| seen.insert(*index));
	all.truncate(k);
	all
}

/// Reward database items several crops agree on. For each window of the
/// first 1, 5 and 10 columns, an item present `c > 1` times has each of its
/// distances inside that window lowered by `weight * c / window`.
pub fn apply_majority_votes(per_crop: &mut [Neighbors], weight: f32) {
	for window in VOTING_WINDOWS {
		let mut counts: HashMap<usize, usize> = HashMap::new();
		for list in per_crop.iter() {
			for (index, _) in list.iter().take(window) {
				*counts.entry(*index).or_default() += 1;
			}
		}

		for list in per_crop.iter_mut() {
			for (index, distance) in list.iter_mut().take(window) {
				let count = counts[&*index];
				if count > 1 {
					*distance -= weight * count as f32 / window as f32;
				}
			}
		}
	}
}
