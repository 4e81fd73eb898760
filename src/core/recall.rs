//! Recall@N over ranked predictions

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Percentage of queries with a positive among their first N predictions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recalls {
	pub values: Vec<usize>,
	pub percentages: Vec<f32>,
}

impl Recalls {
	/// `predictions[q]` holds database indices, best first; `positives[q]` the
	/// indices counted as correct for query `q`.
	pub fn compute(predictions: &[Vec<usize>], positives: &[Vec<usize>], recall_values: &[usize]) -> Self {
		let mut values = recall_values.to_vec();
		values.sort_unstable();
		values.dedup();

		let mut hits = vec![0usize; values.len()];
		for (prediction, positive) in predictions.iter().zip(positives) {
			let positive: HashSet<usize> = positive.iter().copied().collect();
			let first_hit = values
				.iter()
				.position(|&n| prediction.iter().take(n).any(|p| positive.contains(p)));
			if let Some(i) = first_hit {
				for hit in &mut hits[i..] {
					*hit += 1;
				}
			}
		}

		let queries = predictions.len().max(1) as f32;
		Self {
			percentages: hits.iter().map(|&h| h as f32 / queries * 100.0).collect(),
			values,
		}
	}

	/// Recall at the smallest N
	pub fn headline(&self) -> f32 {
		self.percentages.first().copied().unwrap_or(0.0)
	}

	pub fn pairs(&self) -> Vec<(usize, f32)> {
		self.values.iter().copied().zip(self.percentages.iter().copied()).collect()
	}
}

impl fmt::Display for Recalls {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let parts: Vec<String> = self
			.pairs()
			.iter()
			.map(|(n, r)| format!("R@{}: {:.1}", n, r))
			.collect();
		f.write_str(&parts.join(", "))
	}
}
