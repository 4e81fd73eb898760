//! Principal component analysis of descriptors
//!
//! The leading axes are found with a randomized range finder: a seeded
//! sketch of the centered data is refined by a few power iterations, each
//! re-orthonormalized with CholeskyQR, and the small projected problem is
//! solved exactly with a symmetric eigendecomposition. Neither the
//! covariance nor the Gram matrix is ever formed.

use anyhow::{bail, Context, Result};
use nalgebra::{Cholesky, DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::{PCA_OVERSAMPLING, PCA_POWER_ITERATIONS};
use crate::ui;

/// Safety factor of the shifted CholeskyQR pass
const SHIFT_FACTOR: f64 = 11.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pca {
	pub dim: usize,
	pub n_components: usize,
	pub whiten: bool,
	pub mean: Vec<f32>,
	/// Row-major `[n_components, dim]`
	pub components: Vec<f32>,
	pub explained_variance: Vec<f32>,
}

impl Pca {
	/// Fit `n_components` principal axes to the rows of `data`
	pub fn fit(data: ArrayView2<f32>, n_components: usize, whiten: bool, seed: u64) -> Result<Self> {
		let (n, dim) = data.dim();
		if n < 2 {
			bail!("PCA needs at least 2 samples, got {}", n);
		}
		if n_components == 0 || n_components > n.min(dim) {
			bail!(
				"--pca-dim {} must be between 1 and min(samples, dimension) = {}",
				n_components,
				n.min(dim)
			);
		}

		let mean = data.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(dim));
		let centered = &data - &mean;
		let denom = (n - 1) as f64;

		let (values, components) = top_singular(&centered, n_components, seed)?;

		Ok(Self {
			dim,
			n_components,
			whiten,
			mean: mean.to_vec(),
			components: components.as_standard_layout().iter().copied().collect(),
			explained_variance: values.iter().map(|v| (v / denom) as f32).collect(),
		})
	}

	/// `(x - mean) · Cᵀ`, scaled to unit variance when whitening
	pub fn transform(&self, data: ArrayView2<f32>) -> Result<Array2<f32>> {
		if data.ncols() != self.dim {
			bail!("PCA expects {}-dimensional descriptors, got {}", self.dim, data.ncols());
		}
		if self.components.len() != self.n_components * self.dim || self.mean.len() != self.dim {
			bail!("PCA state is inconsistent with its dimensions");
		}
		let components = ArrayView2::from_shape((self.n_components, self.dim), &self.components)?;
		let mean = ArrayView2::from_shape((1, self.dim), &self.mean)?;
		let mut projected = (&data - &mean).dot(&components.t());
		if self.whiten {
			for (mut column, &variance) in projected.axis_iter_mut(Axis(1)).zip(&self.explained_variance) {
				column /= variance.sqrt().max(f32::EPSILON);
			}
		}
		Ok(projected)
	}
}

/// Squared singular values (descending) and right singular vectors, as
/// rows, of the `k` leading directions of `x`.
fn top_singular(x: &Array2<f32>, k: usize, seed: u64) -> Result<(Vec<f64>, Array2<f32>)> {
	let (n, dim) = x.dim();
	let width = (k + PCA_OVERSAMPLING).min(n.min(dim));
	ui::debug(&format!(
		"Randomized PCA on {}x{} with a sketch of width {}",
		n, dim, width
	));

	let mut rng = StdRng::seed_from_u64(seed);
	let sketch = Array2::from_shape_fn((dim, width), |_| rng.random_range(-1.0f32..1.0));
	let mut range = orthonormalize(&x.dot(&sketch))?;
	for _ in 0..PCA_POWER_ITERATIONS {
		let co_range = orthonormalize(&x.t().dot(&range))?;
		range = orthonormalize(&x.dot(&co_range))?;
	}

	// Rayleigh-Ritz: with B = Qᵀx, the eigenvectors u of BBᵀ give Bᵀu = σv
	let projected = x.t().dot(&range).mapv(f64::from);
	let small = projected.t().dot(&projected);
	let eigen = SymmetricEigen::new(DMatrix::from_fn(width, width, |i, j| small[[i, j]]));

	let mut order: Vec<usize> = (0..width).collect();
	order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));
	order.truncate(k);

	let rotation = Array2::from_shape_fn((width, k), |(i, j)| eigen.eigenvectors[(i, order[j])]);
	let mut components = projected.dot(&rotation);
	for mut column in components.axis_iter_mut(Axis(1)) {
		let norm = column.dot(&column).sqrt();
		if norm > f64::EPSILON {
			column /= norm;
		} else {
			column.fill(0.0);
		}
	}

	let values = order.iter().map(|&i| eigen.eigenvalues[i].max(0.0)).collect();
	Ok((values, components.reversed_axes().mapv(|v| v as f32)))
}

/// Orthonormal basis of the columns of `y`: one shifted CholeskyQR pass
/// followed by two plain ones. Directions `y` lacks come out as near-zero
/// columns.
fn orthonormalize(y: &Array2<f32>) -> Result<Array2<f32>> {
	let mut q = y.mapv(f64::from);
	q = cholesky_pass(&q, true).context("CholeskyQR failed on the shifted Gram matrix")?;
	for _ in 0..2 {
		q = match cholesky_pass(&q, false) {
			Some(next) => next,
			None => cholesky_pass(&q, true).context("CholeskyQR failed on the shifted Gram matrix")?,
		};
	}
	Ok(q.mapv(|v| v as f32))
}

/// `Q L⁻ᵀ` where `L Lᵀ = QᵀQ (+ shift I)`
fn cholesky_pass(q: &Array2<f64>, shifted: bool) -> Option<Array2<f64>> {
	let (rows, cols) = q.dim();
	let gram = q.t().dot(q);
	let shift = if shifted {
		let scale = gram.diag().sum().max(f64::MIN_POSITIVE);
		SHIFT_FACTOR * ((rows * cols + cols * (cols + 1)) as f64) * f64::EPSILON * scale
	} else {
		0.0
	};

	let matrix = DMatrix::from_fn(cols, cols, |i, j| gram[[i, j]] + if i == j { shift } else { 0.0 });
	let lower = Cholesky::new(matrix)?.unpack();
	let inverse = lower.solve_lower_triangular(&DMatrix::identity(cols, cols))?;
	let inverse_t = Array2::from_shape_fn((cols, cols), |(i, j)| inverse[(j, i)]);
	Some(q.dot(&inverse_t))
}
