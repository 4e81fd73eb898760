//! Batched descriptor extraction

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use ndarray::Array2;
use rayon::prelude::*;
use std::path::PathBuf;
use std::time::Instant;

use super::image::{self as img, View};
use crate::models::GeoLocalizationNet;
use crate::ui;

/// Run every image of `paths` through `net`. Returns one row per network
/// input, so views producing several crops give `view.count()` consecutive
/// rows per image.
pub fn extract(
	net: &GeoLocalizationNet,
	device: &Device,
	paths: &[PathBuf],
	view: View,
	batch_size: usize,
	label: &str,
) -> Result<Array2<f32>> {
	let batch_size = batch_size.max(1);
	let dim = net.features_dim();
	let rows = paths.len() * view.count();
	let mut descriptors = Vec::with_capacity(rows * dim);
	let start = Instant::now();

	for (batch_index, batch) in paths.chunks(batch_size).enumerate() {
		let inputs: Vec<Vec<image::RgbImage>> = batch
			.par_iter()
			.map(|path| Ok(view.apply(&img::open(path)?)))
			.collect::<Result<_>>()?;
		let inputs: Vec<image::RgbImage> = inputs.into_iter().flatten().collect();

		let (width, height) = inputs[0].dimensions();
		if let Some(odd) = inputs.iter().find(|i| i.dimensions() != (width, height)) {
			bail!(
				"Images of one batch must share a size ({}x{} vs {}x{}); use --infer-batch-size 1",
				width,
				height,
				odd.width(),
				odd.height()
			);
		}

		let pixels: Vec<f32> = inputs.par_iter().flat_map_iter(img::to_chw).collect();
		let images = Tensor::from_vec(pixels, (inputs.len(), 3, height as usize, width as usize), device)?;
		let output = net
			.forward(&images)
			.with_context(|| format!("Forward pass failed on {} batch {}", label, batch_index))?;
		descriptors.extend(output.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?);

		let done = (batch_index * batch_size + batch.len()).min(paths.len());
		if batch_index % 50 == 0 || done == paths.len() {
			ui::debug(&format!(
				"{}: {}/{} images ({:.1}s)",
				label,
				done,
				paths.len(),
				start.elapsed().as_secs_f32()
			));
		}
	}

	Array2::from_shape_vec((rows, dim), descriptors).context("Descriptor count does not match the inputs")
}

/// Mean of each group of `group` consecutive rows
pub fn average_groups(rows: &Array2<f32>, group: usize) -> Array2<f32> {
	let group = group.max(1);
	let n = rows.nrows() / group;
	let mut out = Array2::zeros((n, rows.ncols()));
	for (i, mut row) in out.rows_mut().into_iter().enumerate() {
		let block = rows.slice(ndarray::s![i * group..(i + 1) * group, ..]);
		if let Some(mean) = block.mean_axis(ndarray::Axis(0)) {
			row.assign(&mean);
		}
	}
	out
}

/// Divide every row by its L2 norm
pub fn normalize_rows(rows: &mut Array2<f32>) {
	for mut row in rows.rows_mut() {
		let norm = row.dot(&row).sqrt();
		if norm > 0.0 {
			row /= norm;
		}
	}
}
