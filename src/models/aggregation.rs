//! Aggregation heads turning a `[N, C, H, W]` feature map into `[N, dim]`
//! descriptors: global pooling (GeM, SPoC, MAC, R-MAC) and NetVLAD, optionally
//! with a contextual reweighting network (CRN).

use anyhow::{bail, Context, Result};
use candle_core::{Tensor, D};

use super::layers::{flatten_spatial, l2_normalize, softmax, Conv2d, Linear, VarStore};
use super::state_dict::Init;
use crate::cli::{Aggregation, L2Policy};
use crate::config::{GEM_EPS, GEM_P, RMAC_LEVELS};

const RMAC_OVERLAP: f64 = 0.4;
const RMAC_EPS: f64 = 1e-6;

enum Pool {
	Gem { p: Tensor },
	Spoc,
	Mac,
	Rmac { levels: usize },
}

/// Global pooling wrapped by its L2 policy and an optional projection
pub struct Pooling {
	pool: Pool,
	l2: L2Policy,
	fc: Option<Linear>,
}

impl Pooling {
	pub fn new(
		vs: &mut VarStore,
		aggregation: Aggregation,
		l2: L2Policy,
		channels: usize,
		fc_output_dim: Option<usize>,
	) -> Result<Self> {
		// Sequential([L2Norm, pool, Flatten]) or Sequential([pool, ...]),
		// itself nested at index 0 when a projection follows
		let inner = if fc_output_dim.is_some() { "aggregation.0" } else { "aggregation" };
		let pool_index = if l2 == L2Policy::BeforePool { 1 } else { 0 };

		let pool = match aggregation {
			Aggregation::Gem => Pool::Gem {
				p: vs.get(&format!("{}.{}.p", inner, pool_index), &[1], Init::Const(GEM_P))?,
			},
			Aggregation::Spoc => Pool::Spoc,
			Aggregation::Mac => Pool::Mac,
			Aggregation::Rmac => Pool::Rmac { levels: RMAC_LEVELS },
			Aggregation::Netvlad | Aggregation::Crn => bail!("{:?} is not a pooling aggregation", aggregation),
		};

		let fc = match fc_output_dim {
			Some(dim) => Some(Linear::new(vs, "aggregation.1", channels, dim)?),
			None => None,
		};

		Ok(Self { pool, l2, fc })
	}

	pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
		let xs = match self.l2 {
			L2Policy::BeforePool => l2_normalize(xs, 1)?,
			_ => xs.clone(),
		};

		let mut pooled = match &self.pool {
			Pool::Gem { p } => gem(&xs, p)?,
			Pool::Spoc => flatten_spatial(&xs)?.mean(D::Minus1)?,
			Pool::Mac => mac(&xs)?,
			Pool::Rmac { levels } => rmac(&xs, *levels)?,
		};

		if self.l2 == L2Policy::AfterPool {
			pooled = l2_normalize(&pooled, 1)?;
		}

		match &self.fc {
			Some(fc) => l2_normalize(&fc.forward(&pooled)?, 1),
			None => Ok(pooled),
		}
	}
}

fn gem(xs: &Tensor, p: &Tensor) -> Result<Tensor> {
	let p = p
		.flatten_all()?
		.to_vec1::<f32>()?
		.first()
		.copied()
		.context("GeM exponent is empty")? as f64;
	Ok(flatten_spatial(&xs.maximum(GEM_EPS)?.powf(p)?)?
		.mean(D::Minus1)?
		.powf(1.0 / p)?)
}

fn mac(xs: &Tensor) -> Result<Tensor> {
	Ok(flatten_spatial(xs)?.max(D::Minus1)?)
}

fn normalized_mac(xs: &Tensor) -> Result<Tensor> {
	let v = mac(xs)?;
	let norm = v.sqr()?.sum_keepdim(1)?.sqrt()?.affine(1.0, RMAC_EPS)?;
	Ok(v.broadcast_div(&norm)?)
}

/// Global MAC plus the MAC of every R-MAC region, each L2-normalized, summed.
fn rmac(xs: &Tensor, levels: usize) -> Result<Tensor> {
	let (_, _, h, w) = xs.dims4()?;
	let mut v = normalized_mac(xs)?;
	for (top, left, size) in rmac_regions(h, w, levels) {
		let region = xs.narrow(2, top, size)?.narrow(3, left, size)?;
		v = (v + normalized_mac(&region)?)?;
	}
	Ok(v)
}

/// Square R-MAC regions `(top, left, side)` of an `h × w` map over `levels`
/// scales, overlapping by about 40% between neighbours.
pub fn rmac_regions(h: usize, w: usize, levels: usize) -> Vec<(usize, usize, usize)> {
	let side = h.min(w) as f64;
	let long = h.max(w) as f64;

	// Extra regions along the longer dimension
	let mut best = (f64::INFINITY, 0usize);
	for (idx, steps) in (2..=7).enumerate() {
		let b = (long - side) / (steps as f64 - 1.0);
		let gap = ((side * side - side * b) / (side * side) - RMAC_OVERLAP).abs();
		if gap < best.0 {
			best = (gap, idx);
		}
	}
	let (extra_w, extra_h) = match h.cmp(&w) {
		std::cmp::Ordering::Less => (best.1 + 1, 0),
		std::cmp::Ordering::Greater => (0, best.1 + 1),
		std::cmp::Ordering::Equal => (0, 0),
	};

	let mut regions = Vec::new();
	for level in 1..=levels {
		let size = (2.0 * side / (level as f64 + 1.0)).floor();
		if size < 1.0 {
			continue;
		}
		let half = (size / 2.0 - 1.0).floor();
		let starts = |extent: usize, count: usize| -> Vec<usize> {
			let step = if count == 1 {
				0.0
			} else {
				(extent as f64 - size) / (count as f64 - 1.0)
			};
			(0..count)
				.map(|i| ((half + i as f64 * step).floor() - half).max(0.0) as usize)
				.collect()
		};
		let lefts = starts(w, level + extra_w);
		let tops = starts(h, level + extra_h);
		for &top in &tops {
			for &left in &lefts {
				regions.push((top, left, size as usize));
			}
		}
	}
	regions
}

/// Contextual reweighting network producing a `[N, 1, H, W]` mask
struct Crn {
	filter_3: Conv2d,
	filter_5: Conv2d,
	filter_7: Conv2d,
	acc_w: Conv2d,
}

impl Crn {
	fn new(vs: &mut VarStore, dim: usize) -> Result<Self> {
		Ok(Self {
			filter_3: Conv2d::new(vs, "aggregation.crn.filter_3_3", dim, 32, 3, 1, 1, true)?,
			filter_5: Conv2d::new(vs, "aggregation.crn.filter_5_5", dim, 32, 5, 1, 2, true)?,
			filter_7: Conv2d::new(vs, "aggregation.crn.filter_7_7", dim, 20, 7, 1, 3, true)?,
			acc_w: Conv2d::new(vs, "aggregation.crn.acc_w", 84, 1, 1, 1, 0, true)?,
		})
	}

	fn forward(&self, xs: &Tensor) -> Result<Tensor> {
		let (_, _, h, w) = xs.dims4()?;
		let pooled = downsample(xs)?;
		let g = Tensor::cat(
			&[
				self.filter_3.forward(&pooled)?,
				self.filter_5.forward(&pooled)?,
				self.filter_7.forward(&pooled)?,
			],
			1,
		)?
		.relu()?;
		let mask = self.acc_w.forward(&g)?.relu()?;
		Ok(mask.upsample_nearest2d(h, w)?)
	}
}

/// 3×3 average pooling with stride 2 and ceil rounding: windows running past
/// the border average only the cells they cover.
fn downsample(xs: &Tensor) -> Result<Tensor> {
	let (n, _, h, w) = xs.dims4()?;
	if h < 2 || w < 2 {
		return Ok(xs.clone());
	}
	let pad_h = usize::from(h % 2 == 0);
	let pad_w = usize::from(w % 2 == 0);
	if pad_h == 0 && pad_w == 0 {
		return Ok(xs.avg_pool2d_with_stride(3, 2)?);
	}
	let padded = xs.pad_with_zeros(2, 0, pad_h)?.pad_with_zeros(3, 0, pad_w)?;
	let coverage = Tensor::ones((n, 1, h, w), xs.dtype(), xs.device())?
		.pad_with_zeros(2, 0, pad_h)?
		.pad_with_zeros(3, 0, pad_w)?
		.avg_pool2d_with_stride(3, 2)?;
	Ok(padded.avg_pool2d_with_stride(3, 2)?.broadcast_div(&coverage)?)
}

/// NetVLAD residual aggregation, with CRN reweighting for `crn`
pub struct NetVlad {
	centroids: Tensor,
	conv: Conv2d,
	crn: Option<Crn>,
	clusters: usize,
	dim: usize,
}

impl NetVlad {
	pub fn new(vs: &mut VarStore, dim: usize, clusters: usize, with_crn: bool) -> Result<Self> {
		let centroids = vs.get("aggregation.centroids", &[clusters, dim], Init::UnitUniform)?;
		let conv = Conv2d::new(vs, "aggregation.conv", dim, clusters, 1, 1, 0, false)?;
		let crn = if with_crn { Some(Crn::new(vs, dim)?) } else { None };
		Ok(Self {
			centroids,
			conv,
			crn,
			clusters,
			dim,
		})
	}

	pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
		let (n, _, h, w) = xs.dims4()?;
		let xs = l2_normalize(xs, 1)?;
		let x_flat = flatten_spatial(&xs)?;

		let mut assign = softmax(&self.conv.forward(&xs)?.reshape((n, self.clusters, h * w))?, 1)?;
		if let Some(crn) = &self.crn {
			let mask = crn.forward(&xs)?.reshape((n, 1, h * w))?;
			assign = assign.broadcast_mul(&mask)?;
		}

		// sum_p a[k,p] (x[p] - c[k]) = A·Xᵀ - (sum_p a[k,p]) c[k]
		let weighted = assign.matmul(&x_flat.transpose(1, 2)?.contiguous()?)?;
		let mass = assign.sum_keepdim(2)?;
		let vlad = weighted.sub(&mass.broadcast_mul(&self.centroids.unsqueeze(0)?)?)?;

		let vlad = l2_normalize(&vlad, 2)?.reshape((n, self.clusters * self.dim))?;
		l2_normalize(&vlad, 1)
	}
}

/// Either aggregation family
pub enum Head {
	Pooling(Pooling),
	Vlad(NetVlad),
}

impl Head {
	pub fn new(
		vs: &mut VarStore,
		aggregation: Aggregation,
		l2: L2Policy,
		channels: usize,
		clusters: usize,
		fc_output_dim: Option<usize>,
	) -> Result<Self> {
		Ok(match aggregation {
			Aggregation::Netvlad => Head::Vlad(NetVlad::new(vs, channels, clusters, false)?),
			Aggregation::Crn => Head::Vlad(NetVlad::new(vs, channels, clusters, true)?),
			_ => Head::Pooling(Pooling::new(vs, aggregation, l2, channels, fc_output_dim)?),
		})
	}

	pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
		match self {
			Head::Pooling(pooling) => pooling.forward(xs),
			Head::Vlad(vlad) => vlad.forward(xs),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::models::state_dict::StateDict;
	use candle_core::Device;

	fn build(aggregation: Aggregation, l2: L2Policy, channels: usize, clusters: usize, fc: Option<usize>) -> (Vec<String>, Head) {
		let mut recorder = VarStore::recorder();
		Head::new(&mut recorder, aggregation, l2, channels, clusters, fc).unwrap();
		let specs = recorder.into_specs();
		let dict = StateDict::initialized(&specs, 7).unwrap();
		let mut vs = VarStore::from_state_dict(&dict, &Device::Cpu);
		let head = Head::new(&mut vs, aggregation, l2, channels, clusters, fc).unwrap();
		(specs.into_iter().map(|s| s.name).collect(), head)
	}

	fn feature_map(n: usize, c: usize, h: usize, w: usize) -> Tensor {
		let values: Vec<f32> = (0..n * c * h * w).map(|i| ((i * 37) % 11) as f32 / 10.0).collect();
		Tensor::from_vec(values, (n, c, h, w), &Device::Cpu).unwrap()
	}

	fn row_norms(xs: &Tensor) -> Vec<f32> {
		xs.to_vec2::<f32>()
			.unwrap()
			.iter()
			.map(|r| r.iter().map(|v| v * v).sum::<f32>().sqrt())
			.collect()
	}

	#[test]
	fn rmac_regions_of_square_map() {
		let regions = rmac_regions(10, 10, 3);
		assert_eq!(regions.len(), 1 + 4 + 9);
		assert_eq!(regions[0], (0, 0, 10));
		assert!(regions.iter().all(|&(t, l, s)| t + s <= 10 && l + s <= 10));
	}

	#[test]
	fn rmac_regions_add_columns_on_wide_maps() {
		let regions = rmac_regions(30, 40, 3);
		assert!(regions.iter().all(|&(t, l, s)| t + s <= 30 && l + s <= 40));
		// level one already has two regions side by side
		assert_eq!(regions.iter().filter(|r| r.2 == 30).count(), 2);
	}

	#[test]
	fn gem_parameter_names_follow_l2_policy() {
		let (names, _) = build(Aggregation::Gem, L2Policy::BeforePool, 8, 0, None);
		assert_eq!(names, vec!["aggregation.1.p"]);
		let (names, _) = build(Aggregation::Gem, L2Policy::AfterPool, 8, 0, Some(4));
		assert_eq!(names, vec!["aggregation.0.0.p", "aggregation.1.weight", "aggregation.1.bias"]);
	}

	#[test]
	fn gem_with_constant_map_returns_the_constant() {
		let (_, head) = build(Aggregation::Gem, L2Policy::None, 3, 0, None);
		let xs = (Tensor::ones((1, 3, 4, 5), candle_core::DType::F32, &Device::Cpu).unwrap() * 2.0).unwrap();
		let out = head.forward(&xs).unwrap().to_vec2::<f32>().unwrap();
		assert!(out[0].iter().all(|v| (v - 2.0).abs() < 1e-4), "{:?}", out);
	}

	#[test]
	fn pooled_descriptors_are_normalized_after_pool() {
		for aggregation in [Aggregation::Spoc, Aggregation::Mac, Aggregation::Rmac] {
			let (_, head) = build(aggregation, L2Policy::AfterPool, 6, 0, None);
			let out = head.forward(&feature_map(2, 6, 7, 9)).unwrap();
			assert_eq!(out.dims(), &[2, 6]);
			assert!(row_norms(&out).iter().all(|n| (n - 1.0).abs() < 1e-4));
		}
	}

	#[test]
	fn netvlad_dim_is_channels_times_clusters() {
		let (names, head) = build(Aggregation::Netvlad, L2Policy::BeforePool, 8, 4, None);
		assert_eq!(names, vec!["aggregation.centroids", "aggregation.conv.weight"]);
		let out = head.forward(&feature_map(2, 8, 5, 6)).unwrap();
		assert_eq!(out.dims(), &[2, 32]);
		assert!(row_norms(&out).iter().all(|n| (n - 1.0).abs() < 1e-4));
	}

	#[test]
	fn crn_registers_filters_after_netvlad() {
		let (names, head) = build(Aggregation::Crn, L2Policy::BeforePool, 8, 4, None);
		assert_eq!(&names[..2], &["aggregation.centroids", "aggregation.conv.weight"]);
		assert_eq!(names.last().unwrap(), "aggregation.crn.acc_w.bias");
		assert_eq!(names.len(), 2 + 8);
		for (h, w) in [(6, 8), (5, 7), (1, 3)] {
			let out = head.forward(&feature_map(1, 8, h, w)).unwrap();
			assert_eq!(out.dims(), &[1, 32]);
		}
	}

	#[test]
	fn ceil_downsample_averages_covered_cells() {
		let xs = Tensor::from_vec((0..16).map(|v| v as f32).collect::<Vec<_>>(), (1, 1, 4, 4), &Device::Cpu).unwrap();
		let out = downsample(&xs).unwrap();
		assert_eq!(out.dims(), &[1, 1, 2, 2]);
		let out = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
		// top-left full window, bottom-right covers rows 2..4, cols 2..4
		assert!((out[0] - 5.0).abs() < 1e-5, "{:?}", out);
		assert!((out[3] - 12.5).abs() < 1e-5, "{:?}", out);
	}
}
