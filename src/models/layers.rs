//! Inference-only building blocks on candle tensors

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor, D};
use std::collections::HashMap;

use super::state_dict::{Init, ParamSpec, StateDict};
use crate::config::{BN_EPS, L2_EPS};

enum Mode<'a> {
	Record(Vec<ParamSpec>),
	Load {
		tensors: HashMap<&'a str, &'a Tensor>,
		device: Device,
	},
}

/// Hands out parameters while a model is assembled.
///
/// In record mode it only collects names, shapes and initializers (the
/// returned tensors are scalar placeholders); in load mode it serves the
/// tensors of a state dict on the target device.
pub struct VarStore<'a> {
	mode: Mode<'a>,
}

impl<'a> VarStore<'a> {
	pub fn recorder() -> Self {
		Self {
			mode: Mode::Record(Vec::new()),
		}
	}

	pub fn from_state_dict(dict: &'a StateDict, device: &Device) -> Self {
		Self {
			mode: Mode::Load {
				tensors: dict.iter().collect(),
				device: device.clone(),
			},
		}
	}

	pub fn get(&mut self, name: &str, shape: &[usize], init: Init) -> Result<Tensor> {
		match &mut self.mode {
			Mode::Record(specs) => {
				specs.push(ParamSpec {
					name: name.to_string(),
					shape: shape.to_vec(),
					init,
				});
				Ok(Tensor::zeros((), DType::F32, &Device::Cpu)?)
			}
			Mode::Load { tensors, device } => {
				let Some(tensor) = tensors.get(name) else {
					bail!("Missing parameter '{}'", name);
				};
				if tensor.dims() != shape {
					bail!("Parameter '{}' has shape {:?}, expected {:?}", name, tensor.dims(), shape);
				}
				Ok(tensor.to_dtype(DType::F32)?.to_device(device)?)
			}
		}
	}

	/// Parameters requested so far, in declaration order (record mode only)
	pub fn into_specs(self) -> Vec<ParamSpec> {
		match self.mode {
			Mode::Record(specs) => specs,
			Mode::Load { .. } => Vec::new(),
		}
	}
}

pub struct Conv2d {
	weight: Tensor,
	bias: Option<Tensor>,
	out_channels: usize,
	stride: usize,
	padding: usize,
}

impl Conv2d {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		vs: &mut VarStore,
		prefix: &str,
		in_channels: usize,
		out_channels: usize,
		kernel: usize,
		stride: usize,
		padding: usize,
		bias: bool,
	) -> Result<Self> {
		let bound = 1.0 / ((in_channels * kernel * kernel) as f32).sqrt();
		let weight = vs.get(
			&format!("{}.weight", prefix),
			&[out_channels, in_channels, kernel, kernel],
			Init::Uniform(bound),
		)?;
		let bias = if bias {
			Some(vs.get(&format!("{}.bias", prefix), &[out_channels], Init::Uniform(bound))?)
		} else {
			None
		};
		Ok(Self {
			weight,
			bias,
			out_channels,
			stride,
			padding,
		})
	}

	pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
		let ys = xs.conv2d(&self.weight, self.padding, self.stride, 1, 1)?;
		match &self.bias {
			Some(bias) => Ok(ys.broadcast_add(&bias.reshape((1, self.out_channels, 1, 1))?)?),
			None => Ok(ys),
		}
	}
}

/// Batch normalization with frozen running statistics
pub struct BatchNorm {
	weight: Tensor,
	bias: Tensor,
	running_mean: Tensor,
	running_var: Tensor,
	channels: usize,
}

impl BatchNorm {
	pub fn new(vs: &mut VarStore, prefix: &str, channels: usize) -> Result<Self> {
		Ok(Self {
			weight: vs.get(&format!("{}.weight", prefix), &[channels], Init::Const(1.0))?,
			bias: vs.get(&format!("{}.bias", prefix), &[channels], Init::Const(0.0))?,
			running_mean: vs.get(&format!("{}.running_mean", prefix), &[channels], Init::Const(0.0))?,
			running_var: vs.get(&format!("{}.running_var", prefix), &[channels], Init::Const(1.0))?,
			channels,
		})
	}

	pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
		let scale = self.weight.div(&self.running_var.affine(1.0, BN_EPS)?.sqrt()?)?;
		let shift = self.bias.sub(&self.running_mean.mul(&scale)?)?;
		let shape = (1, self.channels, 1, 1);
		Ok(xs
			.broadcast_mul(&scale.reshape(shape)?)?
			.broadcast_add(&shift.reshape(shape)?)?)
	}
}

pub struct Linear {
	weight: Tensor,
	bias: Tensor,
}

impl Linear {
	pub fn new(vs: &mut VarStore, prefix: &str, in_features: usize, out_features: usize) -> Result<Self> {
		let bound = 1.0 / (in_features as f32).sqrt();
		Ok(Self {
			weight: vs.get(&format!("{}.weight", prefix), &[out_features, in_features], Init::Uniform(bound))?,
			bias: vs.get(&format!("{}.bias", prefix), &[out_features], Init::Uniform(bound))?,
		})
	}

	/// `xs` is `[batch, in_features]`
	pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
		Ok(xs.matmul(&self.weight.t()?)?.broadcast_add(&self.bias)?)
	}
}

/// Divide by the L2 norm along `dim`, clamped away from zero
pub fn l2_normalize<T: candle_core::shape::Dim>(xs: &Tensor, dim: T) -> Result<Tensor> {
	let norm = xs.sqr()?.sum_keepdim(dim)?.sqrt()?.maximum(L2_EPS)?;
	Ok(xs.broadcast_div(&norm)?)
}

/// Numerically stable softmax along `dim`
pub fn softmax(xs: &Tensor, dim: usize) -> Result<Tensor> {
	let max = xs.max_keepdim(dim)?;
	let exp = xs.broadcast_sub(&max)?.exp()?;
	Ok(exp.broadcast_div(&exp.sum_keepdim(dim)?)?)
}

/// Flatten `[N, C, H, W]` into `[N, C, H*W]`
pub fn flatten_spatial(xs: &Tensor) -> Result<Tensor> {
	Ok(xs.flatten_from(D::Minus2)?)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn close(a: &[f32], b: &[f32]) -> bool {
		a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-5)
	}

	#[test]
	fn recorder_collects_declaration_order() {
		let mut vs = VarStore::recorder();
		Conv2d::new(&mut vs, "backbone.0", 3, 8, 3, 1, 1, true).unwrap();
		BatchNorm::new(&mut vs, "backbone.1", 8).unwrap();
		let names: Vec<String> = vs.into_specs().into_iter().map(|s| s.name).collect();
		assert_eq!(
			names,
			vec![
				"backbone.0.weight",
				"backbone.0.bias",
				"backbone.1.weight",
				"backbone.1.bias",
				"backbone.1.running_mean",
				"backbone.1.running_var",
			]
		);
	}

	#[test]
	fn batch_norm_uses_running_statistics() {
		let dict = StateDict::from_entries(vec![
			("bn.weight".into(), Tensor::new(&[2.0f32], &Device::Cpu).unwrap()),
			("bn.bias".into(), Tensor::new(&[1.0f32], &Device::Cpu).unwrap()),
			("bn.running_mean".into(), Tensor::new(&[3.0f32], &Device::Cpu).unwrap()),
			("bn.running_var".into(), Tensor::new(&[4.0f32], &Device::Cpu).unwrap()),
		]);
		let mut vs = VarStore::from_state_dict(&dict, &Device::Cpu);
		let bn = BatchNorm::new(&mut vs, "bn", 1).unwrap();
		let xs = Tensor::new(&[5.0f32, 7.0], &Device::Cpu).unwrap().reshape((1, 1, 1, 2)).unwrap();
		let ys = bn.forward(&xs).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
		// (x - 3) / 2 * 2 + 1
		assert!(close(&ys, &[3.0, 5.0]), "{:?}", ys);
	}

	#[test]
	fn l2_normalize_rows() {
		let xs = Tensor::new(&[[3.0f32, 4.0], [0.0, 0.0]], &Device::Cpu).unwrap();
		let ys = l2_normalize(&xs, 1).unwrap().to_vec2::<f32>().unwrap();
		assert!(close(&ys[0], &[0.6, 0.8]));
		assert!(close(&ys[1], &[0.0, 0.0]));
	}

	#[test]
	fn softmax_sums_to_one() {
		let xs = Tensor::new(&[[1.0f32, 2.0, 3.0]], &Device::Cpu).unwrap();
		let ys = softmax(&xs, 1).unwrap().to_vec2::<f32>().unwrap();
		let sum: f32 = ys[0].iter().sum();
		assert!((sum - 1.0).abs() < 1e-6);
		assert!(ys[0][2] > ys[0][1] && ys[0][1] > ys[0][0]);
	}

	#[test]
	fn linear_applies_weight_and_bias() {
		let dict = StateDict::from_entries(vec![
			("fc.weight".into(), Tensor::new(&[[1.0f32, 2.0]], &Device::Cpu).unwrap()),
			("fc.bias".into(), Tensor::new(&[0.5f32], &Device::Cpu).unwrap()),
		]);
		let mut vs = VarStore::from_state_dict(&dict, &Device::Cpu);
		let fc = Linear::new(&mut vs, "fc", 2, 1).unwrap();
		let xs = Tensor::new(&[[1.0f32, 1.0]], &Device::Cpu).unwrap();
		let ys = fc.forward(&xs).unwrap().to_vec2::<f32>().unwrap();
		assert!(close(&ys[0], &[3.5]));
	}
}
