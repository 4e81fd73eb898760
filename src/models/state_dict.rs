//! Ordered named tensors, checkpoint reading and weight renaming

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::Path;

use super::checkpoint;
use crate::ui;

/// How a parameter is filled when no checkpoint provides it
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
	Const(f32),
	/// Uniform in `[-bound, bound)`
	Uniform(f32),
	/// Uniform in `[0, 1)`
	UnitUniform,
}

/// Name, shape and initializer of one model parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
	pub name: String,
	pub shape: Vec<usize>,
	pub init: Init,
}

impl ParamSpec {
	pub fn numel(&self) -> usize {
		self.shape.iter().product()
	}
}

/// Named tensors in the order they were stored or declared.
#[derive(Debug, Clone, Default)]
pub struct StateDict {
	entries: Vec<(String, Tensor)>,
}

impl StateDict {
	pub fn from_entries(entries: Vec<(String, Tensor)>) -> Self {
		Self { entries }
	}

	/// Read a checkpoint from disk, keeping only the `key` sub-dictionary of
	/// `torch.save` files, in stored order. Safetensors files are flat,
	/// ignore `key` and come back sorted by name.
	pub fn load(path: &Path, key: Option<&str>) -> Result<Self> {
		let is_safetensors = path
			.extension()
			.and_then(|e| e.to_str())
			.is_some_and(|e| e.eq_ignore_ascii_case("safetensors"));

		let entries = if is_safetensors {
			let mut tensors: Vec<(String, Tensor)> = candle_core::safetensors::load(path, &Device::Cpu)
				.with_context(|| format!("Failed to read safetensors {}", path.display()))?
				.into_iter()
				.collect();
			tensors.sort_by(|a, b| a.0.cmp(&b.0));
			tensors
		} else {
			checkpoint::read(path, key).with_context(|| match key {
				Some(key) => format!("Failed to read '{}' from checkpoint {}", key, path.display()),
				None => format!("Failed to read checkpoint {}", path.display()),
			})?
		};

		if entries.is_empty() {
			bail!("Checkpoint {} holds no tensors", path.display());
		}
		ui::debug(&format!("Read {} tensors from {}", entries.len(), path.display()));

		let entries = entries
			.into_iter()
			.map(|(name, tensor)| {
				let tensor = if tensor.dtype().is_float() {
					tensor.to_dtype(DType::F32)?
				} else {
					tensor
				};
				Ok((name, tensor))
			})
			.collect::<Result<Vec<_>>>()?;

		Ok(Self { entries })
	}

	/// Fill every parameter from its initializer with a seeded generator
	pub fn initialized(specs: &[ParamSpec], seed: u64) -> Result<Self> {
		let mut rng = StdRng::seed_from_u64(seed);
		let entries = specs
			.iter()
			.map(|spec| {
				let n = spec.numel();
				let values: Vec<f32> = match spec.init {
					Init::Const(v) => vec![v; n],
					Init::Uniform(bound) => (0..n).map(|_| rng.random_range(-bound..bound)).collect(),
					Init::UnitUniform => (0..n).map(|_| rng.random::<f32>()).collect(),
				};
				let tensor = Tensor::from_vec(values, spec.shape.as_slice(), &Device::Cpu)?;
				Ok((spec.name.clone(), tensor))
			})
			.collect::<Result<Vec<_>>>()?;
		Ok(Self { entries })
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.entries.iter().map(|(name, _)| name.as_str())
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
		self.entries.iter().map(|(name, t)| (name.as_str(), t))
	}

	pub fn get(&self, name: &str) -> Option<&Tensor> {
		self.entries.iter().find(|(n, _)| n == name).map(|(_, t)| t)
	}

	/// Drop integer bookkeeping buffers such as `num_batches_tracked`
	pub fn floating(self) -> Self {
		Self {
			entries: self
				.entries
				.into_iter()
				.filter(|(_, t)| t.dtype().is_float())
				.collect(),
		}
	}

	/// Remove `prefix` from names that carry it (data-parallel checkpoints
	/// store every weight under `module.`).
	pub fn strip_prefix(self, prefix: &str) -> Self {
		Self {
			entries: self
				.entries
				.into_iter()
				.map(|(name, t)| match name.strip_prefix(prefix) {
					Some(stripped) => (stripped.to_string(), t),
					None => (name, t),
				})
				.collect(),
		}
	}

	/// Rename entries with `f`, dropping those it maps to `None`
	pub fn rename_with<F>(self, f: F) -> Self
	where
		F: Fn(&str) -> Option<String>,
	{
		Self {
			entries: self
				.entries
				.into_iter()
				.filter_map(|(name, t)| f(&name).map(|renamed| (renamed, t)))
				.collect(),
		}
	}

	/// Assign the checkpoint's weights, in stored order, to the model's
	/// parameter names, in declaration order. Both lists must have the same
	/// length and every pair the same shape.
	pub fn rename_positionally(self, specs: &[ParamSpec]) -> Result<Self> {
		let weights = self.floating();
		if weights.len() != specs.len() {
			bail!(
				"Checkpoint has {} weight tensors but the model expects {}; check --backbone, --aggregation, --l2 and --fc-output-dim",
				weights.len(),
				specs.len()
			);
		}

		let mut entries = Vec::with_capacity(specs.len());
		for ((source, tensor), spec) in weights.entries.into_iter().zip(specs) {
			if tensor.dims() != spec.shape.as_slice() {
				bail!(
					"Checkpoint tensor '{}' {:?} does not fit model parameter '{}' {:?}",
					source,
					tensor.dims(),
					spec.name,
					spec.shape
				);
			}
			ui::debug(&format!("{} -> {}", source, spec.name));
			entries.push((spec.name.clone(), tensor));
		}

		Ok(Self { entries })
	}

	/// Replace entries that `other` provides under the same name. Names
	/// unknown to `self` are ignored; returns how many entries were replaced.
	pub fn overlay(&mut self, other: StateDict) -> Result<usize> {
		let index: HashMap<String, usize> = self
			.entries
			.iter()
			.enumerate()
			.map(|(i, (name, _))| (name.clone(), i))
			.collect();

		let mut replaced = 0;
		for (name, tensor) in other.entries {
			let Some(&i) = index.get(&name) else {
				continue;
			};
			let current = &self.entries[i].1;
			if current.dims() != tensor.dims() {
				bail!(
					"Tensor '{}' has shape {:?}, expected {:?}",
					name,
					tensor.dims(),
					current.dims()
				);
			}
			self.entries[i].1 = tensor;
			replaced += 1;
		}
		Ok(replaced)
	}

	/// Strict name and shape match against the model's parameters
	pub fn check_against(&self, specs: &[ParamSpec]) -> Result<()> {
		let ours: HashMap<&str, &Tensor> = self.iter().filter(|(_, t)| t.dtype().is_float()).collect();
		let expected: HashMap<&str, &ParamSpec> = specs.iter().map(|s| (s.name.as_str(), s)).collect();

		let mut missing: Vec<&str> = specs
			.iter()
			.filter(|s| !ours.contains_key(s.name.as_str()))
			.map(|s| s.name.as_str())
			.collect();
		let mut unexpected: Vec<&str> = ours.keys().filter(|k| !expected.contains_key(*k)).copied().collect();
		let mismatched: Vec<String> = specs
			.iter()
			.filter_map(|s| {
				let t = ours.get(s.name.as_str())?;
				(t.dims() != s.shape.as_slice())
					.then(|| format!("{} {:?} (expected {:?})", s.name, t.dims(), s.shape))
			})
			.collect();

		if missing.is_empty() && unexpected.is_empty() && mismatched.is_empty() {
			return Ok(());
		}

		unexpected.sort_unstable();
		let mut problems = Vec::new();
		if !missing.is_empty() {
			problems.push(format!("missing {} ({})", missing.len(), preview(&mut missing)));
		}
		if !unexpected.is_empty() {
			problems.push(format!("unexpected {} ({})", unexpected.len(), preview(&mut unexpected)));
		}
		if !mismatched.is_empty() {
			let mut names: Vec<&str> = mismatched.iter().map(|s| s.as_str()).collect();
			problems.push(format!("wrong shape {} ({})", mismatched.len(), preview(&mut names)));
		}
		bail!("State dict does not match the model: {}", problems.join("; "))
	}
}

fn preview(names: &mut Vec<&str>) -> String {
	let more = names.len().saturating_sub(5);
	names.truncate(5);
	let mut out = names.join(", ");
	if more > 0 {
		out.push_str(&format!(", … {} more", more));
	}
	out
}
