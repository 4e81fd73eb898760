//! Truncated ResNet trunks.
//!
//! Parameters are named after `nn.Sequential(*list(resnet.children())[:-2])`
//! (`[:-3]` for conv4 variants): `backbone.0` is the stem convolution,
//! `backbone.1` its batch-norm and `backbone.4` … `backbone.7` the residual
//! stages.

use anyhow::Result;
use candle_core::{Tensor, D};

use super::layers::{BatchNorm, Conv2d, VarStore};
use crate::cli::Backbone;

/// Sequential index of the first residual stage
const FIRST_STAGE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
	Basic,
	Bottleneck,
}

impl BlockKind {
	fn expansion(self) -> usize {
		match self {
			BlockKind::Basic => 1,
			BlockKind::Bottleneck => 4,
		}
	}
}

struct Downsample {
	conv: Conv2d,
	bn: BatchNorm,
}

struct Block {
	conv1: Conv2d,
	bn1: BatchNorm,
	conv2: Conv2d,
	bn2: BatchNorm,
	/// Third convolution of bottleneck blocks
	conv3: Option<(Conv2d, BatchNorm)>,
	downsample: Option<Downsample>,
}

impl Block {
	fn new(vs: &mut VarStore, prefix: &str, kind: BlockKind, c_in: usize, width: usize, stride: usize) -> Result<Self> {
		let c_out = width * kind.expansion();
		let (conv1, bn1, conv2, bn2, conv3) = match kind {
			BlockKind::Basic => (
				Conv2d::new(vs, &format!("{prefix}.conv1"), c_in, width, 3, stride, 1, false)?,
				BatchNorm::new(vs, &format!("{prefix}.bn1"), width)?,
				Conv2d::new(vs, &format!("{prefix}.conv2"), width, width, 3, 1, 1, false)?,
				BatchNorm::new(vs, &format!("{prefix}.bn2"), width)?,
				None,
			),
			BlockKind::Bottleneck => (
				Conv2d::new(vs, &format!("{prefix}.conv1"), c_in, width, 1, 1, 0, false)?,
				BatchNorm::new(vs, &format!("{prefix}.bn1"), width)?,
				Conv2d::new(vs, &format!("{prefix}.conv2"), width, width, 3, stride, 1, false)?,
				BatchNorm::new(vs, &format!("{prefix}.bn2"), width)?,
				Some((
					Conv2d::new(vs, &format!("{prefix}.conv3"), width, c_out, 1, 1, 0, false)?,
					BatchNorm::new(vs, &format!("{prefix}.bn3"), c_out)?,
				)),
			),
		};

		let downsample = if stride != 1 || c_in != c_out {
			Some(Downsample {
				conv: Conv2d::new(vs, &format!("{prefix}.downsample.0"), c_in, c_out, 1, stride, 0, false)?,
				bn: BatchNorm::new(vs, &format!("{prefix}.downsample.1"), c_out)?,
			})
		} else {
			None
		};

		Ok(Self {
			conv1,
			bn1,
			conv2,
			bn2,
			conv3,
			downsample,
		})
	}

	fn forward(&self, xs: &Tensor) -> Result<Tensor> {
		let mut ys = self.bn1.forward(&self.conv1.forward(xs)?)?.relu()?;
		ys = self.bn2.forward(&self.conv2.forward(&ys)?)?;
		if let Some((conv3, bn3)) = &self.conv3 {
			ys = bn3.forward(&conv3.forward(&ys.relu()?)?)?;
		}
		let identity = match &self.downsample {
			Some(down) => down.bn.forward(&down.conv.forward(xs)?)?,
			None => xs.clone(),
		};
		Ok((ys + identity)?.relu()?)
	}
}

pub struct ResNet {
	conv1: Conv2d,
	bn1: BatchNorm,
	stages: Vec<Vec<Block>>,
}

impl ResNet {
	pub fn new(vs: &mut VarStore, backbone: Backbone) -> Result<Self> {
		let (kind, counts) = layout(backbone);
		let conv1 = Conv2d::new(vs, "backbone.0", 3, 64, 7, 2, 3, false)?;
		let bn1 = BatchNorm::new(vs, "backbone.1", 64)?;

		let mut c_in = 64;
		let mut stages = Vec::with_capacity(counts.len());
		for (stage, &count) in counts.iter().enumerate() {
			let width = 64 << stage;
			let mut blocks = Vec::with_capacity(count);
			for index in 0..count {
				let stride = if stage > 0 && index == 0 { 2 } else { 1 };
				let prefix = format!("backbone.{}.{}", FIRST_STAGE + stage, index);
				blocks.push(Block::new(vs, &prefix, kind, c_in, width, stride)?);
				c_in = width * kind.expansion();
			}
			stages.push(blocks);
		}

		Ok(Self { conv1, bn1, stages })
	}

	/// `[N, 3, H, W]` images to `[N, C, H', W']` feature maps
	pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
		// Post-ReLU activations are non-negative, so zero padding matches -inf padding.
		let mut xs = self
			.bn1
			.forward(&self.conv1.forward(xs)?)?
			.relu()?
			.pad_with_zeros(D::Minus1, 1, 1)?
			.pad_with_zeros(D::Minus2, 1, 1)?
			.max_pool2d_with_stride(3, 2)?;
		for blocks in &self.stages {
			for block in blocks {
				xs = block.forward(&xs)?;
			}
		}
		Ok(xs)
	}
}

/// Depth of the torchvision network a backbone is cut from
pub fn depth(backbone: Backbone) -> usize {
	match backbone {
		Backbone::Resnet18Conv4 | Backbone::Resnet18Conv5 => 18,
		Backbone::Resnet50Conv4 | Backbone::Resnet50Conv5 => 50,
		Backbone::Resnet101Conv4 | Backbone::Resnet101Conv5 => 101,
	}
}

fn layout(backbone: Backbone) -> (BlockKind, &'static [usize]) {
	match backbone {
		Backbone::Resnet18Conv4 => (BlockKind::Basic, &[2, 2, 2]),
		Backbone::Resnet18Conv5 => (BlockKind::Basic, &[2, 2, 2, 2]),
		Backbone::Resnet50Conv4 => (BlockKind::Bottleneck, &[3, 4, 6]),
		Backbone::Resnet50Conv5 => (BlockKind::Bottleneck, &[3, 4, 6, 3]),
		Backbone::Resnet101Conv4 => (BlockKind::Bottleneck, &[3, 4, 23]),
		Backbone::Resnet101Conv5 => (BlockKind::Bottleneck, &[3, 4, 23, 3]),
	}
}

/// Map a torchvision ResNet parameter name onto the backbone's naming.
/// The classifier and stages the backbone does not keep map to `None`.
pub fn torchvision_name(name: &str, backbone: Backbone) -> Option<String> {
	let stages = layout(backbone).1.len();
	if let Some(rest) = name.strip_prefix("conv1.") {
		return Some(format!("backbone.0.{}", rest));
	}
	if let Some(rest) = name.strip_prefix("bn1.") {
		return Some(format!("backbone.1.{}", rest));
	}
	let rest = name.strip_prefix("layer")?;
	let (stage, rest) = rest.split_once('.')?;
	let stage: usize = stage.parse().ok()?;
	if stage == 0 || stage > stages {
		return None;
	}
	Some(format!("backbone.{}.{}", FIRST_STAGE + stage - 1, rest))
}
