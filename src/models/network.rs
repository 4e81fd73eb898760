//! The evaluated network: truncated ResNet trunk followed by an aggregation
//! head, with weights from ImageNet, an off-the-shelf zoo or a checkpoint.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};

use super::aggregation::Head;
use super::backbone::{self, ResNet};
use super::layers::VarStore;
use super::state_dict::{ParamSpec, StateDict};
use super::zoo::{self, WeightsSource};
use crate::config::ModelConfig;
use crate::ui;

pub struct GeoLocalizationNet {
	backbone: ResNet,
	head: Head,
	features_dim: usize,
}

impl GeoLocalizationNet {
	fn assemble(vs: &mut VarStore, config: &ModelConfig) -> Result<Self> {
		let backbone = ResNet::new(vs, config.backbone)?;
		let head = Head::new(
			vs,
			config.aggregation,
			config.l2,
			config.base_dim(),
			config.netvlad_clusters,
			config.fc_output_dim,
		)?;
		Ok(Self {
			backbone,
			head,
			features_dim: config.features_dim(),
		})
	}

	/// Parameter names, shapes and initializers in declaration order
	pub fn layout(config: &ModelConfig) -> Result<Vec<ParamSpec>> {
		let mut vs = VarStore::recorder();
		Self::assemble(&mut vs, config)?;
		Ok(vs.into_specs())
	}

	/// Build from a state dict whose names and shapes match `layout` exactly
	pub fn from_state_dict(config: &ModelConfig, dict: &StateDict, device: &Device) -> Result<Self> {
		dict.check_against(&Self::layout(config)?)?;
		let mut vs = VarStore::from_state_dict(dict, device);
		Self::assemble(&mut vs, config)
	}

	/// Fetch the configured weights and build the network on `device`
	pub fn load(config: &ModelConfig, device: &Device, seed: u64) -> Result<Self> {
		let specs = Self::layout(config)?;
		let depth = backbone::depth(config.backbone);
		ui::info(&format!(
			"Building {} + {:?} from {}",
			config.backbone,
			config.aggregation,
			config.weights.describe()
		));

		let path = zoo::fetch(&config.weights, depth)?;
		let dict = match &config.weights {
			WeightsSource::Imagenet => {
				let pretrained = StateDict::load(&path, None)?
					.floating()
					.rename_with(|name| backbone::torchvision_name(name, config.backbone));
				let mut dict = StateDict::initialized(&specs, seed)?;
				let replaced = dict.overlay(pretrained)?;
				ui::debug(&format!(
					"Loaded {} ImageNet tensors, {} parameters keep their initialization",
					replaced,
					specs.len() - replaced
				));
				dict
			}
			WeightsSource::Radenovic { .. } | WeightsSource::Naver { .. } => {
				StateDict::load(&path, Some("state_dict"))?
					.rename_positionally(&specs)
					.with_context(|| format!("Cannot map {} onto the model", path.display()))?
			}
			WeightsSource::Resume(_) => StateDict::load(&path, Some("model_state_dict"))?.strip_prefix("module."),
		};

		let net = Self::from_state_dict(config, &dict, device)?;
		ui::debug(&format!(
			"{} parameters, descriptors of dimension {}",
			specs.iter().map(|s| s.numel()).sum::<usize>(),
			net.features_dim
		));
		Ok(net)
	}

	/// Normalized `[N, 3, H, W]` images to `[N, features_dim]` descriptors
	pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
		let features = self.backbone.forward(images)?;
		self.head.forward(&features)
	}

	pub fn features_dim(&self) -> usize {
		self.features_dim
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cli::{Aggregation, Backbone, L2Policy};
	use candle_core::DType;

	fn config(aggregation: Aggregation, l2: L2Policy, fc: Option<usize>) -> ModelConfig {
		ModelConfig {
			backbone: Backbone::Resnet18Conv4,
			aggregation,
			l2,
			fc_output_dim: fc,
			netvlad_clusters: 4,
			weights: WeightsSource::Imagenet,
			pca_dim: None,
		}
	}

	fn random_net(config: &ModelConfig) -> GeoLocalizationNet {
		let specs = GeoLocalizationNet::layout(config).unwrap();
		let dict = StateDict::initialized(&specs, 3).unwrap();
		GeoLocalizationNet::from_state_dict(config, &dict, &Device::Cpu).unwrap()
	}

	#[test]
	fn layout_puts_head_after_backbone() {
		let specs = GeoLocalizationNet::layout(&config(Aggregation::Gem, L2Policy::AfterPool, Some(64))).unwrap();
		let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
		assert_eq!(names[0], "backbone.0.weight");
		assert_eq!(&names[names.len() - 3..], &["aggregation.0.0.p", "aggregation.1.weight", "aggregation.1.bias"]);
		assert_eq!(specs.last().unwrap().shape, vec![64]);
	}

	#[test]
	fn forward_produces_features_dim() {
		for (aggregation, fc, expected) in [
			(Aggregation::Netvlad, None, 256 * 4),
			(Aggregation::Gem, Some(32), 32),
			(Aggregation::Mac, None, 256),
		] {
			let config = config(aggregation, L2Policy::BeforePool, fc);
			let net = random_net(&config);
			assert_eq!(net.features_dim(), expected);
			let images = Tensor::randn(0f32, 1.0, (2, 3, 48, 64), &Device::Cpu).unwrap();
			let out = net.forward(&images).unwrap();
			assert_eq!(out.dims(), &[2, expected]);
		}
	}

	#[test]
	fn mismatching_state_dict_is_rejected() {
		let netvlad = config(Aggregation::Netvlad, L2Policy::BeforePool, None);
		let specs = GeoLocalizationNet::layout(&netvlad).unwrap();
		let dict = StateDict::initialized(&specs, 0).unwrap();
		let gem = config(Aggregation::Gem, L2Policy::BeforePool, None);
		assert!(GeoLocalizationNet::from_state_dict(&gem, &dict, &Device::Cpu).is_err());

		let empty = StateDict::from_entries(vec![(
			"backbone.0.weight".into(),
			Tensor::zeros((64, 3, 7, 7), DType::F32, &Device::Cpu).unwrap(),
		)]);
		assert!(GeoLocalizationNet::from_state_dict(&netvlad, &empty, &Device::Cpu).is_err());
	}
}
