//! # Retrieval Networks
//!
//! ResNet backbones, aggregation heads and the weights they are loaded from.

pub mod aggregation;
pub mod backbone;
pub mod checkpoint;
pub mod layers;
pub mod network;
pub mod state_dict;
pub mod zoo;

pub use network::GeoLocalizationNet;
pub use state_dict::StateDict;
pub use zoo::WeightsSource;
