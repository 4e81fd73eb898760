//! Datasets read from disk and artifacts written back

pub mod artifacts;
pub mod dataset;

pub use artifacts::{load_pca, save_pca, save_report, ComparisonRecalls, RecallReport};
pub use dataset::{sample_images, TestDataset};
