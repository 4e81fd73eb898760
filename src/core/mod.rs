//! Core retrieval logic: positives, search, recall and PCA

pub mod geo;
pub mod pca;
pub mod recall;
pub mod search;

pub use geo::{positives_within, Utm};
pub use pca::Pca;
pub use recall::Recalls;
pub use search::{apply_majority_votes, knn, merge_nearest, Neighbors};
