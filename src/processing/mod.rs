//! Image preprocessing and descriptor extraction

pub mod extract;
pub mod image;

pub use extract::{average_groups, extract, normalize_rows};
pub use self::image::View;
