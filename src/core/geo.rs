//! UTM coordinates encoded in image file names

use anyhow::{Context, Result};
use std::path::Path;

/// Easting and northing in metres
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Utm {
	pub east: f64,
	pub north: f64,
}

impl Utm {
	/// Parse `@<east>@<north>@...` from a file name
	pub fn from_path(path: &Path) -> Result<Self> {
		let name = path
			.file_name()
			.and_then(|n| n.to_str())
			.with_context(|| format!("Invalid file name: {}", path.display()))?;
		let mut fields = name.split('@').skip(1);
		let mut next = |what: &str| -> Result<f64> {
			let field = fields
				.next()
				.with_context(|| format!("No {} in {}", what, name))?;
			field
				.parse()
				.with_context(|| format!("Invalid {} '{}' in {}", what, field, name))
		};
		let east = next("easting")?;
		let north = next("northing")?;
		Ok(Self { east, north })
	}

	pub fn distance(&self, other: &Self) -> f64 {
		(self.east - other.east).hypot(self.north - other.north)
	}
}

/// Database indices within `threshold` metres of each query
pub fn positives_within(database: &[Utm], queries: &[Utm], threshold: f64) -> Vec<Vec<usize>> {
	queries
		.iter()
		.map(|query| {
			database
				.iter()
				.enumerate()
				.filter(|(_, db)| db.distance(query) <= threshold)
				.map(|(i, _)| i)
				.collect()
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_pitts_style_names() {
		let utm = Utm::from_path(Path::new("db/@0585380.83@4477196.47@17@T@040.44@-079.99@000001@00@@@@@@pitch1_yaw1@.jpg")).unwrap();
		assert_eq!(utm.east, 585380.83);
		assert_eq!(utm.north, 4477196.47);
	}

	#[test]
	fn rejects_names_without_coordinates() {
		assert!(Utm::from_path(Path::new("image_001.jpg")).is_err());
		assert!(Utm::from_path(Path::new("@abc@1.0@.jpg")).is_err());
	}

	#[test]
	fn positives_use_inclusive_radius() {
		let database = [
			Utm { east: 0.0, north: 0.0 },
			Utm { east: 25.0, north: 0.0 },
			Utm { east: 30.0, north: 0.0 },
		];
		let queries = [Utm { east: 0.0, north: 0.0 }, Utm { east: 100.0, north: 0.0 }];
		assert_eq!(positives_within(&database, &queries, 25.0), vec![vec![0, 1], vec![]]);
	}
}
