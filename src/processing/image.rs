//! Image decoding, geometric views and tensor layout

use anyhow::{Context, Result};
use image::{imageops::FilterType, DynamicImage, ImageReader, RgbImage};
use std::path::Path;

use crate::cli::TestMethod;
use crate::config::{IMAGENET_MEAN, IMAGENET_STD};

/// How an image is turned into network inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
	/// Resize to exactly `height × width`
	Resize { height: u32, width: u32 },
	/// Native resolution
	Native,
	/// Scale to cover `height × width`, keep the centre
	CentralCrop { height: u32, width: u32 },
	/// Shorter side to `side`, then corners and centre `side × side`
	FiveCrops { side: u32 },
}

impl View {
	pub fn database(resize: (u32, u32)) -> Self {
		View::Resize {
			height: resize.0,
			width: resize.1,
		}
	}

	pub fn queries(method: TestMethod, resize: (u32, u32)) -> Self {
		let (height, width) = resize;
		match method {
			TestMethod::HardResize => View::Resize { height, width },
			TestMethod::SingleQuery => View::Native,
			TestMethod::CentralCrop => View::CentralCrop { height, width },
			TestMethod::FiveCrops | TestMethod::NearestCrop | TestMethod::MajVoting => View::FiveCrops {
				side: height.min(width),
			},
		}
	}

	/// Inputs produced per image
	pub fn count(&self) -> usize {
		match self {
			View::FiveCrops { .. } => 5,
			_ => 1,
		}
	}

	pub fn apply(&self, img: &DynamicImage) -> Vec<RgbImage> {
		match *self {
			View::Resize { height, width } => vec![img.resize_exact(width, height, FilterType::Triangle).to_rgb8()],
			View::Native => vec![img.to_rgb8()],
			View::CentralCrop { height, width } => {
				let scale = (height as f64 / img.height() as f64).max(width as f64 / img.width() as f64);
				let scaled_w = ((img.width() as f64 * scale).round() as u32).max(width);
				let scaled_h = ((img.height() as f64 * scale).round() as u32).max(height);
				let scaled = img.resize_exact(scaled_w, scaled_h, FilterType::Triangle);
				let (top, left) = centre_offset(scaled_h, scaled_w, height, width);
				vec![scaled.crop_imm(left, top, width, height).to_rgb8()]
			}
			View::FiveCrops { side } => {
				let scaled = resize_shorter_side(img, side);
				let (h, w) = (scaled.height(), scaled.width());
				let (centre_top, centre_left) = centre_offset(h, w, side, side);
				[
					(0, 0),
					(0, w - side),
					(h - side, 0),
					(h - side, w - side),
					(centre_top, centre_left),
				]
				.iter()
				.map(|&(top, left)| scaled.crop_imm(left, top, side, side).to_rgb8())
				.collect()
			}
		}
	}
}

fn centre_offset(h: u32, w: u32, crop_h: u32, crop_w: u32) -> (u32, u32) {
	let top = ((h.saturating_sub(crop_h)) as f64 / 2.0).round() as u32;
	let left = ((w.saturating_sub(crop_w)) as f64 / 2.0).round() as u32;
	(top, left)
}

fn resize_shorter_side(img: &DynamicImage, side: u32) -> DynamicImage {
	let (w, h) = (img.width().max(1), img.height().max(1));
	let (new_w, new_h) = if w <= h {
		(side, ((side as u64 * h as u64) / w as u64).max(side as u64) as u32)
	} else {
		(((side as u64 * w as u64) / h as u64).max(side as u64) as u32, side)
	};
	img.resize_exact(new_w, new_h, FilterType::Triangle)
}

/// Decode by content, whatever the extension says
pub fn open(path: &Path) -> Result<DynamicImage> {
	ImageReader::open(path)
		.with_context(|| format!("Failed to open: {}", path.display()))?
		.with_guessed_format()?
		.decode()
		.with_context(|| format!("Failed to decode: {}", path.display()))
}

/// ImageNet-normalized planes in CHW order
pub fn to_chw(rgb: &RgbImage) -> Vec<f32> {
	let (w, h) = (rgb.width() as usize, rgb.height() as usize);
	let plane = w * h;
	let mut data = vec![0.0f32; 3 * plane];
	for (x, y, px) in rgb.enumerate_pixels() {
		let idx = y as usize * w + x as usize;
		for c in 0..3 {
			data[c * plane + idx] = (px[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
		}
	}
	data
}

#[cfg(test)]
mod tests {
	use super::*;
	use image::Rgb;

	fn gradient(w: u32, h: u32) -> DynamicImage {
		DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 0])))
	}

	#[test]
	fn five_crops_cover_corners_and_centre() {
		let crops = View::FiveCrops { side: 40 }.apply(&gradient(60, 40));
		assert_eq!(crops.len(), 5);
		assert!(crops.iter().all(|c| c.dimensions() == (40, 40)));
		// top-left starts at x = 0, top-right at x = 20, centre at x = 10
		assert_eq!(crops[0].get_pixel(0, 0)[0], 0);
		assert_eq!(crops[1].get_pixel(0, 0)[0], 20);
		assert_eq!(crops[4].get_pixel(0, 0)[0], 10);
	}

	#[test]
	fn central_crop_has_requested_size() {
		for (w, h) in [(640, 480), (300, 600), (1000, 200)] {
			let crops = View::CentralCrop { height: 48, width: 64 }.apply(&gradient(w, h));
			assert_eq!(crops[0].dimensions(), (64, 48));
		}
	}

	#[test]
	fn query_views_follow_test_method() {
		assert_eq!(View::queries(TestMethod::SingleQuery, (480, 640)), View::Native);
		assert_eq!(
			View::queries(TestMethod::MajVoting, (480, 640)),
			View::FiveCrops { side: 480 }
		);
		assert_eq!(View::queries(TestMethod::NearestCrop, (480, 640)).count(), 5);
		assert_eq!(View::database((480, 640)).count(), 1);
	}

	#[test]
	fn chw_is_normalized_per_channel() {
		let rgb = RgbImage::from_pixel(2, 1, Rgb([255, 0, 128]));
		let data = to_chw(&rgb);
		assert_eq!(data.len(), 6);
		assert!((data[0] - (1.0 - 0.485) / 0.229).abs() < 1e-5);
		assert!((data[2] - (0.0 - 0.456) / 0.224).abs() < 1e-5);
		assert!((data[4] - (128.0 / 255.0 - 0.406) / 0.225).abs() < 1e-5);
	}
}
