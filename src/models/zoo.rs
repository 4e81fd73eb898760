//! Pretrained weights: off-the-shelf model zoos, ImageNet backbones and
//! locally resumed checkpoints.
//!
//! Radenovic's cnnimageretrieval-pytorch publishes GeM networks trained with a
//! triplet loss on SfM-120k and Google Landmarks 18; Naver's
//! deep-image-retrieval publishes GeM networks trained with AP on Google
//! Landmarks 18 clean. Both are fetched once into the weights directory.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Backbone;
use crate::config;
use crate::ui;

/// Radenovic checkpoints keyed by `<backbone>_<training set>`
pub const OFF_THE_SHELF_RADENOVIC: &[(&str, &str)] = &[
	(
		"resnet50conv5_sfm",
		"http://cmp.felk.cvut.cz/cnnimageretrieval/data/networks/retrieval-SfM-120k/rSfM120k-tl-resnet50-gem-w-97bf910.pth",
	),
	(
		"resnet101conv5_sfm",
		"http://cmp.felk.cvut.cz/cnnimageretrieval/data/networks/retrieval-SfM-120k/rSfM120k-tl-resnet101-gem-w-a155e54.pth",
	),
	(
		"resnet50conv5_gldv1",
		"http://cmp.felk.cvut.cz/cnnimageretrieval/data/networks/gl18/gl18-tl-resnet50-gem-w-83fdc30.pth",
	),
	(
		"resnet101conv5_gldv1",
		"http://cmp.felk.cvut.cz/cnnimageretrieval/data/networks/gl18/gl18-tl-resnet101-gem-w-a4d43db.pth",
	),
];

/// Naver Google-Drive archives keyed by backbone: (file id, checkpoint inside the archive)
pub const OFF_THE_SHELF_NAVER: &[(&str, &str, &str)] = &[
	("resnet50conv5", "1oPtE_go9tnsiDLkWjN4NMpKjh-_md1G5", "Resnet50-AP-GeM.pt"),
	("resnet101conv5", "1UWJGDuHtzaQdFhSMojoYVQjmCXhIwVvy", "Resnet-101-AP-GeM.pt"),
];

/// torchvision ImageNet weights keyed by ResNet depth
pub const IMAGENET_RESNET: &[(usize, &str)] = &[
	(18, "https://download.pytorch.org/models/resnet18-f37072fd.pth"),
	(50, "https://download.pytorch.org/models/resnet50-0676ba61.pth"),
	(101, "https://download.pytorch.org/models/resnet101-63fe2227.pth"),
];

const GOOGLE_DRIVE_URL: &str = "https://drive.usercontent.google.com/download";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Where a model's weights come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightsSource {
	/// ImageNet backbone, default-initialized aggregation
	Imagenet,
	Radenovic {
		key: String,
		url: &'static str,
	},
	Naver {
		archive: String,
		file_id: &'static str,
		checkpoint: &'static str,
	},
	/// Checkpoint produced by a training run (`model_state_dict`)
	Resume(PathBuf),
}

impl WeightsSource {
	/// Off-the-shelf sources take precedence over `resume`, which takes
	/// precedence over ImageNet initialization.
	pub fn resolve(off_the_shelf: &str, resume: Option<&Path>, backbone: Backbone) -> Result<Self> {
		if off_the_shelf.starts_with("radenovic") {
			let Some(dataset) = off_the_shelf.split('_').nth(1) else {
				bail!("Expected radenovic_<dataset>, got '{}'", off_the_shelf);
			};
			let key = format!("{}_{}", backbone.name(), dataset);
			return Ok(Self::Radenovic {
				url: radenovic_url(&key)?,
				key,
			});
		}

		if off_the_shelf.starts_with("naver") {
			let (file_id, checkpoint) = naver_entry(backbone)?;
			return Ok(Self::Naver {
				archive: format!("{}_naver.zip", backbone.name()),
				file_id,
				checkpoint,
			});
		}

		if off_the_shelf != "imagenet" {
			bail!(
				"Unknown off-the-shelf source '{}' (expected imagenet, radenovic_<dataset> or naver)",
				off_the_shelf
			);
		}

		Ok(match resume {
			Some(path) => Self::Resume(path.to_path_buf()),
			None => Self::Imagenet,
		})
	}

	pub fn is_off_the_shelf(&self) -> bool {
		matches!(self, Self::Radenovic { .. } | Self::Naver { .. })
	}

	pub fn describe(&self) -> String {
		match self {
			Self::Imagenet => "ImageNet backbone".to_string(),
			Self::Radenovic { key, .. } => format!("Radenovic {}", key),
			Self::Naver { checkpoint, .. } => format!("Naver {}", checkpoint),
			Self::Resume(path) => format!("checkpoint {}", path.display()),
		}
	}
}

pub fn radenovic_url(key: &str) -> Result<&'static str> {
	OFF_THE_SHELF_RADENOVIC
		.iter()
		.find(|(k, _)| *k == key)
		.map(|(_, url)| *url)
		.with_context(|| {
			let known: Vec<&str> = OFF_THE_SHELF_RADENOVIC.iter().map(|(k, _)| *k).collect();
			format!("No Radenovic weights for '{}' (available: {})", key, known.join(", "))
		})
}

pub fn naver_entry(backbone: Backbone) -> Result<(&'static str, &'static str)> {
	OFF_THE_SHELF_NAVER
		.iter()
		.find(|(k, _, _)| *k == backbone.name())
		.map(|(_, id, file)| (*id, *file))
		.with_context(|| format!("No Naver weights for backbone '{}'", backbone))
}

pub fn imagenet_url(depth: usize) -> Result<&'static str> {
	IMAGENET_RESNET
		.iter()
		.find(|(d, _)| *d == depth)
		.map(|(_, url)| *url)
		.with_context(|| format!("No ImageNet weights for ResNet-{}", depth))
}

/// Make sure the checkpoint for `source` is on disk and return its path.
pub fn fetch(source: &WeightsSource, depth: usize) -> Result<PathBuf> {
	let dir = config::weights_dir();
	match source {
		WeightsSource::Imagenet => fetch_url(imagenet_url(depth)?, &dir),
		WeightsSource::Radenovic { url, .. } => fetch_url(url, &dir),
		WeightsSource::Naver {
			archive,
			file_id,
			checkpoint,
		} => fetch_naver(&dir, archive, file_id, checkpoint),
		WeightsSource::Resume(path) => {
			if !path.exists() {
				bail!("Checkpoint does not exist: {}", path.display());
			}
			Ok(path.clone())
		}
	}
}

fn fetch_url(url: &str, dir: &Path) -> Result<PathBuf> {
	let filename = url
		.rsplit('/')
		.next()
		.filter(|name| !name.is_empty())
		.with_context(|| format!("Cannot derive a file name from {}", url))?;
	let dest = dir.join(filename);

	if dest.exists() {
		ui::debug(&format!("Using cached weights: {}", dest.display()));
		return Ok(dest);
	}

	download(url, &dest)?;
	Ok(dest)
}

fn fetch_naver(dir: &Path, archive: &str, file_id: &str, checkpoint: &str) -> Result<PathBuf> {
	let zip_path = dir.join(archive);
	let checkpoint_path = dir.join(checkpoint);

	if !zip_path.exists() {
		let url = format!("{}?id={}&export=download&confirm=t", GOOGLE_DRIVE_URL, file_id);
		download(&url, &zip_path)?;
		unzip_flat(&zip_path, dir)?;
	} else if !checkpoint_path.exists() {
		ui::debug(&format!("Re-extracting {}", zip_path.display()));
		unzip_flat(&zip_path, dir)?;
	}

	if !checkpoint_path.exists() {
		bail!(
			"{} does not contain {}",
			zip_path.display(),
			checkpoint
		);
	}
	Ok(checkpoint_path)
}

/// Stream `url` into `dest` through a `.part` file.
pub fn download(url: &str, dest: &Path) -> Result<()> {
	if let Some(parent) = dest.parent() {
		fs::create_dir_all(parent)
			.with_context(|| format!("Failed to create {}", parent.display()))?;
	}

	ui::info(&format!("Downloading {}", url));

	let client = reqwest::blocking::Client::builder()
		.user_agent(concat!("georecall/", env!("CARGO_PKG_VERSION")))
		.timeout(DOWNLOAD_TIMEOUT)
		.build()
		.context("Failed to create HTTP client")?;

	let mut response = client
		.get(url)
		.send()
		.with_context(|| format!("Request to {} failed", url))?
		.error_for_status()
		.with_context(|| format!("Download of {} failed", url))?;

	let is_html = response
		.headers()
		.get(reqwest::header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.starts_with("text/html"));
	if is_html {
		bail!("{} returned a web page instead of a file (quota exceeded or link expired?)", url);
	}

	let part = dest.with_extension("part");
	let mut file = File::create(&part).with_context(|| format!("Failed to create {}", part.display()))?;
	let bytes = response
		.copy_to(&mut file)
		.with_context(|| format!("Failed to write {}", part.display()))?;
	drop(file);

	fs::rename(&part, dest).with_context(|| format!("Failed to move download to {}", dest.display()))?;
	ui::success(&format!(
		"Saved {} ({:.1} MB)",
		dest.display(),
		bytes as f64 / 1024.0 / 1024.0
	));
	Ok(())
}

/// Extract every file of a zip archive directly into `dir`, dropping folders.
pub fn unzip_flat(zip_path: &Path, dir: &Path) -> Result<Vec<PathBuf>> {
	let file = File::open(zip_path).with_context(|| format!("Failed to open {}", zip_path.display()))?;
	let mut archive = zip::ZipArchive::new(file).with_context(|| format!("{} is not a zip archive", zip_path.display()))?;

	let mut extracted = Vec::new();
	for index in 0..archive.len() {
		let mut entry = archive.by_index(index)?;
		if entry.is_dir() {
			continue;
		}
		let Some(name) = entry.enclosed_name().and_then(|p| p.file_name().map(|n| n.to_owned())) else {
			ui::warn(&format!("Skipping unsafe archive entry {}", entry.name()));
			continue;
		};

		let out_path = dir.join(name);
		let mut out = File::create(&out_path).with_context(|| format!("Failed to create {}", out_path.display()))?;
		io::copy(&mut entry, &mut out)?;
		ui::debug(&format!("Extracted {}", out_path.display()));
		extracted.push(out_path);
	}

	Ok(extracted)
}
