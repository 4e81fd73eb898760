//! Fetch command - download weights ahead of evaluation

use anyhow::Result;

use crate::cli::Backbone;
use crate::models::{backbone, zoo, WeightsSource};
use crate::ui;

pub fn run(off_the_shelf: &str, backbone_kind: Backbone) -> Result<()> {
	let source = WeightsSource::resolve(off_the_shelf, None, backbone_kind)?;
	ui::info(&format!("Fetching {} for {}", source.describe(), backbone_kind));
	let path = zoo::fetch(&source, backbone::depth(backbone_kind))?;
	ui::success(&format!("Weights ready: {}", path.display()));
	Ok(())
}
