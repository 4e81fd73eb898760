use clap::{builder::Styles, Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;

/// Compute device for the forward pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum DeviceChoice {
	/// Auto-detect best available (CUDA → Metal → CPU)
	#[default]
	Auto,
	/// CPU only
	Cpu,
	/// NVIDIA CUDA GPU (needs the `cuda` feature)
	Cuda,
	/// Apple Metal GPU (needs the `metal` feature)
	Metal,
}

/// Truncated ResNet trunk used as feature extractor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Backbone {
	#[value(name = "resnet18conv4")]
	Resnet18Conv4,
	#[value(name = "resnet18conv5")]
	Resnet18Conv5,
	#[value(name = "resnet50conv4")]
	Resnet50Conv4,
	#[value(name = "resnet50conv5")]
	Resnet50Conv5,
	#[value(name = "resnet101conv4")]
	Resnet101Conv4,
	#[value(name = "resnet101conv5")]
	Resnet101Conv5,
}

impl Backbone {
	/// Name used in weight tables and file names
	pub fn name(self) -> &'static str {
		match self {
			Backbone::Resnet18Conv4 => "resnet18conv4",
			Backbone::Resnet18Conv5 => "resnet18conv5",
			Backbone::Resnet50Conv4 => "resnet50conv4",
			Backbone::Resnet50Conv5 => "resnet50conv5",
			Backbone::Resnet101Conv4 => "resnet101conv4",
			Backbone::Resnet101Conv5 => "resnet101conv5",
		}
	}
}

impl std::fmt::Display for Backbone {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.name())
	}
}

/// Spatial aggregation turning a feature map into one descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Aggregation {
	/// Generalized-mean pooling
	Gem,
	/// Sum-pooling (average)
	Spoc,
	/// Max-pooling
	Mac,
	/// Regional max-pooling
	Rmac,
	/// NetVLAD residual aggregation
	Netvlad,
	/// NetVLAD with contextual reweighting
	Crn,
}

impl Aggregation {
	pub fn is_vlad(self) -> bool {
		matches!(self, Aggregation::Netvlad | Aggregation::Crn)
	}
}

/// Where L2 normalization happens around pooling
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum L2Policy {
	#[value(name = "none")]
	None,
	#[value(name = "before_pool")]
	BeforePool,
	#[value(name = "after_pool")]
	AfterPool,
}

/// How query images are fed to the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TestMethod {
	/// Resize queries to the database resolution
	#[value(name = "hard_resize")]
	HardResize,
	/// Native query resolution, one query per batch
	#[value(name = "single_query")]
	SingleQuery,
	/// Square crop from the centre of the query
	#[value(name = "central_crop")]
	CentralCrop,
	/// Average descriptors of five square crops
	#[value(name = "five_crops")]
	FiveCrops,
	/// Search with five crops, keep the nearest results
	#[value(name = "nearest_crop")]
	NearestCrop,
	/// Search with five crops, favour results several crops agree on
	#[value(name = "maj_voting")]
	MajVoting,
}

impl TestMethod {
	pub fn name(self) -> &'static str {
		match self {
			TestMethod::HardResize => "hard_resize",
			TestMethod::SingleQuery => "single_query",
			TestMethod::CentralCrop => "central_crop",
			TestMethod::FiveCrops => "five_crops",
			TestMethod::NearestCrop => "nearest_crop",
			TestMethod::MajVoting => "maj_voting",
		}
	}

	/// Number of descriptors computed per query image
	pub fn crops_per_query(self) -> usize {
		match self {
			TestMethod::FiveCrops | TestMethod::NearestCrop | TestMethod::MajVoting => 5,
			_ => 1,
		}
	}
}

fn styles() -> Styles {
	Styles::styled()
		.header(anstyle::Style::new().bold().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Blue))))
		.usage(anstyle::Style::new().bold().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Blue))))
		.literal(anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Blue))))
		.placeholder(anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow))))
		.valid(anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Blue))))
		.invalid(anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Red))))
}

#[derive(Parser, Debug)]
#[command(
	name = "georecall",
	author,
	version,
	about = "Recall@K evaluation of image-retrieval models",
	styles = styles(),
	after_help = format!(
		"{title}
  {bin} {eval}  {naver_args}
  {bin} {eval}  {rad_args}
  {bin} {eval}  {resume_args}
  {bin} {fetch} {fetch_args}",
		title = "Examples:".bright_blue().bold(),
		bin = "georecall".bright_blue(),
		eval = "eval".yellow(),
		naver_args = "--off-the-shelf naver --l2 none --backbone resnet101conv5 --aggregation gem --fc-output-dim 2048".dimmed(),
		rad_args = "--off-the-shelf radenovic_sfm --l2 after_pool --backbone resnet101conv5 --aggregation gem --fc-output-dim 2048".dimmed(),
		resume_args = "--resume best_model.pth --backbone resnet50conv4 --aggregation netvlad --pca-dim 4096 --pca-dataset-folder pitts30k/images/train".dimmed(),
		fetch = "fetch".yellow(),
		fetch_args = "--off-the-shelf radenovic_gldv1 --backbone resnet50conv5".dimmed(),
	),
)]
pub struct Cli {
	/// Enable verbose debug output
	#[arg(short = 'v', long = "verbose", global = true)]
	pub verbose: bool,

	#[command(subcommand)]
	pub command: Command,
}

#[derive(Subcommand, Debug)]
#[allow(clippy::large_enum_variant)]
pub enum Command {
	/// Extract descriptors and compute recall@K on a test set
	Eval(EvalArgs),

	/// Download off-the-shelf weights without evaluating
	Fetch {
		/// Weights source: radenovic_sfm, radenovic_gldv1 or naver
		#[arg(long = "off-the-shelf", alias = "off_the_shelf")]
		off_the_shelf: String,

		/// Backbone the weights belong to
		#[arg(long = "backbone", default_value = "resnet50conv5")]
		backbone: Backbone,

		/// Directory for cached weights (default: data/off_the_shelf_nets)
		#[arg(long = "weights-dir", alias = "weights_dir")]
		weights_dir: Option<PathBuf>,
	},
}

#[derive(Args, Debug, Clone)]
pub struct EvalArgs {
	/// Weights source: imagenet, radenovic_sfm, radenovic_gldv1 or naver
	#[arg(long = "off-the-shelf", alias = "off_the_shelf", default_value = "imagenet")]
	pub off_the_shelf: String,

	/// L2 normalization around pooling (gem, spoc, mac, rmac)
	#[arg(long = "l2", default_value = "before_pool")]
	pub l2: L2Policy,

	#[arg(long = "backbone", default_value = "resnet18conv4")]
	pub backbone: Backbone,

	#[arg(long = "aggregation", default_value = "netvlad")]
	pub aggregation: Aggregation,

	/// Output dimension of a fully connected layer after pooling
	#[arg(long = "fc-output-dim", alias = "fc_output_dim")]
	pub fc_output_dim: Option<usize>,

	/// Number of clusters for netvlad and crn
	#[arg(long = "netvlad-clusters", alias = "netvlad_clusters", default_value_t = 64)]
	pub netvlad_clusters: usize,

	/// Checkpoint to evaluate (key `model_state_dict`)
	#[arg(long = "resume", value_name = "PATH")]
	pub resume: Option<PathBuf>,

	/// Reduce descriptors to this dimension with PCA
	#[arg(long = "pca-dim", alias = "pca_dim")]
	pub pca_dim: Option<usize>,

	/// Images to fit PCA on, relative to --datasets-folder
	#[arg(long = "pca-dataset-folder", alias = "pca_dataset_folder", value_name = "PATH")]
	pub pca_dataset_folder: Option<PathBuf>,

	/// Reuse a PCA fitted by a previous run instead of fitting one
	#[arg(long = "pca-path", alias = "pca_path", value_name = "PATH")]
	pub pca_path: Option<PathBuf>,

	/// Scale PCA components to unit variance
	#[arg(long = "pca-whiten", alias = "pca_whiten")]
	pub pca_whiten: bool,

	/// Also evaluate a second (GeM) model and their ensemble
	#[arg(long = "comparison")]
	pub comparison: bool,

	/// Checkpoint of the second model for --comparison
	#[arg(long = "resume-compar", alias = "resume_compar", value_name = "PATH")]
	pub resume_compar: Option<PathBuf>,

	/// Run name; outputs go to test/<save-dir>/<timestamp>
	#[arg(long = "save-dir", alias = "save_dir", default_value = "default")]
	pub save_dir: String,

	/// Run name for the second model of --comparison
	#[arg(long = "save-alt-dir", alias = "save_alt_dir", default_value = "default_compar")]
	pub save_alt_dir: String,

	#[arg(long = "test-method", alias = "test_method", default_value = "hard_resize")]
	pub test_method: TestMethod,

	#[arg(long = "seed", default_value_t = 0)]
	pub seed: u64,

	#[arg(long = "device", default_value = "auto")]
	pub device: DeviceChoice,

	/// Root folder of the datasets
	#[arg(long = "datasets-folder", alias = "datasets_folder", default_value = "datasets")]
	pub datasets_folder: PathBuf,

	#[arg(long = "dataset-name", alias = "dataset_name", default_value = "pitts30k")]
	pub dataset_name: String,

	/// Database (and hard_resize query) resolution
	#[arg(long = "resize", num_args = 2, value_names = ["H", "W"], default_values_t = [480u32, 640])]
	pub resize: Vec<u32>,

	#[arg(long = "infer-batch-size", alias = "infer_batch_size", default_value_t = 16)]
	pub infer_batch_size: usize,

	/// Recall values to report (comma-separated)
	#[arg(long = "recall-values", alias = "recall_values", value_delimiter = ',', default_values_t = [1usize, 5, 10, 20])]
	pub recall_values: Vec<usize>,

	/// Distance in metres under which a database image is a positive
	#[arg(long = "val-positive-dist-threshold", alias = "val_positive_dist_threshold", default_value_t = 25.0)]
	pub val_positive_dist_threshold: f64,

	/// Distance bonus per vote for maj_voting
	#[arg(long = "majority-weight", alias = "majority_weight", default_value_t = 0.01)]
	pub majority_weight: f32,

	/// Directory for cached weights (default: data/off_the_shelf_nets)
	#[arg(long = "weights-dir", alias = "weights_dir", value_name = "PATH")]
	pub weights_dir: Option<PathBuf>,
}
