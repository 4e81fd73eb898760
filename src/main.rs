//! georecall - recall@N evaluation of image-retrieval models

use clap::Parser;

use georecall::cli::{Cli, Command};
use georecall::ui::{self, Log};
use georecall::{commands, config};

fn main() {
	let cli = Cli::parse();
	Log::set_verbose(cli.verbose);

	let result = match cli.command {
		Command::Eval(args) => {
			if let Some(dir) = &args.weights_dir {
				config::set_weights_dir(dir.clone());
			}
			commands::eval::run(&args)
		}
		Command::Fetch {
			off_the_shelf,
			backbone,
			weights_dir,
		} => {
			if let Some(dir) = weights_dir {
				config::set_weights_dir(dir);
			}
			commands::fetch::run(&off_the_shelf, backbone)
		}
	};

	if let Err(e) = result {
		ui::error(&format!("{:#}", e));
		std::process::exit(1);
	}
}
