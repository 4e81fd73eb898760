//! Unified logging system
//!
//! Console lines are colored; once a run directory is known every line is
//! also mirrored, uncolored and timestamped, into `info.log` and `debug.log`.

use chrono::Local;
use colored::*;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};

static VERBOSE: AtomicBool = AtomicBool::new(false);
static FILE_SINK: OnceLock<Mutex<FileSink>> = OnceLock::new();

struct FileSink {
	info: File,
	debug: File,
}

#[derive(Clone, Copy)]
enum Level {
	Info,
	Success,
	Warning,
	Error,
	Debug,
}

impl Level {
	fn tag(self) -> &'static str {
		match self {
			Level::Info | Level::Success => "INFO",
			Level::Warning => "WARNING",
			Level::Error => "ERROR",
			Level::Debug => "DEBUG",
		}
	}
}

pub struct Log;

impl Log {
	pub fn set_verbose(enabled: bool) {
		VERBOSE.store(enabled, Ordering::Relaxed);
	}

	pub fn is_verbose() -> bool {
		VERBOSE.load(Ordering::Relaxed)
	}

	/// Create `dir` and start mirroring log lines into its log files.
	/// Only the first call takes effect.
	pub fn init_files(dir: &Path) -> Result<()> {
		fs::create_dir_all(dir)
			.with_context(|| format!("Failed to create output directory {}", dir.display()))?;

		let open = |name: &str| {
			OpenOptions::new()
				.create(true)
				.append(true)
				.open(dir.join(name))
				.with_context(|| format!("Failed to open {}", dir.join(name).display()))
		};
		let sink = FileSink {
			info: open("info.log")?,
			debug: open("debug.log")?,
		};

		let _ = FILE_SINK.set(Mutex::new(sink));
		Ok(())
	}
}

fn write_files(level: Level, msg: &str) {
	let Some(sink) = FILE_SINK.get() else {
		return;
	};
	let Ok(mut sink) = sink.lock() else {
		return;
	};

	let line = format!(
		"{}   {:<7} {}\n",
		Local::now().format("%Y-%m-%d %H:%M:%S"),
		level.tag(),
		msg
	);
	let _ = sink.debug.write_all(line.as_bytes());
	if !matches!(level, Level::Debug) {
		let _ = sink.info.write_all(line.as_bytes());
	}
}

pub fn info(msg: &str) {
	println!("{} {}", "ℹ".bright_blue().bold(), msg.bright_white());
	write_files(Level::Info, msg);
}

pub fn success(msg: &str) {
	println!("{} {}", "✓".bright_green().bold(), msg.bright_white());
	write_files(Level::Success, msg);
}

pub fn warn(msg: &str) {
	println!("{} {}", "⚠".bright_yellow().bold(), msg.bright_white());
	write_files(Level::Warning, msg);
}

pub fn error(msg: &str) {
	eprintln!("{} {}", "✗".bright_red().bold(), msg.bright_white());
	write_files(Level::Error, msg);
}

pub fn debug(msg: &str) {
	if Log::is_verbose() {
		println!("{} {}", "⚙".bright_black().bold(), msg.dimmed());
	}
	write_files(Level::Debug, msg);
}

pub fn header(text: &str) {
	println!("\n{}", format!("─── {} ───", text).bright_blue().bold());
}

/// Format elapsed time as `H:MM:SS`
pub fn format_elapsed(elapsed: std::time::Duration) -> String {
	let secs = elapsed.as_secs();
	format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Print a recall table, one bar per recall value.
pub fn recall_table(title: &str, recalls: &[(usize, f32)]) {
	header(title);
	for (n, value) in recalls {
		let filled = (*value / 5.0).round() as usize;
		let bar = format!("{}{}", "█".repeat(filled), "░".repeat(20usize.saturating_sub(filled)));
		println!(
			"  {} {} {}",
			format!("R@{:<3}", n).bright_blue().bold(),
			bar.bright_green(),
			format!("{:5.1}%", value).bright_white()
		);
	}
	println!();
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[test]
	fn elapsed_is_hours_minutes_seconds() {
		assert_eq!(format_elapsed(Duration::from_secs(0)), "0:00:00");
		assert_eq!(format_elapsed(Duration::from_secs(3725)), "1:02:05");
		assert_eq!(format_elapsed(Duration::from_millis(59_999)), "0:00:59");
	}
}
