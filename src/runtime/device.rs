//! Compute device selection

use candle_core::Device;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::cli::DeviceChoice;
use crate::ui;

static DEVICE_LOGGED: AtomicBool = AtomicBool::new(false);

fn announce(message: &str) {
	if !DEVICE_LOGGED.swap(true, Ordering::Relaxed) {
		ui::success(message);
	}
}

/// Resolve the requested device, falling back to the CPU when it is not
/// available in this build or on this machine.
pub fn select_device(choice: DeviceChoice) -> Device {
	match choice {
		DeviceChoice::Auto => best_available(),
		DeviceChoice::Cpu => {
			announce("Using CPU (forced)");
			Device::Cpu
		}
		DeviceChoice::Cuda => try_cuda().unwrap_or_else(|| {
			ui::error("CUDA requested but unavailable, falling back to CPU");
			Device::Cpu
		}),
		DeviceChoice::Metal => try_metal().unwrap_or_else(|| {
			ui::error("Metal requested but unavailable, falling back to CPU");
			Device::Cpu
		}),
	}
}

fn best_available() -> Device {
	if let Some(device) = try_cuda() {
		return device;
	}
	if let Some(device) = try_metal() {
		return device;
	}
	announce("Using CPU");
	Device::Cpu
}

macro_rules! try_device {
	($available:path, $create:path, $name:expr) => {{
		ui::debug(&format!("Trying device: {}", $name));
		if !$available() {
			ui::debug(&format!("{} not available", $name));
			return None;
		}
		match $create(0) {
			Ok(device) => {
				announce(&format!("Using {} device 0", $name));
				Some(device)
			}
			Err(e) => {
				ui::debug(&format!("{} initialization failed: {}", $name, e));
				None
			}
		}
	}};
}

fn try_cuda() -> Option<Device> {
	try_device!(candle_core::utils::cuda_is_available, Device::new_cuda, "CUDA")
}

fn try_metal() -> Option<Device> {
	try_device!(candle_core::utils::metal_is_available, Device::new_metal, "Metal")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cpu_is_always_selectable() {
		assert!(matches!(select_device(DeviceChoice::Cpu), Device::Cpu));
	}

	#[cfg(not(any(feature = "cuda", feature = "metal")))]
	#[test]
	fn accelerators_fall_back_to_cpu_without_features() {
		assert!(matches!(select_device(DeviceChoice::Cuda), Device::Cpu));
		assert!(matches!(select_device(DeviceChoice::Metal), Device::Cpu));
		assert!(matches!(select_device(DeviceChoice::Auto), Device::Cpu));
	}
}
