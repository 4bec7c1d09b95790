// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 Mid-Ohio Area Robotics

pub mod bootloader;
pub mod error;
pub mod flasher;
pub mod ihex;
pub mod memory;
pub mod protocol;
pub mod session;
pub mod usb;

/// Which kinds of device memory the operator has enabled for writing
/// and verification.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WriteOptions
{
	pub write_flash: bool,
	pub write_eeprom: bool,
}

impl Default for WriteOptions
{
	fn default() -> Self
	{
		Self {
			write_flash: true,
			write_eeprom: false,
		}
	}
}
