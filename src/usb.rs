// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 Mid-Ohio Area Robotics
//! USB HID transport for the bootloader.
//!
//! The protocol client talks through the [HidLink] trait so the whole
//! command layer can be exercised against a scripted link in tests; the
//! real implementation wraps a non-blocking `hidapi` device handle.

use hidapi::{HidApi, HidDevice};
use log::{debug, warn};

use crate::error::TransportError;

/// Vendor id of the Muribot bootloader.
pub const VENDOR_ID: u16 = 0x04D8;
/// Product id of the Muribot bootloader.
pub const PRODUCT_ID: u16 = 0x003C;

/// One open byte-oriented HID endpoint.
///
/// Both calls are non-blocking: `Ok(0)` means no byte moved and the caller
/// should retry; any error means the transfer failed and the link is dead.
pub trait HidLink
{
	fn write(&mut self, report: &[u8]) -> Result<usize, TransportError>;
	fn read(&mut self, report: &mut [u8]) -> Result<usize, TransportError>;
}

/// Where bootloader links come from: enumeration plus open. The session
/// controller polls through this so tests can hand it a scripted device.
pub trait DevicePort
{
	type Link: HidLink;

	fn device_present(&mut self) -> bool;
	fn open(&mut self) -> Result<Self::Link, TransportError>;
}

/// Handle on the host's HID subsystem, used to enumerate and open the
/// bootloader device.
pub struct UsbPort
{
	api: HidApi,
}

impl UsbPort
{
	pub fn new() -> Result<Self, TransportError>
	{
		let api = HidApi::new().map_err(|error| TransportError::Fail(error.to_string()))?;
		Ok(Self {
			api,
		})
	}
}

impl DevicePort for UsbPort
{
	type Link = UsbLink;

	/// Re-enumerate and report whether a bootloader is attached.
	fn device_present(&mut self) -> bool
	{
		if let Err(error) = self.api.refresh_devices() {
			warn!("Failed to refresh the HID device list: {error}");
			return false;
		}
		self.api
			.device_list()
			.any(|device| device.vendor_id() == VENDOR_ID && device.product_id() == PRODUCT_ID)
	}

	/// Open the attached bootloader and switch the handle to non-blocking
	/// reads, ready for the retry-loop I/O the client performs.
	fn open(&mut self) -> Result<UsbLink, TransportError>
	{
		let device = self
			.api
			.open(VENDOR_ID, PRODUCT_ID)
			.map_err(|error| TransportError::Fail(error.to_string()))?;
		device
			.set_blocking_mode(false)
			.map_err(|error| TransportError::Fail(error.to_string()))?;
		debug!("Opened bootloader HID device {VENDOR_ID:04x}:{PRODUCT_ID:04x}");
		Ok(UsbLink {
			device,
		})
	}
}

/// The hidapi-backed [HidLink].
pub struct UsbLink
{
	device: HidDevice,
}

impl HidLink for UsbLink
{
	fn write(&mut self, report: &[u8]) -> Result<usize, TransportError>
	{
		self.device
			.write(report)
			.map_err(|error| TransportError::Fail(error.to_string()))
	}

	fn read(&mut self, report: &mut [u8]) -> Result<usize, TransportError>
	{
		self.device
			.read(report)
			.map_err(|error| TransportError::Fail(error.to_string()))
	}
}

#[cfg(test)]
pub(crate) mod testing
{
	//! Test doubles for the HID link: a dumb scripted link for packet-level
	//! assertions and a behavioural bootloader model for pipeline tests.

	use std::collections::VecDeque;

	use super::HidLink;
	use crate::error::TransportError;
	use crate::protocol::{Command, FirmwareInfo, REPORT_IN_SIZE, REPORT_OUT_SIZE};

	/// Records every outbound report and answers reads from a prepared queue.
	#[derive(Default)]
	pub(crate) struct ScriptedLink
	{
		pub sent: Vec<Vec<u8>>,
		pub responses: VecDeque<Vec<u8>>,
		pub fail_next_write: bool,
		pub fail_next_read: bool,
		/// When set, writes report that no byte moved.
		pub write_blocked: bool,
	}

	impl HidLink for ScriptedLink
	{
		fn write(&mut self, report: &[u8]) -> Result<usize, TransportError>
		{
			if self.write_blocked {
				return Ok(0);
			}
			if self.fail_next_write {
				self.fail_next_write = false;
				return Err(TransportError::Fail("scripted write failure".into()));
			}
			self.sent.push(report.to_vec());
			Ok(report.len())
		}

		fn read(&mut self, report: &mut [u8]) -> Result<usize, TransportError>
		{
			if self.fail_next_read {
				self.fail_next_read = false;
				return Err(TransportError::Fail("scripted read failure".into()));
			}
			match self.responses.pop_front() {
				Some(frame) => {
					report[..frame.len()].copy_from_slice(&frame);
					Ok(frame.len())
				},
				None => Ok(0),
			}
		}
	}

	/// A minimal model of the device-side bootloader: 64KiB of flash, the
	/// erase/program/read/sign semantics, and a FIRMWARE_INFO response.
	/// Records the command byte of every report it is sent.
	pub(crate) struct MockBootloader
	{
		pub flash: Vec<u8>,
		pub info: FirmwareInfo,
		pub commands: Vec<u8>,
		pub sent: Vec<Vec<u8>>,
		/// Write a mangled signature word, as a failing flash would.
		pub sign_corrupt: bool,
		/// Silently drop program packets, as a worn-out flash would.
		pub program_ignored: bool,
		responses: VecDeque<[u8; REPORT_IN_SIZE]>,
	}

	impl MockBootloader
	{
		pub fn new(info: FirmwareInfo) -> Self
		{
			Self {
				flash: vec![0xFF; 0x1_0000],
				info,
				commands: Vec::new(),
				sent: Vec::new(),
				sign_corrupt: false,
				program_ignored: false,
				responses: VecDeque::new(),
			}
		}

		fn handle(&mut self, report: &[u8])
		{
			let command = report[1];
			let address = u32::from_le_bytes([report[2], report[3], report[4], report[5]]) as usize;
			let length = report[6] as usize;

			if command == Command::EraseDevice as u8 {
				self.flash.fill(0xFF);
			} else if command == Command::ProgramDevice as u8 {
				if !self.program_ignored {
					// The count field carries the true fragment length; the
					// data field holds it padded out to a whole flash word.
					let padded = length.next_multiple_of(2);
					let payload = &report[REPORT_OUT_SIZE - padded..];
					self.flash[address..address + padded].copy_from_slice(payload);
				}
			} else if command == Command::SignFlash as u8 {
				let mut signature = self.info.signature_value.to_le_bytes();
				if self.sign_corrupt {
					signature[0] ^= 0xFF;
				}
				let at = self.info.signature_address as usize;
				self.flash[at] = signature[0];
				self.flash[at + 1] = signature[1];
			} else if command == Command::GetData as u8 {
				let mut frame = [0u8; REPORT_IN_SIZE];
				frame[0] = Command::GetData as u8;
				frame[1..5].copy_from_slice(&(address as u32).to_le_bytes());
				frame[5] = length as u8;
				frame[REPORT_IN_SIZE - length..].copy_from_slice(&self.flash[address..address + length]);
				self.responses.push_back(frame);
			} else if command == Command::FirmwareInfo as u8 {
				let mut frame = [0u8; REPORT_IN_SIZE];
				frame[0] = Command::FirmwareInfo as u8;
				frame[1..3].copy_from_slice(&self.info.bootloader_version.to_le_bytes());
				frame[3..5].copy_from_slice(&self.info.application_version.to_le_bytes());
				frame[5..9].copy_from_slice(&self.info.signature_address.to_le_bytes());
				frame[9..11].copy_from_slice(&self.info.signature_value.to_le_bytes());
				frame[11..15].copy_from_slice(&self.info.erase_page_size.to_le_bytes());
				self.responses.push_back(frame);
			}
		}
	}

	impl HidLink for MockBootloader
	{
		fn write(&mut self, report: &[u8]) -> Result<usize, TransportError>
		{
			self.commands.push(report[1]);
			self.sent.push(report.to_vec());
			self.handle(report);
			Ok(report.len())
		}

		fn read(&mut self, report: &mut [u8]) -> Result<usize, TransportError>
		{
			match self.responses.pop_front() {
				Some(frame) => {
					report[..frame.len()].copy_from_slice(&frame);
					Ok(frame.len())
				},
				None => Ok(0),
			}
		}
	}
}
