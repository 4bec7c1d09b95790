// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 Mid-Ohio Area Robotics
//! The erase / program / verify / sign pipeline.
//!
//! A full write cycle runs five phases against the bootloader: bulk
//! erase, segmented programming of every enabled region, a read-back
//! verify of the same regions, the signature write that marks the image
//! bootable, and a final re-verify of the erase page holding the
//! signature. Progress is reported 0-32% for erase, 33-66% for program
//! and 67-100% for verify, matching what the operator sees as one
//! continuous bar.

use std::time::Instant;

use log::{debug, info, warn};

use crate::WriteOptions;
use crate::bootloader::BootloaderClient;
use crate::error::{FlashError, TransportError};
use crate::memory::{DeviceMap, MemoryRange, RegionKind};
use crate::protocol::{Command, DATA_FIELD_SIZE, FirmwareInfo};
use crate::session::{EventSink, IoStatus};
use crate::usb::HidLink;

/// One run of the pipeline against an engaged bootloader.
pub struct FlashCycle<'cycle, L: HidLink>
{
	client: &'cycle mut BootloaderClient<L>,
	events: &'cycle EventSink,
	options: WriteOptions,
}

impl<'cycle, L: HidLink> FlashCycle<'cycle, L>
{
	pub fn new(client: &'cycle mut BootloaderClient<L>, events: &'cycle EventSink, options: WriteOptions) -> Self
	{
		Self {
			client,
			events,
			options,
		}
	}

	fn region_enabled(&self, kind: RegionKind) -> bool
	{
		match kind {
			RegionKind::Program => self.options.write_flash,
			RegionKind::Eeprom => self.options.write_eeprom,
			// Config words and user ID are never bulk programmed.
			RegionKind::Config | RegionKind::UserId => false,
		}
	}

	/// Bulk erase, with completion polled through the firmware-info
	/// exchange. Also serves the standalone erase verb.
	pub fn erase(&mut self) -> Result<FirmwareInfo, FlashError>
	{
		self.events
			.log("Erasing memory... (no status update until complete, may take several seconds)");
		self.events.io_started("Erase");
		self.events.progress(0);
		let started = Instant::now();

		match self.client.erase() {
			Ok(info) => {
				self.events
					.io_completed("Erase", IoStatus::Success, started.elapsed().as_secs_f64());
				self.events.progress(32);
				Ok(info)
			},
			Err(error) => {
				self.events
					.io_completed("Erase", IoStatus::from(&error), started.elapsed().as_secs_f64());
				Err(FlashError::EraseFailed(error))
			},
		}
	}

	/// Run the full write cycle. `hex_map` holds the parsed file contents,
	/// `device_map` receives the read-back during verify; both share one
	/// layout. Returns the firmware info refreshed by the signing poll.
	pub fn write(
		&mut self,
		device_map: &mut DeviceMap,
		hex_map: &DeviceMap,
		info: FirmwareInfo,
	) -> Result<FirmwareInfo, FlashError>
	{
		self.erase()?;

		self.events.io_started("Write");
		let started = Instant::now();
		for range in hex_map.ranges() {
			if !self.region_enabled(range.kind()) {
				continue;
			}
			if let Err(error) = self.program_region(range) {
				self.events
					.io_completed("Write", IoStatus::Failed, started.elapsed().as_secs_f64());
				return Err(error);
			}
		}
		self.events
			.io_completed("Write", IoStatus::Success, started.elapsed().as_secs_f64());

		self.events.io_started("Verify");
		let started = Instant::now();
		for (device_range, hex_range) in device_map.ranges_mut().iter_mut().zip(hex_map.ranges()) {
			debug_assert_eq!(device_range.start(), hex_range.start());
			if !self.region_enabled(device_range.kind()) {
				continue;
			}
			if let Err(error) = self.verify_region(device_range, hex_range) {
				self.events
					.io_completed("Verify", IoStatus::Failed, started.elapsed().as_secs_f64());
				if matches!(error, FlashError::VerifyFailed { .. }) {
					// Deliberately no erase here: nothing has been signed,
					// so the bootloader will refuse to boot this image.
					warn!("The device now holds a programmed but unsigned image");
					self.events
						.log("Verify failed; the device keeps an unsigned image and stays in the bootloader.");
				}
				return Err(error);
			}
		}

		match self.sign_and_reverify(hex_map, info) {
			Ok(refreshed) => {
				self.events
					.io_completed("Verify", IoStatus::Success, started.elapsed().as_secs_f64());
				self.events.progress(100);
				Ok(refreshed)
			},
			Err(error) => {
				self.events
					.io_completed("Verify", IoStatus::Failed, started.elapsed().as_secs_f64());
				Err(error)
			},
		}
	}

	/// Walk one region in packet-sized windows, skipping the all-0xFF ones.
	///
	/// The erase already left every location at `0xFF`, so blank windows
	/// need no transfer. The bootloader buffers program data internally
	/// though, so each time a run of blank windows begins - and again at
	/// the end of the region - a PROGRAM_COMPLETE is sent to make it flush
	/// what it holds.
	fn program_region(&mut self, range: &MemoryRange) -> Result<(), FlashError>
	{
		let per_address = range.bytes_per_address();
		let per_word = range.bytes_per_word();
		// Never split a word across packets: shrink the window until it is
		// an exact multiple of the write unit.
		let packet_bytes = (DATA_FIELD_SIZE as u32 / per_word) * per_word;

		let buffer = range.buffer();
		let total_addresses = (range.end() - range.start()).max(1);
		let mut address = range.start();
		let mut position = 0usize;
		let mut flush_pending = false;
		let mut last_command = Command::ProgramDevice;

		debug!(
			"Programming {} [{:#06x}, {:#06x})",
			range.kind(),
			range.start(),
			range.end()
		);

		while address < range.end() {
			let percent = 100 - (range.end() - address) * 100 / total_addresses;
			self.events.progress(33 + percent.min(100) / 3);

			let remaining_bytes = (range.end() - address) * per_address;
			let programmed = move |source| FlashError::ProgramFailed {
				address,
				source,
			};

			// Trailing fragment: true length in the packet's count field,
			// data padded up to the next word boundary with the erased value.
			let mut padded = Vec::new();
			let (payload, fragment_length) = if remaining_bytes < packet_bytes {
				debug!("Preparing short packet of final program data with payload {remaining_bytes:#x}");
				padded.extend_from_slice(&buffer[position..position + remaining_bytes as usize]);
				while padded.len() as u32 % per_word != 0 {
					padded.push(0xFF);
				}
				(padded.as_slice(), remaining_bytes as u8)
			} else {
				(
					&buffer[position..position + packet_bytes as usize],
					packet_bytes as u8,
				)
			};

			if payload.iter().any(|&byte| byte != 0xFF) {
				self.client
					.program(address, payload, fragment_length)
					.map_err(programmed)?;
				flush_pending = true;
				last_command = Command::ProgramDevice;
			} else if flush_pending {
				// First blank window after real data: make the bootloader
				// commit its buffer before we skip ahead.
				self.client.program_complete(address).map_err(programmed)?;
				flush_pending = false;
				last_command = Command::ProgramComplete;
			}

			address += packet_bytes / per_address;
			position += packet_bytes as usize;
		}

		if last_command != Command::ProgramComplete {
			self.client.program_complete(range.end()).map_err(|source| {
				FlashError::ProgramFailed {
					address: range.end(),
					source,
				}
			})?;
		}
		Ok(())
	}

	/// Read one region back into the device map's shadow buffer and compare
	/// it byte for byte against the parsed file contents.
	fn verify_region(&mut self, device_range: &mut MemoryRange, hex_range: &MemoryRange) -> Result<(), FlashError>
	{
		let per_address = device_range.bytes_per_address();
		let start = device_range.start();
		let end = device_range.end();
		let total_addresses = (end - start).max(1);

		debug!("Verifying {} [{start:#06x}, {end:#06x})", device_range.kind());

		let mut address = start;
		let mut position = 0usize;
		while address < end {
			let percent = 100 - (end - address) * 100 / total_addresses;
			self.events.progress(67 + percent.min(100) / 3);

			let remaining_bytes = (end - address) * per_address;
			let length = remaining_bytes.min(DATA_FIELD_SIZE as u32) as u8;
			let data = self.client.get_data(address, length)?;
			if data.is_empty() {
				return Err(TransportError::BadFrame("empty data packet during read-back").into());
			}

			device_range.buffer_mut()[position..position + data.len()].copy_from_slice(&data);
			position += data.len();
			address += data.len() as u32 / per_address;
		}

		for (offset, (&actual, &expected)) in device_range
			.buffer()
			.iter()
			.zip(hex_range.buffer())
			.enumerate()
		{
			if actual != expected {
				let address = start + offset as u32 / per_address;
				warn!("Verify mismatch at {address:#06x}: expected {expected:#04x}, read {actual:#04x}");
				return Err(FlashError::VerifyFailed {
					address,
					expected,
					actual,
				});
			}
		}
		Ok(())
	}

	/// Phase D and E: write the signature word, then re-verify the erase
	/// page containing it, with the signature bytes substituted into the
	/// expected data. A mismatch here means the device carries a signed
	/// image we cannot trust, so it is forcibly erased before reporting.
	fn sign_and_reverify(&mut self, hex_map: &DeviceMap, info: FirmwareInfo) -> Result<FirmwareInfo, FlashError>
	{
		self.events.log("Signing flash...");
		let refreshed = self.client.sign_flash()?;
		debug!(
			"Signature word {:#06x} written at {:#06x}",
			info.signature_value, info.signature_address
		);

		let page = info.erase_page_size;
		let block_start = info.signature_address - info.signature_address % page;

		let mut actual = Vec::with_capacity(page as usize);
		let mut address = block_start;
		while address < block_start + page {
			let length = (block_start + page - address).min(DATA_FIELD_SIZE as u32) as u8;
			let data = self.client.get_data(address, length)?;
			if data.is_empty() {
				return Err(TransportError::BadFrame("empty data packet during read-back").into());
			}
			address += data.len() as u32;
			actual.extend_from_slice(&data);
		}

		let expected = expected_signature_page(hex_map, &info, block_start);
		if let Some(offset) = expected.iter().zip(&actual).position(|(a, b)| a != b) {
			warn!("Post signing verify failure at {:#06x}", block_start + offset as u32);
			// The signature might be valid even though the data is not,
			// which would let the device boot a corrupt application. Erase
			// so it cannot.
			if let Err(error) = self.client.erase() {
				warn!("Follow-up erase after post-sign verify failure also failed: {error}");
			}
			self.events
				.log("Post-sign verify failed; the device was erased to invalidate the signature.");
			return Err(FlashError::PostSignVerifyFailed {
				address: block_start + offset as u32,
				expected: expected[offset],
				actual: actual[offset],
			});
		}

		info!("Programming completed successfully");
		Ok(refreshed)
	}
}

/// Build the expected contents of the erase page at `block_start`: the
/// parsed file data where it overlaps the page, with the two signature
/// bytes replaced by what the bootloader just wrote - the file's own
/// contents at those addresses no longer apply once signed.
fn expected_signature_page(hex_map: &DeviceMap, info: &FirmwareInfo, block_start: u32) -> Vec<u8>
{
	let page = info.erase_page_size;
	let mut expected = vec![0xFF; page as usize];

	for range in hex_map.ranges() {
		for (offset, byte) in expected.iter_mut().enumerate() {
			let address = block_start + offset as u32;
			if address >= range.start() && address < range.end() {
				*byte = range.buffer()[(address - range.start()) as usize];
			}
		}
	}

	let signature = info.signature_value.to_le_bytes();
	let low = (info.signature_address - block_start) as usize;
	expected[low] = signature[0];
	if low + 1 < expected.len() {
		expected[low + 1] = signature[1];
	}
	expected
}
