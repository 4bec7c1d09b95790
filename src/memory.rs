// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 Mid-Ohio Area Robotics
//! Typed model of the programmable memory on the robot's microcontroller.
//!
//! A [DeviceMap] is an ordered set of [MemoryRange]s, each mirroring one
//! programmable region of the device with a host-side shadow buffer. The
//! hex importer fills the buffers through [DeviceMap::locate]; the flash
//! pipeline walks them range by range.

use std::fmt::{self, Display, Formatter};

use log::debug;

use crate::error::MemoryError;

/// The kinds of programmable region the bootloader knows about.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegionKind
{
	Program,
	Eeprom,
	Config,
	UserId,
}

impl RegionKind
{
	/// How many hex-file bytes make up one device address of this kind.
	pub const fn bytes_per_address(self) -> u32
	{
		// Uniformly 1 on this device. The range arithmetic stays generic
		// so a future part with 16-bit word addressing only changes this.
		1
	}

	/// The smallest write unit of this kind - program packets must never
	/// split a word.
	pub const fn bytes_per_word(self) -> u32
	{
		match self {
			Self::Program => 2,
			_ => 1,
		}
	}

	/// Whether hex file contents may be imported into a region of this kind.
	/// Config words and user ID are left strictly alone by the host.
	pub const fn importable(self) -> bool
	{
		matches!(self, Self::Program | Self::Eeprom)
	}
}

impl Display for RegionKind
{
	fn fmt(&self, f: &mut Formatter) -> fmt::Result
	{
		match self {
			Self::Program => write!(f, "program flash"),
			Self::Eeprom => write!(f, "EEPROM"),
			Self::Config => write!(f, "config words"),
			Self::UserId => write!(f, "user ID"),
		}
	}
}

/// One programmable region of the device plus its host-side shadow buffer.
///
/// `start` and `end` are device addresses (`end` exclusive); the buffer
/// holds `(end - start) * bytes_per_address` bytes, `0xFF`-filled until
/// something writes into it (`0xFF` being the erased state of the flash).
#[derive(Debug)]
pub struct MemoryRange
{
	kind: RegionKind,
	start: u32,
	end: u32,
	bytes_per_address: u32,
	bytes_per_word: u32,
	buffer: Box<[u8]>,
}

/// Result of looking a hex-file linear address up in a [DeviceMap].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Location
{
	/// Index of the matching range within the map.
	pub range: usize,
	/// Byte offset of the addressed byte within the range's shadow buffer.
	pub offset: usize,
	/// The device address the byte belongs to.
	pub device_address: u32,
	/// Whether this is the very last byte of the very last address of the range.
	pub end_of_range: bool,
}

impl MemoryRange
{
	fn new(kind: RegionKind, address_count: u32, start: u32) -> Result<Self, MemoryError>
	{
		Self::with_geometry(kind, address_count, start, kind.bytes_per_address(), kind.bytes_per_word())
	}

	/// Build a range with explicit geometry rather than the kind's defaults.
	/// The compiled-in descriptor never needs this; the lookup arithmetic
	/// is kept honest for `bytes_per_address > 1` through it.
	pub(crate) fn with_geometry(
		kind: RegionKind,
		address_count: u32,
		start: u32,
		bytes_per_address: u32,
		bytes_per_word: u32,
	) -> Result<Self, MemoryError>
	{
		let bytes = address_count as usize * bytes_per_address as usize;
		// The shadow buffer is the one allocation that scales with the
		// device descriptor, so fail politely rather than aborting.
		let mut buffer = Vec::new();
		buffer
			.try_reserve_exact(bytes)
			.map_err(|_| MemoryError::InsufficientMemory {
				bytes,
			})?;
		buffer.resize(bytes, 0xFF);

		Ok(Self {
			kind,
			start,
			end: start + address_count,
			bytes_per_address,
			bytes_per_word,
			buffer: buffer.into_boxed_slice(),
		})
	}

	pub fn kind(&self) -> RegionKind
	{
		self.kind
	}

	/// First device address of the range.
	pub fn start(&self) -> u32
	{
		self.start
	}

	/// One past the last device address of the range.
	pub fn end(&self) -> u32
	{
		self.end
	}

	pub fn bytes_per_address(&self) -> u32
	{
		self.bytes_per_address
	}

	pub fn bytes_per_word(&self) -> u32
	{
		self.bytes_per_word
	}

	pub fn buffer(&self) -> &[u8]
	{
		&self.buffer
	}

	pub fn buffer_mut(&mut self) -> &mut [u8]
	{
		&mut self.buffer
	}

	fn overlaps(&self, kind: RegionKind, start: u32, end: u32) -> bool
	{
		self.kind == kind && start < self.end && end > self.start
	}
}

/// The full set of programmable regions for one device.
#[derive(Debug, Default)]
pub struct DeviceMap
{
	ranges: Vec<MemoryRange>,
}

impl DeviceMap
{
	/// The compiled-in descriptor for the Muribot's PIC18F46J50: 4KiB of
	/// bootloadable program flash and the config words at the top of memory.
	pub fn muribot() -> Result<Self, MemoryError>
	{
		let mut map = Self::default();
		map.add_range(RegionKind::Program, 0x1000, 0xEC00)?;
		map.add_range(RegionKind::Config, 0x0008, 0xFFF8)?;
		Ok(map)
	}

	/// Append a range of `address_count` device addresses starting at
	/// `start_address`, allocating its `0xFF`-filled shadow buffer.
	pub fn add_range(&mut self, kind: RegionKind, address_count: u32, start_address: u32) -> Result<(), MemoryError>
	{
		let end = start_address + address_count;
		if self.ranges.iter().any(|range| range.overlaps(kind, start_address, end)) {
			return Err(MemoryError::RangeOverlap {
				kind,
				start: start_address,
			});
		}

		let range = MemoryRange::new(kind, address_count, start_address)?;
		debug!(
			"Added {} range [{:#06x}, {:#06x}) ({} bytes of shadow buffer)",
			kind,
			range.start(),
			range.end(),
			range.buffer().len()
		);
		self.ranges.push(range);
		Ok(())
	}

	pub fn ranges(&self) -> &[MemoryRange]
	{
		&self.ranges
	}

	pub fn ranges_mut(&mut self) -> &mut [MemoryRange]
	{
		&mut self.ranges
	}

	/// Duplicate the layout of this map - same regions and geometry, fresh
	/// `0xFF`-filled buffers.
	pub fn clone_layout(&self) -> Result<Self, MemoryError>
	{
		let mut map = Self::default();
		for range in &self.ranges {
			map.ranges.push(MemoryRange::with_geometry(
				range.kind,
				range.end - range.start,
				range.start,
				range.bytes_per_address,
				range.bytes_per_word,
			)?);
		}
		Ok(map)
	}

	/// Look up the hex-file linear byte address `host_address` in the map.
	///
	/// Only program flash and EEPROM ranges participate; bytes aimed at
	/// config or user ID space are reported as unmapped. Pure lookup -
	/// never mutates the map.
	pub fn locate(&self, host_address: u32) -> Option<Location>
	{
		for (index, range) in self.ranges.iter().enumerate() {
			if !range.kind.importable() {
				continue;
			}

			let per_address = range.bytes_per_address;
			let device_address = host_address / per_address;
			if device_address < range.start || device_address >= range.end {
				continue;
			}

			let byte_within_address = host_address % per_address;
			let offset = ((device_address - range.start) * per_address + byte_within_address) as usize;
			let end_of_range = device_address == range.end - 1 && byte_within_address == per_address - 1;
			return Some(Location {
				range: index,
				offset,
				device_address,
				end_of_range,
			});
		}
		None
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn muribot_descriptor()
	{
		let map = DeviceMap::muribot().unwrap();
		let ranges = map.ranges();
		assert_eq!(ranges.len(), 2);

		assert_eq!(ranges[0].kind(), RegionKind::Program);
		assert_eq!(ranges[0].start(), 0xEC00);
		assert_eq!(ranges[0].end(), 0xFC00);
		assert_eq!(ranges[0].buffer().len(), 0x1000);
		assert!(ranges[0].buffer().iter().all(|&byte| byte == 0xFF));

		assert_eq!(ranges[1].kind(), RegionKind::Config);
		assert_eq!(ranges[1].start(), 0xFFF8);
		assert_eq!(ranges[1].end(), 0x1_0000);
		assert_eq!(ranges[1].buffer().len(), 8);
	}

	#[test]
	fn locate_program_bounds()
	{
		let map = DeviceMap::muribot().unwrap();

		let first = map.locate(0xEC00).unwrap();
		assert_eq!(first.range, 0);
		assert_eq!(first.offset, 0);
		assert_eq!(first.device_address, 0xEC00);
		assert!(!first.end_of_range);

		let last = map.locate(0xFBFF).unwrap();
		assert_eq!(last.offset, 0x0FFF);
		assert_eq!(last.device_address, 0xFBFF);
		assert!(last.end_of_range);

		assert!(map.locate(0xFC00).is_none());
		assert!(map.locate(0x0000).is_none());
	}

	#[test]
	fn locate_skips_config_space()
	{
		// Config words are mapped but must never be filled from a hex file.
		let map = DeviceMap::muribot().unwrap();
		assert!(map.locate(0xFFF8).is_none());
		assert!(map.locate(0xFFFF).is_none());
	}

	#[test]
	fn locate_with_two_bytes_per_address()
	{
		// No Muribot region uses more than one byte per address, but the
		// arithmetic has to hold for word-addressed parts too.
		let mut map = DeviceMap::default();
		map.ranges
			.push(MemoryRange::with_geometry(RegionKind::Program, 4, 0x100, 2, 2).unwrap());
		assert_eq!(map.ranges()[0].buffer().len(), 8);

		let loc = map.locate(0x204).unwrap();
		assert_eq!(loc.device_address, 0x102);
		assert_eq!(loc.offset, 4);
		assert!(!loc.end_of_range);

		// Second byte of the final word address is the end of the range.
		let last = map.locate(0x207).unwrap();
		assert_eq!(last.device_address, 0x103);
		assert_eq!(last.offset, 7);
		assert!(last.end_of_range);

		// First byte of the final word address is not.
		assert!(!map.locate(0x206).unwrap().end_of_range);

		assert!(map.locate(0x1FF).is_none());
		assert!(map.locate(0x208).is_none());
	}

	#[test]
	fn overlapping_ranges_rejected()
	{
		let mut map = DeviceMap::default();
		map.add_range(RegionKind::Program, 0x100, 0x1000).unwrap();
		let result = map.add_range(RegionKind::Program, 0x100, 0x10FF);
		assert!(matches!(result, Err(MemoryError::RangeOverlap { .. })));

		// A different kind may share the address space.
		map.add_range(RegionKind::Eeprom, 0x100, 0x1000).unwrap();
	}

	#[test]
	fn clone_layout_resets_buffers()
	{
		let mut map = DeviceMap::muribot().unwrap();
		map.ranges_mut()[0].buffer_mut()[0] = 0xAB;

		let fresh = map.clone_layout().unwrap();
		assert_eq!(fresh.ranges().len(), map.ranges().len());
		assert_eq!(fresh.ranges()[0].start(), map.ranges()[0].start());
		assert!(fresh.ranges()[0].buffer().iter().all(|&byte| byte == 0xFF));
	}
}
