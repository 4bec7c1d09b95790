// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 Mid-Ohio Area Robotics
//! Streaming Intel HEX importer.
//!
//! Reads a hex file record by record and projects its data bytes into the
//! shadow buffers of a [DeviceMap]. Only the four record types the
//! bootloader flow needs are recognised; anything else is treated as a
//! malformed file. Bytes falling outside every programmable region are
//! silently discarded - a file in which *nothing* lands is an error.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str;

use log::debug;

use crate::error::LoadError;
use crate::memory::DeviceMap;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RecordType
{
	Data,
	EndOfFile,
	ExtendedSegmentAddress,
	ExtendedLinearAddress,
}

impl RecordType
{
	fn from_byte(value: u8) -> Option<Self>
	{
		match value {
			0x00 => Some(Self::Data),
			0x01 => Some(Self::EndOfFile),
			0x02 => Some(Self::ExtendedSegmentAddress),
			0x04 => Some(Self::ExtendedLinearAddress),
			_ => None,
		}
	}
}

struct Record
{
	address: u16,
	record_type: RecordType,
	payload: Vec<u8>,
}

/// Import `path` into the shadow buffers of `map`.
///
/// On success at least one byte landed in a programmable region. On any
/// error the map's buffers may have been partially written; callers are
/// expected to discard the map rather than reuse it.
pub fn import_hex_file(path: &Path, map: &mut DeviceMap) -> Result<(), LoadError>
{
	let file = File::open(path).map_err(|source| LoadError::CouldNotOpenFile {
		path: path.to_path_buf(),
		source,
	})?;
	import_hex(BufReader::new(file), map)
}

/// Import an Intel HEX stream into the shadow buffers of `map`.
pub fn import_hex(reader: impl BufRead, map: &mut DeviceMap) -> Result<(), LoadError>
{
	let mut segment_base = 0u32;
	let mut imported_any = false;

	for (index, line) in reader.lines().enumerate() {
		let line_number = index + 1;
		let record = parse_record(&line?, line_number)?;

		match record.record_type {
			RecordType::Data => {
				// Address arithmetic wraps, as it does in the bootloader:
				// anything that lands outside the map is discarded anyway.
				let line_address = segment_base.wrapping_add(u32::from(record.address));
				for (offset, &byte) in record.payload.iter().enumerate() {
					// Bytes aimed outside every programmable region are
					// discarded without comment - hex files routinely carry
					// config words and debug sections we must not touch.
					if let Some(location) = map.locate(line_address.wrapping_add(offset as u32)) {
						map.ranges_mut()[location.range].buffer_mut()[location.offset] = byte;
						imported_any = true;
					}
				}
			},
			RecordType::EndOfFile => break,
			RecordType::ExtendedSegmentAddress => {
				segment_base = u32::from(u16::from_be_bytes([record.payload[0], record.payload[1]])) << 4;
				debug!("Hex segment base now {segment_base:#x} (extended segment address)");
			},
			RecordType::ExtendedLinearAddress => {
				segment_base = u32::from(u16::from_be_bytes([record.payload[0], record.payload[1]])) << 16;
				debug!("Hex segment base now {segment_base:#x} (extended linear address)");
			},
		}
	}

	if imported_any {
		debug!("Hex file imported successfully");
		Ok(())
	} else {
		Err(LoadError::NoneInRange)
	}
}

/// Parse and checksum one `:`-prefixed ASCII record.
fn parse_record(line: &str, line_number: usize) -> Result<Record, LoadError>
{
	let malformed = || LoadError::MalformedRecord {
		line: line_number,
	};

	let bytes = line.as_bytes();
	if bytes.first() != Some(&b':') || bytes.len() < 11 {
		return Err(malformed());
	}

	let byte_count = hex_byte(bytes, 1).ok_or_else(malformed)?;
	// `:` + count + address + type + payload + checksum, two chars per byte
	if bytes.len() < 11 + 2 * byte_count as usize {
		return Err(malformed());
	}

	let address_high = hex_byte(bytes, 3).ok_or_else(malformed)?;
	let address_low = hex_byte(bytes, 5).ok_or_else(malformed)?;
	let type_byte = hex_byte(bytes, 7).ok_or_else(malformed)?;

	let mut checksum = byte_count
		.wrapping_add(address_high)
		.wrapping_add(address_low)
		.wrapping_add(type_byte);

	let mut payload = Vec::with_capacity(byte_count as usize);
	for index in 0..byte_count as usize {
		let byte = hex_byte(bytes, 9 + 2 * index).ok_or_else(malformed)?;
		checksum = checksum.wrapping_add(byte);
		payload.push(byte);
	}

	// The record checksum is the two's complement of the byte sum, so the
	// whole line sums to zero when intact.
	let computed = (!checksum).wrapping_add(1);
	let stated = hex_byte(bytes, 9 + 2 * byte_count as usize).ok_or_else(malformed)?;
	if stated != computed {
		return Err(LoadError::ChecksumMismatch {
			line: line_number,
			stated,
			computed,
		});
	}

	let record_type = RecordType::from_byte(type_byte).ok_or_else(malformed)?;
	// Both extended-address flavours carry exactly one big-endian u16.
	if matches!(
		record_type,
		RecordType::ExtendedSegmentAddress | RecordType::ExtendedLinearAddress
	) && byte_count != 2
	{
		return Err(malformed());
	}

	Ok(Record {
		address: u16::from_be_bytes([address_high, address_low]),
		record_type,
		payload,
	})
}

/// Decode the two ASCII hex digits at char offset `at`.
fn hex_byte(line: &[u8], at: usize) -> Option<u8>
{
	let pair = line.get(at..at + 2)?;
	u8::from_str_radix(str::from_utf8(pair).ok()?, 16).ok()
}
