// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 Mid-Ohio Area Robotics
//! Error types for the bootloader core, one enum per origin.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::memory::RegionKind;

/// Errors raised while building a device memory map.
#[derive(Debug, Error)]
pub enum MemoryError
{
	#[error("memory range {kind} @ {start:#06x} overlaps an existing range of the same kind")]
	RangeOverlap
	{
		kind: RegionKind,
		start: u32,
	},

	#[error("failed to allocate {bytes} bytes of shadow buffer")]
	InsufficientMemory
	{
		bytes: usize,
	},
}

/// Errors raised while importing an Intel HEX file into a device map.
#[derive(Debug, Error)]
pub enum LoadError
{
	#[error("could not open file {}", .path.display())]
	CouldNotOpenFile
	{
		path: PathBuf,
		source: io::Error,
	},

	#[error("malformed record on line {line} of the hex file")]
	MalformedRecord
	{
		line: usize,
	},

	#[error("checksum mismatch on line {line} of the hex file (file says {stated:#04x}, computed {computed:#04x})")]
	ChecksumMismatch
	{
		line: usize,
		stated: u8,
		computed: u8,
	},

	#[error("no byte in the hex file falls within a programmable region of the device")]
	NoneInRange,

	#[error(transparent)]
	Memory(#[from] MemoryError),

	#[error("failed to read from the hex file")]
	Io(#[from] io::Error),
}

/// Errors raised by the HID protocol client.
#[derive(Debug, Error)]
pub enum TransportError
{
	#[error("bootloader not connected")]
	NotConnected,

	#[error("timed out waiting for the bootloader to respond")]
	Timeout,

	#[error("HID transfer failed: {0}")]
	Fail(String),

	#[error("bootloader answered with command {received:#04x} where {expected:#04x} was expected")]
	IncorrectCommand
	{
		expected: u8,
		received: u8,
	},

	#[error("malformed response frame: {0}")]
	BadFrame(&'static str),
}

/// Terminal errors of the erase/program/verify/sign pipeline.
#[derive(Debug, Error)]
pub enum FlashError
{
	#[error("bulk erase failed")]
	EraseFailed(#[source] TransportError),

	#[error("programming failed at device address {address:#06x}")]
	ProgramFailed
	{
		address: u32,
		source: TransportError,
	},

	#[error("verify failed at device address {address:#06x} (expected {expected:#04x}, device read back {actual:#04x})")]
	VerifyFailed
	{
		address: u32,
		expected: u8,
		actual: u8,
	},

	#[error("post-sign verify failed at device address {address:#06x} (expected {expected:#04x}, device read back {actual:#04x})")]
	PostSignVerifyFailed
	{
		address: u32,
		expected: u8,
		actual: u8,
	},

	#[error("no hex file has been loaded")]
	NoFileLoaded,

	#[error("nothing to do: flash and EEPROM writes are both disabled")]
	NothingEnabled,

	#[error(transparent)]
	Transport(#[from] TransportError),
}
