// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 Mid-Ohio Area Robotics
//! Wire frames of the Muribot HID bootloader protocol.
//!
//! Every outbound report is a fixed 65 byte buffer: report id, command,
//! a little-endian 32-bit address (or command-specific value), a payload
//! byte count and a 58 byte data field. Inbound reports are the same
//! minus the report id. The data field is *right-justified*: a payload of
//! length L occupies the final L bytes, with padding before it. The
//! device firmware depends on the last data byte sitting at a fixed
//! position, so this must never be "fixed" to left justification.

use crate::error::TransportError;

/// Outbound report length: report id plus 64 data bytes.
pub const REPORT_OUT_SIZE: usize = 65;
/// Inbound report length: no report id on the way back.
pub const REPORT_IN_SIZE: usize = 64;
/// Length of the data field in both directions.
pub const DATA_FIELD_SIZE: usize = 58;

/// Commands understood by the resident bootloader.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Command
{
	UnlockConfig = 0x03,
	EraseDevice = 0x04,
	ProgramDevice = 0x05,
	ProgramComplete = 0x06,
	GetData = 0x07,
	ResetDevice = 0x08,
	SignFlash = 0x09,
	EngageBootloader = 0x0A,
	FirmwareInfo = 0x0C,
}

impl TryFrom<u8> for Command
{
	type Error = TransportError;

	fn try_from(value: u8) -> Result<Self, Self::Error>
	{
		match value {
			0x03 => Ok(Self::UnlockConfig),
			0x04 => Ok(Self::EraseDevice),
			0x05 => Ok(Self::ProgramDevice),
			0x06 => Ok(Self::ProgramComplete),
			0x07 => Ok(Self::GetData),
			0x08 => Ok(Self::ResetDevice),
			0x09 => Ok(Self::SignFlash),
			0x0A => Ok(Self::EngageBootloader),
			0x0C => Ok(Self::FirmwareInfo),
			_ => Err(TransportError::BadFrame("unknown command byte")),
		}
	}
}

/// Builder for one outbound report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket
{
	bytes: [u8; REPORT_OUT_SIZE],
}

impl CommandPacket
{
	/// Start a fresh report for `command`. All other bytes, the report id
	/// included, start out zero.
	pub fn new(command: Command) -> Self
	{
		let mut bytes = [0u8; REPORT_OUT_SIZE];
		bytes[1] = command as u8;
		Self {
			bytes,
		}
	}

	/// Set the 32-bit little-endian address field.
	pub fn with_address(mut self, address: u32) -> Self
	{
		self.bytes[2..6].copy_from_slice(&address.to_le_bytes());
		self
	}

	/// Copy `payload` into the tail of the data field and record its length.
	pub fn with_payload(mut self, payload: &[u8]) -> Self
	{
		debug_assert!(payload.len() <= DATA_FIELD_SIZE);
		self.bytes[6] = payload.len() as u8;
		self.bytes[REPORT_OUT_SIZE - payload.len()..].copy_from_slice(payload);
		self
	}

	/// Overwrite the payload length field alone.
	///
	/// Used by GET_DATA requests (which carry a length but no data) and by
	/// trailing program fragments, whose data is padded out to a word
	/// multiple while the length field keeps the true fragment size.
	pub fn with_payload_length(mut self, length: u8) -> Self
	{
		self.bytes[6] = length;
		self
	}

	pub fn command(&self) -> u8
	{
		self.bytes[1]
	}

	pub fn as_bytes(&self) -> &[u8]
	{
		&self.bytes
	}
}

/// One decoded inbound data report, as answered to GET_DATA.
#[derive(Debug)]
pub struct DataPacket<'frame>
{
	pub command: Command,
	pub address: u32,
	payload: &'frame [u8],
}

impl<'frame> DataPacket<'frame>
{
	pub fn parse(frame: &'frame [u8; REPORT_IN_SIZE]) -> Result<Self, TransportError>
	{
		let command = Command::try_from(frame[0])?;
		let address = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
		let length = frame[5] as usize;
		if length > DATA_FIELD_SIZE {
			return Err(TransportError::BadFrame("payload length exceeds the data field"));
		}

		Ok(Self {
			command,
			address,
			payload: &frame[REPORT_IN_SIZE - length..],
		})
	}

	/// The meaningful bytes of the data field, in device order.
	pub fn payload(&self) -> &'frame [u8]
	{
		self.payload
	}
}

/// What the bootloader reports about itself and the installed application.
///
/// Fetched on every connect, and again after ERASE_DEVICE and SIGN_FLASH
/// as a completion poll. Immutable once read.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FirmwareInfo
{
	pub bootloader_version: u16,
	pub application_version: u16,
	pub signature_address: u32,
	pub signature_value: u16,
	pub erase_page_size: u32,
}

impl FirmwareInfo
{
	pub fn parse(frame: &[u8; REPORT_IN_SIZE]) -> Result<Self, TransportError>
	{
		if frame[0] != Command::FirmwareInfo as u8 {
			return Err(TransportError::IncorrectCommand {
				expected: Command::FirmwareInfo as u8,
				received: frame[0],
			});
		}

		Ok(Self {
			bootloader_version: u16::from_le_bytes([frame[1], frame[2]]),
			application_version: u16::from_le_bytes([frame[3], frame[4]]),
			signature_address: u32::from_le_bytes([frame[5], frame[6], frame[7], frame[8]]),
			signature_value: u16::from_le_bytes([frame[9], frame[10]]),
			erase_page_size: u32::from_le_bytes([frame[11], frame[12], frame[13], frame[14]]),
		})
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn program_packet_layout()
	{
		let packet = CommandPacket::new(Command::ProgramDevice)
			.with_address(0xECA8)
			.with_payload(&[0x11, 0x22, 0x33]);
		let bytes = packet.as_bytes();

		assert_eq!(bytes.len(), REPORT_OUT_SIZE);
		assert_eq!(bytes[0], 0x00, "report id");
		assert_eq!(bytes[1], 0x05, "command byte");
		assert_eq!(&bytes[2..6], &[0xA8, 0xEC, 0x00, 0x00], "little-endian address");
		assert_eq!(bytes[6], 3, "payload length");

		// Right justified: padding first, data in the final three bytes.
		assert!(bytes[7..REPORT_OUT_SIZE - 3].iter().all(|&byte| byte == 0x00));
		assert_eq!(&bytes[REPORT_OUT_SIZE - 3..], &[0x11, 0x22, 0x33]);
	}

	#[test]
	fn full_payload_fills_the_data_field()
	{
		let payload = [0xA5u8; DATA_FIELD_SIZE];
		let packet = CommandPacket::new(Command::ProgramDevice).with_payload(&payload);
		assert_eq!(packet.as_bytes()[6], DATA_FIELD_SIZE as u8);
		assert_eq!(&packet.as_bytes()[7..], &payload);
	}

	#[test]
	fn get_data_request_carries_length_but_no_data()
	{
		let packet = CommandPacket::new(Command::GetData)
			.with_address(0xEC00)
			.with_payload_length(58);
		let bytes = packet.as_bytes();
		assert_eq!(bytes[1], 0x07);
		assert_eq!(bytes[6], 58);
		assert!(bytes[7..].iter().all(|&byte| byte == 0x00));
	}

	#[test]
	fn data_packet_payload_is_right_justified()
	{
		let mut frame = [0u8; REPORT_IN_SIZE];
		frame[0] = Command::GetData as u8;
		frame[1..5].copy_from_slice(&0xEC20u32.to_le_bytes());
		frame[5] = 4;
		frame[REPORT_IN_SIZE - 4..].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);

		let packet = DataPacket::parse(&frame).unwrap();
		assert_eq!(packet.command, Command::GetData);
		assert_eq!(packet.address, 0xEC20);
		assert_eq!(packet.payload(), &[0xDE, 0xAD, 0xBE, 0xEF]);
	}

	#[test]
	fn oversized_payload_length_is_rejected()
	{
		let mut frame = [0u8; REPORT_IN_SIZE];
		frame[0] = Command::GetData as u8;
		frame[5] = 59;
		assert!(matches!(DataPacket::parse(&frame), Err(TransportError::BadFrame(_))));
	}

	#[test]
	fn firmware_info_decodes_little_endian_fields()
	{
		let mut frame = [0u8; REPORT_IN_SIZE];
		frame[0] = Command::FirmwareInfo as u8;
		frame[1..3].copy_from_slice(&0x0102u16.to_le_bytes());
		frame[3..5].copy_from_slice(&0x0304u16.to_le_bytes());
		frame[5..9].copy_from_slice(&0x0000EC04u32.to_le_bytes());
		frame[9..11].copy_from_slice(&0x600Du16.to_le_bytes());
		frame[11..15].copy_from_slice(&0x0000_0400u32.to_le_bytes());

		let info = FirmwareInfo::parse(&frame).unwrap();
		assert_eq!(info.bootloader_version, 0x0102);
		assert_eq!(info.application_version, 0x0304);
		assert_eq!(info.signature_address, 0xEC04);
		assert_eq!(info.signature_value, 0x600D);
		assert_eq!(info.erase_page_size, 0x400);
	}

	#[test]
	fn firmware_info_rejects_wrong_command()
	{
		let mut frame = [0u8; REPORT_IN_SIZE];
		frame[0] = Command::GetData as u8;
		match FirmwareInfo::parse(&frame) {
			Err(TransportError::IncorrectCommand {
				expected,
				received,
			}) => {
				assert_eq!(expected, 0x0C);
				assert_eq!(received, 0x07);
			},
			other => panic!("expected IncorrectCommand, got {other:?}"),
		}
	}
}
