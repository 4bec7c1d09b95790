// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 Mid-Ohio Area Robotics
//! Request/response client for the resident HID bootloader.
//!
//! Owns the HID link and serialises every exchange: no command is issued
//! before the previous one's response (or completion poll) has come back.
//! Commands that produce no response of their own (ERASE_DEVICE,
//! SIGN_FLASH) are chased with a FIRMWARE_INFO exchange, which doubles as
//! a completion poll and refreshes the cached device information.

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::TransportError;
use crate::protocol::{Command, CommandPacket, DataPacket, FirmwareInfo, REPORT_IN_SIZE};
use crate::usb::HidLink;

/// How long a transfer may sit without a byte moving before one retry is
/// burned.
pub const SYNC_WAIT: Duration = Duration::from_secs(40);
/// Sync-wait intervals allowed for an outbound report.
const SEND_RETRIES: u32 = 5;
/// Sync-wait intervals allowed for a response.
const RECEIVE_RETRIES: u32 = 3;

/// Connection lifecycle of the bootloader link.
///
/// `Present` is what enumeration reports before the device has been
/// opened; the client itself only ever sits in the other three states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnState
{
	Disconnected,
	Present,
	Open,
	Engaged,
}

/// The HID bootloader protocol client. Not thread safe - exactly one
/// context may drive it at a time.
pub struct BootloaderClient<L: HidLink>
{
	link: Option<L>,
	state: ConnState,
	sync_wait: Duration,
}

impl<L: HidLink> Default for BootloaderClient<L>
{
	fn default() -> Self
	{
		Self::new()
	}
}

impl<L: HidLink> BootloaderClient<L>
{
	pub fn new() -> Self
	{
		Self::with_sync_wait(SYNC_WAIT)
	}

	/// Build a client with a non-standard sync-wait window. The default
	/// matches the bootloader firmware's worst-case erase stall.
	pub fn with_sync_wait(sync_wait: Duration) -> Self
	{
		Self {
			link: None,
			state: ConnState::Disconnected,
			sync_wait,
		}
	}

	/// Adopt a freshly opened HID link. The connection is `Open` but the
	/// bootloader has not been engaged yet.
	pub fn attach(&mut self, link: L)
	{
		self.link = Some(link);
		self.state = ConnState::Open;
	}

	/// Drop the link, if any, and fall back to `Disconnected`.
	pub fn close(&mut self)
	{
		if self.link.take().is_some() {
			debug!("Closing bootloader connection");
		}
		self.state = ConnState::Disconnected;
	}

	pub fn state(&self) -> ConnState
	{
		self.state
	}

	pub fn is_connected(&self) -> bool
	{
		matches!(self.state, ConnState::Open | ConnState::Engaged)
	}

	/// Direct access to the link, for test assertions against the doubles.
	#[cfg(test)]
	pub(crate) fn link_ref(&self) -> Option<&L>
	{
		self.link.as_ref()
	}

	/// Push one report out, retrying the non-blocking write until a byte
	/// moves. A transport error closes the link; running out of retry
	/// budget does not.
	fn send_packet(&mut self, packet: &CommandPacket) -> Result<(), TransportError>
	{
		let mut timer = Instant::now();
		let mut budget = SEND_RETRIES;
		loop {
			let result = self
				.link
				.as_mut()
				.ok_or(TransportError::NotConnected)?
				.write(packet.as_bytes());
			match result {
				Ok(0) => {
					if timer.elapsed() >= self.sync_wait {
						timer = Instant::now();
						budget -= 1;
						if budget == 0 {
							warn!("Timed out sending command {:#04x}", packet.command());
							return Err(TransportError::Timeout);
						}
					}
				},
				Ok(_) => return Ok(()),
				Err(error) => {
					warn!("HID write failed: {error}");
					self.close();
					return Err(error);
				},
			}
		}
	}

	/// Pull one 64 byte response in, with the same retry discipline as
	/// [Self::send_packet] but a shorter budget.
	fn receive_packet(&mut self) -> Result<[u8; REPORT_IN_SIZE], TransportError>
	{
		let mut frame = [0u8; REPORT_IN_SIZE];
		let mut timer = Instant::now();
		let mut budget = RECEIVE_RETRIES;
		loop {
			let result = self
				.link
				.as_mut()
				.ok_or(TransportError::NotConnected)?
				.read(&mut frame);
			match result {
				Ok(0) => {
					if timer.elapsed() >= self.sync_wait {
						timer = Instant::now();
						budget -= 1;
						if budget == 0 {
							warn!("Timed out waiting for a response packet");
							return Err(TransportError::Timeout);
						}
					}
				},
				Ok(_) => return Ok(frame),
				Err(error) => {
					warn!("HID read failed: {error}");
					self.close();
					return Err(error);
				},
			}
		}
	}

	/// Tell the bootloader the host wants to program it.
	///
	/// The Muribot has no bootloader jumper: the application firmware
	/// drops into the bootloader when it sees this command shortly after
	/// power-up.
	pub fn engage_bootloader(&mut self) -> Result<(), TransportError>
	{
		if !self.is_connected() {
			return Err(TransportError::NotConnected);
		}
		self.send_packet(&CommandPacket::new(Command::EngageBootloader))?;
		debug!("Bootloader engaged");
		self.state = ConnState::Engaged;
		Ok(())
	}

	/// Bulk-erase the device, polling FIRMWARE_INFO for completion.
	pub fn erase(&mut self) -> Result<FirmwareInfo, TransportError>
	{
		let started = Instant::now();
		self.send_packet(&CommandPacket::new(Command::EraseDevice))?;
		// The erase command produces no response of its own; the info
		// exchange below only completes once the erase has finished.
		let info = self.read_firmware_info()?;
		debug!("Erase complete ({:.2}s)", started.elapsed().as_secs_f64());
		Ok(info)
	}

	/// Ask the bootloader to write the signature word, marking the freshly
	/// programmed image bootable. Polled for completion like erase.
	pub fn sign_flash(&mut self) -> Result<FirmwareInfo, TransportError>
	{
		let started = Instant::now();
		self.send_packet(&CommandPacket::new(Command::SignFlash))?;
		let info = self.read_firmware_info()?;
		debug!("Flash signed ({:.2}s)", started.elapsed().as_secs_f64());
		Ok(info)
	}

	/// Fetch version numbers, signature coordinates and the erase page size.
	pub fn read_firmware_info(&mut self) -> Result<FirmwareInfo, TransportError>
	{
		self.send_packet(&CommandPacket::new(Command::FirmwareInfo))?;
		let frame = self.receive_packet()?;
		FirmwareInfo::parse(&frame)
	}

	/// Send one buffered program packet. `fragment_length` is the number
	/// of meaningful bytes; `payload` may be longer when a trailing
	/// fragment was padded out to a word boundary.
	pub fn program(&mut self, address: u32, payload: &[u8], fragment_length: u8) -> Result<(), TransportError>
	{
		let packet = CommandPacket::new(Command::ProgramDevice)
			.with_address(address)
			.with_payload(payload)
			.with_payload_length(fragment_length);
		self.send_packet(&packet)
	}

	/// Flush the bootloader's internal program buffer to flash.
	pub fn program_complete(&mut self, address: u32) -> Result<(), TransportError>
	{
		let packet = CommandPacket::new(Command::ProgramComplete).with_address(address);
		self.send_packet(&packet)
	}

	/// Read `length` bytes back from `address`.
	pub fn get_data(&mut self, address: u32, length: u8) -> Result<Vec<u8>, TransportError>
	{
		let request = CommandPacket::new(Command::GetData)
			.with_address(address)
			.with_payload_length(length);
		self.send_packet(&request)?;

		let frame = self.receive_packet()?;
		let response = DataPacket::parse(&frame)?;
		if response.command != Command::GetData {
			return Err(TransportError::IncorrectCommand {
				expected: Command::GetData as u8,
				received: response.command as u8,
			});
		}
		Ok(response.payload().to_vec())
	}

	/// Leave the bootloader and jump into the application. No response.
	pub fn reset(&mut self) -> Result<(), TransportError>
	{
		self.send_packet(&CommandPacket::new(Command::ResetDevice))?;
		debug!("Reset command sent");
		Ok(())
	}
}

#[cfg(test)]
mod tests
{
	use std::time::Duration;

	use super::*;
	use crate::usb::testing::{MockBootloader, ScriptedLink};

	fn info() -> FirmwareInfo
	{
		FirmwareInfo {
			bootloader_version: 0x0101,
			application_version: 0x0203,
			signature_address: 0xEC04,
			signature_value: 0x600D,
			erase_page_size: 0x40,
		}
	}

	#[test]
	fn commands_refused_while_disconnected()
	{
		let mut client = BootloaderClient::<ScriptedLink>::new();
		assert!(matches!(client.engage_bootloader(), Err(TransportError::NotConnected)));
		assert!(matches!(client.erase(), Err(TransportError::NotConnected)));
		assert!(matches!(client.read_firmware_info(), Err(TransportError::NotConnected)));
		assert!(matches!(client.get_data(0xEC00, 58), Err(TransportError::NotConnected)));
		assert!(matches!(client.program(0xEC00, &[0u8; 58], 58), Err(TransportError::NotConnected)));
		assert!(matches!(client.reset(), Err(TransportError::NotConnected)));
		assert_eq!(client.state(), ConnState::Disconnected);
	}

	#[test]
	fn engage_sends_single_command_and_advances_state()
	{
		let mut client = BootloaderClient::new();
		client.attach(ScriptedLink::default());
		assert_eq!(client.state(), ConnState::Open);

		client.engage_bootloader().unwrap();
		assert_eq!(client.state(), ConnState::Engaged);

		let link = client.link.as_ref().unwrap();
		assert_eq!(link.sent.len(), 1);
		assert_eq!(link.sent[0][1], Command::EngageBootloader as u8);
	}

	#[test]
	fn erase_polls_with_firmware_info()
	{
		let mut client = BootloaderClient::new();
		client.attach(MockBootloader::new(info()));
		client.link.as_mut().unwrap().flash[0xEC00] = 0x42;

		let reported = client.erase().unwrap();
		assert_eq!(reported, info());

		let mock = client.link.as_ref().unwrap();
		assert_eq!(mock.commands, vec![Command::EraseDevice as u8, Command::FirmwareInfo as u8]);
		assert!(mock.flash.iter().all(|&byte| byte == 0xFF));
	}

	#[test]
	fn get_data_returns_right_justified_payload()
	{
		let mut client = BootloaderClient::new();
		client.attach(MockBootloader::new(info()));
		{
			let mock = client.link.as_mut().unwrap();
			mock.flash[0xEC00..0xEC04].copy_from_slice(&[0x10, 0x20, 0x30, 0x40]);
		}

		let data = client.get_data(0xEC00, 4).unwrap();
		assert_eq!(data, vec![0x10, 0x20, 0x30, 0x40]);
	}

	#[test]
	fn incorrect_response_command_is_reported()
	{
		let mut link = ScriptedLink::default();
		// GET_DATA answered with a FIRMWARE_INFO frame.
		let mut frame = vec![0u8; REPORT_IN_SIZE];
		frame[0] = Command::FirmwareInfo as u8;
		link.responses.push_back(frame);

		let mut client = BootloaderClient::new();
		client.attach(link);
		assert!(matches!(
			client.get_data(0xEC00, 8),
			Err(TransportError::IncorrectCommand { .. })
		));
	}

	#[test]
	fn transport_failure_closes_the_link()
	{
		let mut client = BootloaderClient::new();
		let mut link = ScriptedLink::default();
		link.fail_next_write = true;
		client.attach(link);

		assert!(matches!(client.reset(), Err(TransportError::Fail(_))));
		assert_eq!(client.state(), ConnState::Disconnected);
		assert!(client.link.is_none());
	}

	#[test]
	fn receive_timeout_leaves_the_link_open()
	{
		// Zero sync-wait burns one retry per loop pass, so the budget
		// drains without any real waiting.
		let mut client = BootloaderClient::with_sync_wait(Duration::ZERO);
		client.attach(ScriptedLink::default());

		assert!(matches!(client.read_firmware_info(), Err(TransportError::Timeout)));
		assert_eq!(client.state(), ConnState::Open);
		assert!(client.link.is_some());
	}

	#[test]
	fn send_timeout_when_no_byte_moves()
	{
		let mut client = BootloaderClient::with_sync_wait(Duration::ZERO);
		let mut link = ScriptedLink::default();
		link.write_blocked = true;
		client.attach(link);

		assert!(matches!(client.reset(), Err(TransportError::Timeout)));
		// Timeout is not a transport failure: the handle stays open.
		assert_eq!(client.state(), ConnState::Open);
	}
}
