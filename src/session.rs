// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 Mid-Ohio Area Robotics
//! Session controller: the coarse verbs a shell drives the core with.
//!
//! Owns the protocol client, the device's memory map, the parsed hex
//! image (once a file is loaded) and the cached firmware info. All
//! feedback to the operator flows one way through a [SessionEvent]
//! channel; the shell decides how to render it.

use std::path::Path;
use std::sync::mpsc::{Receiver, Sender, channel};

use log::{info, warn};

use crate::WriteOptions;
use crate::bootloader::{BootloaderClient, ConnState};
use crate::error::{FlashError, LoadError, MemoryError, TransportError};
use crate::flasher::FlashCycle;
use crate::ihex::import_hex_file;
use crate::memory::DeviceMap;
use crate::protocol::FirmwareInfo;
use crate::usb::DevicePort;

/// Feedback emitted by the core while a verb runs.
#[derive(Debug, Clone)]
pub enum SessionEvent
{
	/// Overall cycle progress, 0 to 100.
	Progress(u32),
	/// A line of operator-readable text.
	Log(String),
	/// A device operation began.
	IoStarted(&'static str),
	/// A device operation finished, with its wall-clock duration.
	IoCompleted
	{
		label: &'static str,
		status: IoStatus,
		seconds: f64,
	},
}

/// Coarse outcome attached to an [SessionEvent::IoCompleted].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoStatus
{
	Success,
	NotConnected,
	Timeout,
	Failed,
}

impl IoStatus
{
	/// Operator text in the shape the status line expects,
	/// e.g. "Erase Complete (1.2s)".
	pub fn describe(self, seconds: f64) -> String
	{
		match self {
			Self::Success => format!("Complete ({seconds:.1}s)"),
			Self::NotConnected => "Failed. Muribot not connected.".into(),
			Self::Timeout => format!("Timed out waiting for response ({seconds:.1}s)"),
			Self::Failed => "Failed.".into(),
		}
	}
}

impl From<&TransportError> for IoStatus
{
	fn from(error: &TransportError) -> Self
	{
		match error {
			TransportError::NotConnected => Self::NotConnected,
			TransportError::Timeout => Self::Timeout,
			_ => Self::Failed,
		}
	}
}

/// Sending half of the event stream. Cloneable; a sink without a channel
/// silently discards everything, which suits headless use and tests.
#[derive(Clone)]
pub struct EventSink
{
	sender: Option<Sender<SessionEvent>>,
}

impl EventSink
{
	pub fn new(sender: Sender<SessionEvent>) -> Self
	{
		Self {
			sender: Some(sender),
		}
	}

	/// A connected sink plus the receiving end for the shell to drain.
	pub fn channel() -> (Self, Receiver<SessionEvent>)
	{
		let (sender, receiver) = channel();
		(Self::new(sender), receiver)
	}

	/// A sink that drops every event.
	pub fn disconnected() -> Self
	{
		Self {
			sender: None,
		}
	}

	fn send(&self, event: SessionEvent)
	{
		if let Some(sender) = &self.sender {
			// A hung-up receiver just means nobody is watching any more.
			let _ = sender.send(event);
		}
	}

	pub fn progress(&self, percent: u32)
	{
		self.send(SessionEvent::Progress(percent));
	}

	pub fn log(&self, message: impl Into<String>)
	{
		self.send(SessionEvent::Log(message.into()));
	}

	pub fn io_started(&self, label: &'static str)
	{
		self.send(SessionEvent::IoStarted(label));
	}

	pub fn io_completed(&self, label: &'static str, status: IoStatus, seconds: f64)
	{
		self.send(SessionEvent::IoCompleted {
			label,
			status,
			seconds,
		});
	}
}

/// The live programming session against one (possibly absent) Muribot.
pub struct Session<P: DevicePort>
{
	port: P,
	client: BootloaderClient<P::Link>,
	device_map: DeviceMap,
	hex_map: Option<DeviceMap>,
	firmware_info: Option<FirmwareInfo>,
	options: WriteOptions,
	events: EventSink,
	busy: bool,
	present: bool,
}

impl<P: DevicePort> Session<P>
{
	pub fn new(port: P, events: EventSink) -> Result<Self, MemoryError>
	{
		Ok(Self {
			port,
			client: BootloaderClient::new(),
			device_map: DeviceMap::muribot()?,
			hex_map: None,
			firmware_info: None,
			options: WriteOptions::default(),
			events,
			busy: false,
			present: false,
		})
	}

	pub fn options(&self) -> WriteOptions
	{
		self.options
	}

	pub fn set_options(&mut self, options: WriteOptions)
	{
		self.options = options;
	}

	pub fn firmware_info(&self) -> Option<FirmwareInfo>
	{
		self.firmware_info
	}

	pub fn hex_loaded(&self) -> bool
	{
		self.hex_map.is_some()
	}

	fn conn_state(&self) -> ConnState
	{
		if self.client.is_connected() {
			self.client.state()
		} else if self.present {
			ConnState::Present
		} else {
			ConnState::Disconnected
		}
	}

	/// Re-enumerate and react to attach/detach edges. Idempotent, and a
	/// no-op while a pipeline is in flight so the worker keeps exclusive
	/// use of the link.
	///
	/// A transport fault drops the handle but leaves the device on the
	/// bus, so "present but not connected" is also treated as a fresh
	/// attachment and re-opened here.
	pub fn poll_connection(&mut self) -> ConnState
	{
		if self.busy {
			return self.conn_state();
		}

		let was_present = self.present;
		self.present = self.port.device_present();

		if self.present {
			if !self.client.is_connected() {
				if !was_present {
					self.events.log("Muribot detected!");
					self.events.log("Attempting to connect...");
				}
				match self.port.open() {
					Ok(link) => {
						self.client.attach(link);
						if let Err(error) = self.connect_sequence() {
							warn!("Failed to bring the bootloader up: {error}");
							self.client.close();
						}
					},
					Err(error) => warn!("Unable to open device: {error}"),
				}
			}
		} else if was_present {
			warn!("Muribot detached");
			self.client.close();
			self.hex_map = None;
			self.firmware_info = None;
			self.events.log("Muribot detached.");
			self.events.progress(0);
		}
		self.conn_state()
	}

	/// A fresh connection is engaged and interrogated before anything else
	/// may talk to it. The Muribot has no bootloader jumper, so the engage
	/// command is what keeps the device from launching the application.
	fn connect_sequence(&mut self) -> Result<(), TransportError>
	{
		self.client.engage_bootloader()?;
		let info = self.client.read_firmware_info()?;
		self.firmware_info = Some(info);
		info!(
			"Connected; bootloader {:#06x}, application {:#06x}",
			info.bootloader_version, info.application_version
		);
		self.events.log("Connected to Muribot");
		self.events
			.log(format!("Application Version: {:#x}", info.application_version));
		self.events
			.log(format!("Bootloader Version: {:#x}", info.bootloader_version));
		Ok(())
	}

	/// Parse `path` into a fresh hex map sharing the device map's layout.
	/// Replaces any previously loaded file; on error no file stays loaded.
	pub fn load_file(&mut self, path: &Path) -> Result<(), LoadError>
	{
		self.hex_map = None;
		let mut map = self.device_map.clone_layout().map_err(LoadError::Memory)?;
		import_hex_file(path, &mut map)?;
		self.hex_map = Some(map);

		let name = path.file_name().map(|name| name.to_string_lossy().into_owned());
		self.events
			.log(format!("Opened: {}", name.unwrap_or_else(|| path.display().to_string())));
		Ok(())
	}

	/// Run the full erase/program/verify/sign cycle with the loaded file.
	pub fn write(&mut self) -> Result<(), FlashError>
	{
		if !self.options.write_flash && !self.options.write_eeprom {
			return Err(FlashError::NothingEnabled);
		}
		let info = self
			.firmware_info
			.ok_or(FlashError::Transport(TransportError::NotConnected))?;
		let Some(hex_map) = self.hex_map.as_ref() else {
			return Err(FlashError::NoFileLoaded);
		};

		self.busy = true;
		let result =
			FlashCycle::new(&mut self.client, &self.events, self.options).write(&mut self.device_map, hex_map, info);
		self.busy = false;

		let refreshed = result?;
		self.firmware_info = Some(refreshed);
		Ok(())
	}

	/// Bulk-erase the device without programming anything.
	pub fn erase(&mut self) -> Result<(), FlashError>
	{
		self.busy = true;
		let result = FlashCycle::new(&mut self.client, &self.events, self.options).erase();
		self.busy = false;

		let info = result?;
		self.firmware_info = Some(info);
		Ok(())
	}

	/// Leave the bootloader and start the installed application.
	pub fn reset(&mut self) -> Result<(), TransportError>
	{
		self.events.log("Resetting firmware...");
		self.client.reset()
	}
}
