// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 Mid-Ohio Area Robotics

use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, crate_description, crate_version};
use color_eyre::eyre::{Context, Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use muriutil::WriteOptions;
use muriutil::bootloader::ConnState;
use muriutil::session::{EventSink, Session, SessionEvent};
use muriutil::usb::UsbPort;

#[derive(Parser)]
#[command(
	version,
	about = format!("{} v{}", crate_description!(), crate_version!()),
	arg_required_else_help(true)
)]
struct CliArguments
{
	/// How many seconds to wait for a Muribot to be attached
	#[arg(global = true, long = "wait", default_value_t = 30)]
	wait: u64,

	#[command(subcommand)]
	subcommand: CliCommands,
}

#[derive(Subcommand)]
enum CliCommands
{
	/// Program a hex file onto the robot and verify it
	Flash(FlashArguments),
	/// Bulk-erase the robot's program memory
	Erase,
	/// Show bootloader and application version information
	Info,
	/// Leave the bootloader and start the installed application
	Reset,
}

#[derive(Args)]
struct FlashArguments
{
	/// Intel HEX file to program
	file: PathBuf,

	/// Also write the EEPROM region
	#[arg(long)]
	eeprom: bool,

	/// Leave program flash alone (useful with --eeprom)
	#[arg(long = "skip-flash")]
	skip_flash: bool,

	/// Stay in the bootloader after a successful write instead of
	/// starting the application
	#[arg(long = "no-reset")]
	no_reset: bool,
}

/// Render the session's event stream: a progress bar for the write cycle
/// plus the log and operation-status lines above it.
fn spawn_event_printer(receiver: Receiver<SessionEvent>) -> JoinHandle<()>
{
	thread::spawn(move || {
		let bar = ProgressBar::new(100).with_style(
			ProgressStyle::default_bar()
				.template(" {percent:>3}% |{bar:50}| [{elapsed}]")
				.unwrap(),
		);
		for event in receiver {
			match event {
				SessionEvent::Progress(percent) => bar.set_position(u64::from(percent)),
				SessionEvent::Log(message) => bar.println(message),
				SessionEvent::IoStarted(label) => bar.println(format!("{label}...")),
				SessionEvent::IoCompleted {
					label,
					status,
					seconds,
				} => bar.println(format!("{label} {}", status.describe(seconds))),
			}
		}
		bar.finish_and_clear();
	})
}

/// Poll for the robot at 1Hz until the bootloader is engaged or patience
/// runs out.
fn wait_for_connection(session: &mut Session<UsbPort>, seconds: u64) -> Result<()>
{
	let deadline = Instant::now() + Duration::from_secs(seconds);
	loop {
		if session.poll_connection() == ConnState::Engaged {
			return Ok(());
		}
		if Instant::now() >= deadline {
			return Err(eyre!(
				"no Muribot found - check that the USB cable is plugged in and the robot is turned on"
			));
		}
		thread::sleep(Duration::from_secs(1));
	}
}

fn flash(session: &mut Session<UsbPort>, args: &FlashArguments) -> Result<()>
{
	session.set_options(WriteOptions {
		write_flash: !args.skip_flash,
		write_eeprom: args.eeprom,
	});
	session
		.load_file(&args.file)
		.wrap_err_with(|| eyre!("failed to load {} for programming", args.file.display()))?;

	println!("Attempting to program the Muribot.");
	println!("Do not unplug it or turn it off until the operation is fully complete.");
	session.write()?;
	info!("Programming completed successfully");

	if args.no_reset {
		println!("The robot stays in the bootloader; reset it to start the new firmware.");
	} else {
		session.reset()?;
		println!("You may now unplug the Muribot.");
	}
	Ok(())
}

fn info_banner(session: &Session<UsbPort>) -> Result<()>
{
	let info = session
		.firmware_info()
		.ok_or_else(|| eyre!("no firmware information was read from the device"))?;
	println!("Bootloader version:  {:#06x}", info.bootloader_version);
	println!("Application version: {:#06x}", info.application_version);
	println!(
		"Signature word:      {:#06x} @ {:#010x}",
		info.signature_value, info.signature_address
	);
	println!("Erase page size:     {} bytes", info.erase_page_size);
	Ok(())
}

fn main() -> Result<()>
{
	color_eyre::install()?;
	env_logger::Builder::new()
		.filter_level(log::LevelFilter::Info)
		.parse_default_env()
		.init();

	let cli_args = CliArguments::parse();

	let (events, receiver) = EventSink::channel();
	let printer = spawn_event_printer(receiver);

	let mut session = Session::new(UsbPort::new()?, events)?;
	wait_for_connection(&mut session, cli_args.wait)?;

	let result = match &cli_args.subcommand {
		CliCommands::Flash(args) => flash(&mut session, args),
		CliCommands::Erase => session.erase().map_err(Into::into),
		CliCommands::Info => info_banner(&session),
		CliCommands::Reset => session.reset().map_err(Into::into),
	};

	// Dropping the session closes the event channel so the printer can
	// drain and finish before we report the verb's outcome.
	drop(session);
	let _ = printer.join();

	result
}
