//! devwatch binary
//!
//! Watches USB, serial and ADB devices and prints one JSON object per
//! device-state delta on stdout, flushed per event. Logs go to stderr.
//! With `--watch` the process runs until stdin reaches EOF, which is
//! how the remote bindings drive it as a child process.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{debug, warn};

use adb::blocking::AdbClient;
use watcher::{DeviceInterface, DeviceWatcher, WatchSettings};

#[derive(Parser, Debug)]
#[command(name = "devwatch")]
#[command(
    author,
    version,
    about = "Watch USB, serial and ADB devices and stream state deltas as JSON lines"
)]
#[command(long_about = "
Watches locally attached USB and serial interfaces plus the devices the
ADB server knows about, and prints one JSON object per state change.

EXAMPLES:
    # One-shot snapshot of present devices
    devwatch

    # Keep watching until stdin closes
    devwatch --watch --pretty

    # Only Google devices in ADB or fastboot mode
    devwatch --watch --vids=0x18d1 --types=\"usb,adb|usb,fastboot\"

    # Also watch two network ADB devices
    devwatch --watch --ip-list=10.0.0.5:5555,10.0.0.9:5555
")]
struct Args {
    /// Pretty-print each event with 4-space indentation
    #[arg(long)]
    pretty: bool,

    /// Keep watching until EOF on stdin
    #[arg(long)]
    watch: bool,

    /// USB vid include/exclude list, e.g. "0x18d1,!0x04e8"
    #[arg(long, value_name = "LIST", default_value = "")]
    vids: String,

    /// USB pid include/exclude list, e.g. "0x4ee7,!0x9008"
    #[arg(long, value_name = "LIST", default_value = "")]
    pids: String,

    /// Device type filter, `|` between alternatives: "usb,adb|net"
    #[arg(long, value_name = "FILTER", default_value = "")]
    types: String,

    /// Driver name filter, e.g. "qcserial,WinUSB"
    #[arg(long, value_name = "LIST", default_value = "")]
    drivers: String,

    /// Network ADB endpoints to connect at startup, e.g. "10.0.0.5:5555"
    #[arg(long = "ip-list", alias = "ip_list", value_name = "LIST", default_value = "")]
    ip_list: String,

    /// Rebind usbserial for these vid:pid pairs (requires root)
    #[cfg(target_os = "linux")]
    #[arg(
        long = "usbserial-vidpid",
        alias = "usbserial_vidpid",
        value_name = "LIST",
        default_value = ""
    )]
    usbserial_vidpid: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "warn")]
    log_level: String,
}

fn build_settings(args: &Args) -> common::Result<WatchSettings> {
    let mut settings = WatchSettings::default();

    (settings.include_vids, settings.exclude_vids) = watcher::settings::parse_id_list(&args.vids)?;
    (settings.include_pids, settings.exclude_pids) = watcher::settings::parse_id_list(&args.pids)?;
    settings.type_filters = watcher::settings::parse_type_filters(&args.types)?;
    settings.drivers = watcher::settings::parse_driver_list(&args.drivers);

    #[cfg(target_os = "linux")]
    {
        settings.usbserial_vidpid =
            watcher::settings::parse_vidpid_list(&args.usbserial_vidpid)?;
    }

    Ok(settings)
}

/// Ask the ADB server to connect the configured network endpoints.
/// Failures are not fatal; the device simply stays absent.
fn connect_ip_list(ip_list: &str) {
    let client = AdbClient::new(Default::default());
    for endpoint in ip_list.split(',').filter(|s| !s.is_empty()) {
        match client.command_query(&format!("connect:{endpoint}")) {
            Ok(reply) => debug!(endpoint, reply, "adb connect"),
            Err(e) => warn!(endpoint, "adb connect failed: {e}"),
        }
    }
}

fn print_event(dev: &DeviceInterface, pretty: bool) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    let rendered = if pretty {
        let mut buf = Vec::new();
        let indent = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, indent);
        if dev.serialize(&mut ser).is_err() {
            return;
        }
        buf
    } else {
        match serde_json::to_vec(dev) {
            Ok(buf) => buf,
            Err(_) => return,
        }
    };

    // One event per line, flushed so pipe readers see it immediately.
    let _ = out.write_all(&rendered);
    let _ = out.write_all(b"\n");
    let _ = out.flush();
}

fn main() -> std::process::ExitCode {
    match run() {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("devwatch: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    common::setup_logging(&args.log_level).context("failed to setup logging")?;

    #[cfg(target_os = "linux")]
    if !args.usbserial_vidpid.is_empty() && unsafe { libc::geteuid() } != 0 {
        anyhow::bail!("--usbserial-vidpid requires root privileges");
    }

    let settings = build_settings(&args).context("invalid filter arguments")?;

    connect_ip_list(&args.ip_list);

    let pretty = args.pretty;
    let mut watcher = DeviceWatcher::start(settings, move |dev| print_event(dev, pretty))
        .context("failed to start device watch")?;

    if args.watch {
        // Run until the parent closes our stdin.
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }

    watcher.stop();
    Ok(())
}
