//! ADB host-protocol client
//!
//! Speaks to a local or remote ADB server over TCP: host services with
//! the 4-hex-digit length framing, transport switching, the shell v2
//! multiplexed protocol, and the sync subprotocol for file transfer.
//! The client never talks to devices directly and never implements the
//! server itself; when allowed, it autostarts one local server per
//! process lifetime.
//!
//! The async surface lives on [`AdbClient`]; [`blocking::AdbClient`]
//! mirrors it for synchronous callers, running each call on a private
//! current-thread runtime so that dropping the call tears down its
//! sockets and timers.

mod client;
mod devices;
mod error;
mod host;
mod options;
mod server;
mod shell;
mod sync;

pub use client::{blocking, AdbClient};
pub use devices::{DeviceInfo, Features};
pub use error::{AdbError, Result};
pub use options::{TransportOption, TransportType};
pub use shell::ShellOutput;
pub use sync::{DirEntry, FileStat};
