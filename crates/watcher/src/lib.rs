//! devwatch watcher
//!
//! Observes locally attached and network-reachable USB, serial and ADB
//! devices and emits a stream of device-state deltas. The enumeration
//! engine normalizes OS events into cached [`DeviceInterface`] records,
//! applies the configured filters, and correlates USB-ADB interfaces
//! with the serials the ADB server reports before announcing them.
//!
//! Embedders start a [`DeviceWatcher`] with [`WatchSettings`] and a
//! subscriber callback; `wait_for` blocks until a device matching a
//! partial record shows up.

pub mod correlate;
pub mod engine;
mod platform;
pub mod settings;
pub mod types;
mod watcher;

pub use correlate::{Correlator, DeviceLister};
pub use engine::{Engine, EventFn, Trigger};
pub use settings::WatchSettings;
pub use types::{DeviceInterface, DeviceType};
pub use watcher::DeviceWatcher;
