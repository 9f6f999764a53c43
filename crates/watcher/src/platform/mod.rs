//! Platform device sources
//!
//! Each source runs on a dedicated thread: it performs one initial
//! enumeration (one synthetic arrival per present interface), reports
//! readiness, then feeds OS events into the engine until shut down.

use std::thread::JoinHandle;

use tracing::error;

#[cfg(target_os = "linux")]
mod netlink;
#[cfg(target_os = "linux")]
pub(crate) use netlink::spawn_source;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::spawn_source;

#[cfg(not(any(target_os = "linux", windows)))]
mod unsupported {
    use std::sync::Arc;

    use crate::engine::Engine;
    use crate::settings::WatchSettings;

    pub(crate) fn spawn_source(
        _engine: Arc<Engine>,
        _settings: WatchSettings,
    ) -> common::Result<super::SourceHandle> {
        Err(common::Error::Init(
            "no device source for this platform".into(),
        ))
    }
}
#[cfg(not(any(target_os = "linux", windows)))]
pub(crate) use unsupported::spawn_source;

/// A running platform source: its thread plus the wakeup that makes the
/// thread leave its event loop.
pub(crate) struct SourceHandle {
    thread: JoinHandle<()>,
    stopper: Box<dyn Fn() + Send>,
}

impl SourceHandle {
    pub(crate) fn new(thread: JoinHandle<()>, stopper: Box<dyn Fn() + Send>) -> Self {
        Self { thread, stopper }
    }

    /// Wake the source out of its loop and join the thread.
    pub(crate) fn shutdown(self) {
        (self.stopper)();
        if self.thread.join().is_err() {
            error!("platform source thread panicked");
        }
    }
}
