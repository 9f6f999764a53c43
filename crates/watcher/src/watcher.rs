//! Watcher façade
//!
//! Owns the engine, the correlation worker and the platform source
//! thread. `start` blocks until the source finishes its initial
//! enumeration; `wait_for` blocks until a cached or newly emitted
//! record matches a partial target.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use adb::TransportOption;
use common::TaskWorker;

use crate::correlate::{spawn_correlation, Correlator, DeviceLister};
use crate::engine::{Engine, Trigger};
use crate::platform;
use crate::settings::WatchSettings;
use crate::types::DeviceInterface;

#[derive(Default)]
struct WatcherShared {
    /// Mirror of the engine cache, keyed by identity.
    cache: Mutex<HashMap<String, DeviceInterface>>,
    changed: Condvar,
}

impl WatcherShared {
    fn observe(&self, dev: &DeviceInterface) {
        {
            let mut cache = self.cache.lock().unwrap();
            if dev.off {
                cache.remove(&dev.identity);
            } else {
                cache.insert(dev.identity.clone(), dev.clone());
            }
        }
        self.changed.notify_all();
    }

    fn wait_for(
        &self,
        target: &DeviceInterface,
        timeout: Option<Duration>,
    ) -> Option<DeviceInterface> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut cache = self.cache.lock().unwrap();

        loop {
            if let Some(found) = cache.values().find(|d| matches_target(d, target)) {
                return Some(found.clone());
            }

            cache = match deadline {
                None => self.changed.wait(cache).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (cache, _) = self
                        .changed
                        .wait_timeout(cache, deadline - now)
                        .unwrap();
                    cache
                }
            };
        }
    }
}

/// A running device watch.
///
/// Dropping the watcher stops the platform source and the correlation
/// worker. The subscriber callback runs on watcher-internal threads and
/// must not call back into the watcher.
pub struct DeviceWatcher {
    source: Option<platform::SourceHandle>,
    correlation: Option<TaskWorker<Trigger>>,
    shared: Arc<WatcherShared>,
}

impl DeviceWatcher {
    /// Start watching with the default ADB server for correlation.
    pub fn start<F>(settings: WatchSettings, on_event: F) -> common::Result<Self>
    where
        F: Fn(&DeviceInterface) + Send + Sync + 'static,
    {
        let lister = Correlator::default_lister(TransportOption::default());
        Self::start_with_lister(settings, lister, on_event)
    }

    /// Start watching with a custom ADB device lister.
    pub fn start_with_lister<F>(
        settings: WatchSettings,
        lister: DeviceLister,
        on_event: F,
    ) -> common::Result<Self>
    where
        F: Fn(&DeviceInterface) + Send + Sync + 'static,
    {
        let shared = Arc::new(WatcherShared::default());
        let callback = Arc::new(on_event);

        let mirror = Arc::clone(&shared);
        let engine = Engine::new(
            settings.clone(),
            Arc::new(move |dev: &DeviceInterface| {
                mirror.observe(dev);
                callback(dev);
            }),
        );

        let correlation = settings
            .with_adb
            .then(|| spawn_correlation(Arc::clone(&engine), lister));

        let source = platform::spawn_source(engine, settings)?;

        Ok(Self {
            source: Some(source),
            correlation,
            shared,
        })
    }

    /// Signal the platform source to exit its loop and join all
    /// watcher-owned threads.
    pub fn stop(&mut self) {
        if let Some(source) = self.source.take() {
            source.shutdown();
        }
        if let Some(mut correlation) = self.correlation.take() {
            correlation.stop();
        }
    }

    /// Block until a record matching every non-empty field of `target`
    /// is cached or emitted, or the timeout elapses.
    pub fn wait_for(
        &self,
        target: &DeviceInterface,
        timeout: Option<Duration>,
    ) -> Option<DeviceInterface> {
        self.shared.wait_for(target, timeout)
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Partial-record matching: empty strings, zero numerics and an empty
/// type mean "don't care". The target's `identity` field also matches
/// against devpath, hub, serial, ip and driver, so a caller can wait on
/// whichever identifier it has.
pub(crate) fn matches_target(record: &DeviceInterface, target: &DeviceInterface) -> bool {
    if !target.identity.is_empty() {
        let id = &target.identity;
        let hit = record.identity == *id
            || record.devpath == *id
            || record.hub == *id
            || record.serial == *id
            || record.ip == *id
            || record.driver == *id;
        if !hit {
            return false;
        }
    }

    if !target.device_type.is_empty()
        && !record.device_type.intersects(target.device_type)
    {
        return false;
    }

    macro_rules! match_str {
        ($field:ident) => {
            if !target.$field.is_empty() && record.$field != target.$field {
                return false;
            }
        };
    }
    macro_rules! match_num {
        ($field:ident) => {
            if target.$field != 0 && record.$field != target.$field {
                return false;
            }
        };
    }

    match_str!(devpath);
    match_str!(hub);
    match_str!(serial);
    match_str!(manufacturer);
    match_str!(product);
    match_str!(model);
    match_str!(device);
    match_str!(driver);
    match_str!(ip);
    match_str!(description);
    match_num!(port);
    match_num!(vid);
    match_num!(pid);
    match_num!(usb_class);
    match_num!(usb_sub_class);
    match_num!(usb_proto);

    true
}
