//! ADB correlation task
//!
//! Every 3 seconds, and whenever the engine queues a pending USB-ADB
//! interface, the task lists the devices the ADB server knows and
//! reconciles: serials that vanished take their network records down,
//! new `ip:port` serials become network-ADB records, and a pending USB
//! interface is enriched with serial/product/model/device from its
//! matching entry. A pending interface with no match yet is retried a
//! bounded number of times.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, error};

use adb::{DeviceInfo, TransportOption};
use common::{interface_identity, TaskWorker};

use crate::engine::{Engine, Trigger};
use crate::types::{DeviceInterface, DeviceType};

/// Poll interval of the reconciliation tick.
pub const CORRELATION_PERIOD: Duration = Duration::from_secs(3);

/// Retries before an unmatched USB-ADB interface is given up on.
pub const MAX_ROUNDS: u32 = 60;

/// Pause after a retry re-enqueue, against hot reconnect loops.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

static RE_REMOTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d{1,5})$").unwrap()
});

/// Recognize a network-ADB serial of the form `ip:port`.
pub fn parse_remote_serial(serial: &str) -> Option<(String, u16)> {
    let caps = RE_REMOTE.captures(serial)?;
    let port: u16 = caps[2].parse().ok()?;
    Some((caps[1].to_string(), port))
}

/// Produces the ADB server's device list; injected so the tick logic is
/// testable without a server.
pub type DeviceLister = Arc<dyn Fn() -> adb::Result<Vec<DeviceInfo>> + Send + Sync>;

pub struct Correlator {
    engine: Arc<Engine>,
    lister: DeviceLister,
    stopped: AtomicBool,
}

impl Correlator {
    pub fn new(engine: Arc<Engine>, lister: DeviceLister) -> Arc<Self> {
        Arc::new(Self {
            engine,
            lister,
            stopped: AtomicBool::new(false),
        })
    }

    /// The production lister: ask the configured ADB server, one
    /// blocking call per tick.
    pub fn default_lister(option: TransportOption) -> DeviceLister {
        Arc::new(move || {
            adb::blocking::AdbClient::new(option.clone()).list_devices(true, None)
        })
    }

    /// True once a server failure has shut the task down.
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// One reconciliation pass.
    ///
    /// Returns the trigger to re-enqueue when the pending interface is
    /// still unmatched and has retries left.
    pub fn tick(&self, trigger: Option<Trigger>) -> Option<Trigger> {
        if self.stopped() {
            return None;
        }

        let mut pending: Option<DeviceInterface> = None;
        let mut round = 0;

        if let Some(trigger) = trigger {
            if trigger.node.off {
                // The interface is gone; forget its serial so a
                // reappearance counts as new.
                self.engine
                    .remove_adb_serial_by_identity(&trigger.node.identity);
            } else {
                round = trigger.round;
                pending = Some(trigger.node);
            }
        }

        let devices = match (self.lister)() {
            Ok(devices) => devices,
            Err(e) => {
                error!("listing adb devices failed, stopping correlation: {e}");
                self.stopped.store(true, Ordering::SeqCst);
                return None;
            }
        };

        // Serials the server no longer reports. Network records are
        // taken down under the identity stored when they appeared.
        for (serial, identity) in self.engine.adb_serials() {
            if !devices.iter().any(|d| d.serial == serial) {
                if parse_remote_serial(&serial).is_some() {
                    self.engine.remove_identity(&identity);
                }
                self.engine.remove_adb_serial(&serial);
            }
        }

        // New serials: network devices are announced directly, local
        // ones are candidates for the pending USB interface.
        let mut candidates: Vec<&DeviceInfo> = Vec::new();
        for dev in &devices {
            if self.engine.contains_adb_serial(&dev.serial) {
                continue;
            }

            if let Some((ip, port)) = parse_remote_serial(&dev.serial) {
                let node = DeviceInterface {
                    device_type: DeviceType::ADB | DeviceType::NET,
                    ip,
                    port,
                    serial: dev.serial.clone(),
                    product: dev.product.clone(),
                    model: dev.model.clone(),
                    device: dev.device.clone(),
                    ..Default::default()
                };
                self.engine
                    .push_adb_serial(&dev.serial, &interface_identity(&dev.serial));
                self.engine.on_interface_enumerated(&dev.serial, node);
            } else if let Some(node) = &pending {
                if node.serial.is_empty() || node.serial == dev.serial {
                    candidates.push(dev);
                }
            }
        }

        if !candidates.is_empty() {
            if let Some(mut node) = pending.take() {
                let chosen = pick_candidate(&candidates, &node.serial);
                debug!(
                    identity = %node.identity,
                    serial = %chosen.serial,
                    "enriching usb-adb interface"
                );
                node.serial = chosen.serial.clone();
                node.product = chosen.product.clone();
                node.model = chosen.model.clone();
                node.device = chosen.device.clone();
                self.engine.push_adb_serial(&node.serial, &node.identity);
                self.engine.store_enriched(node);
            }
        }

        match pending {
            Some(node) if round < MAX_ROUNDS => Some(Trigger {
                node,
                round: round + 1,
            }),
            _ => None,
        }
    }
}

/// An exact serial match outranks everything; otherwise the entry with
/// the lowest transport id wins.
fn pick_candidate<'a>(candidates: &[&'a DeviceInfo], serial: &str) -> &'a DeviceInfo {
    if !serial.is_empty() {
        if let Some(exact) = candidates.iter().find(|d| d.serial == serial) {
            return exact;
        }
    }
    candidates
        .iter()
        .min_by_key(|d| d.transport_id)
        .expect("pick_candidate called with candidates")
}

/// Start the correlation worker and wire the engine's trigger sink to
/// its queue. Triggers are deduplicated by identity.
pub fn spawn_correlation(engine: Arc<Engine>, lister: DeviceLister) -> TaskWorker<Trigger> {
    let correlator = Correlator::new(Arc::clone(&engine), lister);

    let mut worker = TaskWorker::new();
    worker.set_consume_all(true);

    let requeue = worker.handle();
    worker.start_periodic(CORRELATION_PERIOD, move |trigger| {
        if let Some(retry) = correlator.tick(trigger) {
            let identity = retry.node.identity.clone();
            requeue.push_if(retry, |queued| queued.node.identity == identity);
            std::thread::sleep(RETRY_BACKOFF);
        }
    });

    let sink = worker.handle();
    engine.set_trigger(Box::new(move |trigger| {
        let identity = trigger.node.identity.clone();
        if trigger.node.off {
            sink.push(trigger);
        } else {
            sink.push_if(trigger, |queued| {
                !queued.node.off && queued.node.identity == identity
            });
        }
    }));

    worker
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_serial_recognizer() {
        assert_eq!(
            parse_remote_serial("127.0.0.1:5555"),
            Some(("127.0.0.1".to_string(), 5555))
        );
        assert_eq!(
            parse_remote_serial("10.0.0.1:1"),
            Some(("10.0.0.1".to_string(), 1))
        );

        assert_eq!(parse_remote_serial("127.0.0.1"), None);
        assert_eq!(parse_remote_serial(":5555"), None);
        assert_eq!(parse_remote_serial("abc:5555"), None);
        assert_eq!(parse_remote_serial("HT12345"), None);
        assert_eq!(parse_remote_serial("127.0.0.1:5555 "), None);
        // Five digits parse but must still fit a u16 port.
        assert_eq!(parse_remote_serial("1.2.3.4:99999"), None);
    }

    #[test]
    fn candidate_ranking() {
        let a = DeviceInfo {
            serial: "AAA".into(),
            transport_id: 5,
            ..Default::default()
        };
        let b = DeviceInfo {
            serial: "BBB".into(),
            transport_id: 2,
            ..Default::default()
        };

        // Exact serial match wins over a lower transport id.
        let picked = pick_candidate(&[&a, &b], "AAA");
        assert_eq!(picked.serial, "AAA");

        // No exact match: lowest transport id.
        let picked = pick_candidate(&[&a, &b], "");
        assert_eq!(picked.serial, "BBB");
    }
}
