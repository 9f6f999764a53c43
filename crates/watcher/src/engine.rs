//! Enumeration engine
//!
//! Receives raw interface records from a platform source, classifies
//! them, applies the configured filters, maintains the authoritative
//! cache keyed by identity, and decides per record whether to emit a
//! delta right away or to hand it to the ADB correlation task first.
//!
//! For a given identity the emitted deltas always form the sequence
//! create, optional enrichment update, remove. One mutex guards the
//! cache and the ADB serial table; it is never held across the emit
//! callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use common::interface_identity;
use tracing::debug;

use crate::settings::WatchSettings;
use crate::types::{DeviceInterface, DeviceType};

const QUALCOMM_VID: u16 = 0x05c6;
const QDL_PID: u16 = 0x9008;

/// Subscriber callback receiving every emitted delta.
pub type EventFn = Arc<dyn Fn(&DeviceInterface) + Send + Sync>;

/// Sink for USB-ADB records awaiting correlation.
pub type TriggerFn = Box<dyn Fn(Trigger) + Send + Sync>;

/// A pending USB-ADB interface queued for the correlation task.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub node: DeviceInterface,
    /// Retry count; bounded by the correlator.
    pub round: u32,
}

#[derive(Default)]
struct EngineState {
    /// Authoritative live set, identity -> record.
    devices: HashMap<String, DeviceInterface>,
    /// ADB-server-visible serials paired with the identity each was
    /// announced under, in observation order.
    adb_serials: Vec<(String, String)>,
}

pub struct Engine {
    settings: WatchSettings,
    state: Mutex<EngineState>,
    emit: EventFn,
    trigger: Mutex<Option<TriggerFn>>,
}

impl Engine {
    pub fn new(settings: WatchSettings, emit: EventFn) -> Arc<Self> {
        Arc::new(Self {
            settings,
            state: Mutex::new(EngineState::default()),
            emit,
            trigger: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &WatchSettings {
        &self.settings
    }

    /// Install the correlation sink. Without one, USB-ADB records are
    /// emitted directly.
    pub fn set_trigger(&self, trigger: TriggerFn) {
        *self.trigger.lock().unwrap() = Some(trigger);
    }

    /// A platform source discovered an interface.
    ///
    /// `locator` is the platform-specific stable key; its hash becomes
    /// the record identity.
    pub fn on_interface_enumerated(&self, locator: &str, mut node: DeviceInterface) {
        self.classify(&mut node);

        if !self.passes_filters(&node) {
            debug!(locator, vid = node.vid, pid = node.pid, "interface filtered out");
            return;
        }

        node.identity = interface_identity(locator);

        {
            let mut state = self.state.lock().unwrap();
            state.devices.insert(node.identity.clone(), node.clone());
        }

        if self.wants_correlation(&node) {
            if let Some(trigger) = &*self.trigger.lock().unwrap() {
                trigger(Trigger { node, round: 0 });
                return;
            }
        }

        (self.emit)(&node);
    }

    /// A platform source reported an interface removal.
    pub fn on_interface_off(&self, locator: &str) {
        self.remove_identity(&interface_identity(locator));
    }

    /// Remove a cached record by identity and emit the removal delta.
    ///
    /// A USB-ADB record that never received enrichment was never
    /// announced, so its removal is not announced either; the
    /// correlation task is still told so it can forget the serial.
    pub fn remove_identity(&self, identity: &str) {
        let node = {
            let mut state = self.state.lock().unwrap();
            let Some(mut node) = state.devices.remove(identity) else {
                return;
            };
            node.off = true;
            node
        };

        if self.wants_correlation(&node) {
            if let Some(trigger) = &*self.trigger.lock().unwrap() {
                trigger(Trigger {
                    node: node.clone(),
                    round: 0,
                });
            }
            if node.device.is_empty() && node.model.is_empty() {
                debug!(identity, "suppressing removal of unannounced interface");
                return;
            }
        }

        (self.emit)(&node);
    }

    /// Store a record the correlation task has enriched and announce it.
    pub fn store_enriched(&self, node: DeviceInterface) {
        {
            let mut state = self.state.lock().unwrap();
            state.devices.insert(node.identity.clone(), node.clone());
        }
        (self.emit)(&node);
    }

    /// Snapshot of the (serial, identity) table.
    pub fn adb_serials(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().adb_serials.clone()
    }

    pub fn contains_adb_serial(&self, serial: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .adb_serials
            .iter()
            .any(|(s, _)| s == serial)
    }

    pub fn push_adb_serial(&self, serial: &str, identity: &str) {
        self.state
            .lock()
            .unwrap()
            .adb_serials
            .push((serial.to_string(), identity.to_string()));
    }

    pub fn remove_adb_serial(&self, serial: &str) {
        self.state
            .lock()
            .unwrap()
            .adb_serials
            .retain(|(s, _)| s != serial);
    }

    pub fn remove_adb_serial_by_identity(&self, identity: &str) {
        self.state
            .lock()
            .unwrap()
            .adb_serials
            .retain(|(_, id)| id != identity);
    }

    fn wants_correlation(&self, node: &DeviceInterface) -> bool {
        self.settings.with_adb
            && node
                .device_type
                .contains(DeviceType::ADB | DeviceType::USB)
    }

    fn classify(&self, node: &mut DeviceInterface) {
        // Vendor-specific interfaces carry the debug-protocol markers in
        // the subclass/protocol pair.
        if node.usb_class == 0xff {
            match (node.usb_sub_class, node.usb_proto) {
                (0x42, 0x01) => node.device_type |= DeviceType::ADB,
                (0x42, 0x03) => node.device_type |= DeviceType::FASTBOOT,
                (0x50, 0x01) => node.device_type |= DeviceType::HDC,
                _ => {}
            }
        }

        if node.vid == QUALCOMM_VID && node.pid == QDL_PID {
            node.device_type |= DeviceType::QDL;
        }
    }

    fn passes_filters(&self, node: &DeviceInterface) -> bool {
        let s = &self.settings;

        if !s.type_filters.is_empty()
            && !s
                .type_filters
                .iter()
                .any(|filter| node.device_type.contains(*filter))
        {
            return false;
        }

        if !s.exclude_vids.is_empty() && node.vid != 0 && s.exclude_vids.contains(&node.vid) {
            return false;
        }
        if !s.include_vids.is_empty() && (node.vid == 0 || !s.include_vids.contains(&node.vid)) {
            return false;
        }

        if !s.exclude_pids.is_empty() && node.pid != 0 && s.exclude_pids.contains(&node.pid) {
            return false;
        }

        if !s.drivers.is_empty() && !s.drivers.contains(&node.driver) {
            return false;
        }

        if !s.include_pids.is_empty() && (node.pid == 0 || !s.include_pids.contains(&node.pid)) {
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn collecting_engine(settings: WatchSettings) -> (Arc<Engine>, Arc<StdMutex<Vec<DeviceInterface>>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let engine = Engine::new(
            settings,
            Arc::new(move |dev: &DeviceInterface| sink.lock().unwrap().push(dev.clone())),
        );
        (engine, events)
    }

    fn usb_node(vid: u16, pid: u16) -> DeviceInterface {
        DeviceInterface {
            vid,
            pid,
            device_type: DeviceType::USB,
            ..Default::default()
        }
    }

    #[test]
    fn classifies_adb_fastboot_hdc_qdl() {
        let (engine, events) = collecting_engine(WatchSettings {
            with_adb: false,
            ..Default::default()
        });

        let mut adb = usb_node(0x18d1, 0x4ee7);
        adb.usb_class = 0xff;
        adb.usb_sub_class = 0x42;
        adb.usb_proto = 0x01;
        engine.on_interface_enumerated("a", adb);

        let mut fastboot = usb_node(0x18d1, 0x4ee0);
        fastboot.usb_class = 0xff;
        fastboot.usb_sub_class = 0x42;
        fastboot.usb_proto = 0x03;
        engine.on_interface_enumerated("b", fastboot);

        let mut hdc = usb_node(0x12d1, 0x107e);
        hdc.usb_class = 0xff;
        hdc.usb_sub_class = 0x50;
        hdc.usb_proto = 0x01;
        engine.on_interface_enumerated("c", hdc);

        engine.on_interface_enumerated("d", usb_node(0x05c6, 0x9008));

        let events = events.lock().unwrap();
        assert!(events[0].device_type.contains(DeviceType::ADB | DeviceType::USB));
        assert!(events[1].device_type.contains(DeviceType::FASTBOOT));
        assert!(events[2].device_type.contains(DeviceType::HDC));
        assert!(events[3].device_type.contains(DeviceType::QDL | DeviceType::USB));
    }

    #[test]
    fn identity_is_hash_of_locator() {
        let (engine, events) = collecting_engine(WatchSettings::default());
        engine.on_interface_enumerated("257", usb_node(0x1234, 0x5678));

        let events = events.lock().unwrap();
        assert_eq!(events[0].identity, interface_identity("257"));
    }

    #[test]
    fn removal_of_unknown_identity_is_a_noop() {
        let (engine, events) = collecting_engine(WatchSettings::default());
        engine.on_interface_off("never-seen");
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn create_then_remove_ordering() {
        let (engine, events) = collecting_engine(WatchSettings::default());

        engine.on_interface_enumerated("257", usb_node(0x1234, 0x5678));
        engine.on_interface_off("257");
        // A second removal must not produce a second delta.
        engine.on_interface_off("257");

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(!events[0].off);
        assert!(events[1].off);
        assert_eq!(events[0].identity, events[1].identity);
    }

    #[test]
    fn type_filter_masks_are_or_of_and() {
        let settings = WatchSettings {
            type_filters: parse_filters("usb,serial|net"),
            with_adb: false,
            ..Default::default()
        };
        let (engine, events) = collecting_engine(settings);

        // usb alone covers neither mask
        engine.on_interface_enumerated("a", usb_node(1, 1));
        // usb|serial covers the first
        let mut tty = usb_node(1, 1);
        tty.device_type |= DeviceType::SERIAL;
        engine.on_interface_enumerated("b", tty);
        // net covers the second
        let net = DeviceInterface {
            device_type: DeviceType::NET | DeviceType::ADB,
            ..Default::default()
        };
        engine.on_interface_enumerated("c", net);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].device_type.contains(DeviceType::SERIAL));
        assert!(events[1].device_type.contains(DeviceType::NET));
    }

    fn parse_filters(s: &str) -> Vec<DeviceType> {
        crate::settings::parse_type_filters(s).unwrap()
    }

    #[test]
    fn include_and_exclude_id_filters() {
        let settings = WatchSettings {
            include_vids: vec![0x18d1],
            exclude_pids: vec![0x9999],
            with_adb: false,
            ..Default::default()
        };
        let (engine, events) = collecting_engine(settings);

        engine.on_interface_enumerated("a", usb_node(0x04e8, 0x1234)); // wrong vid
        engine.on_interface_enumerated("b", usb_node(0x18d1, 0x9999)); // excluded pid
        engine.on_interface_enumerated("c", usb_node(0x18d1, 0x4ee7)); // passes

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pid, 0x4ee7);
    }

    #[test]
    fn include_vid_list_rejects_zero_vid_records() {
        let settings = WatchSettings {
            include_vids: vec![0x18d1],
            with_adb: false,
            ..Default::default()
        };
        let (engine, events) = collecting_engine(settings);

        let net = DeviceInterface {
            device_type: DeviceType::NET | DeviceType::ADB,
            ..Default::default()
        };
        engine.on_interface_enumerated("10.0.0.1:5555", net);

        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn driver_filter() {
        let settings = WatchSettings {
            drivers: vec!["qcserial".into()],
            with_adb: false,
            ..Default::default()
        };
        let (engine, events) = collecting_engine(settings);

        engine.on_interface_enumerated("a", usb_node(1, 2));
        let mut qc = usb_node(1, 2);
        qc.driver = "qcserial".into();
        engine.on_interface_enumerated("b", qc);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].driver, "qcserial");
    }

    #[test]
    fn usb_adb_arrival_goes_to_trigger_not_subscriber() {
        let (engine, events) = collecting_engine(WatchSettings::default());
        let triggers = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&triggers);
        engine.set_trigger(Box::new(move |t| sink.lock().unwrap().push(t)));

        let mut adb = usb_node(0x18d1, 0x4ee7);
        adb.usb_class = 0xff;
        adb.usb_sub_class = 0x42;
        adb.usb_proto = 0x01;
        engine.on_interface_enumerated("x", adb);

        assert!(events.lock().unwrap().is_empty());
        let triggers = triggers.lock().unwrap();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].round, 0);
        assert!(!triggers[0].node.off);
    }

    #[test]
    fn unenriched_usb_adb_removal_is_suppressed() {
        let (engine, events) = collecting_engine(WatchSettings::default());
        let triggers = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&triggers);
        engine.set_trigger(Box::new(move |t| sink.lock().unwrap().push(t)));

        let mut adb = usb_node(0x18d1, 0x4ee7);
        adb.usb_class = 0xff;
        adb.usb_sub_class = 0x42;
        adb.usb_proto = 0x01;
        engine.on_interface_enumerated("x", adb);
        engine.on_interface_off("x");

        // Nothing was announced; the correlator saw both edges.
        assert!(events.lock().unwrap().is_empty());
        let triggers = triggers.lock().unwrap();
        assert_eq!(triggers.len(), 2);
        assert!(triggers[1].node.off);
    }

    #[test]
    fn serial_table_operations() {
        let (engine, _) = collecting_engine(WatchSettings::default());

        engine.push_adb_serial("HT1", "id1");
        engine.push_adb_serial("10.0.0.1:5555", "id2");
        assert!(engine.contains_adb_serial("HT1"));

        engine.remove_adb_serial_by_identity("id1");
        assert!(!engine.contains_adb_serial("HT1"));
        assert!(engine.contains_adb_serial("10.0.0.1:5555"));

        engine.remove_adb_serial("10.0.0.1:5555");
        assert!(engine.adb_serials().is_empty());
    }
}
