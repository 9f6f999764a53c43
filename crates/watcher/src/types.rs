//! Device model: the type bitset and the interface record

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

use serde::{Serialize, Serializer};

/// Bitset of device type tags.
///
/// A record usually carries several: a USB-attached Android device in
/// normal mode is `USB | ADB`, a network device is `NET | ADB`, a
/// usbserial tty node is `USB | SERIAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceType(u32);

impl DeviceType {
    pub const NONE: DeviceType = DeviceType(0);
    pub const USB: DeviceType = DeviceType(1 << 0);
    pub const NET: DeviceType = DeviceType(1 << 1);
    pub const SERIAL: DeviceType = DeviceType(1 << 2);
    pub const ADB: DeviceType = DeviceType(1 << 3);
    pub const FASTBOOT: DeviceType = DeviceType(1 << 4);
    pub const HDC: DeviceType = DeviceType(1 << 5);
    pub const DIAG: DeviceType = DeviceType(1 << 6);
    pub const QDL: DeviceType = DeviceType(1 << 7);

    /// Render order is fixed; parsing accepts any order.
    const NAMES: [(DeviceType, &'static str); 8] = [
        (DeviceType::USB, "usb"),
        (DeviceType::NET, "net"),
        (DeviceType::SERIAL, "serial"),
        (DeviceType::ADB, "adb"),
        (DeviceType::FASTBOOT, "fastboot"),
        (DeviceType::HDC, "hdc"),
        (DeviceType::DIAG, "diag"),
        (DeviceType::QDL, "qdl"),
    ];

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// All bits of `other` are set in `self`.
    pub fn contains(self, other: DeviceType) -> bool {
        self.0 & other.0 == other.0
    }

    /// At least one bit of `other` is set in `self`.
    pub fn intersects(self, other: DeviceType) -> bool {
        self.0 & other.0 != 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Parse a single lowercase tag name.
    pub fn from_name(name: &str) -> Option<DeviceType> {
        Self::NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(t, _)| *t)
    }
}

impl BitOr for DeviceType {
    type Output = DeviceType;
    fn bitor(self, rhs: DeviceType) -> DeviceType {
        DeviceType(self.0 | rhs.0)
    }
}

impl BitOrAssign for DeviceType {
    fn bitor_assign(&mut self, rhs: DeviceType) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for DeviceType {
    type Output = DeviceType;
    fn bitand(self, rhs: DeviceType) -> DeviceType {
        DeviceType(self.0 & rhs.0)
    }
}

impl Not for DeviceType {
    type Output = DeviceType;
    fn not(self) -> DeviceType {
        DeviceType(!self.0)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (bit, name) in Self::NAMES {
            if self.contains(bit) {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for DeviceType {
    type Err = common::Error;

    /// Parse a comma-separated tag list, e.g. `"usb,adb"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = DeviceType::NONE;
        for token in s.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            match DeviceType::from_name(token) {
                Some(t) => out |= t,
                None => {
                    return Err(common::Error::Config(format!(
                        "unknown device type {token:?}"
                    )))
                }
            }
        }
        Ok(out)
    }
}

impl Serialize for DeviceType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero_u8(v: &u8) -> bool {
    *v == 0
}

fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}

/// One physical USB interface, or a virtual interface standing for an
/// ADB-over-TCP device or a serial tty node.
///
/// Serializes to the line-delimited JSON schema of the event stream:
/// string fields are omitted when empty and numeric fields when zero,
/// except `id` and `type` which are always present.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInterface {
    /// Stable 128-bit SHA-256 prefix of the platform locator, as hex.
    #[serde(rename = "id")]
    pub identity: String,

    /// True when this record reports a removal.
    #[serde(skip_serializing_if = "is_false")]
    pub off: bool,

    /// OS device node, e.g. a serial port path.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub devpath: String,

    /// Enumerated USB port path, e.g. `USB1-3-2`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hub: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub serial: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub manufacturer: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub product: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub model: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub device: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub driver: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub ip: String,

    #[serde(skip_serializing_if = "is_zero_u16")]
    pub port: u16,

    #[serde(skip_serializing_if = "is_zero_u16")]
    pub vid: u16,

    #[serde(skip_serializing_if = "is_zero_u16")]
    pub pid: u16,

    #[serde(rename = "type")]
    pub device_type: DeviceType,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(rename = "usbClass", skip_serializing_if = "is_zero_u8")]
    pub usb_class: u8,

    #[serde(rename = "usbSubClass", skip_serializing_if = "is_zero_u8")]
    pub usb_sub_class: u8,

    #[serde(rename = "usbProto", skip_serializing_if = "is_zero_u8")]
    pub usb_proto: u8,

    /// Interface number; >= 0 on a composite device, -1 otherwise.
    #[serde(skip)]
    pub usb_if: i32,
}

impl Default for DeviceInterface {
    fn default() -> Self {
        Self {
            identity: String::new(),
            off: false,
            devpath: String::new(),
            hub: String::new(),
            serial: String::new(),
            manufacturer: String::new(),
            product: String::new(),
            model: String::new(),
            device: String::new(),
            driver: String::new(),
            ip: String::new(),
            port: 0,
            vid: 0,
            pid: 0,
            device_type: DeviceType::NONE,
            description: String::new(),
            usb_class: 0,
            usb_sub_class: 0,
            usb_proto: 0,
            usb_if: -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn render_uses_fixed_order() {
        let t = DeviceType::ADB | DeviceType::USB;
        assert_eq!(t.to_string(), "usb,adb");

        let all = DeviceType::NAMES
            .iter()
            .fold(DeviceType::NONE, |acc, (bit, _)| acc | *bit);
        assert_eq!(
            all.to_string(),
            "usb,net,serial,adb,fastboot,hdc,diag,qdl"
        );
        assert_eq!(DeviceType::NONE.to_string(), "");
    }

    #[test]
    fn render_parse_round_trip_over_all_subsets() {
        for bits in 0u32..256 {
            let t = DeviceType(bits);
            let parsed = DeviceType::from_str(&t.to_string()).unwrap();
            assert_eq!(parsed, t, "subset {bits:#04x}");
        }
    }

    #[test]
    fn parse_rejects_unknown_names() {
        assert!(DeviceType::from_str("usb,bogus").is_err());
    }

    #[test]
    fn parse_tolerates_whitespace_and_empty_tokens() {
        let t = DeviceType::from_str(" usb , adb ,").unwrap();
        assert_eq!(t, DeviceType::USB | DeviceType::ADB);
    }

    #[test]
    fn bit_operations() {
        let t = DeviceType::USB | DeviceType::ADB;
        assert!(t.contains(DeviceType::USB));
        assert!(t.contains(DeviceType::ADB | DeviceType::USB));
        assert!(!t.contains(DeviceType::NET | DeviceType::USB));
        assert!(t.intersects(DeviceType::ADB | DeviceType::NET));
        assert!(!t.intersects(DeviceType::NET));
        assert_eq!((t & DeviceType::USB), DeviceType::USB);
        assert!((!t).intersects(DeviceType::NET));
    }

    #[test]
    fn json_omits_empty_fields() {
        let node = DeviceInterface {
            identity: "aabb".into(),
            vid: 0x18d1,
            pid: 0x4ee7,
            device_type: DeviceType::USB | DeviceType::ADB,
            ..Default::default()
        };
        let json = serde_json::to_value(&node).unwrap();

        assert_eq!(json["id"], "aabb");
        assert_eq!(json["type"], "usb,adb");
        assert_eq!(json["vid"], 0x18d1);
        assert!(json.get("off").is_none());
        assert!(json.get("serial").is_none());
        assert!(json.get("port").is_none());
        assert!(json.get("usbClass").is_none());
        assert!(json.get("usb_if").is_none());
    }

    #[test]
    fn json_always_has_id_and_type() {
        let node = DeviceInterface::default();
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["id"], "");
        assert_eq!(json["type"], "");
    }

    #[test]
    fn json_renders_removal_and_class_triple() {
        let node = DeviceInterface {
            identity: "ffee".into(),
            off: true,
            usb_class: 0xff,
            usb_sub_class: 0x42,
            usb_proto: 0x01,
            device_type: DeviceType::USB,
            ..Default::default()
        };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["off"], true);
        assert_eq!(json["usbClass"], 0xff);
        assert_eq!(json["usbSubClass"], 0x42);
        assert_eq!(json["usbProto"], 0x01);
    }
}
