//! Device list and feature parsing

/// One device known to the ADB server, as reported by `host:devices-l`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub serial: String,
    /// Connection state (`device`, `offline`, `unauthorized`, ...).
    pub state: String,
    pub product: String,
    pub model: String,
    pub device: String,
    pub transport_id: i64,
}

/// Parse the multi-line `host:devices-l` response.
///
/// `device_only` drops entries not in the `device` state;
/// `target_serial` keeps only the named device.
pub(crate) fn parse_device_list(
    raw: &str,
    device_only: bool,
    target_serial: Option<&str>,
) -> Vec<DeviceInfo> {
    let mut out = Vec::new();

    for line in raw.lines() {
        let mut items = line.split_whitespace();
        let Some(serial) = items.next() else {
            continue;
        };
        let Some(state) = items.next() else {
            continue;
        };

        if device_only && state != "device" {
            continue;
        }
        if target_serial.is_some_and(|target| target != serial) {
            continue;
        }

        let mut dev = DeviceInfo {
            serial: serial.to_string(),
            state: state.to_string(),
            ..Default::default()
        };

        for item in items {
            if let Some(v) = item.strip_prefix("product:") {
                dev.product = v.to_string();
            } else if let Some(v) = item.strip_prefix("model:") {
                dev.model = v.to_string();
            } else if let Some(v) = item.strip_prefix("device:") {
                dev.device = v.to_string();
            } else if let Some(v) = item.strip_prefix("transport_id:") {
                dev.transport_id = v.parse().unwrap_or(0);
            }
        }

        out.push(dev);
    }

    out
}

/// Capabilities advertised by the ADB server via `host:features`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Features {
    pub shell_v2: bool,
    pub stat_v2: bool,
    pub ls_v2: bool,
    pub fixed_push_mkdir: bool,
    pub remount_shell: bool,
}

impl Features {
    pub fn from_list<S: AsRef<str>>(features: &[S]) -> Self {
        let mut out = Features::default();
        for feature in features {
            match feature.as_ref() {
                "shell_v2" => out.shell_v2 = true,
                "stat_v2" => out.stat_v2 = true,
                "ls_v2" => out.ls_v2 = true,
                "fixed_push_mkdir" => out.fixed_push_mkdir = true,
                "remount_shell" => out.remount_shell = true,
                _ => {}
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "HT12345        device product:sargo model:Pixel device:sargo transport_id:1\n\
                           emulator-5554  offline transport_id:2\n\
                           10.0.0.1:5555  device product:lynx model:Pixel_7a device:lynx transport_id:3\n";

    #[test]
    fn parses_devices_long_format() {
        let devs = parse_device_list(LISTING, false, None);
        assert_eq!(devs.len(), 3);
        assert_eq!(devs[0].serial, "HT12345");
        assert_eq!(devs[0].state, "device");
        assert_eq!(devs[0].product, "sargo");
        assert_eq!(devs[0].model, "Pixel");
        assert_eq!(devs[0].device, "sargo");
        assert_eq!(devs[0].transport_id, 1);
        assert_eq!(devs[2].serial, "10.0.0.1:5555");
        assert_eq!(devs[2].transport_id, 3);
    }

    #[test]
    fn device_only_drops_offline_entries() {
        let devs = parse_device_list(LISTING, true, None);
        assert_eq!(devs.len(), 2);
        assert!(devs.iter().all(|d| d.state == "device"));
    }

    #[test]
    fn target_serial_filters() {
        let devs = parse_device_list(LISTING, false, Some("10.0.0.1:5555"));
        assert_eq!(devs.len(), 1);
        assert_eq!(devs[0].model, "Pixel_7a");
    }

    #[test]
    fn empty_response_parses_to_empty_list() {
        assert!(parse_device_list("", true, None).is_empty());
        assert!(parse_device_list("\n\n", true, None).is_empty());
    }

    #[test]
    fn feature_list_parsing() {
        let features = Features::from_list(&["shell_v2", "stat_v2", "ls_v2", "unknown_cap"]);
        assert!(features.shell_v2 && features.stat_v2 && features.ls_v2);
        assert!(!features.fixed_push_mkdir && !features.remount_shell);
    }
}
