//! Transport selection for ADB operations

pub(crate) const DEFAULT_ADB_SERVER: &str = "localhost";
pub(crate) const DEFAULT_ADB_PORT: &str = "5037";

/// Which transport class a service should be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportType {
    #[default]
    Any,
    Usb,
    Local,
}

/// Selects the ADB server and the device transport for one operation.
///
/// Empty strings mean "use the default" (`localhost:5037`, any device).
#[derive(Debug, Clone)]
pub struct TransportOption {
    /// ADB server host.
    pub server: String,
    /// ADB server port.
    pub port: String,
    /// Pin the operation to a device serial.
    pub serial: String,
    pub transport_type: TransportType,
    /// Pin the operation to a numeric transport id; wins over `serial`.
    pub transport_id: Option<i64>,
    /// Autostart a local ADB server when the first connect is refused.
    pub launch_server: bool,
}

impl Default for TransportOption {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: String::new(),
            serial: String::new(),
            transport_type: TransportType::Any,
            transport_id: None,
            launch_server: true,
        }
    }
}

impl TransportOption {
    /// `host:port` endpoint of the ADB server this option points at.
    pub(crate) fn endpoint(&self) -> String {
        let server = if self.server.is_empty() {
            DEFAULT_ADB_SERVER
        } else {
            &self.server
        };
        let port = if self.port.is_empty() {
            DEFAULT_ADB_PORT
        } else {
            &self.port
        };
        format!("{server}:{port}")
    }

    /// Format a host-scoped command with the transport prefix the server
    /// expects for this option.
    pub(crate) fn host_command(&self, command: &str) -> String {
        if let Some(id) = self.transport_id {
            return format!("host-transport-id:{id}:{command}");
        }
        if !self.serial.is_empty() {
            return format!("host-serial:{}:{command}", self.serial);
        }
        match self.transport_type {
            TransportType::Usb => format!("host-usb:{command}"),
            TransportType::Local => format!("host-local:{command}"),
            TransportType::Any => format!("host:{command}"),
        }
    }
}
