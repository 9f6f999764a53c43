//! Linux device source: kernel uevents plus sysfs
//!
//! Listens on a `NETLINK_KOBJECT_UEVENT` socket for `add`/`remove`
//! events of the usb and tty subsystems, reads interface attributes out
//! of sysfs, and walks `/sys/bus/usb/devices` once at startup. An
//! eventfd in the same `poll` set provides graceful shutdown.
//!
//! Only messages from the kernel group with sender uid 0 are accepted;
//! `SO_PASSCRED` makes the credentials visible.

use std::ffi::c_void;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::engine::Engine;
use crate::platform::SourceHandle;
use crate::settings::WatchSettings;
use crate::types::{DeviceInterface, DeviceType};

const SYSFS_DEVICE_PATH: &str = "/sys/bus/usb/devices";
const NL_GROUP_KERNEL: u32 = 1;

/// How long a usbserial candidate may take to surface a tty node
/// before the driver is rebound.
const EXPECT_TTY_TIMEOUT: Duration = Duration::from_millis(1000);

pub(crate) fn spawn_source(
    engine: Arc<Engine>,
    settings: WatchSettings,
) -> common::Result<SourceHandle> {
    if !settings.usbserial_vidpid.is_empty() && unsafe { libc::geteuid() } != 0 {
        return Err(common::Error::Init(
            "usbserial driver rebind requires root".into(),
        ));
    }

    let netlink = create_netlink_socket()
        .map_err(|e| common::Error::Init(format!("uevent socket: {e}")))?;
    let event = Arc::new(
        create_eventfd().map_err(|e| common::Error::Init(format!("eventfd: {e}")))?,
    );

    let stop_event = Arc::clone(&event);
    let (ready_tx, ready_rx) = mpsc::channel();

    let mut source = NetlinkSource {
        engine,
        settings,
        netlink,
        event,
        expect: ExpectTty::default(),
        driver_loaded: false,
    };

    let thread = std::thread::Builder::new()
        .name("usb-watch".into())
        .spawn(move || {
            source.enumerate_devices();
            let _ = ready_tx.send(());
            source.run();
        })
        .map_err(|e| common::Error::Init(e.to_string()))?;

    if ready_rx.recv().is_err() {
        let _ = thread.join();
        return Err(common::Error::Init("device source failed to start".into()));
    }

    Ok(SourceHandle::new(
        thread,
        Box::new(move || {
            let one: u64 = 1;
            let _ = unsafe {
                libc::write(
                    stop_event.as_raw_fd(),
                    &one as *const u64 as *const c_void,
                    8,
                )
            };
        }),
    ))
}

fn create_netlink_socket() -> std::io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::PF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::NETLINK_KOBJECT_UEVENT,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_groups = NL_GROUP_KERNEL;

    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let opt: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            &opt as *const libc::c_int as *const c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(fd)
}

fn create_eventfd() -> std::io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// A usbserial device that should shortly produce a tty node. If none
/// appears before the deadline, the usbserial module is rebound with
/// the device's vid/pid.
#[derive(Default)]
struct ExpectTty {
    deadline: Option<Instant>,
    devpath: String,
    vid: u16,
    pid: u16,
    ifnum: i32,
}

struct NetlinkSource {
    engine: Arc<Engine>,
    settings: WatchSettings,
    netlink: OwnedFd,
    event: Arc<OwnedFd>,
    expect: ExpectTty,
    driver_loaded: bool,
}

impl NetlinkSource {
    fn run(&mut self) {
        loop {
            let mut fds = [
                libc::pollfd {
                    fd: self.event.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.netlink.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];

            let timeout = match self.expect.deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .as_millis() as libc::c_int,
                None => -1,
            };

            let rc = unsafe { libc::poll(fds.as_mut_ptr(), 2, timeout) };
            let poll_error = (rc < 0).then(std::io::Error::last_os_error);

            if let Some(deadline) = self.expect.deadline {
                if Instant::now() >= deadline {
                    self.expect.deadline = None;
                    self.load_driver();
                }
            }

            if let Some(e) = poll_error {
                if e.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                warn!("poll on uevent socket failed: {e}");
                break;
            }
            if rc == 0 {
                continue;
            }
            if fds[0].revents != 0 {
                break; // shutdown wakeup
            }
            if fds[1].revents != 0 {
                self.read_netlink_message();
            }
        }

        self.unload_driver();
    }

    fn read_netlink_message(&mut self) {
        let mut buf = [0u8; 2048];
        let mut cred_buf = [0u8; 64];
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };

        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &mut addr as *mut libc::sockaddr_nl as *mut c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cred_buf.as_mut_ptr() as *mut c_void;
        msg.msg_controllen = cred_buf.len();

        let len = unsafe { libc::recvmsg(self.netlink.as_raw_fd(), &mut msg, 0) };
        if len < 0 {
            return; // EAGAIN and friends
        }
        if (len as usize) < 32 || msg.msg_flags & libc::MSG_TRUNC != 0 {
            debug!("ignoring undersized or truncated uevent");
            return;
        }
        if addr.nl_groups != NL_GROUP_KERNEL || addr.nl_pid != 0 {
            return; // not the kernel uevent group
        }

        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        if cmsg.is_null() || unsafe { (*cmsg).cmsg_type } != libc::SCM_CREDENTIALS {
            return; // no sender credentials
        }
        let cred = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::ucred) };
        if cred.uid != 0 {
            return;
        }

        let payload = &buf[..len as usize];
        match uevent_value(payload, "ACTION") {
            Some("add") => self.on_uevent_add(payload),
            Some("remove") => self.on_uevent_remove(payload),
            _ => {}
        }
    }

    fn on_uevent_add(&mut self, buf: &[u8]) {
        match uevent_value(buf, "SUBSYSTEM") {
            Some("usb") => {
                if uevent_value(buf, "DEVTYPE") == Some("usb_interface") {
                    self.on_usb_interface_add(buf);
                }
            }
            Some("tty") => self.on_tty_add(buf),
            _ => {}
        }
    }

    // PRODUCT=18d1/4ee7/404
    // INTERFACE=255/66/1
    // DEVPATH=/devices/pci0000:00/0000:00:14.0/usb1/1-9/1-9.1/1-9.1:1.0
    fn on_usb_interface_add(&mut self, buf: &[u8]) {
        let (Some(product), Some(interface), Some(devpath)) = (
            uevent_value(buf, "PRODUCT"),
            uevent_value(buf, "INTERFACE"),
            uevent_value(buf, "DEVPATH"),
        ) else {
            return;
        };

        let ifnum = ifnum_from_devpath(devpath);
        let (vid, pid, _) = unpack_triple(product, 16);
        let (class, subclass, proto) = unpack_triple(interface, 10);

        if self.settings.is_usbserial_device(vid, pid) {
            // A tty node should emerge for this interface; rebind the
            // driver if it does not.
            self.expect = ExpectTty {
                deadline: Some(Instant::now() + EXPECT_TTY_TIMEOUT),
                devpath: devpath.to_string(),
                vid,
                pid,
                ifnum,
            };
            return;
        }

        // Device attributes live one level above the interface dir.
        let full = format!("/sys{devpath}");
        let Some(device_dir) = Path::new(&full).parent() else {
            return;
        };

        let mut attrs = UsbAttrs {
            vendor: vid,
            product: pid,
            ifnum,
            usb_class: class as u8,
            usb_sub_class: subclass as u8,
            usb_proto: proto as u8,
            ..Default::default()
        };
        if read_usb_attrs(device_dir, &mut attrs) {
            self.emit_interface(&attrs);
        }
    }

    // DEVPATH=/devices/.../usb1/1-9/1-9.1/1-9.1:1.0/ttyUSB0/tty/ttyUSB0
    // DEVNAME=ttyUSB0
    fn on_tty_add(&mut self, buf: &[u8]) {
        let (Some(devname), Some(devpath)) = (
            uevent_value(buf, "DEVNAME"),
            uevent_value(buf, "DEVPATH"),
        ) else {
            return;
        };

        // The expected node appeared; cancel the rebind timer.
        if self.expect.deadline.is_some()
            && !self.expect.devpath.is_empty()
            && devpath.starts_with(&self.expect.devpath)
        {
            self.expect.deadline = None;
        }

        let full = format!("/sys{devpath}");
        let Some(colon) = full.rfind(':') else {
            return;
        };
        let ifnum = ifnum_after_colon(&full[colon + 1..]);

        // Strip the interface suffix to reach the device dir.
        let Some(device_dir) = Path::new(&full[..colon]).parent() else {
            return;
        };

        let mut attrs = UsbAttrs {
            tty: devname.to_string(),
            ifnum,
            ..Default::default()
        };
        if read_usb_attrs(device_dir, &mut attrs) {
            self.emit_interface(&attrs);
        }
    }

    // DEVPATH=/devices/.../usb1/1-9/1-9.1
    // SUBSYSTEM=usb  DEVTYPE=usb_device  BUSNUM=001  DEVNUM=016
    fn on_uevent_remove(&mut self, buf: &[u8]) {
        if uevent_value(buf, "SUBSYSTEM") != Some("usb") {
            return;
        }

        if uevent_value(buf, "DEVTYPE") == Some("usb_interface") {
            if let Some(devpath) = uevent_value(buf, "DEVPATH") {
                if self.expect.deadline.is_some() && self.expect.devpath == devpath {
                    self.expect.deadline = None;
                }
            }
        }

        let (Some(busnum), Some(devnum)) = (
            uevent_value(buf, "BUSNUM"),
            uevent_value(buf, "DEVNUM"),
        ) else {
            return;
        };
        let (Ok(busnum), Ok(devnum)) = (busnum.parse::<u32>(), devnum.parse::<u32>()) else {
            return;
        };

        self.engine
            .on_interface_off(&session_locator((busnum & 0xff) as u8, (devnum & 0xff) as u8));
        self.unload_driver();
    }

    fn enumerate_devices(&mut self) {
        let Ok(entries) = std::fs::read_dir(SYSFS_DEVICE_PATH) else {
            debug!("{SYSFS_DEVICE_PATH} not available, skipping initial scan");
            return;
        };

        for entry in entries.flatten() {
            let name_os = entry.file_name();
            let Some(name) = name_os.to_str() else {
                continue;
            };
            // Device dirs only: "1-9.1", not interface dirs "1-9.1:1.0"
            // and not the "usb1" root-hub aliases.
            if !name.starts_with(|c: char| c.is_ascii_digit()) || name.contains(':') {
                continue;
            }
            self.scan_device(&entry.path());
        }
    }

    fn scan_device(&mut self, device_dir: &Path) {
        let mut base = UsbAttrs::default();
        if !read_usb_attrs(device_dir, &mut base) {
            return;
        }

        let Ok(entries) = std::fs::read_dir(device_dir) else {
            return;
        };

        let mut tty_found = false;
        let mut unknown_ifs = Vec::new();

        for entry in entries.flatten() {
            let name_os = entry.file_name();
            let Some(name) = name_os.to_str() else {
                continue;
            };
            if !name.contains(':') {
                continue; // only interface dirs
            }

            let ifnum = name
                .rsplit('.')
                .next()
                .and_then(|s| s.parse::<i32>().ok())
                .unwrap_or(-1);
            let interface_dir = entry.path();

            let mut attrs = base.clone();
            attrs.ifnum = ifnum;

            if let Some(tty) = find_tty_node(&interface_dir) {
                attrs.tty = tty;
                self.emit_interface(&attrs);
                tty_found = true;
                continue;
            }

            if let (Some(class), Some(subclass), Some(proto)) = (
                read_sysfs_u32(&interface_dir, "bInterfaceClass", 16),
                read_sysfs_u32(&interface_dir, "bInterfaceSubClass", 16),
                read_sysfs_u32(&interface_dir, "bInterfaceProtocol", 16),
            ) {
                attrs.usb_class = class as u8;
                attrs.usb_sub_class = subclass as u8;
                attrs.usb_proto = proto as u8;
                self.emit_interface(&attrs);
                continue;
            }

            if ifnum >= 0 {
                unknown_ifs.push(ifnum);
            }
        }

        if !tty_found
            && !unknown_ifs.is_empty()
            && self.settings.is_usbserial_device(base.vendor, base.product)
        {
            // Known usbserial hardware with no tty bound: rebind now.
            self.expect = ExpectTty {
                deadline: Some(Instant::now()),
                devpath: String::new(),
                vid: base.vendor,
                pid: base.product,
                ifnum: unknown_ifs[0],
            };
        }
    }

    fn emit_interface(&self, attrs: &UsbAttrs) {
        if !attrs.tty.is_empty()
            && !self.settings.is_usbserial_device(attrs.vendor, attrs.product)
        {
            // Only configured usbserial adapters surface as tty records.
            return;
        }

        let mut node = DeviceInterface {
            hub: attrs.hub.clone(),
            vid: attrs.vendor,
            pid: attrs.product,
            serial: attrs.serial.clone(),
            usb_if: attrs.ifnum,
            ..Default::default()
        };

        let friendly;
        if attrs.tty.is_empty() {
            node.device_type = DeviceType::USB;
            node.description = format!("USB - {}", attrs.hub);
            node.usb_class = attrs.usb_class;
            node.usb_sub_class = attrs.usb_sub_class;
            node.usb_proto = attrs.usb_proto;
            friendly = attrs.hub.clone();
        } else {
            node.device_type = DeviceType::USB | DeviceType::SERIAL;
            node.devpath = format!("/dev/{}", attrs.tty);
            node.description = attrs.tty.clone();
            friendly = attrs.tty.clone();
        }

        if !attrs.product_desc.is_empty() {
            node.description = format!("{} ({})", attrs.product_desc, friendly);
        }

        self.engine
            .on_interface_enumerated(&session_locator(attrs.busnum, attrs.devnum), node);
    }

    fn load_driver(&mut self) {
        let script = format!(
            "rmmod usbserial; modprobe usbserial vendor={:#06x} product={:#06x}",
            self.expect.vid, self.expect.pid
        );
        debug!(script, ifnum = self.expect.ifnum, "rebinding usbserial");
        match std::process::Command::new("sh").arg("-c").arg(&script).spawn() {
            Ok(mut child) => {
                self.driver_loaded = true;
                std::thread::spawn(move || {
                    let _ = child.wait();
                });
            }
            Err(e) => warn!("usbserial rebind failed to start: {e}"),
        }
    }

    fn unload_driver(&mut self) {
        if !self.driver_loaded {
            return;
        }
        self.driver_loaded = false;
        match std::process::Command::new("sh")
            .args(["-c", "rmmod usbserial"])
            .spawn()
        {
            Ok(mut child) => {
                std::thread::spawn(move || {
                    let _ = child.wait();
                });
            }
            Err(e) => warn!("usbserial unload failed to start: {e}"),
        }
    }
}

/// The locator of every interface of one physical device is its
/// bus/address session id; hot-plug removal reports the same pair.
fn session_locator(busnum: u8, devnum: u8) -> String {
    (((busnum as u16) << 8) | devnum as u16).to_string()
}

/// Look up `KEY=value` in a NUL-separated uevent buffer.
fn uevent_value<'a>(buf: &'a [u8], key: &str) -> Option<&'a str> {
    buf.split(|b| *b == 0).find_map(|part| {
        let s = std::str::from_utf8(part).ok()?;
        let rest = s.strip_prefix(key)?;
        rest.strip_prefix('=')
    })
}

/// Parse `a/b/c` triples like `PRODUCT=18d1/4ee7/404` (hex) or
/// `INTERFACE=255/66/1` (decimal).
fn unpack_triple(s: &str, radix: u32) -> (u16, u16, u16) {
    let mut parts = s.split('/');
    let mut next = || {
        parts
            .next()
            .and_then(|p| u16::from_str_radix(p, radix).ok())
            .unwrap_or(0)
    };
    let a = next();
    let b = next();
    let c = next();
    (a, b, c)
}

/// Interface number from a devpath tail like `.../1-9.1:1.0` -> 0.
fn ifnum_from_devpath(devpath: &str) -> i32 {
    devpath
        .rsplit('.')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(-1)
}

/// Interface number from the text after the config colon:
/// `1.0/ttyUSB0/tty/ttyUSB0` -> 0.
fn ifnum_after_colon(s: &str) -> i32 {
    let Some(dot) = s.find('.') else {
        return -1;
    };
    let digits: String = s[dot + 1..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(-1)
}

/// A tty child of an interface dir: either `ttyUSB0` directly or an
/// ACM-style `tty/ttyACM0` one level down.
fn find_tty_node(interface_dir: &Path) -> Option<String> {
    let entries = std::fs::read_dir(interface_dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("tty") {
            continue;
        }
        if name == "tty" {
            let nested = std::fs::read_dir(entry.path()).ok()?;
            for sub in nested.flatten() {
                return Some(sub.file_name().to_string_lossy().into_owned());
            }
            return None;
        }
        return Some(name);
    }
    None
}

#[derive(Debug, Clone, Default)]
struct UsbAttrs {
    busnum: u8,
    devnum: u8,
    vendor: u16,
    product: u16,
    /// `1-9.1` -> `USB1-9-1`
    hub: String,
    tty: String,
    serial: String,
    product_desc: String,
    ifnum: i32,
    usb_class: u8,
    usb_sub_class: u8,
    usb_proto: u8,
}

fn read_usb_attrs(device_dir: &Path, attrs: &mut UsbAttrs) -> bool {
    // bNumInterfaces is unset while the device is unconfigured; treat
    // that as "not ready" exactly like a missing busnum.
    if read_sysfs_u32(device_dir, "bNumInterfaces", 10).is_none() {
        return false;
    }
    let Some(busnum) = read_sysfs_u32(device_dir, "busnum", 10) else {
        return false;
    };
    let Some(devnum) = read_sysfs_u32(device_dir, "devnum", 10) else {
        return false;
    };
    attrs.busnum = (busnum & 0xff) as u8;
    attrs.devnum = (devnum & 0xff) as u8;

    if attrs.vendor == 0 {
        let Some(vendor) = read_sysfs_u32(device_dir, "idVendor", 16) else {
            return false;
        };
        attrs.vendor = vendor as u16;
    }
    if attrs.product == 0 {
        let Some(product) = read_sysfs_u32(device_dir, "idProduct", 16) else {
            return false;
        };
        attrs.product = product as u16;
    }

    if let Some(serial) = read_sysfs_string(device_dir, "serial") {
        attrs.serial = serial;
    }
    if let Some(desc) = read_sysfs_string(device_dir, "product") {
        attrs.product_desc = desc;
    }

    if let Some(name) = device_dir.file_name().and_then(|n| n.to_str()) {
        attrs.hub = format!("USB{}", name.replace('.', "-"));
    }

    true
}

fn read_sysfs_string(dir: &Path, attr: &str) -> Option<String> {
    let raw = std::fs::read_to_string(dir.join(attr)).ok()?;
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn read_sysfs_u32(dir: &Path, attr: &str, radix: u32) -> Option<u32> {
    let raw = read_sysfs_string(dir, attr)?;
    // Decimal attributes may carry a fraction ("1.5" speed values).
    let head = raw.split('.').next()?;
    u32::from_str_radix(head, radix).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uevent(pairs: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        for pair in pairs {
            buf.extend_from_slice(pair.as_bytes());
            buf.push(0);
        }
        buf
    }

    #[test]
    fn uevent_key_lookup() {
        let buf = uevent(&[
            "add@/devices/x",
            "ACTION=add",
            "SUBSYSTEM=usb",
            "DEVTYPE=usb_interface",
            "PRODUCT=18d1/4ee7/404",
        ]);
        assert_eq!(uevent_value(&buf, "ACTION"), Some("add"));
        assert_eq!(uevent_value(&buf, "SUBSYSTEM"), Some("usb"));
        assert_eq!(uevent_value(&buf, "PRODUCT"), Some("18d1/4ee7/404"));
        assert_eq!(uevent_value(&buf, "DEVNAME"), None);
        // Exact key match only.
        assert_eq!(uevent_value(&buf, "ACT"), None);
    }

    #[test]
    fn triple_unpacking() {
        assert_eq!(unpack_triple("18d1/4ee7/404", 16), (0x18d1, 0x4ee7, 0x404));
        assert_eq!(unpack_triple("255/66/1", 10), (255, 66, 1));
        assert_eq!(unpack_triple("255/66", 10), (255, 66, 0));
        assert_eq!(unpack_triple("garbage", 10), (0, 0, 0));
    }

    #[test]
    fn interface_numbers() {
        assert_eq!(
            ifnum_from_devpath("/devices/pci0000:00/usb1/1-9/1-9.1/1-9.1:1.0"),
            0
        );
        assert_eq!(ifnum_from_devpath("/devices/x/1-9:1.3"), 3);
        assert_eq!(ifnum_from_devpath("/devices/nodot"), -1);

        assert_eq!(ifnum_after_colon("1.0/ttyUSB0/tty/ttyUSB0"), 0);
        assert_eq!(ifnum_after_colon("1.2/ttyUSB1"), 2);
        assert_eq!(ifnum_after_colon("nodot"), -1);
    }

    #[test]
    fn session_locator_packs_bus_and_address() {
        assert_eq!(session_locator(1, 16), "272");
        assert_eq!(session_locator(0, 1), "1");
        assert_eq!(session_locator(2, 0), "512");
    }
}
