//! Windows device source: device-interface notifications
//!
//! Runs a hidden message-only window registered for device-interface
//! broadcasts of the serial-port and ADB/WinUSB classes. Arrivals are
//! resolved through SetupDi to pick up the driver service name, the
//! friendly description, the port path and the interface class triple;
//! the device-instance path doubles as the stable locator. Teardown
//! posts a close message to the window.

use std::ffi::c_void;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{mpsc, Arc};

use tracing::{debug, warn};

use windows_sys::core::GUID;
use windows_sys::Win32::Devices::DeviceAndDriverInstallation::{
    SetupDiDestroyDeviceInfoList, SetupDiEnumDeviceInterfaces, SetupDiGetClassDevsW,
    SetupDiGetDeviceInterfaceDetailW, SetupDiGetDeviceRegistryPropertyW, DIGCF_DEVICEINTERFACE,
    DIGCF_PRESENT, SPDRP_COMPATIBLEIDS, SPDRP_DEVICEDESC, SPDRP_LOCATION_INFORMATION,
    SPDRP_SERVICE, SP_DEVICE_INTERFACE_DATA, SP_DEVINFO_DATA,
};
use windows_sys::Win32::Foundation::{HWND, LPARAM, LRESULT, WPARAM};
use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;
use windows_sys::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DispatchMessageW, GetMessageW, GetWindowLongPtrW,
    PostMessageW, PostQuitMessage, RegisterClassW, RegisterDeviceNotificationW,
    SetWindowLongPtrW, TranslateMessage, UnregisterDeviceNotification, DBT_DEVICEARRIVAL,
    DBT_DEVICEREMOVECOMPLETE, DBT_DEVTYP_DEVICEINTERFACE, DEVICE_NOTIFY_WINDOW_HANDLE,
    DEV_BROADCAST_DEVICEINTERFACE_W, DEV_BROADCAST_HDR, GWLP_USERDATA, HWND_MESSAGE, MSG,
    WM_CLOSE, WM_DESTROY, WM_DEVICECHANGE, WNDCLASSW,
};

use crate::engine::Engine;
use crate::platform::SourceHandle;
use crate::settings::WatchSettings;
use crate::types::{DeviceInterface, DeviceType};

/// Serial-port device interface class.
const GUID_DEVINTERFACE_COMPORT: GUID = GUID {
    data1: 0x86e0d1e0,
    data2: 0x8089,
    data3: 0x11d0,
    data4: [0x9c, 0xe4, 0x08, 0x00, 0x3e, 0x30, 0x1f, 0x73],
};

/// ADB/WinUSB device interface class used by Android debug drivers.
const GUID_DEVINTERFACE_ADB: GUID = GUID {
    data1: 0xf72fe0d4,
    data2: 0xcbcb,
    data3: 0x407d,
    data4: [0x88, 0x14, 0x9e, 0xd6, 0x73, 0xd0, 0xdd, 0x6b],
};

const WATCHED_CLASSES: [GUID; 2] = [GUID_DEVINTERFACE_COMPORT, GUID_DEVINTERFACE_ADB];

pub(crate) fn spawn_source(
    engine: Arc<Engine>,
    settings: WatchSettings,
) -> common::Result<SourceHandle> {
    let hwnd = Arc::new(AtomicIsize::new(0));
    let (ready_tx, ready_rx) = mpsc::channel();

    // Driver and id filters run in the engine; the source itself has no
    // per-setting behavior on this platform.
    let _ = settings;

    let loop_hwnd = Arc::clone(&hwnd);
    let thread = std::thread::Builder::new()
        .name("usb-watch".into())
        .spawn(move || {
            let source = Box::new(WindowsSource { engine });
            run_message_loop(source, loop_hwnd, ready_tx);
        })
        .map_err(|e| common::Error::Init(e.to_string()))?;

    match ready_rx.recv() {
        Ok(true) => {}
        _ => {
            let _ = thread.join();
            return Err(common::Error::Init("device source failed to start".into()));
        }
    }

    let stop_hwnd = Arc::clone(&hwnd);
    Ok(SourceHandle::new(
        thread,
        Box::new(move || {
            let hwnd = stop_hwnd.load(Ordering::SeqCst) as HWND;
            if !hwnd.is_null() {
                unsafe { PostMessageW(hwnd, WM_CLOSE, 0, 0) };
            }
        }),
    ))
}

struct WindowsSource {
    engine: Arc<Engine>,
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn run_message_loop(
    source: Box<WindowsSource>,
    shared_hwnd: Arc<AtomicIsize>,
    ready: mpsc::Sender<bool>,
) {
    unsafe {
        let class_name = wide("devwatch-usb-watch");
        let instance = GetModuleHandleW(std::ptr::null());

        let wc = WNDCLASSW {
            style: 0,
            lpfnWndProc: Some(wnd_proc),
            cbClsExtra: 0,
            cbWndExtra: 0,
            hInstance: instance,
            hIcon: std::ptr::null_mut(),
            hCursor: std::ptr::null_mut(),
            hbrBackground: std::ptr::null_mut(),
            lpszMenuName: std::ptr::null(),
            lpszClassName: class_name.as_ptr(),
        };
        if RegisterClassW(&wc) == 0 {
            let _ = ready.send(false);
            return;
        }

        let hwnd = CreateWindowExW(
            0,
            class_name.as_ptr(),
            class_name.as_ptr(),
            0,
            0,
            0,
            0,
            0,
            HWND_MESSAGE,
            std::ptr::null_mut(),
            instance,
            std::ptr::null(),
        );
        if hwnd.is_null() {
            let _ = ready.send(false);
            return;
        }

        let source_ptr = Box::into_raw(source);
        SetWindowLongPtrW(hwnd, GWLP_USERDATA, source_ptr as isize);
        shared_hwnd.store(hwnd as isize, Ordering::SeqCst);

        let mut registrations = Vec::new();
        for guid in &WATCHED_CLASSES {
            let mut filter: DEV_BROADCAST_DEVICEINTERFACE_W = std::mem::zeroed();
            filter.dbcc_size = std::mem::size_of::<DEV_BROADCAST_DEVICEINTERFACE_W>() as u32;
            filter.dbcc_devicetype = DBT_DEVTYP_DEVICEINTERFACE;
            filter.dbcc_classguid = *guid;

            let registration = RegisterDeviceNotificationW(
                hwnd as *mut c_void,
                &filter as *const _ as *const c_void,
                DEVICE_NOTIFY_WINDOW_HANDLE,
            );
            if registration.is_null() {
                let _ = ready.send(false);
                drop(Box::from_raw(source_ptr));
                return;
            }
            registrations.push(registration);
        }

        (*source_ptr).enumerate_present_interfaces();
        let _ = ready.send(true);

        let mut msg: MSG = std::mem::zeroed();
        while GetMessageW(&mut msg, std::ptr::null_mut(), 0, 0) > 0 {
            TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }

        for registration in registrations {
            UnregisterDeviceNotification(registration);
        }
        shared_hwnd.store(0, Ordering::SeqCst);
        drop(Box::from_raw(source_ptr));
    }
}

unsafe extern "system" fn wnd_proc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    match msg {
        WM_DEVICECHANGE => {
            let source = GetWindowLongPtrW(hwnd, GWLP_USERDATA) as *mut WindowsSource;
            if !source.is_null() && lparam != 0 {
                let header = &*(lparam as *const DEV_BROADCAST_HDR);
                if header.dbch_devicetype == DBT_DEVTYP_DEVICEINTERFACE {
                    let broadcast = &*(lparam as *const DEV_BROADCAST_DEVICEINTERFACE_W);
                    let name_ptr = broadcast.dbcc_name.as_ptr();
                    let mut len = 0usize;
                    while *name_ptr.add(len) != 0 {
                        len += 1;
                    }
                    let devpath =
                        String::from_utf16_lossy(std::slice::from_raw_parts(name_ptr, len));

                    match wparam as u32 {
                        DBT_DEVICEARRIVAL => {
                            (*source).on_interface_arrival(&broadcast.dbcc_classguid, &devpath);
                        }
                        DBT_DEVICEREMOVECOMPLETE => {
                            (*source).on_interface_remove(&devpath);
                        }
                        _ => {}
                    }
                }
            }
            1
        }
        WM_CLOSE => {
            windows_sys::Win32::UI::WindowsAndMessaging::DestroyWindow(hwnd);
            0
        }
        WM_DESTROY => {
            PostQuitMessage(0);
            0
        }
        _ => DefWindowProcW(hwnd, msg, wparam, lparam),
    }
}

impl WindowsSource {
    /// Initial scan: one synthetic arrival per present interface of the
    /// watched classes.
    fn enumerate_present_interfaces(&self) {
        for guid in &WATCHED_CLASSES {
            unsafe {
                let devinfo = SetupDiGetClassDevsW(
                    guid,
                    std::ptr::null(),
                    std::ptr::null_mut(),
                    DIGCF_DEVICEINTERFACE | DIGCF_PRESENT,
                );
                if devinfo.is_null() {
                    continue;
                }

                let mut index = 0;
                loop {
                    let mut interface_data: SP_DEVICE_INTERFACE_DATA = std::mem::zeroed();
                    interface_data.cbSize =
                        std::mem::size_of::<SP_DEVICE_INTERFACE_DATA>() as u32;
                    if SetupDiEnumDeviceInterfaces(
                        devinfo,
                        std::ptr::null(),
                        guid,
                        index,
                        &mut interface_data,
                    ) == 0
                    {
                        break;
                    }
                    index += 1;

                    // Two calls: first for the size, then for the path.
                    let mut required = 0u32;
                    SetupDiGetDeviceInterfaceDetailW(
                        devinfo,
                        &interface_data,
                        std::ptr::null_mut(),
                        0,
                        &mut required,
                        std::ptr::null_mut(),
                    );
                    if required == 0 {
                        continue;
                    }

                    let mut detail = vec![0u8; required as usize];
                    let detail_ptr = detail.as_mut_ptr()
                        as *mut windows_sys::Win32::Devices::DeviceAndDriverInstallation::SP_DEVICE_INTERFACE_DETAIL_DATA_W;
                    (*detail_ptr).cbSize = std::mem::size_of::<
                        windows_sys::Win32::Devices::DeviceAndDriverInstallation::SP_DEVICE_INTERFACE_DETAIL_DATA_W,
                    >() as u32;

                    let mut devinfo_data: SP_DEVINFO_DATA = std::mem::zeroed();
                    devinfo_data.cbSize = std::mem::size_of::<SP_DEVINFO_DATA>() as u32;

                    if SetupDiGetDeviceInterfaceDetailW(
                        devinfo,
                        &interface_data,
                        detail_ptr,
                        required,
                        std::ptr::null_mut(),
                        &mut devinfo_data,
                    ) == 0
                    {
                        continue;
                    }

                    let path_ptr = std::ptr::addr_of!((*detail_ptr).DevicePath) as *const u16;
                    let mut len = 0usize;
                    while *path_ptr.add(len) != 0 {
                        len += 1;
                    }
                    let devpath =
                        String::from_utf16_lossy(std::slice::from_raw_parts(path_ptr, len));

                    self.emit_arrival(guid, &devpath, devinfo, Some(devinfo_data));
                }

                SetupDiDestroyDeviceInfoList(devinfo);
            }
        }
    }

    fn on_interface_arrival(&self, guid: &GUID, devpath: &str) {
        unsafe {
            // Re-resolve the arrived interface to reach its registry
            // properties.
            let devinfo = SetupDiGetClassDevsW(
                guid,
                std::ptr::null(),
                std::ptr::null_mut(),
                DIGCF_DEVICEINTERFACE | DIGCF_PRESENT,
            );
            if devinfo.is_null() {
                self.emit_arrival(guid, devpath, std::ptr::null_mut(), None);
                return;
            }
            self.emit_arrival(guid, devpath, devinfo, None);
            SetupDiDestroyDeviceInfoList(devinfo);
        }
    }

    fn on_interface_remove(&self, devpath: &str) {
        let locator = device_instance_from_devpath(devpath);
        if locator.is_empty() {
            return;
        }
        self.engine.on_interface_off(&locator);
    }

    fn emit_arrival(
        &self,
        guid: &GUID,
        devpath: &str,
        devinfo: windows_sys::Win32::Devices::DeviceAndDriverInstallation::HDEVINFO,
        devinfo_data: Option<SP_DEVINFO_DATA>,
    ) {
        let locator = device_instance_from_devpath(devpath);
        if locator.is_empty() {
            debug!(devpath, "ignoring interface with unparsable path");
            return;
        }

        let mut node = DeviceInterface::default();
        let (vid, pid, ifnum) = ids_from_devpath(devpath);
        node.vid = vid;
        node.pid = pid;
        node.usb_if = ifnum;
        node.serial = serial_from_devpath(devpath);

        if guid_eq(guid, &GUID_DEVINTERFACE_COMPORT) {
            node.device_type = DeviceType::USB | DeviceType::SERIAL;
        } else {
            node.device_type = DeviceType::USB;
            // The ADB class only binds vendor-specific debug interfaces.
            node.usb_class = 0xff;
            node.usb_sub_class = 0x42;
            node.usb_proto = 0x01;
        }

        if !devinfo.is_null() {
            if let Some(data) = devinfo_data {
                self.fill_registry_properties(&mut node, devinfo, &data);
            }
        }

        if node.description.is_empty() {
            node.description = locator.clone();
        }

        self.engine.on_interface_enumerated(&locator, node);
    }

    fn fill_registry_properties(
        &self,
        node: &mut DeviceInterface,
        devinfo: windows_sys::Win32::Devices::DeviceAndDriverInstallation::HDEVINFO,
        data: &SP_DEVINFO_DATA,
    ) {
        if let Some(service) = registry_property(devinfo, data, SPDRP_SERVICE) {
            node.driver = service;
        }
        if let Some(desc) = registry_property(devinfo, data, SPDRP_DEVICEDESC) {
            node.description = desc;
        }
        if let Some(location) = registry_property(devinfo, data, SPDRP_LOCATION_INFORMATION) {
            node.hub = hub_from_location(&location);
        }
        if let Some(compatible) = registry_property(devinfo, data, SPDRP_COMPATIBLEIDS) {
            if let Some((class, subclass, proto)) = class_triple_from_compatible_ids(&compatible)
            {
                node.usb_class = class;
                node.usb_sub_class = subclass;
                node.usb_proto = proto;
            }
        }
    }
}

fn guid_eq(a: &GUID, b: &GUID) -> bool {
    a.data1 == b.data1 && a.data2 == b.data2 && a.data3 == b.data3 && a.data4 == b.data4
}

fn registry_property(
    devinfo: windows_sys::Win32::Devices::DeviceAndDriverInstallation::HDEVINFO,
    data: &SP_DEVINFO_DATA,
    property: u32,
) -> Option<String> {
    unsafe {
        let mut buf = [0u16; 512];
        let mut required = 0u32;
        let ok = SetupDiGetDeviceRegistryPropertyW(
            devinfo,
            data,
            property,
            std::ptr::null_mut(),
            buf.as_mut_ptr() as *mut u8,
            (buf.len() * 2) as u32,
            &mut required,
        );
        if ok == 0 {
            return None;
        }
        let len = buf.iter().position(|c| *c == 0).unwrap_or(buf.len());
        if len == 0 {
            return None;
        }
        Some(String::from_utf16_lossy(&buf[..len]))
    }
}

/// `\\?\usb#vid_18d1&pid_4ee7&mi_01#6&2c3f&0&0001#{...}` ->
/// `USB\VID_18D1&PID_4EE7&MI_01\6&2C3F&0&0001`
fn device_instance_from_devpath(devpath: &str) -> String {
    let trimmed = devpath.strip_prefix(r"\\?\").unwrap_or(devpath);
    let mut parts = trimmed.split('#');
    let (Some(bus), Some(hwid), Some(instance)) = (parts.next(), parts.next(), parts.next())
    else {
        return String::new();
    };
    format!("{bus}\\{hwid}\\{instance}").to_uppercase()
}

/// Pull VID/PID and the composite interface number out of an interface
/// devpath. `mi_xx` is absent on non-composite devices.
fn ids_from_devpath(devpath: &str) -> (u16, u16, i32) {
    let lower = devpath.to_lowercase();
    let find_hex = |tag: &str| -> u32 {
        lower
            .find(tag)
            .map(|pos| &lower[pos + tag.len()..])
            .and_then(|rest| {
                let digits: String = rest
                    .chars()
                    .take_while(|c| c.is_ascii_hexdigit())
                    .collect();
                u32::from_str_radix(&digits, 16).ok()
            })
            .unwrap_or(0)
    };

    let vid = find_hex("vid_") as u16;
    let pid = find_hex("pid_") as u16;
    let ifnum = match lower.find("mi_") {
        Some(_) => find_hex("mi_") as i32,
        None => -1,
    };
    (vid, pid, ifnum)
}

/// The third `#`-separated chunk carries the serial for single-instance
/// devices; composite instance paths (`6&2c3f&0&0001`) are not serials.
fn serial_from_devpath(devpath: &str) -> String {
    let trimmed = devpath.strip_prefix(r"\\?\").unwrap_or(devpath);
    let instance = trimmed.split('#').nth(2).unwrap_or("");
    if instance.contains('&') {
        String::new()
    } else {
        instance.to_string()
    }
}

/// `Port_#0003.Hub_#0001` -> `USB1-3`
fn hub_from_location(location: &str) -> String {
    let number_after = |tag: &str| -> Option<u32> {
        let pos = location.find(tag)?;
        let digits: String = location[pos + tag.len()..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().ok()
    };

    match (number_after("Hub_#"), number_after("Port_#")) {
        (Some(hub), Some(port)) => format!("USB{hub}-{port}"),
        _ => String::new(),
    }
}

/// `USB\Class_ff&SubClass_42&Prot_01` from the compatible-ids multi-sz.
fn class_triple_from_compatible_ids(ids: &str) -> Option<(u8, u8, u8)> {
    let lower = ids.to_lowercase();
    let hex_after = |tag: &str| -> Option<u8> {
        let pos = lower.find(tag)?;
        let digits: String = lower[pos + tag.len()..]
            .chars()
            .take_while(|c| c.is_ascii_hexdigit())
            .collect();
        u8::from_str_radix(&digits, 16).ok()
    };

    Some((
        hex_after("class_")?,
        hex_after("subclass_")?,
        hex_after("prot_")?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devpath_to_device_instance() {
        let devpath =
            r"\\?\usb#vid_31ef&pid_9091&mi_03#6&897122b&0&0003#{f72fe0d4-cbcb-407d-8814-9ed673d0dd6b}";
        assert_eq!(
            device_instance_from_devpath(devpath),
            r"USB\VID_31EF&PID_9091&MI_03\6&897122B&0&0003"
        );
    }

    #[test]
    fn devpath_id_extraction() {
        let devpath = r"\\?\usb#vid_18d1&pid_4ee7&mi_01#6&2c3f&0&0001#{guid}";
        assert_eq!(ids_from_devpath(devpath), (0x18d1, 0x4ee7, 1));

        let simple = r"\\?\usb#vid_18d1&pid_4ee7#HT12345#{guid}";
        assert_eq!(ids_from_devpath(simple), (0x18d1, 0x4ee7, -1));
        assert_eq!(serial_from_devpath(simple), "HT12345");
        assert_eq!(serial_from_devpath(devpath), "");
    }

    #[test]
    fn location_to_hub_path() {
        assert_eq!(hub_from_location("Port_#0003.Hub_#0001"), "USB1-3");
        assert_eq!(hub_from_location("weird"), "");
    }

    #[test]
    fn compatible_ids_to_class_triple() {
        assert_eq!(
            class_triple_from_compatible_ids(r"USB\Class_ff&SubClass_42&Prot_01"),
            Some((0xff, 0x42, 0x01))
        );
        assert_eq!(class_triple_from_compatible_ids("USB\\COMPOSITE"), None);
    }
}
