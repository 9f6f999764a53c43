//! Watch settings and their command-line forms

use std::str::FromStr;

use common::{Error, Result};

use crate::types::DeviceType;

/// Immutable filter specification supplied before the watch starts.
#[derive(Debug, Clone)]
pub struct WatchSettings {
    /// OR of alternatives; a record passes when any mask is fully
    /// covered by its type bits. Empty means pass-all.
    pub type_filters: Vec<DeviceType>,
    pub include_vids: Vec<u16>,
    pub exclude_vids: Vec<u16>,
    pub include_pids: Vec<u16>,
    pub exclude_pids: Vec<u16>,
    /// Driver/service names; non-empty list must contain the record's.
    pub drivers: Vec<String>,
    /// Reconcile USB-ADB interfaces against the ADB server.
    pub with_adb: bool,
    /// (vid, pid) pairs eligible for the usbserial rebind; pid 0 is a
    /// wildcard. Linux only, requires root.
    pub usbserial_vidpid: Vec<(u16, u16)>,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            type_filters: Vec::new(),
            include_vids: Vec::new(),
            exclude_vids: Vec::new(),
            include_pids: Vec::new(),
            exclude_pids: Vec::new(),
            drivers: Vec::new(),
            with_adb: true,
            usbserial_vidpid: Vec::new(),
        }
    }
}

impl WatchSettings {
    /// Is this (vid, pid) pair a configured usbserial candidate?
    pub fn is_usbserial_device(&self, vid: u16, pid: u16) -> bool {
        self.usbserial_vidpid
            .iter()
            .any(|(v, p)| *v == vid && (*p == pid || *p == 0))
    }
}

/// Parse a decimal or `0x`-prefixed hex id.
fn parse_u16(s: &str) -> Result<u16> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|_| Error::Config(format!("invalid id {s:?}")))
}

/// Parse a comma-separated id list; a `!` prefix marks an exclusion.
/// E.g. `"0x18d1,!0x04e8"` -> includes `[0x18d1]`, excludes `[0x04e8]`.
pub fn parse_id_list(arg: &str) -> Result<(Vec<u16>, Vec<u16>)> {
    let mut includes = Vec::new();
    let mut excludes = Vec::new();

    for token in arg.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if let Some(rest) = token.strip_prefix('!') {
            excludes.push(parse_u16(rest)?);
        } else {
            includes.push(parse_u16(token)?);
        }
    }

    Ok((includes, excludes))
}

/// Parse type filter alternatives: `|` between alternatives, `,` within.
/// E.g. `"usb,adb|net"` matches USB-ADB records or network records.
pub fn parse_type_filters(arg: &str) -> Result<Vec<DeviceType>> {
    let mut out = Vec::new();
    for alternative in arg.split('|') {
        if alternative.trim().is_empty() {
            continue;
        }
        out.push(DeviceType::from_str(alternative)?);
    }
    Ok(out)
}

/// Parse a comma-separated driver name list.
pub fn parse_driver_list(arg: &str) -> Vec<String> {
    arg.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse comma-separated `vid:pid` pairs; pid 0 is a wildcard.
pub fn parse_vidpid_list(arg: &str) -> Result<Vec<(u16, u16)>> {
    let mut out = Vec::new();
    for token in arg.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let Some((vid, pid)) = token.split_once(':') else {
            return Err(Error::Config(format!("invalid vid:pid pair {token:?}")));
        };
        out.push((parse_u16(vid)?, parse_u16(pid)?));
    }
    Ok(out)
}
