//! # USB Recovery Ladder
//!
//! When the device disappears and plain rescanning cannot bring it back, the
//! host side can kick the USB stack itself. This module is the ordered
//! ladder of those kicks, from a polite authorization toggle to removing the
//! host controller from the PCI bus.
//!
//! Procedures are identified by name; their position in [`PROCEDURES`] only
//! orders escalation. Each one is defensive: every sysfs write is
//! best-effort, missing pseudo-files (containers, non-Linux hosts, odd
//! kernels) degrade to a failed report, and nothing here panics.
//!
//! | # | name | what it does |
//! |---|------|--------------|
//! | 1 | authorize-toggle | deauthorize/reauthorize the device |
//! | 2 | remove-rescan | remove the device, re-enumerate each host bus |
//! | 3 | hc-rebind | unbind + rebind the xHCI controller driver |
//! | 4 | pci-power-cycle | remove the controller from PCI, rescan the bus |
//! | 5 | multi-cycle | repeated 4-then-3 passes with growing delays |
//! | 6 | runtime-pm | force the controller through autosuspend |

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use super::{DEVICE_PIDS, DEVICE_VID};

/// Ladder order, lightest first.
pub const PROCEDURES: [&str; 6] = [
    "authorize-toggle",
    "remove-rescan",
    "hc-rebind",
    "pci-power-cycle",
    "multi-cycle",
    "runtime-pm",
];

/// Tunable knobs, mostly for tests and for hosts with slow enumeration.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub vid: u16,
    pub pids: Vec<u16>,
    /// `/sys/bus/usb/devices`
    pub usb_devices: PathBuf,
    /// `/sys/bus/pci/drivers`
    pub pci_drivers: PathBuf,
    /// `/sys/bus/pci/devices`
    pub pci_devices: PathBuf,
    /// `/sys/bus/pci/rescan`
    pub pci_rescan: PathBuf,
    /// Pause after light operations (authorize, rebind).
    pub settle_short: Duration,
    /// Pause after re-enumeration triggers.
    pub settle_medium: Duration,
    /// Pause after PCI device removal.
    pub settle_long: Duration,
    /// Deepest level `run_auto` may reach; `run_ultimate` ignores this.
    pub auto_max_level: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            vid: DEVICE_VID,
            pids: DEVICE_PIDS.to_vec(),
            usb_devices: PathBuf::from("/sys/bus/usb/devices"),
            pci_drivers: PathBuf::from("/sys/bus/pci/drivers"),
            pci_devices: PathBuf::from("/sys/bus/pci/devices"),
            pci_rescan: PathBuf::from("/sys/bus/pci/rescan"),
            settle_short: Duration::from_secs(1),
            settle_medium: Duration::from_secs(3),
            settle_long: Duration::from_secs(30),
            auto_max_level: 3,
        }
    }
}

/// Outcome of one procedure.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub success: bool,
    pub procedure: &'static str,
    pub message: String,
    pub device_found: bool,
}

impl RecoveryReport {
    fn new(procedure: &'static str, success: bool, message: String, device_found: bool) -> Self {
        RecoveryReport {
            success,
            procedure,
            message,
            device_found,
        }
    }
}

/// Runs levels `1..=auto_max_level` in order; the first procedure after
/// which the device re-enumerates wins, otherwise the last report comes
/// back.
pub async fn run_auto(cfg: &RecoveryConfig) -> RecoveryReport {
    run_levels(cfg, cfg.auto_max_level.clamp(1, PROCEDURES.len())).await
}

/// Runs the entire ladder, all six procedures, lightest first.
pub async fn run_ultimate(cfg: &RecoveryConfig) -> RecoveryReport {
    run_levels(cfg, PROCEDURES.len()).await
}

async fn run_levels(cfg: &RecoveryConfig, max_level: usize) -> RecoveryReport {
    let mut last = RecoveryReport::new(PROCEDURES[0], false, "ladder not run".into(), false);
    for level in 1..=max_level {
        info!("usb recovery: running {}", PROCEDURES[level - 1]);
        last = run_procedure(cfg, level).await;
        if last.device_found {
            return last;
        }
    }
    last
}

/// Runs one 1-based ladder level.
pub async fn run_procedure(cfg: &RecoveryConfig, level: usize) -> RecoveryReport {
    match level {
        1 => authorize_toggle(cfg).await,
        2 => remove_rescan(cfg).await,
        3 => controller_rebind(cfg).await,
        4 => pci_power_cycle(cfg).await,
        5 => multi_cycle(cfg).await,
        6 => runtime_pm(cfg).await,
        _ => RecoveryReport::new(
            PROCEDURES[PROCEDURES.len() - 1],
            false,
            format!("no such ladder level {level}"),
            false,
        ),
    }
}

/// Level 1: write `0` then `1` to the device's `authorized` file. Power is
/// untouched, so this is safe to run even while audio capture is up.
async fn authorize_toggle(cfg: &RecoveryConfig) -> RecoveryReport {
    let name = PROCEDURES[0];
    let Some(dev) = find_device_dir(cfg) else {
        return RecoveryReport::new(name, false, "device not present in sysfs".into(), false);
    };

    let mut log = String::new();
    let ok_off = write_attr(&dev.join("authorized"), "0", &mut log);
    tokio::time::sleep(cfg.settle_short).await;
    let ok_on = write_attr(&dev.join("authorized"), "1", &mut log);
    tokio::time::sleep(cfg.settle_short).await;

    let found = device_enumerated(cfg);
    RecoveryReport::new(name, ok_off && ok_on, trimmed(log, "authorization toggled"), found)
}

/// Level 2: detach the device, then poke `authorized_default` on every host
/// bus to force a re-enumeration sweep.
async fn remove_rescan(cfg: &RecoveryConfig) -> RecoveryReport {
    let name = PROCEDURES[1];
    let mut log = String::new();
    let mut removed = false;

    if let Some(dev) = find_device_dir(cfg) {
        removed = write_attr(&dev.join("remove"), "1", &mut log);
        tokio::time::sleep(cfg.settle_short).await;
    } else {
        let _ = writeln!(log, "device not present in sysfs, rescanning anyway");
    }

    let mut toggled = 0usize;
    for bus in host_buses(cfg) {
        let attr = bus.join("authorized_default");
        if write_attr(&attr, "0", &mut log) {
            tokio::time::sleep(cfg.settle_short).await;
            if write_attr(&attr, "1", &mut log) {
                toggled += 1;
            }
        }
    }
    tokio::time::sleep(cfg.settle_medium).await;

    let found = device_enumerated(cfg);
    let _ = writeln!(log, "removed={removed}, buses toggled={toggled}");
    RecoveryReport::new(name, removed || toggled > 0, trimmed(log, "bus rescan issued"), found)
}

/// Level 3: unbind and rebind the xHCI host controller's PCI function.
async fn controller_rebind(cfg: &RecoveryConfig) -> RecoveryReport {
    let name = PROCEDURES[2];
    let Some(address) = host_controller_address(cfg) else {
        return RecoveryReport::new(name, false, "no xhci controller address found".into(), false);
    };

    let driver = cfg.pci_drivers.join("xhci_hcd");
    let mut log = String::new();
    let unbound = write_attr(&driver.join("unbind"), &address, &mut log);
    tokio::time::sleep(cfg.settle_short).await;
    let bound = write_attr(&driver.join("bind"), &address, &mut log);
    tokio::time::sleep(cfg.settle_medium).await;

    let found = device_enumerated(cfg);
    let _ = writeln!(log, "controller {address} rebind");
    RecoveryReport::new(name, unbound && bound, trimmed(log, "controller rebound"), found)
}

/// Level 4: remove the controller from the PCI bus entirely, then trigger a
/// bus rescan. The deepest single-shot reset; takes tens of seconds.
async fn pci_power_cycle(cfg: &RecoveryConfig) -> RecoveryReport {
    let name = PROCEDURES[3];
    let Some(address) = host_controller_address(cfg) else {
        return RecoveryReport::new(name, false, "no xhci controller address found".into(), false);
    };

    let mut log = String::new();
    let removed = write_attr(&cfg.pci_devices.join(&address).join("remove"), "1", &mut log);
    tokio::time::sleep(cfg.settle_long).await;
    let rescanned = write_attr(&cfg.pci_rescan, "1", &mut log);
    tokio::time::sleep(cfg.settle_medium).await;

    let found = device_enumerated(cfg);
    let _ = writeln!(log, "controller {address} power-cycled");
    RecoveryReport::new(name, removed && rescanned, trimmed(log, "pci cycle issued"), found)
}

/// Level 5: alternate the two heaviest single procedures with growing
/// settle times until one of them brings the device back.
async fn multi_cycle(cfg: &RecoveryConfig) -> RecoveryReport {
    let name = PROCEDURES[4];
    let mut last_message = String::from("no cycles attempted");

    for (round, factor) in [1u32, 2, 4].into_iter().enumerate() {
        let mut scaled = cfg.clone();
        scaled.settle_short = cfg.settle_short * factor;
        scaled.settle_medium = cfg.settle_medium * factor;
        scaled.settle_long = cfg.settle_long * factor;

        debug!("multi-cycle round {}", round + 1);
        let cycle = pci_power_cycle(&scaled).await;
        if cycle.device_found {
            return RecoveryReport::new(name, true, cycle.message, true);
        }
        let rebind = controller_rebind(&scaled).await;
        if rebind.device_found {
            return RecoveryReport::new(name, true, rebind.message, true);
        }
        last_message = format!("round {}: {}", round + 1, rebind.message);
    }

    RecoveryReport::new(name, false, last_message, false)
}

/// Level 6: force the controller through runtime autosuspend and back.
async fn runtime_pm(cfg: &RecoveryConfig) -> RecoveryReport {
    let name = PROCEDURES[5];
    let Some(address) = host_controller_address(cfg) else {
        return RecoveryReport::new(name, false, "no xhci controller address found".into(), false);
    };

    let power = cfg.pci_devices.join(&address).join("power");
    let mut log = String::new();
    let delay_set = write_attr(&power.join("autosuspend_delay_ms"), "0", &mut log);
    let suspended = write_attr(&power.join("control"), "auto", &mut log);
    tokio::time::sleep(cfg.settle_medium).await;
    let restored = write_attr(&power.join("control"), "on", &mut log);
    tokio::time::sleep(cfg.settle_short).await;

    let found = device_enumerated(cfg);
    let _ = writeln!(log, "controller {address} runtime-pm cycled");
    RecoveryReport::new(
        name,
        delay_set && suspended && restored,
        trimmed(log, "runtime pm cycled"),
        found,
    )
}

/// Locates the device's sysfs directory by matching idVendor/idProduct.
fn find_device_dir(cfg: &RecoveryConfig) -> Option<PathBuf> {
    let entries = fs::read_dir(&cfg.usb_devices).ok()?;
    for entry in entries.flatten() {
        let dir = entry.path();
        let Some(vid) = read_hex_attr(&dir.join("idVendor")) else {
            continue;
        };
        let Some(pid) = read_hex_attr(&dir.join("idProduct")) else {
            continue;
        };
        if vid == cfg.vid && cfg.pids.contains(&pid) {
            return Some(dir);
        }
    }
    None
}

/// The `usbN` root-hub directories.
fn host_buses(cfg: &RecoveryConfig) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(&cfg.usb_devices) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("usb") && n[3..].chars().all(|c| c.is_ascii_digit()))
        })
        .collect()
}

/// Walks a root hub's canonical path upward to the owning PCI function
/// address (`dddd:bb:dd.f`).
fn host_controller_address(cfg: &RecoveryConfig) -> Option<String> {
    for bus in host_buses(cfg) {
        let Ok(real) = fs::canonicalize(&bus) else {
            continue;
        };
        for component in real.components().rev() {
            let name = component.as_os_str().to_string_lossy();
            if is_pci_address(&name) {
                return Some(name.into_owned());
            }
        }
    }
    None
}

/// `dddd:bb:dd.f`, all hex but the dot-separated function digit.
fn is_pci_address(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 12 {
        return false;
    }
    let hex = |r: std::ops::Range<usize>| s[r].chars().all(|c| c.is_ascii_hexdigit());
    hex(0..4)
        && bytes[4] == b':'
        && hex(5..7)
        && bytes[7] == b':'
        && hex(8..10)
        && bytes[10] == b'.'
        && bytes[11].is_ascii_digit()
}

/// Checks whether a matching device is enumerated again, via the same serial
/// scan the link uses.
fn device_enumerated(cfg: &RecoveryConfig) -> bool {
    tokio_serial::available_ports()
        .unwrap_or_default()
        .iter()
        .any(|p| match &p.port_type {
            tokio_serial::SerialPortType::UsbPort(usb) => {
                usb.vid == cfg.vid && cfg.pids.contains(&usb.pid)
            }
            _ => false,
        })
}

/// Best-effort sysfs write; failures land in the log, not in a panic.
fn write_attr(path: &Path, value: &str, log: &mut String) -> bool {
    match fs::write(path, value) {
        Ok(()) => {
            debug!("wrote {value:?} to {}", path.display());
            true
        }
        Err(e) => {
            let _ = writeln!(log, "{}: {e}", path.display());
            false
        }
    }
}

fn read_hex_attr(path: &Path) -> Option<u16> {
    let raw = fs::read_to_string(path).ok()?;
    u16::from_str_radix(raw.trim(), 16).ok()
}

fn trimmed(log: String, fallback: &str) -> String {
    let trimmed = log.trim_end().to_string();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed
    }
}
