//! SCSI LUN rescan and multipath device resolution.
//!
//! After login, one path device appears per portal. The SCSI midlayer is
//! told to rescan the LUN on every iSCSI host, the per-portal
//! `/dev/disk/by-path/...` links are awaited, and the resulting path
//! devices are coalesced into the single `/dev/dm-N` map that multipathd
//! assembles over them.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::error::{IscsiError, Result};
use super::exec;
use crate::host::HostView;

/// How many one-second polls to grant a `/dev/disk/by-path` link.
pub const PATH_WAIT_RETRIES: u32 = 10;

/// How many one-second polls to grant sysfs device state and multipath
/// assembly after a rescan.
const RESCAN_WAIT_RETRIES: u32 = 6;

/// Warn-only probe that the multipath daemon is reachable; a broken
/// multipathd shows up later as an unresolvable map.
pub fn check_multipath() {
    if let Err(e) = exec::run_quietly("multipathd", "show status") {
        warn!(error = %e, "multipathd status probe failed");
    }
}

/// Rescan the LUN on every iSCSI SCSI host, wait for the devices to come up
/// and for a multipath map to assemble over them.
pub fn rescan(vol_name: &str, lun: &str) -> Result<()> {
    info!(volume = %vol_name, lun = %lun, "rescanning iSCSI hosts");

    let host_ids = exec::run(
        "iscsiadm",
        r#"-m session -P3 | awk '{ if (NF > 3 && $1 == "Host" && $2 == "Number:") printf("%s ", $3) }'"#,
    )
    .map_err(|e| IscsiError::HostEnvironment(format!("finding iSCSI hosts failed: {e}")))?;

    let hosts: Vec<&str> = host_ids.split_whitespace().collect();
    if hosts.is_empty() {
        return Err(IscsiError::HostEnvironment(format!(
            "no iSCSI hosts found while rescanning volume '{vol_name}'"
        )));
    }

    for host in &hosts {
        let scan = format!("/sys/class/scsi_host/host{host}/scan");
        exec::run("echo", &format!("'0 0 {lun}' > {scan}")).map_err(|e| {
            IscsiError::HostEnvironment(format!("rescan of host {scan} failed for lun {lun}: {e}"))
        })?;
    }

    for host in &hosts {
        wait_for_device_state(host, lun, "running")?;
    }

    // Best-effort: when no map ever assembles, attachment falls back to the
    // bare path device.
    if !wait_for_multipath(hosts[0], lun) {
        warn!(volume = %vol_name, lun = %lun, "no multipath map assembled after rescan");
    }

    info!(volume = %vol_name, lun = %lun, "rescan complete");
    Ok(())
}

/// Poll sysfs until the SCSI device for `(host, lun)` reports the wanted
/// state.
fn wait_for_device_state(host: &str, lun: &str, state: &str) -> Result<()> {
    let state_path = format!("/sys/class/scsi_device/{host}:0:0:{lun}/device/state");
    for _ in 0..RESCAN_WAIT_RETRIES {
        match std::fs::read_to_string(&state_path) {
            Ok(current) if current.trim() == state => return Ok(()),
            Ok(current) => {
                debug!(path = %state_path, state = %current.trim(), "device not ready")
            }
            Err(e) => debug!(path = %state_path, error = %e, "device state not readable"),
        }
        std::thread::sleep(Duration::from_secs(1));
    }
    Err(IscsiError::HostEnvironment(format!(
        "device of host {host} lun {lun} never reached state '{state}'"
    )))
}

/// Poll until a dm map lists the `(host, lun)` block device among its
/// slaves. Returns false when none assembles before the retries run out.
fn wait_for_multipath(host: &str, lun: &str) -> bool {
    let block_dir = format!("/sys/class/scsi_device/{host}:0:0:{lun}/device/block");
    for _ in 0..RESCAN_WAIT_RETRIES {
        if let Some(disk) = first_dir_entry(&block_dir) {
            if find_multipath_for_slave(Path::new("/sys/block"), &disk).is_some() {
                return true;
            }
        }
        std::thread::sleep(Duration::from_secs(1));
    }
    false
}

fn first_dir_entry(dir: &str) -> Option<String> {
    std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .next()
        .map(|entry| entry.file_name().to_string_lossy().to_string())
}

/// The by-path link a portal's path device appears under. Non-tcp
/// transports carry an unknown PCI id, so their pattern keeps a wildcard
/// and is resolved by globbing.
pub fn device_by_path(
    host: &HostView,
    transport: &str,
    portal: &str,
    iqn: &str,
    lun: &str,
) -> String {
    let root = host.root().to_string_lossy();
    if transport == "tcp" {
        format!("{root}/dev/disk/by-path/ip-{portal}-iscsi-{iqn}-lun-{lun}")
    } else {
        format!("{root}/dev/disk/by-path/pci-*-ip-{portal}-iscsi-{iqn}-lun-{lun}")
    }
}

/// Wait for a device path to appear, polling once per second for exactly
/// `max_retries` attempts. For non-tcp transports the path is a glob whose
/// first match is adopted in place.
pub fn wait_for_path_to_exist(device_path: &mut String, max_retries: u32, transport: &str) -> bool {
    wait_for_path_internal(
        device_path,
        max_retries,
        transport,
        |p| std::fs::metadata(p).map(|_| ()),
        |pattern| match glob::glob(pattern) {
            Ok(paths) => paths.flatten().map(|p| p.to_string_lossy().to_string()).collect(),
            Err(_) => Vec::new(),
        },
    )
}

// Stat and glob are injected so the retry accounting is testable.
fn wait_for_path_internal<S, G>(
    device_path: &mut String,
    max_retries: u32,
    transport: &str,
    stat: S,
    glob_fn: G,
) -> bool
where
    S: Fn(&str) -> std::io::Result<()>,
    G: Fn(&str) -> Vec<String>,
{
    for attempt in 0..max_retries {
        if transport == "tcp" {
            match stat(device_path) {
                Ok(()) => {
                    debug!(path = %device_path, "device path exists");
                    return true;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(path = %device_path, "device path does not exist yet")
                }
                // Any other stat failure means the path will not come up.
                Err(e) => {
                    error!(path = %device_path, error = %e, "stat failed");
                    return false;
                }
            }
        } else if let Some(first) = glob_fn(device_path).into_iter().next() {
            *device_path = first;
            debug!(path = %device_path, "device path exists");
            return true;
        } else {
            debug!(pattern = %device_path, "no device path matches yet");
        }

        if attempt == max_retries - 1 {
            break;
        }
        std::thread::sleep(Duration::from_secs(1));
    }
    error!(path = %device_path, "timed out waiting for device path");
    false
}

/// Given a path device, find the `/dev/dm-N` map holding it as a slave.
/// `None` means no multipath; the caller falls back to the bare device.
pub fn find_multipath_for_device(host: &HostView, device_path: &str) -> Option<String> {
    let resolved = std::fs::canonicalize(device_path).ok()?;
    let disk = match device_leaf(&resolved.to_string_lossy(), host) {
        Ok(disk) => disk,
        Err(e) => {
            warn!(device = %device_path, error = %e, "cannot resolve device leaf");
            return None;
        }
    };
    find_multipath_for_slave(Path::new("/sys/block"), &disk)
}

fn find_multipath_for_slave(sys_block: &Path, disk: &str) -> Option<String> {
    let entries = std::fs::read_dir(sys_block).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("dm-") && entry.path().join("slaves").join(disk).exists() {
            return Some(format!("/dev/{name}"));
        }
    }
    None
}

/// Reduce a resolved device path to its `sdX` leaf name.
pub(crate) fn device_leaf(resolved: &str, host: &HostView) -> Result<String> {
    let path = host.strip(resolved);
    let parts: Vec<&str> = path.split('/').collect();
    match parts.as_slice() {
        ["", "dev", leaf] if !leaf.is_empty() => Ok(leaf.to_string()),
        _ => Err(IscsiError::HostEnvironment(format!("illegal path for device '{path}'"))),
    }
}

/// Ask device-mapper for the canonical map name behind a device. Exactly one
/// row means `/dev/mapper/<name>`; anything else keeps the input path.
pub fn resolve_mapper_name(device_path: &str) -> String {
    let out = match exec::run("dmsetup", &format!("info -C --noheadings -o name {device_path}")) {
        Ok(out) => out,
        Err(e) => {
            warn!(device = %device_path, error = %e, "dmsetup info failed");
            return device_path.to_string();
        }
    };
    let names: Vec<&str> = out.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    match names.as_slice() {
        [name] => {
            let mapper = format!("/dev/mapper/{name}");
            info!(device = %device_path, mapper = %mapper, "using mapper device");
            mapper
        }
        _ => device_path.to_string(),
    }
}

/// Flush the multipath map behind a `/dev/dm-N` device. Best-effort: detach
/// must keep going even when the map is already gone.
pub fn detach_mpath_device(mpath_device: &str, protocol: &str) {
    if mpath_device.is_empty() {
        debug!(protocol = %protocol, "no multipath device recorded, nothing to flush");
        return;
    }

    let device_name = mpath_device.trim_start_matches("/dev/");
    let map_name = match exec::run(
        "multipath",
        &format!("-l | grep --word-regexp {device_name} | awk '{{print $1}}'"),
    ) {
        Ok(out) => out.trim().to_string(),
        Err(e) => {
            warn!(device = %mpath_device, error = %e, "cannot find multipath map for device");
            return;
        }
    };
    if map_name.is_empty() {
        warn!(device = %mpath_device, "device has no multipath map, skipping flush");
        return;
    }

    info!(device = %mpath_device, map = %map_name, protocol = %protocol, "flushing multipath map");
    match exec::run("multipath", &format!("-f {map_name}")) {
        Ok(_) => debug!(map = %map_name, "multipath map flushed"),
        Err(e) => warn!(map = %map_name, error = %e, "multipath flush failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Instant;

    #[test]
    fn test_device_by_path_tcp() {
        let host = HostView::default();
        assert_eq!(
            device_by_path(&host, "tcp", "10.0.0.1:3260", "iqn.2009-11.com.example:storage", "0"),
            "/host/dev/disk/by-path/ip-10.0.0.1:3260-iscsi-iqn.2009-11.com.example:storage-lun-0"
        );
    }

    #[test]
    fn test_device_by_path_other_transport_globs_pci() {
        let host = HostView::default();
        let path =
            device_by_path(&host, "qla4xxx", "10.0.0.1:3260", "iqn.2009-11.com.example:storage", "1");
        assert!(path.contains("/pci-*-ip-"));
    }

    #[test]
    fn test_wait_for_path_attempt_bound() {
        let attempts = Cell::new(0u32);
        let mut path = String::from("/dev/disk/by-path/ip-x");
        let start = Instant::now();

        let found = wait_for_path_internal(
            &mut path,
            3,
            "tcp",
            |_| {
                attempts.set(attempts.get() + 1);
                Err(std::io::Error::from(ErrorKind::NotFound))
            },
            |_| Vec::new(),
        );

        assert!(!found);
        assert_eq!(attempts.get(), 3);
        // Exactly max_retries - 1 sleeps of one second each.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));
    }

    #[test]
    fn test_wait_for_path_found_first_attempt_does_not_sleep() {
        let mut path = String::from("/dev/disk/by-path/ip-x");
        let start = Instant::now();
        let found = wait_for_path_internal(&mut path, 10, "tcp", |_| Ok(()), |_| Vec::new());
        assert!(found);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_for_path_non_notfound_stat_error_aborts() {
        let attempts = Cell::new(0u32);
        let mut path = String::from("/dev/disk/by-path/ip-x");
        let found = wait_for_path_internal(
            &mut path,
            5,
            "tcp",
            |_| {
                attempts.set(attempts.get() + 1);
                Err(std::io::Error::from(ErrorKind::PermissionDenied))
            },
            |_| Vec::new(),
        );
        assert!(!found);
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_wait_for_path_glob_adopts_first_match() {
        let mut path = String::from("/host/dev/disk/by-path/pci-*-ip-x");
        let found = wait_for_path_internal(
            &mut path,
            3,
            "qla4xxx",
            |_| Ok(()),
            |_| {
                vec![
                    "/host/dev/disk/by-path/pci-0000:04:00.0-ip-x".to_string(),
                    "/host/dev/disk/by-path/pci-0000:05:00.0-ip-x".to_string(),
                ]
            },
        );
        assert!(found);
        assert_eq!(path, "/host/dev/disk/by-path/pci-0000:04:00.0-ip-x");
    }

    #[test]
    fn test_device_leaf() {
        let host = HostView::default();
        assert_eq!(device_leaf("/host/dev/sdc", &host).unwrap(), "sdc");
        assert_eq!(device_leaf("/dev/sda", &host).unwrap(), "sda");
        assert!(device_leaf("/sys/block/sda", &host).is_err());
        assert!(device_leaf("/dev/", &host).is_err());
    }

    #[test]
    fn test_find_multipath_for_slave() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sys_block = tmp.path();
        std::fs::create_dir_all(sys_block.join("sda")).unwrap();
        std::fs::create_dir_all(sys_block.join("dm-4/slaves/sdb")).unwrap();
        std::fs::create_dir_all(sys_block.join("dm-7/slaves/sdc")).unwrap();

        assert_eq!(find_multipath_for_slave(sys_block, "sdc").unwrap(), "/dev/dm-7");
        assert_eq!(find_multipath_for_slave(sys_block, "sdb").unwrap(), "/dev/dm-4");
        assert!(find_multipath_for_slave(sys_block, "sdz").is_none());
    }
}
