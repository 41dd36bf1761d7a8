//! Node-side iSCSI attach/detach engine.
//!
//! Attachment is a strict pipeline across four subsystems outside this
//! process: the iSCSI initiator daemon, the SCSI midlayer in sysfs, the
//! device-mapper multipath manager and the VFS. Each can succeed partially
//! and leave durable kernel state; every step is written to be re-entrant
//! under orchestrator retry.

pub mod device;
pub mod error;
pub mod exec;
pub mod initiator;
pub mod mount;
pub mod staging;

pub use error::{IscsiError, Result};
pub use mount::MountRequest;
pub use staging::AttachedDisk;

use tracing::{error, info, warn};

use crate::host::HostView;

/// Attach the disk described by the request and mount it at the target
/// path. Returns the device path that was mounted, empty when the target
/// was already mounted by an earlier attempt.
///
/// Order within one attach is strict: iface, discovery, CHAP, login,
/// rescan, path wait, multipath resolution, mount, sidecar.
pub fn attach(host: &HostView, req: &mut MountRequest<'_>) -> Result<String> {
    info!(
        volume = %req.disk.vol_name,
        iqn = %req.disk.iqn,
        fs_type = %req.fs_type,
        read_only = req.read_only,
        target = %req.target_path,
        stage = %req.stage_path,
        "attaching disk"
    );

    let iface_out = initiator::iface_show(&req.disk.iface).map_err(|e| {
        IscsiError::HostEnvironment(format!("cannot read interface '{}': {e}", req.disk.iface))
    })?;
    let transport = initiator::extract_transport(&iface_out).ok_or_else(|| {
        IscsiError::HostEnvironment(format!(
            "could not parse transport name from iface '{}'",
            req.disk.iface
        ))
    })?;

    // One iface per portal set, named after the first portal and shared
    // across volumes.
    if !req.disk.initiator_name.is_empty() {
        initiator::ensure_iface(req.disk)?;
    }

    initiator::discover(&req.disk.portals[0])?;

    if req.disk.chap_session {
        for portal in req.disk.portals.clone() {
            // A node record that fails to update is left alone; deleting it
            // would impact sessions already using it.
            if let Err(e) = initiator::apply_chap(req.disk, &portal) {
                warn!(portal = %portal, error = %e, "failed to update node record with CHAP");
            }
        }
    }

    initiator::login(&req.disk.iqn, &req.disk.iface)?;

    device::rescan(&req.disk.vol_name, &req.disk.lun)?;

    let mut device_paths = Vec::new();
    let mut last_err = None;
    for portal in &req.disk.portals {
        let mut path =
            device::device_by_path(host, &transport, portal, &req.disk.iqn, &req.disk.lun);
        if device::wait_for_path_to_exist(&mut path, device::PATH_WAIT_RETRIES, &transport) {
            device_paths.push(path);
        } else {
            let msg = format!(
                "failed to attach iqn '{}' lun '{}' at portal '{portal}': timeout after {}s",
                req.disk.iqn,
                req.disk.lun,
                device::PATH_WAIT_RETRIES
            );
            error!("{msg}");
            last_err = Some(msg);
        }
    }

    if device_paths.is_empty() {
        return Err(IscsiError::PathTimeout(
            last_err.unwrap_or_else(|| "no path device appeared".to_string()),
        ));
    }

    // The first portal's device represents the disk; any path that resolves
    // to a dm map wins over the bare device.
    let mut device_path = device_paths[0].clone();
    for path in &device_paths {
        if let Some(mapped) = device::find_multipath_for_device(host, path) {
            device_path = mapped.clone();
            req.disk.mpath_device = mapped;
            break;
        }
    }

    mount::mount_disk(host, req, &device_path)
}
