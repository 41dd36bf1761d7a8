//! Mounting of attached devices and unpublish-side cleanup.
//!
//! Raw block volumes are bind-mounted onto a target file; filesystem
//! volumes are formatted on first use and mounted onto a target directory.
//! Directories are created with the `mkdir` binary through the command
//! runner, never with a native recursive mkdir, so the chroot the container
//! image sets up for host tools is honored.

use tracing::{debug, info, warn};

use super::error::{IscsiError, Result};
use super::exec;
use super::staging::{self, AttachedDisk};
use crate::host::HostView;

/// One publish request's worth of mount state.
#[derive(Debug)]
pub struct MountRequest<'a> {
    pub disk: &'a mut AttachedDisk,
    pub fs_type: String,
    pub mount_options: Vec<String>,
    pub read_only: bool,
    pub target_path: String,
    pub stage_path: String,
}

/// Check the mount table for an exact path match.
pub fn is_mounted(target: &str) -> bool {
    match std::fs::read_to_string("/proc/mounts") {
        Ok(mounts) => {
            mounts.lines().any(|line| line.split_whitespace().nth(1) == Some(target))
        }
        Err(e) => {
            warn!(error = %e, "cannot read mount table");
            false
        }
    }
}

/// Mount the resolved device for a publish request.
///
/// The sidecar is written before the mount is attempted, so even a failed
/// mount leaves enough state behind for the next unstage to flush the
/// multipath map.
pub fn mount_disk(host: &HostView, req: &mut MountRequest<'_>, device_path: &str) -> Result<String> {
    // An already-mounted target means an orchestrator retry; nothing new is
    // mounted or recorded.
    if is_mounted(&req.target_path) {
        info!(target = %req.target_path, "already mounted");
        return Ok(String::new());
    }

    if req.disk.is_block {
        mount_block(host, req, device_path)
    } else {
        mount_filesystem(host, req, device_path)
    }
}

fn mount_block(host: &HostView, req: &mut MountRequest<'_>, device_path: &str) -> Result<String> {
    info!(target = %req.target_path, "bind mounting raw block volume");
    if req.read_only {
        return Err(IscsiError::Mount("read-only is not supported for block volumes".into()));
    }

    let parent = parent_dir(&req.target_path);
    create_mount_dir(&parent)?;

    let target_file = host.rebase(&req.target_path);
    std::fs::File::create(&target_file).map_err(|e| {
        IscsiError::Mount(format!(
            "failed to create target file '{}' for raw block bind mount: {e}",
            target_file.display()
        ))
    })?;

    let device = host.strip(device_path);
    staging::save(host, req.disk, &req.stage_path)?;

    exec::run("mount", &format!("-o bind,rw {device} '{}'", req.target_path)).map_err(|e| {
        IscsiError::Mount(format!(
            "failed to bind mount block volume {device} to '{}': {e}",
            req.target_path
        ))
    })?;

    info!(target = %req.target_path, device = %device, "block volume bind mounted");
    Ok(device)
}

fn mount_filesystem(
    host: &HostView,
    req: &mut MountRequest<'_>,
    device_path: &str,
) -> Result<String> {
    // Prefer the stable mapper alias over the bare dm device when
    // device-mapper resolves exactly one.
    let device_path = super::device::resolve_mapper_name(device_path);
    info!(device = %device_path, target = %req.target_path, fs_type = %req.fs_type, "mounting filesystem volume");

    match std::fs::metadata(&req.target_path) {
        Ok(_) => debug!(target = %req.target_path, "mount point already exists"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            create_mount_dir(&req.target_path)?;
        }
        Err(e) => {
            return Err(IscsiError::Mount(format!(
                "cannot stat mount point '{}': {e}",
                req.target_path
            )));
        }
    }

    let options = fs_mount_options(req.read_only, &req.mount_options, &req.fs_type);
    let device = host.strip(&device_path);

    // Persist before mounting so cleanup can flush multipath even when the
    // mount itself fails.
    staging::save(host, req.disk, &req.stage_path)?;

    format_and_mount(&device, &req.target_path, &req.fs_type, &options)?;
    info!(device = %device, target = %req.target_path, "volume mounted");
    Ok(device)
}

/// Mount options for a filesystem volume: access mode first, then the
/// caller's flags, then `nouuid` for xfs to tolerate UUID collisions
/// between cloned volumes.
fn fs_mount_options(read_only: bool, mount_options: &[String], fs_type: &str) -> Vec<String> {
    let mut options = vec![if read_only { "ro".to_string() } else { "rw".to_string() }];
    options.extend(mount_options.iter().cloned());
    if fs_type == "xfs" {
        options.push("nouuid".to_string());
    }
    options
}

/// Format the device with the requested filesystem only when it carries
/// none, then mount it. A racing retry that already mounted the target is
/// absorbed as success.
fn format_and_mount(device: &str, target: &str, fs_type: &str, options: &[String]) -> Result<()> {
    if needs_formatting(device)? {
        format_device(device, fs_type)?;
    }

    let opts = options.join(",");
    if let Err(e) = exec::run("mount", &format!("-t {fs_type} -o {opts} {device} '{target}'")) {
        if e.to_string().contains(&format!("already mounted on {target}")) {
            info!(device = %device, target = %target, "device already mounted by a racing retry");
            return Ok(());
        }
        return Err(IscsiError::Mount(format!(
            "failed to mount volume {device} [{fs_type}] to '{target}': {e}"
        )));
    }
    Ok(())
}

/// A device with no detectable filesystem signature needs formatting.
/// blkid exits nonzero when it finds nothing.
fn needs_formatting(device: &str) -> Result<bool> {
    match exec::run_quietly("blkid", &format!("-p {device}")) {
        Ok(out) => Ok(!out.contains("TYPE=")),
        Err(IscsiError::CommandFailed { .. }) => Ok(true),
        Err(e) => Err(e),
    }
}

fn format_device(device: &str, fs_type: &str) -> Result<()> {
    info!(device = %device, fs_type = %fs_type, "formatting unformatted device");
    let args = match fs_type {
        "ext4" | "ext3" => format!("-F {device}"),
        "xfs" => format!("-f {device}"),
        _ => device.to_string(),
    };
    exec::run(&format!("mkfs.{fs_type}"), &args)
        .map_err(|e| IscsiError::Mount(format!("mkfs.{fs_type} failed on {device}: {e}")))?;
    Ok(())
}

fn create_mount_dir(path: &str) -> Result<()> {
    debug!(path = %path, "creating mount point");
    exec::run("mkdir", &format!("--parents --mode 0750 '{path}'"))
        .map_err(|e| IscsiError::Mount(format!("failed to mkdir '{path}': {e}")))?;
    Ok(())
}

fn parent_dir(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent.to_string(),
        _ => "/".to_string(),
    }
}

/// Unmount a published target and clean up the directory tree around it.
///
/// For a directory target (filesystem volume) the `mount/` directory must be
/// empty before it is removed; refusing otherwise preserves unsynced volume
/// data. The sibling `vol_data.json` and the `csi-*` parent directory go
/// with it. A plain-file target (raw block bind mount) is removed directly.
pub fn unmount_and_cleanup(host: &HostView, target_path: &str) -> Result<()> {
    info!(target = %target_path, "unmounting and cleaning up");

    if let Err(e) = exec::run("umount", &format!("'{target_path}'")) {
        warn!(target = %target_path, error = %e, "unmount failed, rechecking mount table");
    }

    let target_host_path = host.rebase(target_path);
    let target_host_str = target_host_path.to_string_lossy().to_string();
    if is_mounted(&target_host_str) || is_mounted(target_path) {
        return Err(IscsiError::Mount(format!(
            "volume remains mounted at '{target_host_str}'"
        )));
    }

    let meta = match std::fs::metadata(&target_host_path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %target_host_str, "target path already gone");
            return Ok(());
        }
        Err(e) => {
            return Err(IscsiError::Mount(format!("cannot stat '{target_host_str}': {e}")));
        }
    };

    if meta.is_dir() {
        cleanup_mount_directory(&target_host_str)
    } else {
        std::fs::remove_file(&target_host_path).map_err(|e| {
            IscsiError::Mount(format!("failed to remove '{target_host_str}': {e}"))
        })?;
        Ok(())
    }
}

fn cleanup_mount_directory(target_host_path: &str) -> Result<()> {
    if !is_dir_empty(target_host_path)? {
        return Err(IscsiError::Mount(format!(
            "mount directory '{target_host_path}' is not empty and may contain volume data"
        )));
    }

    std::fs::remove_dir(target_host_path).map_err(|e| {
        IscsiError::Mount(format!("failed to remove mount point '{target_host_path}': {e}"))
    })?;
    debug!(path = %target_host_path, "removed mount point");

    // The kubelet layout is <...>/csi-NNNN/mount with vol_data.json beside
    // the mount directory.
    let csi_path = target_host_path.trim_end_matches("/mount").to_string();
    let vol_data = format!("{csi_path}/vol_data.json");
    match std::fs::remove_file(&vol_data) {
        Ok(()) => debug!(path = %vol_data, "removed volume data file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %vol_data, error = %e, "failed to remove volume data file"),
    }

    if csi_path != target_host_path {
        match std::fs::remove_dir(&csi_path) {
            Ok(()) => debug!(path = %csi_path, "removed volume directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %csi_path, error = %e, "failed to remove volume directory"),
        }
    }
    Ok(())
}

fn is_dir_empty(path: &str) -> Result<bool> {
    let mut entries = std::fs::read_dir(path)
        .map_err(|e| IscsiError::Mount(format!("failed to read '{path}': {e}")))?;
    Ok(entries.next().is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_only_block_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let host = HostView::rooted(tmp.path());
        let mut disk = AttachedDisk { is_block: true, ..Default::default() };
        let mut req = MountRequest {
            disk: &mut disk,
            fs_type: String::new(),
            mount_options: Vec::new(),
            read_only: true,
            target_path: format!("{}/pods/p/volume", tmp.path().display()),
            stage_path: "/stage".into(),
        };

        let err = mount_disk(&host, &mut req, "/host/dev/dm-1").unwrap_err();
        assert!(err.to_string().contains("not supported"));
        // Rejected before any file or directory was created.
        assert!(!tmp.path().join("pods").exists());
    }

    #[test]
    fn test_fs_mount_options_xfs_gains_nouuid() {
        let options = fs_mount_options(false, &["noatime".to_string()], "xfs");
        assert_eq!(options, vec!["rw", "noatime", "nouuid"]);
    }

    #[test]
    fn test_fs_mount_options_read_only() {
        let options = fs_mount_options(true, &[], "ext4");
        assert_eq!(options, vec!["ro"]);
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("/var/lib/kubelet/pods/p/volume"), "/var/lib/kubelet/pods/p");
        assert_eq!(parent_dir("/volume"), "/");
    }

    #[test]
    fn test_cleanup_removes_mount_dir_voldata_and_csi_dir() {
        let tmp = TempDir::new().unwrap();
        let host = HostView::rooted(tmp.path());
        let csi_dir = host.rebase("/pv/csi-6e48953803");
        let mount_dir = csi_dir.join("mount");
        std::fs::create_dir_all(&mount_dir).unwrap();
        std::fs::write(csi_dir.join("vol_data.json"), b"{}").unwrap();

        unmount_and_cleanup(&host, "/pv/csi-6e48953803/mount").unwrap();

        assert!(!mount_dir.exists());
        assert!(!csi_dir.join("vol_data.json").exists());
        assert!(!csi_dir.exists());
    }

    #[test]
    fn test_cleanup_refuses_non_empty_mount_dir() {
        let tmp = TempDir::new().unwrap();
        let host = HostView::rooted(tmp.path());
        let mount_dir = host.rebase("/pv/csi-1/mount");
        std::fs::create_dir_all(&mount_dir).unwrap();
        std::fs::write(mount_dir.join("data.db"), b"precious").unwrap();

        let err = unmount_and_cleanup(&host, "/pv/csi-1/mount").unwrap_err();
        assert!(err.to_string().contains("not empty"));
        assert!(mount_dir.join("data.db").exists());
    }

    #[test]
    fn test_cleanup_missing_target_is_success() {
        let tmp = TempDir::new().unwrap();
        let host = HostView::rooted(tmp.path());
        unmount_and_cleanup(&host, "/pv/csi-2/mount").unwrap();
    }

    #[test]
    fn test_cleanup_removes_plain_file_target() {
        let tmp = TempDir::new().unwrap();
        let host = HostView::rooted(tmp.path());
        let target = host.rebase("/pods/p/device");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"").unwrap();

        unmount_and_cleanup(&host, "/pods/p/device").unwrap();
        assert!(!target.exists());
    }
}
