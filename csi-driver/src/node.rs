//! CSI Node Service Implementation
//!
//! Handles staging, publishing, unpublishing and unstaging of
//! iSCSI-attached array volumes on Linux nodes.
//!
//! Staging registers this host's initiator with the array and reconciles
//! the CHAP security posture. Publishing drives the attach pipeline: iface,
//! discovery, login, LUN rescan, multipath resolution and mount. The
//! reverse operations tear down mounts and multipath maps from the
//! persisted sidecar alone.

use std::collections::HashMap;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use futures::FutureExt;
use tonic::{Request, Response, Status};
use tracing::{error, info, warn};

use crate::array_client::{ArrayClient, ArrayCredentials};
use crate::csi;
use crate::host::HostView;
use crate::iscsi::{self, AttachedDisk, IscsiError, MountRequest, device, initiator, mount, staging};
use crate::metrics::OperationTimer;
use crate::types::{UseChap, VolumeHandle, yaml_bool};

/// Protocol tag this engine serves; other tags belong to other engines.
const PROTOCOL: &str = "iscsi";

/// CSI Node Service
///
/// Implements the CSI Node service which handles:
/// - Volume staging (initiator registration, CHAP posture on the array)
/// - Volume publishing (iSCSI attach, multipath resolution, mount)
/// - Volume unpublishing (unmount, mount directory cleanup)
/// - Volume unstaging (multipath flush, staging metadata removal)
/// - Node capability reporting
pub struct NodeService {
    /// The node identifier for this CSI node
    node_id: String,
    /// View of the node's root filesystem
    host: HostView,
    /// Shared client for the array management API
    array: Arc<ArrayClient>,
}

/// Run an RPC body under a panic envelope and an operation timer. A panic
/// inside the handler becomes an `Internal` error instead of tearing the
/// process down.
async fn guarded<T, F>(operation: &'static str, fut: F) -> Result<Response<T>, Status>
where
    F: Future<Output = Result<T, Status>>,
{
    let timer = OperationTimer::new(operation);
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(reply)) => {
            timer.success();
            info!(operation, "completed");
            Ok(Response::new(reply))
        }
        Ok(Err(status)) => {
            error!(operation, code = ?status.code(), message = %status.message(), "failed");
            timer.failure(&format!("{:?}", status.code()));
            Err(status)
        }
        Err(panic) => {
            let msg = panic_payload(panic);
            error!(operation, panic = %msg, "recovered from panic");
            timer.failure("panic");
            Err(Status::internal(format!("recovered from {operation}: {msg}")))
        }
    }
}

fn panic_payload(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl NodeService {
    /// Create a new NodeService operating on the default `/host` view.
    pub fn new(node_id: String, array: Arc<ArrayClient>) -> Self {
        Self { node_id, host: HostView::default(), array }
    }

    /// Create a NodeService on an explicit host view. Used by tests to run
    /// against a scratch directory.
    pub fn with_host_view(node_id: String, array: Arc<ArrayClient>, host: HostView) -> Self {
        Self { node_id, host, array }
    }

    /// Validate that a path is safe to use in shell commands.
    /// Returns an error if the path contains dangerous characters.
    fn validate_path(path: &str) -> Result<(), Status> {
        if path.is_empty() {
            return Err(Status::invalid_argument("Path cannot be empty"));
        }

        if !path.starts_with('/') {
            return Err(Status::invalid_argument("Path must be absolute"));
        }

        // Disallow characters that could enable shell injection
        let dangerous_chars = [';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\'', '\n', '\r'];
        for c in dangerous_chars {
            if path.contains(c) {
                return Err(Status::invalid_argument(format!(
                    "Path contains dangerous character: '{}'",
                    c
                )));
            }
        }

        if path.contains("..") {
            return Err(Status::invalid_argument(
                "Path cannot contain '..' (path traversal)",
            ));
        }

        Ok(())
    }

    async fn stage(&self, req: csi::NodeStageVolumeRequest) -> Result<csi::NodeStageVolumeResponse, Status> {
        let handle: VolumeHandle =
            req.volume_id.parse().map_err(|e| Status::invalid_argument(format!("{e}")))?;
        Self::validate_path(&req.staging_target_path)?;

        info!(
            volume = %handle.id,
            staging_target_path = %req.staging_target_path,
            "NodeStageVolume request"
        );
        device::check_multipath();

        let host_id_str = req.publish_context.get("hostID").map(String::as_str).unwrap_or("");
        let host_id: i64 = host_id_str.parse().map_err(|e| {
            Status::internal(format!("hostID string '{host_id_str}' is not a valid host ID: {e}"))
        })?;
        if host_id < 1 {
            return Err(Status::internal(format!("hostID {host_id} is not a valid host ID")));
        }

        let ports = req.publish_context.get("hostPorts").cloned().unwrap_or_default();
        let host_security = req.publish_context.get("securityMethod").cloned().unwrap_or_default();
        let use_chap: UseChap = req
            .volume_context
            .get("useCHAP")
            .map(String::as_str)
            .unwrap_or("")
            .parse()
            .map_err(|e| Status::invalid_argument(format!("{e}")))?;

        let initiator_name = initiator::read_initiator_name().map_err(Status::from)?;

        let port_registered = ports.contains(&initiator_name);
        if !port_registered {
            info!(host_id, initiator = %initiator_name, "host port not registered, creating one");
            let creds = ArrayCredentials::from_secrets(&req.secrets)
                .map_err(|e| Status::internal(e.to_string()))?;
            self.array
                .add_port_for_host(&creds, host_id, "ISCSI", &initiator_name)
                .await
                .map_err(|e| Status::internal(e.to_string()))?;
        }

        // Both sides of the posture comparison are normalized; any mismatch,
        // including the mixed-case ones, pushes the requested posture.
        let posture_differs = !host_security.eq_ignore_ascii_case(&use_chap.to_string());
        if posture_differs || !port_registered {
            if let Some(chap_creds) = build_chap_creds(use_chap, &req.secrets, &host_security)? {
                info!(host_id, posture = %use_chap, "updating host security posture");
                let creds = ArrayCredentials::from_secrets(&req.secrets)
                    .map_err(|e| Status::internal(e.to_string()))?;
                self.array
                    .add_chap_security_for_host(&creds, host_id, &chap_creds)
                    .await
                    .map_err(|e| Status::internal(e.to_string()))?;
            }
        }

        Ok(csi::NodeStageVolumeResponse {})
    }

    async fn publish(&self, req: csi::NodePublishVolumeRequest) -> Result<csi::NodePublishVolumeResponse, Status> {
        let handle: VolumeHandle =
            req.volume_id.parse().map_err(|e| Status::invalid_argument(format!("{e}")))?;
        Self::validate_path(&req.target_path)?;
        Self::validate_path(&req.staging_target_path)?;

        info!(
            volume = %handle.id,
            staging_target_path = %req.staging_target_path,
            target_path = %req.target_path,
            readonly = req.readonly,
            "NodePublishVolume request"
        );
        device::check_multipath();

        let initiator_name = initiator::read_initiator_name().map_err(Status::from)?;
        let mut disk = build_attached_disk(&handle, &req, &initiator_name).map_err(Status::from)?;
        let (fs_type, mount_options) = mount_parameters(&req, &mut disk)?;

        let mut mount_req = MountRequest {
            disk: &mut disk,
            fs_type,
            mount_options,
            read_only: req.readonly,
            target_path: req.target_path.clone(),
            stage_path: req.staging_target_path.clone(),
        };
        iscsi::attach(&self.host, &mut mount_req).map_err(Status::from)?;
        info!(volume = %handle.id, target = %req.target_path, "attach succeeded");

        let target = self.host.rebase(&req.target_path);
        let uid = req.volume_context.get("uid").map(String::as_str).unwrap_or("");
        let gid = req.volume_context.get("gid").map(String::as_str).unwrap_or("");
        chown_volume(uid, gid, &target)?;

        let unix_permissions =
            req.volume_context.get("unix_permissions").map(String::as_str).unwrap_or("");
        chmod_volume(unix_permissions, &target)?;

        Ok(csi::NodePublishVolumeResponse {})
    }

    async fn unpublish(&self, req: csi::NodeUnpublishVolumeRequest) -> Result<csi::NodeUnpublishVolumeResponse, Status> {
        // Delete paths are idempotent: a handle this engine cannot parse
        // means there is nothing of ours to clean up.
        let handle = match req.volume_id.parse::<VolumeHandle>() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(volume_id = %req.volume_id, error = %e, "invalid volume handle on unpublish, nothing to do");
                return Ok(csi::NodeUnpublishVolumeResponse {});
            }
        };
        Self::validate_path(&req.target_path)?;

        info!(volume = %handle.id, target_path = %req.target_path, "NodeUnpublishVolume request");

        mount::unmount_and_cleanup(&self.host, &req.target_path).map_err(Status::from)?;

        Ok(csi::NodeUnpublishVolumeResponse {})
    }

    async fn unstage(&self, req: csi::NodeUnstageVolumeRequest) -> Result<csi::NodeUnstageVolumeResponse, Status> {
        let handle = match req.volume_id.parse::<VolumeHandle>() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(volume_id = %req.volume_id, error = %e, "invalid volume handle on unstage, nothing to do");
                return Ok(csi::NodeUnstageVolumeResponse {});
            }
        };
        Self::validate_path(&req.staging_target_path)?;

        let stage_path = req.staging_target_path.clone();
        info!(volume = %handle.id, staging_target_path = %stage_path, "NodeUnstageVolume request");
        device::check_multipath();

        let mpath_device = match staging::load(&self.host, &stage_path, &handle.id) {
            Ok(disk) => {
                info!(volume = %handle.id, "loaded disk information from staging record");
                disk.mpath_device
            }
            Err(IscsiError::StagingRecordMissing(_)) => {
                // Nothing was ever attached here; remove whatever is left of
                // the stage directory and report success.
                info!(stage = %stage_path, "no staging record, removing stage path");
                let path = self.host.rebase(&stage_path);
                match std::fs::remove_dir_all(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stage path"),
                }
                return Ok(csi::NodeUnstageVolumeResponse {});
            }
            Err(e) => {
                warn!(stage = %stage_path, error = %e, "failed to load staging record");
                String::new()
            }
        };

        device::detach_mpath_device(&mpath_device, PROTOCOL);

        let remove_path = self.host.rebase(&stage_path);
        let meta = match std::fs::metadata(&remove_path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(csi::NodeUnstageVolumeResponse {});
            }
            Err(e) => {
                return Err(Status::internal(format!(
                    "failed to check stage path '{}': {e}",
                    remove_path.display()
                )));
            }
        };

        if meta.is_dir() {
            let sidecar = staging::sidecar_path(&self.host, &stage_path, &handle.id);
            match std::fs::remove_file(&sidecar) {
                Ok(()) => info!(file = %sidecar.display(), "removed staging record"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Status::internal(format!(
                        "failed to remove staging record '{}': {e}",
                        sidecar.display()
                    )));
                }
            }
            std::fs::remove_dir(&remove_path).map_err(|e| {
                Status::internal(format!("failed to remove '{}': {e}", remove_path.display()))
            })?;
        } else {
            std::fs::remove_file(&remove_path).map_err(|e| {
                Status::internal(format!("failed to remove '{}': {e}", remove_path.display()))
            })?;
        }

        // Sessions and targets are deliberately left logged in: they are
        // shared by every volume on the same target.

        Ok(csi::NodeUnstageVolumeResponse {})
    }
}

/// Build the attach description from the publish request context.
fn build_attached_disk(
    handle: &VolumeHandle,
    req: &csi::NodePublishVolumeRequest,
    initiator_name: &str,
) -> Result<AttachedDisk, IscsiError> {
    let volume_context = &req.volume_context;

    let iqn = volume_context
        .get("iqn")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| IscsiError::InvalidArgument("target iqn is missing".into()))?;

    let portals =
        staging::parse_portals(volume_context.get("portals").map(String::as_str).unwrap_or(""))?;

    let lun = req
        .publish_context
        .get("lun")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| IscsiError::InvalidArgument("LUN is missing".into()))?;

    let use_chap: UseChap = volume_context
        .get("useCHAP")
        .map(String::as_str)
        .unwrap_or("")
        .parse()
        .map_err(|e| IscsiError::InvalidArgument(format!("{e}")))?;

    let chap_discovery = volume_context
        .get("discoveryCHAPAuth")
        .map(|v| {
            yaml_bool(v).unwrap_or_else(|e| {
                warn!(error = %e, "ignoring unparsable discoveryCHAPAuth");
                false
            })
        })
        .unwrap_or(false);

    let secret = staging::parse_session_secret(&use_chap.to_string(), &req.secrets)?;

    Ok(AttachedDisk {
        vol_name: handle.id.clone(),
        portals,
        iqn: iqn.clone(),
        iface: "default".to_string(),
        lun: lun.clone(),
        initiator_name: initiator_name.to_string(),
        chap_session: use_chap.session_enabled(),
        chap_discovery,
        secret,
        ..Default::default()
    })
}

/// Derive filesystem type and mount flags from the volume capability,
/// honoring the deprecated opaque `fstype` context key with a warning.
fn mount_parameters(
    req: &csi::NodePublishVolumeRequest,
    disk: &mut AttachedDisk,
) -> Result<(String, Vec<String>), Status> {
    let capability = req
        .volume_capability
        .as_ref()
        .ok_or_else(|| Status::invalid_argument("no VolumeCapability provided"))?;

    let legacy_fstype = req.volume_context.get("fstype");
    if let Some(fstype) = legacy_fstype {
        warn!(
            fstype = %fstype,
            "deprecated 'fstype' parameter provided, will NOT be supported in future releases - please move to 'csi.storage.k8s.io/fstype'"
        );
    }

    match &capability.access_type {
        Some(csi::volume_capability::AccessType::Mount(mount_cap)) => {
            disk.is_block = false;

            let fs_type = if !mount_cap.fs_type.is_empty() {
                mount_cap.fs_type.clone()
            } else if let Some(fstype) = legacy_fstype {
                fstype.clone()
            } else {
                return Err(Status::invalid_argument(format!(
                    "no fstype in VolumeCapability for volume: {}",
                    req.volume_id
                )));
            };

            Ok((fs_type, mount_cap.mount_flags.clone()))
        }
        Some(csi::volume_capability::AccessType::Block(_)) => {
            disk.is_block = true;

            let multi_writer = capability.access_mode.as_ref().map(|m| m.mode)
                == Some(csi::volume_capability::access_mode::Mode::MultiNodeMultiWriter as i32);
            if multi_writer {
                warn!("MULTI_NODE_MULTI_WRITER AccessMode requested for raw block volume, could be dangerous");
            }

            Ok((String::new(), Vec::new()))
        }
        None => Err(Status::invalid_argument(format!(
            "no access type in VolumeCapability for volume: {}",
            req.volume_id
        ))),
    }
}

/// Map the requested posture and secrets onto the array's host security
/// mapping. `None` means the array already matches and no call is needed.
fn build_chap_creds(
    use_chap: UseChap,
    secrets: &HashMap<String, String>,
    host_security: &str,
) -> Result<Option<HashMap<String, String>>, Status> {
    let get = |key: &str| secrets.get(key).filter(|v| !v.is_empty()).cloned();
    let mut chap_creds = HashMap::new();

    match use_chap {
        UseChap::None => {
            if host_security.eq_ignore_ascii_case(&use_chap.to_string()) {
                return Ok(None);
            }
        }
        UseChap::Chap | UseChap::MutualChap => {
            let (Some(username), Some(password)) =
                (get("node.session.auth.username"), get("node.session.auth.password"))
            else {
                return Err(Status::internal("iscsi: chap credentials not provided"));
            };
            chap_creds.insert("security_chap_inbound_username".to_string(), username);
            chap_creds.insert("security_chap_inbound_secret".to_string(), password);

            if use_chap == UseChap::MutualChap {
                let (Some(username_in), Some(password_in)) =
                    (get("node.session.auth.username_in"), get("node.session.auth.password_in"))
                else {
                    return Err(Status::internal("iscsi: mutual chap credentials not provided"));
                };
                chap_creds.insert("security_chap_outbound_username".to_string(), username_in);
                chap_creds.insert("security_chap_outbound_secret".to_string(), password_in);
            }
        }
    }
    chap_creds.insert("security_method".to_string(), use_chap.security_method().to_string());
    Ok(Some(chap_creds))
}

/// Apply requested ownership to a published path. Empty uid/gid means no
/// change.
fn chown_volume(uid: &str, gid: &str, path: &Path) -> Result<(), Status> {
    if uid.is_empty() && gid.is_empty() {
        return Ok(());
    }
    let parse_id = |value: &str, what: &str| -> Result<Option<u32>, Status> {
        if value.is_empty() {
            return Ok(None);
        }
        value
            .parse()
            .map(Some)
            .map_err(|e| Status::internal(format!("invalid {what} '{value}': {e}")))
    };
    let uid = parse_id(uid, "uid")?;
    let gid = parse_id(gid, "gid")?;

    std::os::unix::fs::chown(path, uid, gid).map_err(|e| {
        Status::internal(format!("Failed to chown path '{}': {e}", path.display()))
    })
}

/// Apply a numeric mode string to a published path. Empty means no change.
fn chmod_volume(unix_permissions: &str, path: &Path) -> Result<(), Status> {
    if unix_permissions.is_empty() {
        return Ok(());
    }
    let mode = u32::from_str_radix(unix_permissions, 8).map_err(|e| {
        Status::internal(format!("invalid unix_permissions '{unix_permissions}': {e}"))
    })?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
        Status::internal(format!("Failed to chmod path '{}': {e}", path.display()))
    })
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    /// Stage a volume: make sure this host's initiator is registered on the
    /// array and the CHAP posture matches the request. The actual attach
    /// happens at publish time.
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        guarded("node_stage_volume", self.stage(req)).await
    }

    /// Unstage a volume: flush the multipath map recorded in the staging
    /// sidecar and remove the staging directory.
    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        guarded("node_unstage_volume", self.unstage(req)).await
    }

    /// Publish a volume: attach the LUN through the initiator stack and
    /// mount it at the target path.
    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        guarded("node_publish_volume", self.publish(req)).await
    }

    /// Unpublish a volume from the target path.
    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        guarded("node_unpublish_volume", self.unpublish(req)).await
    }

    /// Get information about this node.
    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0, // No limit
            accessible_topology: None,
        }))
    }

    /// Report node capabilities.
    ///
    /// No stage-unstage capability is advertised; orchestrators configured
    /// for this driver still invoke stage and unstage.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        let capabilities = vec![csi::NodeServiceCapability {
            r#type: Some(csi::node_service_capability::Type::Rpc(
                csi::node_service_capability::Rpc {
                    r#type: csi::node_service_capability::rpc::Type::Unknown as i32,
                },
            )),
        }];

        Ok(Response::new(csi::NodeGetCapabilitiesResponse { capabilities }))
    }

    /// Get volume statistics (not implemented).
    async fn node_get_volume_stats(
        &self,
        _request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented("NodeGetVolumeStats is not supported"))
    }

    /// Expand a volume on this node (not implemented).
    async fn node_expand_volume(
        &self,
        _request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeExpandVolume is not supported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INITIATOR: &str = "iqn.1994-05.com.redhat:462c9b4cda1";

    fn context(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn publish_request() -> csi::NodePublishVolumeRequest {
        csi::NodePublishVolumeRequest {
            volume_id: "93642189$$iscsi".to_string(),
            volume_context: context(&[
                ("iqn", "iqn.2009-11.com.infinidat:storage:x"),
                ("portals", "10.0.0.1,10.0.0.2"),
                ("useCHAP", "none"),
            ]),
            publish_context: context(&[("lun", "0")]),
            staging_target_path: "/var/lib/kubelet/plugins/pv/csi-1/globalmount".to_string(),
            target_path: "/var/lib/kubelet/pods/p/mount".to_string(),
            ..Default::default()
        }
    }

    fn handle() -> VolumeHandle {
        "93642189$$iscsi".parse().unwrap()
    }

    #[test]
    fn test_validate_path_valid() {
        assert!(NodeService::validate_path("/var/lib/kubelet/pods/p/mount").is_ok());
        assert!(NodeService::validate_path("/mnt/volume").is_ok());
    }

    #[test]
    fn test_validate_path_invalid() {
        assert!(NodeService::validate_path("").is_err());
        assert!(NodeService::validate_path("var/lib").is_err());
        assert!(NodeService::validate_path("/var/../etc").is_err());
        assert!(NodeService::validate_path("/var;ls").is_err());
        assert!(NodeService::validate_path("/var|cat").is_err());
        assert!(NodeService::validate_path("/var$HOME").is_err());
        assert!(NodeService::validate_path("/var`id`").is_err());
        assert!(NodeService::validate_path("/var'quote").is_err());
    }

    #[test]
    fn test_build_attached_disk_defaults_ports_and_iface() {
        let disk = build_attached_disk(&handle(), &publish_request(), INITIATOR).unwrap();
        assert_eq!(disk.vol_name, "93642189");
        assert_eq!(disk.portals, vec!["10.0.0.1:3260", "10.0.0.2:3260"]);
        assert_eq!(disk.iqn, "iqn.2009-11.com.infinidat:storage:x");
        assert_eq!(disk.lun, "0");
        assert_eq!(disk.iface, "default");
        assert_eq!(disk.initiator_name, INITIATOR);
        assert!(!disk.chap_session);
        assert!(disk.secret.is_empty());
        assert!(disk.mpath_device.is_empty());
    }

    #[test]
    fn test_build_attached_disk_missing_iqn() {
        let mut req = publish_request();
        req.volume_context.remove("iqn");
        let err = build_attached_disk(&handle(), &req, INITIATOR).unwrap_err();
        assert!(matches!(err, IscsiError::InvalidArgument(_)));
    }

    #[test]
    fn test_build_attached_disk_missing_portals() {
        let mut req = publish_request();
        req.volume_context.remove("portals");
        assert!(build_attached_disk(&handle(), &req, INITIATOR).is_err());
    }

    #[test]
    fn test_build_attached_disk_missing_lun() {
        let mut req = publish_request();
        req.publish_context.remove("lun");
        let err = build_attached_disk(&handle(), &req, INITIATOR).unwrap_err();
        assert!(err.to_string().contains("LUN"));
    }

    #[test]
    fn test_build_attached_disk_chap_secrets() {
        let mut req = publish_request();
        req.volume_context.insert("useCHAP".to_string(), "chap".to_string());
        req.secrets = context(&[
            ("node.session.auth.username", "user"),
            ("node.session.auth.password", "pass"),
        ]);
        let disk = build_attached_disk(&handle(), &req, INITIATOR).unwrap();
        assert!(disk.chap_session);
        assert_eq!(disk.secret.len(), 2);
    }

    #[test]
    fn test_build_attached_disk_mutual_chap_missing_outbound_fails() {
        let mut req = publish_request();
        req.volume_context.insert("useCHAP".to_string(), "mutual_chap".to_string());
        req.secrets = context(&[
            ("node.session.auth.username", "user"),
            ("node.session.auth.password", "pass"),
        ]);
        let err = build_attached_disk(&handle(), &req, INITIATOR).unwrap_err();
        assert!(matches!(err, IscsiError::AuthMissing(_)));

        // AuthMissing surfaces to gRPC as Internal.
        let status: Status = err.into();
        assert_eq!(status.code(), tonic::Code::Internal);
    }

    #[test]
    fn test_build_attached_disk_discovery_chap_auth() {
        let mut req = publish_request();
        req.volume_context.insert("discoveryCHAPAuth".to_string(), "true".to_string());
        let disk = build_attached_disk(&handle(), &req, INITIATOR).unwrap();
        assert!(disk.chap_discovery);

        req.volume_context.insert("discoveryCHAPAuth".to_string(), "not-a-bool".to_string());
        let disk = build_attached_disk(&handle(), &req, INITIATOR).unwrap();
        assert!(!disk.chap_discovery);
    }

    #[test]
    fn test_mount_parameters_filesystem() {
        let mut req = publish_request();
        req.volume_capability = Some(csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(
                csi::volume_capability::MountVolume {
                    fs_type: "xfs".to_string(),
                    mount_flags: vec!["noatime".to_string()],
                    ..Default::default()
                },
            )),
            access_mode: None,
        });
        let mut disk = AttachedDisk::default();
        let (fs_type, flags) = mount_parameters(&req, &mut disk).unwrap();
        assert_eq!(fs_type, "xfs");
        assert_eq!(flags, vec!["noatime"]);
        assert!(!disk.is_block);
    }

    #[test]
    fn test_mount_parameters_block() {
        let mut req = publish_request();
        req.volume_capability = Some(csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Block(
                csi::volume_capability::BlockVolume {},
            )),
            access_mode: None,
        });
        let mut disk = AttachedDisk::default();
        let (fs_type, flags) = mount_parameters(&req, &mut disk).unwrap();
        assert!(fs_type.is_empty());
        assert!(flags.is_empty());
        assert!(disk.is_block);
    }

    #[test]
    fn test_mount_parameters_legacy_fstype_fallback() {
        let mut req = publish_request();
        req.volume_context.insert("fstype".to_string(), "ext4".to_string());
        req.volume_capability = Some(csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(
                csi::volume_capability::MountVolume::default(),
            )),
            access_mode: None,
        });
        let mut disk = AttachedDisk::default();
        let (fs_type, _) = mount_parameters(&req, &mut disk).unwrap();
        assert_eq!(fs_type, "ext4");
    }

    #[test]
    fn test_mount_parameters_standard_fstype_wins_over_legacy() {
        let mut req = publish_request();
        req.volume_context.insert("fstype".to_string(), "ext4".to_string());
        req.volume_capability = Some(csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(
                csi::volume_capability::MountVolume { fs_type: "xfs".to_string(), ..Default::default() },
            )),
            access_mode: None,
        });
        let mut disk = AttachedDisk::default();
        let (fs_type, _) = mount_parameters(&req, &mut disk).unwrap();
        assert_eq!(fs_type, "xfs");
    }

    #[test]
    fn test_mount_parameters_no_fstype_anywhere() {
        let mut req = publish_request();
        req.volume_capability = Some(csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(
                csi::volume_capability::MountVolume::default(),
            )),
            access_mode: None,
        });
        let mut disk = AttachedDisk::default();
        let err = mount_parameters(&req, &mut disk).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn test_mount_parameters_missing_capability() {
        let req = publish_request();
        let mut disk = AttachedDisk::default();
        assert!(mount_parameters(&req, &mut disk).is_err());
    }

    #[test]
    fn test_build_chap_creds_none_matching_posture() {
        let creds = build_chap_creds(UseChap::None, &HashMap::new(), "NONE").unwrap();
        assert!(creds.is_none());
    }

    #[test]
    fn test_build_chap_creds_none_differing_posture() {
        let creds = build_chap_creds(UseChap::None, &HashMap::new(), "CHAP").unwrap().unwrap();
        assert_eq!(creds["security_method"], "NONE");
    }

    #[test]
    fn test_build_chap_creds_chap() {
        let secrets = context(&[
            ("node.session.auth.username", "user"),
            ("node.session.auth.password", "pass"),
        ]);
        let creds = build_chap_creds(UseChap::Chap, &secrets, "NONE").unwrap().unwrap();
        assert_eq!(creds["security_method"], "CHAP");
        assert_eq!(creds["security_chap_inbound_username"], "user");
        assert_eq!(creds["security_chap_inbound_secret"], "pass");
    }

    #[test]
    fn test_build_chap_creds_mutual_chap() {
        let secrets = context(&[
            ("node.session.auth.username", "user"),
            ("node.session.auth.password", "pass"),
            ("node.session.auth.username_in", "peer"),
            ("node.session.auth.password_in", "peer-pass"),
        ]);
        let creds = build_chap_creds(UseChap::MutualChap, &secrets, "NONE").unwrap().unwrap();
        assert_eq!(creds["security_method"], "MUTUAL_CHAP");
        assert_eq!(creds["security_chap_outbound_username"], "peer");
    }

    #[test]
    fn test_build_chap_creds_mutual_chap_missing_outbound() {
        let secrets = context(&[
            ("node.session.auth.username", "user"),
            ("node.session.auth.password", "pass"),
        ]);
        let err = build_chap_creds(UseChap::MutualChap, &secrets, "NONE").unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
        assert!(err.message().contains("mutual chap"));
    }

    #[test]
    fn test_chmod_volume_invalid_mode() {
        let err = chmod_volume("79x", Path::new("/tmp")).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
    }

    #[test]
    fn test_chown_chmod_empty_are_noops() {
        chown_volume("", "", Path::new("/nonexistent/path")).unwrap();
        chmod_volume("", Path::new("/nonexistent/path")).unwrap();
    }
}
