//! Attach metadata persisted beside the staged mount.
//!
//! After a volume is attached, a JSON sidecar describing the attachment is
//! written into the staging directory so that a later unstage can reverse
//! the operation without the original publish context.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{IscsiError, Result};
use crate::host::HostView;

/// Session-auth keys understood by iscsiadm node records, in the order they
/// are applied.
pub const CHAP_SESSION_KEYS: [&str; 4] = [
    "node.session.auth.username",
    "node.session.auth.password",
    "node.session.auth.username_in",
    "node.session.auth.password_in",
];

/// Default iSCSI portal port.
pub const DEFAULT_ISCSI_PORT: &str = "3260";

/// Everything needed to detach a staged volume without its publish request.
///
/// Serialized field names are the sidecar wire format; changing them breaks
/// unstage of volumes attached by older driver versions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttachedDisk {
    #[serde(rename = "VolName")]
    pub vol_name: String,
    /// Portal order is the trust order for discovery and multipath
    /// enumeration; the first portal also names the iface.
    #[serde(rename = "Portals")]
    pub portals: Vec<String>,
    #[serde(rename = "Iqn")]
    pub iqn: String,
    #[serde(rename = "Iface")]
    pub iface: String,
    #[serde(rename = "Lun")]
    pub lun: String,
    #[serde(rename = "InitiatorName")]
    pub initiator_name: String,
    /// Resolved `/dev/dm-N`; empty until multipath resolution succeeds.
    #[serde(rename = "MpathDevice", default)]
    pub mpath_device: String,
    #[serde(rename = "ChapSession", default)]
    pub chap_session: bool,
    #[serde(rename = "ChapDiscovery", default)]
    pub chap_discovery: bool,
    #[serde(rename = "Secret", default, skip_serializing_if = "HashMap::is_empty")]
    pub secret: HashMap<String, String>,
    #[serde(rename = "IsBlock", default)]
    pub is_block: bool,
}

/// Sidecar location: `<host view>/<stage path>/<vol name>.json`.
pub fn sidecar_path(host: &HostView, stage_path: &str, vol_name: &str) -> PathBuf {
    host.rebase(stage_path).join(format!("{vol_name}.json"))
}

/// Persist the attach metadata into the staging directory.
pub fn save(host: &HostView, disk: &AttachedDisk, stage_path: &str) -> Result<()> {
    let file = sidecar_path(host, stage_path, &disk.vol_name);
    debug!(file = %file.display(), "persisting attach metadata");

    let fp = File::create(&file).map_err(|e| {
        IscsiError::HostEnvironment(format!("failed to create '{}': {e}", file.display()))
    })?;
    fp.set_permissions(std::fs::Permissions::from_mode(0o644))?;
    serde_json::to_writer(&fp, disk).map_err(|e| {
        IscsiError::HostEnvironment(format!("failed to encode '{}': {e}", file.display()))
    })?;
    Ok(())
}

/// Load attach metadata back from the staging directory.
///
/// A missing sidecar is the distinct [`IscsiError::StagingRecordMissing`]
/// so unstage can tell "nothing was ever attached here" from a real failure.
pub fn load(host: &HostView, stage_path: &str, vol_name: &str) -> Result<AttachedDisk> {
    let file = sidecar_path(host, stage_path, vol_name);
    let fp = match File::open(&file) {
        Ok(fp) => fp,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(IscsiError::StagingRecordMissing(vol_name.to_string()));
        }
        Err(e) => {
            return Err(IscsiError::HostEnvironment(format!(
                "failed to open '{}': {e}",
                file.display()
            )));
        }
    };
    serde_json::from_reader(fp).map_err(|e| {
        IscsiError::HostEnvironment(format!("failed to decode '{}': {e}", file.display()))
    })
}

/// Append the default iSCSI port when the portal carries none.
pub fn default_portal(portal: &str) -> String {
    if portal.contains(':') {
        portal.to_string()
    } else {
        format!("{portal}:{DEFAULT_ISCSI_PORT}")
    }
}

/// Split a comma-separated portal list and apply the default port.
pub fn parse_portals(portals: &str) -> Result<Vec<String>> {
    let list: Vec<String> = portals
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(default_portal)
        .collect();
    if list.is_empty() {
        return Err(IscsiError::InvalidArgument("target portals list is missing".into()));
    }
    Ok(list)
}

/// Extract the session CHAP secret for the requested auth level, with strict
/// per-key presence checks. Fails before any external command runs.
pub fn parse_session_secret(
    use_chap: &str,
    secrets: &HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    let mut secret = HashMap::new();

    if use_chap != "chap" && use_chap != "mutual_chap" {
        return Ok(secret);
    }
    if secrets.is_empty() {
        return Err(IscsiError::AuthMissing("required chap secrets not provided".into()));
    }

    let mut require = |key: &str| -> Result<()> {
        match secrets.get(key) {
            Some(v) => {
                secret.insert(key.to_string(), v.clone());
                Ok(())
            }
            None => Err(IscsiError::AuthMissing(format!("{key} not found in secret"))),
        }
    };

    require("node.session.auth.username")?;
    require("node.session.auth.password")?;
    if use_chap == "mutual_chap" {
        require("node.session.auth.username_in")?;
        require("node.session.auth.password_in")?;
    }
    Ok(secret)
}
