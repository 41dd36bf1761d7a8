//! Drives the host's iSCSI initiator stack through `iscsiadm`.
//!
//! Covers iface lookup and cloning, sendtargets discovery, CHAP node-record
//! updates and session-aware login. One iface exists per portal set, named
//! after the first portal; it is created lazily and never destroyed because
//! it is shared across volumes.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use super::error::{IscsiError, Result};
use super::exec;
use super::staging::{AttachedDisk, CHAP_SESSION_KEYS};

/// Where open-iscsi records this host's initiator IQN.
pub const INITIATOR_NAME_FILE: &str = "/etc/iscsi/initiatorname.iscsi";

static TRANSPORT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"iface.transport_name = (.*)\n").unwrap());

/// Read this host's initiator IQN from the open-iscsi configuration.
pub fn read_initiator_name() -> Result<String> {
    let content = std::fs::read_to_string(INITIATOR_NAME_FILE).map_err(|e| {
        IscsiError::HostEnvironment(format!(
            "failed to read '{INITIATOR_NAME_FILE}', is the iSCSI initiator installed? {e}"
        ))
    })?;
    parse_initiator_name(&content).ok_or_else(|| {
        IscsiError::HostEnvironment(format!("initiator name not found in '{INITIATOR_NAME_FILE}'"))
    })
}

pub(crate) fn parse_initiator_name(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("InitiatorName="))
        .map(|name| name.trim_end().to_string())
        .filter(|name| !name.is_empty())
}

/// Show the iface record, unlogged (the output repeats on every attach).
pub fn iface_show(iface: &str) -> Result<String> {
    exec::run_quietly("iscsiadm", &format!("--mode iface --interface {iface} --op show"))
}

/// Pull the transport name out of `iscsiadm --op show` output.
/// `<empty>` means the default transport, tcp.
pub fn extract_transport(iface_output: &str) -> Option<String> {
    let captured = TRANSPORT_NAME_RE.captures(iface_output)?;
    let transport = captured.get(1)?.as_str();
    if transport == "<empty>" { Some("tcp".to_string()) } else { Some(transport.to_string()) }
}

/// Parse `iface.X = Y` lines into settable parameters, dropping `<empty>`
/// values and the immutable `iface.iscsi_ifacename`.
pub fn parse_iscsiadm_show(output: &str) -> Result<HashMap<String, String>> {
    let mut params = HashMap::new();
    for line in output.lines() {
        if !line.starts_with("iface.") || line.contains("<empty>") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 || fields[1] != "=" {
            return Err(IscsiError::HostEnvironment(format!("invalid iface setting: {fields:?}")));
        }
        // iscsi_ifacename is immutable once the iface is created
        if fields[0] == "iface.iscsi_ifacename" {
            continue;
        }
        params.insert(fields[0].to_string(), fields[2].to_string());
    }
    Ok(params)
}

/// Make sure an iface named after the first portal exists, cloning the
/// pre-configured iface when it does not. Rewrites `disk.iface` to the
/// portal-named iface.
pub fn ensure_iface(disk: &mut AttachedDisk) -> Result<()> {
    let new_iface = disk.portals[0].clone();
    debug!(initiator = %disk.initiator_name, iface = %new_iface, "checking required iface");

    if iface_show(&new_iface).is_ok() {
        debug!(iface = %new_iface, "required iface already exists");
    } else {
        info!(iface = %new_iface, "cloning pre-configured iface");
        clone_iface(&disk.iface, &new_iface, &disk.initiator_name)?;
        info!(iface = %new_iface, "new iface created");
    }
    disk.iface = new_iface;
    Ok(())
}

/// Clone `source` into `new_iface`, overriding the initiator name. A failed
/// parameter update deletes the partially created iface best-effort before
/// surfacing the error.
fn clone_iface(source: &str, new_iface: &str, initiator_name: &str) -> Result<()> {
    let out = iface_show(source).map_err(|e| {
        IscsiError::HostEnvironment(format!("failed to show iface '{source}' records: {e}"))
    })?;

    let mut params = parse_iscsiadm_show(&out)?;
    params.insert("iface.initiatorname".to_string(), initiator_name.to_string());

    exec::run("iscsiadm", &format!("--mode iface --interface {new_iface} --op new"))?;

    for (key, val) in &params {
        let update = format!(
            "--mode iface --interface {new_iface} --op update --name '{key}' --value '{val}'"
        );
        if let Err(update_err) = exec::run("iscsiadm", &update) {
            warn!(iface = %new_iface, key = %key, "failed to update cloned iface record");
            if let Err(delete_err) =
                exec::run("iscsiadm", &format!("--mode iface --interface {new_iface} --op delete"))
            {
                return Err(IscsiError::HostEnvironment(format!(
                    "failed to delete iface '{new_iface}': {delete_err}"
                )));
            }
            return Err(IscsiError::HostEnvironment(format!(
                "failed to update iface records for '{new_iface}': {update_err}"
            )));
        }
    }
    Ok(())
}

/// Discover all targets behind a portal, adding and pruning portal records
/// in one pass from the node database's perspective.
pub fn discover(portal: &str) -> Result<()> {
    info!(portal = %portal, "discovering targets");
    exec::run(
        "iscsiadm",
        &format!("--mode discoverydb --type sendtargets --portal {portal} --discover --op new --op delete"),
    )
    .map_err(|e| {
        IscsiError::HostEnvironment(format!("failed to discover targets at portal '{portal}': {e}"))
    })?;
    Ok(())
}

/// Write session CHAP settings into the node record for one portal.
pub fn apply_chap(disk: &AttachedDisk, portal: &str) -> Result<()> {
    if !disk.chap_session {
        return Ok(());
    }
    debug!(portal = %portal, iqn = %disk.iqn, "updating node record with CHAP");

    exec::run(
        "iscsiadm",
        &format!(
            "--mode node --portal {portal} --targetname {} --interface {} --op update --name node.session.auth.authmethod --value CHAP",
            disk.iqn, disk.iface
        ),
    )
    .map_err(|e| IscsiError::HostEnvironment(format!("failed to set CHAP authmethod: {e}")))?;

    for key in CHAP_SESSION_KEYS {
        let Some(value) = disk.secret.get(key) else { continue };
        if value.is_empty() {
            continue;
        }
        exec::run_quietly(
            "iscsiadm",
            &format!(
                "--mode node --portal {portal} --targetname {} --interface {} --op update --name '{key}' --value '{value}'",
                disk.iqn, disk.iface
            ),
        )
        .map_err(|e| {
            IscsiError::HostEnvironment(format!("failed to update node session key '{key}': {e}"))
        })?;
    }
    Ok(())
}

/// Log in to the target unless a session for its IQN already exists.
/// Sessions are shared across volumes on the same target.
pub fn login(iqn: &str, iface: &str) -> Result<()> {
    let sessions = match exec::run("iscsiadm", &format!("--mode session | grep '{iqn}'")) {
        Ok(out) => out,
        Err(e) => {
            warn!(iqn = %iqn, error = %e, "session list returned nothing");
            String::new()
        }
    };

    if sessions.contains(iqn) {
        info!(iqn = %iqn, iface = %iface, "already logged in to target");
        return Ok(());
    }

    info!(iqn = %iqn, iface = %iface, "logging in to target at all portals");
    if let Err(e) =
        exec::run("iscsiadm", &format!("--mode node --targetname {iqn} --interface {iface} --login"))
    {
        if is_already_logged_in(&e) {
            info!(iqn = %iqn, "session already exists");
        } else {
            return Err(IscsiError::HostEnvironment(format!(
                "iscsi login failed to target iqn '{iqn}': {e}"
            )));
        }
    }

    // A session must be visible after login; a target that drops us straight
    // away is a host environment problem, not a retry case.
    exec::run("iscsiadm", &format!("--mode session | grep '{iqn}'")).map_err(|e| {
        IscsiError::HostEnvironment(format!("no session found after login to '{iqn}': {e}"))
    })?;
    Ok(())
}

fn is_already_logged_in(err: &IscsiError) -> bool {
    match err {
        IscsiError::CommandFailed { stderr, .. } => {
            stderr.contains("already exists") || stderr.contains("already present")
        }
        _ => false,
    }
}
