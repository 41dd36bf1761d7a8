//! Host-rooted path handling.
//!
//! The driver runs inside a container with the node's root filesystem
//! bind-mounted at `/host`. All filesystem access goes through that view.
//! The one exception is the device path handed to mount, which the kernel
//! resolves in the host mount namespace and must not carry the prefix.

use std::path::{Path, PathBuf};

/// Where the node's root filesystem is bind-mounted inside the container.
pub const HOST_ROOT: &str = "/host";

/// A view of the node's filesystem rooted at [`HOST_ROOT`].
///
/// The root is overridable so tests can operate inside a scratch directory.
#[derive(Debug, Clone)]
pub struct HostView {
    root: PathBuf,
}

impl Default for HostView {
    fn default() -> Self {
        Self { root: PathBuf::from(HOST_ROOT) }
    }
}

impl HostView {
    /// A view rooted somewhere other than `/host`.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Rebase an orchestrator-supplied absolute path into this view.
    pub fn rebase(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// Strip the view prefix from a device path before it is handed to mount.
    pub fn strip(&self, device: &str) -> String {
        let root = self.root.to_string_lossy();
        match device.strip_prefix(root.as_ref()) {
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            _ => device.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
