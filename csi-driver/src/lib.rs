//! CSI Node Driver Library
//!
//! Kubernetes CSI driver for iSCSI-attached networked block-storage
//! arrays. The node side drives the host's iSCSI initiator stack to expose
//! mapped LUNs, coalesces per-portal paths into one multipath device and
//! mounts it for pods; the array itself is managed over its REST API.
//!
//! This library provides:
//! - CSI Identity and Node service implementations
//! - The iSCSI attach/detach engine (initiator, rescan, multipath, mount)
//! - A REST client for the array management API

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod array_client;
pub mod host;
pub mod identity;
pub mod iscsi;
pub mod metrics;
pub mod node;
pub mod types;

pub use array_client::{ArrayClient, ArrayCredentials};
pub use host::HostView;
pub use identity::{DRIVER_NAME, DRIVER_VERSION, IdentityService};
pub use node::NodeService;
