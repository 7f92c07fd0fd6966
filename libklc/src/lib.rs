//! # libklc: block volumes for KVM guests backed by LVM
//!
//! `libklc` provisions logical volumes in an LVM volume group and attaches
//! them to libvirt domains as guest disks.  Each published volume occupies
//! one device slot (`vdb`, `vdc`, ...) on its node; the slot assignment is
//! persisted in a directory-backed registry so that the node side can find
//! the guest device of a volume.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: identifiers, `Volume`, records, requests. |
//! | [`error`] | [`CsiError`] enum and its status [`Code`]. |
//! | [`config`] | [`DriverConfig`] and the device slot alphabet. |
//! | [`exec`] | External process seam used by the adapters. |
//! | [`registry`] | Durable volume → slot/node records and slot allocation. |
//! | [`backend`] | Storage pool adapters (LVM). |
//! | [`hypervisor`] | Disk attach/detach adapters (virsh). |
//! | [`mount`] | Mount primitives used on the node. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait: volume lifecycle. |
//! | [`node`] | [`CsiNode`] trait: publish, unpublish, stats. |
//! | [`driver`] | Controller and node service implementations. |
//! | [`message`] | [`CsiMessage`] request/response envelope. |
//! | [`transport`] | Unix-socket client/server. |
//! | [`testing`] | In-memory fakes of the external systems. |

pub mod backend;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod exec;
pub mod hypervisor;
pub mod identity;
pub mod message;
pub mod mount;
pub mod node;
pub mod registry;
pub mod testing;
pub mod transport;
pub mod types;

pub use config::DriverConfig;
pub use controller::CsiController;
pub use driver::{ControllerService, NodeService};
pub use error::{Code, CsiError};
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use registry::Registry;
pub use types::*;
