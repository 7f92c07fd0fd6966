//! Service implementations.
//!
//! [`ControllerService`] implements [`CsiIdentity`](crate::identity::CsiIdentity)
//! and [`CsiController`](crate::controller::CsiController) on top of a
//! [`StorageBackend`](crate::backend::StorageBackend), a
//! [`Hypervisor`](crate::hypervisor::Hypervisor) and the
//! [`Registry`](crate::registry::Registry).  [`NodeService`] implements
//! [`CsiIdentity`](crate::identity::CsiIdentity) and
//! [`CsiNode`](crate::node::CsiNode) on a compute node, reading the same
//! registry.

pub mod controller;
pub mod node;

pub use controller::ControllerService;
pub use node::NodeService;
