//! # HaloGrid Core
//!
//! The exchange engine of a distributed 3-D stencil halo-exchange library
//! for multi-device, multi-node clusters.
//!
//! The engine owns a rectangular compute volume, decomposes it across
//! processes × devices, replicates a configurable halo around each
//! subdomain, and repeatedly synchronizes those halos so a user-supplied
//! kernel can advance the field one step per iteration.
//!
//! ## Core Abstractions
//!
//! - [`DistributedGrid`] - construction, planning, and the exchange driver
//! - [`Subdomain`] - per-device allocations and halo geometry
//! - [`Partition`] - prime-factor decomposition onto ranks × devices
//! - [`Communicator`] - the process-group seam ([`comm::local::LocalGroup`]
//!   is the in-process reference implementation)
//! - [`Platform`] - the device seam ([`device::host::HostPlatform`] is the
//!   host-memory reference backend; `halogrid-cuda` supplies CUDA)
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use halogrid_core::prelude::*;
//!
//! let group = LocalGroup::new(1);
//! let platform = Arc::new(HostPlatform::new(1));
//! let mut grid =
//!     DistributedGrid::new(Arc::new(group.communicator(0)), platform, 10, 10, 10).unwrap();
//! grid.set_radius(1).unwrap();
//! let field = grid.add_data(4, "pressure").unwrap();
//! grid.realize().unwrap();
//!
//! // [set initial values through grid.domains()]
//! grid.exchange().unwrap();
//! grid.swap();
//! # let _ = field;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod comm;
pub mod config;
pub mod device;
pub mod direction;
pub mod error;
pub mod geom;
pub mod grid;
pub mod partition;
pub mod subdomain;
pub mod topology;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::comm::local::{LocalComm, LocalGroup};
    pub use crate::comm::{Communicator, PendingRecv, PendingSend, Tag};
    pub use crate::config::{Methods, Placement};
    pub use crate::device::host::HostPlatform;
    pub use crate::device::{Device, DeviceBuffer, DeviceStream, Platform, RegionJob, RegionSpec};
    pub use crate::direction::{directions, dir_code, DirectionMap};
    pub use crate::error::{HaloError, Result};
    pub use crate::geom::{Box3, Coord3, Radius};
    pub use crate::grid::DistributedGrid;
    pub use crate::partition::Partition;
    pub use crate::subdomain::{FieldId, FieldSpec, Subdomain};
    pub use crate::topology::Topology;
}

// Re-exports for convenience
pub use comm::Communicator;
pub use config::{Methods, Placement};
pub use device::Platform;
pub use error::{HaloError, Result};
pub use geom::{Box3, Coord3, Radius};
pub use grid::DistributedGrid;
pub use partition::Partition;
pub use subdomain::{FieldId, Subdomain};
