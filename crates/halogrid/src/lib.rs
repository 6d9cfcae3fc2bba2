//! # HaloGrid
//!
//! Distributed 3-D stencil halo exchange for multi-device, multi-node
//! clusters.
//!
//! The library owns a rectangular compute volume, decomposes it across
//! processes × devices, replicates a configurable halo around each
//! subdomain, and repeatedly synchronizes those halos so a user-supplied
//! kernel can advance the field one step per iteration. Per neighbor
//! direction the planner picks among direct peer writes, staged peer
//! copies, host bounces, and process-group messaging, and every exchange
//! overlaps packing, intra-node copies, and inter-node messages.
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use halogrid::prelude::*;
//!
//! // One in-process rank over the host reference backend; swap in an MPI
//! // communicator and the CUDA platform on a cluster.
//! let group = LocalGroup::new(1);
//! let mut grid = GridBuilder::new(64, 64, 64)
//!     .radius(2)
//!     .field(4, "pressure")
//!     .field(4, "velocity")
//!     .build(
//!         Arc::new(group.communicator(0)),
//!         Arc::new(HostPlatform::new(1)),
//!     )
//!     .unwrap();
//!
//! for _step in 0..3 {
//!     grid.exchange().unwrap();
//!     // [launch stencil kernels over grid.domains()]
//!     grid.swap();
//! }
//! ```
//!
//! ## Backends
//!
//! - **Host** - testing and single-node fallback (always available)
//! - **CUDA** - NVIDIA GPUs (requires the `cuda` feature)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use halogrid_core::*;

#[cfg(feature = "cuda")]
pub use halogrid_cuda::CudaPlatform;

use std::sync::Arc;

use halogrid_core::comm::Communicator;
use halogrid_core::config::{Methods, Placement};
use halogrid_core::device::Platform;
use halogrid_core::error::Result;
use halogrid_core::geom::Radius;
use halogrid_core::grid::DistributedGrid;
use halogrid_core::subdomain::FieldId;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::GridBuilder;
    pub use halogrid_core::prelude::*;

    #[cfg(feature = "cuda")]
    pub use halogrid_cuda::CudaPlatform;
}

/// Builder over [`DistributedGrid`]: collects the configuration, registers
/// fields, and realizes the engine in one call.
pub struct GridBuilder {
    size: (i64, i64, i64),
    radius: Radius,
    methods: Methods,
    placement: Placement,
    fields: Vec<(usize, String)>,
}

impl GridBuilder {
    /// Start a builder for a global volume of `(x, y, z)` cells.
    pub fn new(x: i64, y: i64, z: i64) -> Self {
        Self {
            size: (x, y, z),
            radius: Radius::uniform(0),
            methods: Methods::all(),
            placement: Placement::Trivial,
            fields: Vec::new(),
        }
    }

    /// Set the stencil radius; scalar or per-axis-per-side.
    pub fn radius(mut self, r: impl Into<Radius>) -> Self {
        self.radius = r.into();
        self
    }

    /// Restrict the transfer strategies the planner may select.
    pub fn methods(mut self, methods: Methods) -> Self {
        self.methods = methods;
        self
    }

    /// Choose the rank placement strategy.
    pub fn placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    /// Register a field of `elem_size`-byte elements.
    pub fn field(mut self, elem_size: usize, name: &str) -> Self {
        self.fields.push((elem_size, name.to_string()));
        self
    }

    /// Construct and realize the engine. Collective: every rank of the
    /// group must call this with the same configuration.
    pub fn build(
        self,
        comm: Arc<dyn Communicator>,
        platform: Arc<dyn Platform>,
    ) -> Result<DistributedGrid> {
        let (x, y, z) = self.size;
        let mut grid = DistributedGrid::new(comm, platform, x, y, z)?;
        grid.set_radius(self.radius)?;
        grid.set_methods(self.methods)?;
        grid.set_placement(self.placement)?;
        for (elem, name) in &self.fields {
            grid.add_data(*elem, name)?;
        }
        grid.realize()?;
        Ok(grid)
    }

    /// Like [`GridBuilder::build`], returning the handles of the registered
    /// fields alongside the engine.
    pub fn build_with_fields(
        self,
        comm: Arc<dyn Communicator>,
        platform: Arc<dyn Platform>,
    ) -> Result<(DistributedGrid, Vec<FieldId>)> {
        let (x, y, z) = self.size;
        let mut grid = DistributedGrid::new(comm, platform, x, y, z)?;
        grid.set_radius(self.radius)?;
        grid.set_methods(self.methods)?;
        grid.set_placement(self.placement)?;
        let mut ids = Vec::with_capacity(self.fields.len());
        for (elem, name) in &self.fields {
            ids.push(grid.add_data(*elem, name)?);
        }
        grid.realize()?;
        Ok((grid, ids))
    }
}
