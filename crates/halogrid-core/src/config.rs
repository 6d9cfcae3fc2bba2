//! Engine configuration: transfer method selection and rank placement.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// The transfer strategies the planner may select.
    ///
    /// An empty set passed to `set_methods` enables everything. When both a
    /// peer and a non-peer variant are enabled for the same pair, the
    /// planner prefers, in order: `KERNEL_PEER`, `SAME_RANK_PEER`,
    /// `SAME_RANK_COPY` on the same rank; `COLOCATED_STAGED` over the
    /// remote variants for colocated ranks; `DEVICE_AWARE_REMOTE` over
    /// `REMOTE_STAGED` otherwise.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Methods: u32 {
        /// Same rank, no peer access: pack, bounce through host memory.
        const SAME_RANK_COPY = 1 << 0;
        /// Same rank with peer access: pack, peer copy, unpack.
        const SAME_RANK_PEER = 1 << 1;
        /// Same rank with peer access: translate kernel writes the peer
        /// halo directly.
        const KERNEL_PEER = 1 << 2;
        /// Different rank on the same node: staged process-group messaging.
        const COLOCATED_STAGED = 1 << 3;
        /// Different node: staged process-group messaging via host buffers.
        const REMOTE_STAGED = 1 << 4;
        /// Different rank with a device-aware transport: the staging buffer
        /// itself goes on the wire.
        const DEVICE_AWARE_REMOTE = 1 << 5;
    }
}

impl Default for Methods {
    fn default() -> Self {
        Methods::all()
    }
}

/// How comm ranks map onto the rank grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Placement {
    /// Rank grid follows process-group rank order directly.
    #[default]
    Trivial,
    /// Colocated ranks are grouped into contiguous grid positions, keeping
    /// node-internal faces off the network.
    NodeAware,
}
