//! The process-group seam.
//!
//! The engine consumes ranks, barriers, tagged non-blocking point-to-point
//! messaging, and one small collective through the [`Communicator`] trait.
//! [`local::LocalGroup`] provides the in-process reference implementation;
//! an MPI-backed communicator plugs into the same trait from outside the
//! core.

pub mod local;

use crate::direction::dir_code;
use crate::error::{HaloError, Result};
use crate::geom::Coord3;

/// Message tag namespace.
pub type Tag = u64;

/// Derive the tag for one halo message from the source and destination
/// subdomain linear indices and the sender's direction, so concurrent
/// direction traffic between the same pair of ranks cannot be mis-matched.
pub fn halo_tag(src: i64, dst: i64, grid_volume: i64, dir: Coord3) -> Tag {
    ((src * grid_volume + dst) as Tag) * 27 + dir_code(dir) as Tag
}

/// Handle for an in-flight send. Dropping without waiting abandons the
/// completion signal, not the message.
pub trait PendingSend: Send {
    /// Block until the payload buffer may be reused.
    fn wait(self: Box<Self>) -> Result<()>;
}

/// Handle for an in-flight receive.
pub trait PendingRecv: Send {
    /// Block until the matching message arrives and return its bytes.
    ///
    /// Fails with [`HaloError::LengthMismatch`] when the message does not
    /// have the posted length.
    fn wait(self: Box<Self>) -> Result<Vec<u8>>;
}

/// Minimal process-group interface consumed by the exchange engine.
pub trait Communicator: Send + Sync {
    /// This process's rank in `[0, world_size)`.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn world_size(&self) -> usize;

    /// Ranks sharing a host with this rank, including this rank, ascending.
    fn colocated(&self) -> Vec<usize>;

    /// Collective barrier over the whole group.
    fn barrier(&self) -> Result<()>;

    /// Post a tagged message to `dst`. Returns once the payload has been
    /// handed off; the handle completes when the buffer may be reused.
    fn send(&self, dst: usize, tag: Tag, payload: &[u8]) -> Result<Box<dyn PendingSend>>;

    /// Post a tagged receive of exactly `len` bytes from `src`.
    fn recv(&self, src: usize, tag: Tag, len: usize) -> Result<Box<dyn PendingRecv>>;

    /// Gather one `u64` from every rank, rank-major.
    fn allgather_u64(&self, value: u64) -> Result<Vec<u64>>;

    /// Whether [`Communicator::send_device`] / [`Communicator::recv_device`]
    /// accept device-resident buffers (a device-aware transport).
    fn device_aware(&self) -> bool {
        false
    }

    /// Post a send of `len` bytes starting at device address `addr`.
    fn send_device(
        &self,
        _dst: usize,
        _tag: Tag,
        _addr: usize,
        _len: usize,
    ) -> Result<Box<dyn PendingSend>> {
        Err(HaloError::NotSupported(
            "device-resident messaging".to_string(),
        ))
    }

    /// Post a receive of `len` bytes into device address `addr`.
    fn recv_device(
        &self,
        _src: usize,
        _tag: Tag,
        _addr: usize,
        _len: usize,
    ) -> Result<Box<dyn PendingRecv>> {
        Err(HaloError::NotSupported(
            "device-resident messaging".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_unique_per_route_and_direction() {
        use std::collections::HashSet;
        let grid = Coord3::new(2, 2, 2);
        let vol = grid.flatten();
        let mut seen = HashSet::new();
        for src in 0..vol {
            for dst in 0..vol {
                for d in crate::direction::directions() {
                    assert!(seen.insert(halo_tag(src, dst, vol, d)));
                }
            }
        }
    }
}
