//! The device seam.
//!
//! The engine talks to accelerators through four traits: a [`Platform`]
//! enumerating devices and probing peer access, a [`Device`] allocating
//! memory and streams, a [`DeviceBuffer`] linear allocation, and a
//! [`DeviceStream`] ordered work queue carrying the pack/unpack/translate
//! region kernels and the copy family. [`host::HostPlatform`] is the
//! in-process reference backend; `halogrid-cuda` supplies the CUDA one.

pub mod host;

use std::any::Any;
use std::sync::Arc;

use crate::error::Result;
use crate::geom::Coord3;

/// One strided 3-D region of a dense allocation.
///
/// `raw` is the full allocation extent (the pitch), `pos` the region origin
/// in allocation coordinates, `ext` the region extent, `elem` the element
/// size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSpec {
    /// Allocation extent in elements per axis.
    pub raw: Coord3,
    /// Region origin within the allocation.
    pub pos: Coord3,
    /// Region extent.
    pub ext: Coord3,
    /// Element size in bytes.
    pub elem: usize,
}

impl RegionSpec {
    /// Packed size of the region in bytes.
    pub fn bytes(&self) -> usize {
        self.ext.flatten() as usize * self.elem
    }
}

/// One field's contribution to a multi-field pack or unpack: the field
/// allocation and the region it exchanges.
pub struct RegionJob<'a> {
    /// The field allocation.
    pub buf: &'a dyn DeviceBuffer,
    /// The region within it.
    pub region: RegionSpec,
}

/// A linear device allocation.
pub trait DeviceBuffer: Send + Sync {
    /// Length in bytes.
    fn len(&self) -> usize;

    /// True for a zero-length allocation.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stable device address of the first byte.
    fn addr(&self) -> usize;

    /// Ordinal of the owning device.
    fn device(&self) -> usize;

    /// Backend downcast hook.
    fn as_any(&self) -> &dyn Any;
}

/// An ordered queue of device work.
///
/// Kernels and device-to-device copies are asynchronous: they are complete
/// only once [`DeviceStream::synchronize`] returns. The host copy pair is
/// blocking and drains previously queued work on this stream first.
pub trait DeviceStream: Send + Sync {
    /// Gather `region` of `src` into `dst` at byte offset `dst_off`,
    /// row-major over the region extent.
    fn pack(
        &self,
        dst: &dyn DeviceBuffer,
        dst_off: usize,
        src: &dyn DeviceBuffer,
        region: RegionSpec,
    ) -> Result<()>;

    /// Scatter contiguous bytes of `src` at `src_off` into `region` of
    /// `dst`; the inverse of [`DeviceStream::pack`].
    fn unpack(
        &self,
        dst: &dyn DeviceBuffer,
        region: RegionSpec,
        src: &dyn DeviceBuffer,
        src_off: usize,
    ) -> Result<()>;

    /// Copy a region of `src` directly into a region of `dst`, with
    /// independent pitches on each side. `dst` may live on a peer device.
    #[allow(clippy::too_many_arguments)]
    fn translate(
        &self,
        dst: &dyn DeviceBuffer,
        dst_raw: Coord3,
        dst_pos: Coord3,
        src: &dyn DeviceBuffer,
        src_raw: Coord3,
        src_pos: Coord3,
        ext: Coord3,
        elem: usize,
    ) -> Result<()>;

    /// Linear device-to-device copy, possibly across devices.
    fn copy_d2d(
        &self,
        dst: &dyn DeviceBuffer,
        dst_off: usize,
        src: &dyn DeviceBuffer,
        src_off: usize,
        len: usize,
    ) -> Result<()>;

    /// Copy `dst.len()` bytes of `src` starting at `src_off` to the host.
    /// Blocking.
    fn copy_to_host(&self, dst: &mut [u8], src: &dyn DeviceBuffer, src_off: usize) -> Result<()>;

    /// Copy host bytes into `dst` starting at `dst_off`. Blocking.
    fn copy_from_host(&self, dst: &dyn DeviceBuffer, dst_off: usize, src: &[u8]) -> Result<()>;

    /// Gather every job's region into `dst` at cumulative byte offsets, job
    /// order, no padding. Backends may fuse this into one kernel launch per
    /// direction; the default issues one [`DeviceStream::pack`] per field.
    fn pack_many(&self, dst: &dyn DeviceBuffer, jobs: &[RegionJob<'_>]) -> Result<()> {
        let mut off = 0usize;
        for j in jobs {
            self.pack(dst, off, j.buf, j.region)?;
            off += j.region.bytes();
        }
        Ok(())
    }

    /// Scatter `src` back into every job's region; the inverse of
    /// [`DeviceStream::pack_many`] with the same layout.
    fn unpack_many(&self, src: &dyn DeviceBuffer, jobs: &[RegionJob<'_>]) -> Result<()> {
        let mut off = 0usize;
        for j in jobs {
            self.unpack(j.buf, j.region, src, off)?;
            off += j.region.bytes();
        }
        Ok(())
    }

    /// Block until all queued work on this stream has completed.
    fn synchronize(&self) -> Result<()>;
}

/// One accelerator visible to this process.
pub trait Device: Send + Sync {
    /// Device ordinal within the platform.
    fn ordinal(&self) -> usize;

    /// Allocate `len` bytes aligned to at least `align`.
    fn alloc(&self, len: usize, align: usize) -> Result<Arc<dyn DeviceBuffer>>;

    /// Create a new stream on this device.
    fn new_stream(&self) -> Result<Arc<dyn DeviceStream>>;
}

/// The set of devices this process can drive.
pub trait Platform: Send + Sync {
    /// Number of visible devices.
    fn device_count(&self) -> usize;

    /// Handle for device `ordinal`.
    fn device(&self, ordinal: usize) -> Result<Arc<dyn Device>>;

    /// Attempt to enable peer access from `from` to `to`. Returns `false`
    /// when the capability is absent; never fails.
    fn enable_peer_access(&self, from: usize, to: usize) -> bool;
}
