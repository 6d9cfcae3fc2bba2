//! Host-memory reference backend for the device seam.
//!
//! `HostPlatform` presents N simulated devices backed by heap memory. Stream
//! work executes immediately on the calling thread, so `synchronize` is a
//! no-op; the region kernels are pitched row copies. Peer access is granted
//! between all simulated devices unless the platform is built without it,
//! which forces the planner onto the bounce-copy path.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{Device, DeviceBuffer, DeviceStream, Platform, RegionSpec};
use crate::error::{HaloError, Result};
use crate::geom::Coord3;

/// A set of simulated devices backed by host memory.
pub struct HostPlatform {
    devices: Vec<Arc<HostDevice>>,
    peer: bool,
}

impl HostPlatform {
    /// Create a platform with `count` devices, all mutually peer-capable.
    pub fn new(count: usize) -> Self {
        Self::build(count, true)
    }

    /// Create a platform whose devices deny peer access, forcing the
    /// staged same-rank transports.
    pub fn without_peer(count: usize) -> Self {
        Self::build(count, false)
    }

    fn build(count: usize, peer: bool) -> Self {
        Self {
            devices: (0..count).map(|o| Arc::new(HostDevice { ordinal: o })).collect(),
            peer,
        }
    }
}

impl Platform for HostPlatform {
    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device(&self, ordinal: usize) -> Result<Arc<dyn Device>> {
        self.devices
            .get(ordinal)
            .cloned()
            .map(|d| d as Arc<dyn Device>)
            .ok_or_else(|| HaloError::BackendError(format!("no host device {ordinal}")))
    }

    fn enable_peer_access(&self, from: usize, to: usize) -> bool {
        from == to || self.peer
    }
}

/// One simulated device.
pub struct HostDevice {
    ordinal: usize,
}

impl Device for HostDevice {
    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn alloc(&self, len: usize, _align: usize) -> Result<Arc<dyn DeviceBuffer>> {
        // Heap allocations already satisfy the element alignments in use.
        Ok(Arc::new(HostBuffer::new(len, self.ordinal)))
    }

    fn new_stream(&self) -> Result<Arc<dyn DeviceStream>> {
        Ok(Arc::new(HostStream {
            ordinal: self.ordinal,
        }))
    }
}

/// A host allocation standing in for device memory.
pub struct HostBuffer {
    bytes: Mutex<Box<[u8]>>,
    base: usize,
    ordinal: usize,
}

impl HostBuffer {
    fn new(len: usize, ordinal: usize) -> Self {
        let bytes = vec![0u8; len].into_boxed_slice();
        let base = bytes.as_ptr() as usize;
        Self {
            bytes: Mutex::new(bytes),
            base,
            ordinal,
        }
    }
}

impl DeviceBuffer for HostBuffer {
    fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    fn addr(&self) -> usize {
        self.base
    }

    fn device(&self) -> usize {
        self.ordinal
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Immediate-execution stream over host buffers.
pub struct HostStream {
    #[allow(dead_code)]
    ordinal: usize,
}

fn host(buf: &dyn DeviceBuffer) -> Result<&HostBuffer> {
    buf.as_any()
        .downcast_ref::<HostBuffer>()
        .ok_or_else(|| HaloError::BackendError("buffer does not belong to the host platform".to_string()))
}

/// Run `f` over the bytes of two distinct buffers, locking in address order
/// so concurrent transports touching the same pair cannot deadlock.
fn with_pair<R>(
    a: &HostBuffer,
    b: &HostBuffer,
    f: impl FnOnce(&mut [u8], &mut [u8]) -> R,
) -> Result<R> {
    if a.base == b.base {
        return Err(HaloError::BackendError(
            "host copy source and destination alias".to_string(),
        ));
    }
    if a.base < b.base {
        let mut ga = a.bytes.lock();
        let mut gb = b.bytes.lock();
        Ok(f(&mut ga, &mut gb))
    } else {
        let mut gb = b.bytes.lock();
        let mut ga = a.bytes.lock();
        Ok(f(&mut ga, &mut gb))
    }
}

fn row_bounds(len: usize, start: usize, row: usize) -> Result<()> {
    if start + row > len {
        return Err(HaloError::TransferFailed(format!(
            "region row [{start}, {}) exceeds allocation of {len} bytes",
            start + row
        )));
    }
    Ok(())
}

impl DeviceStream for HostStream {
    fn pack(
        &self,
        dst: &dyn DeviceBuffer,
        dst_off: usize,
        src: &dyn DeviceBuffer,
        region: RegionSpec,
    ) -> Result<()> {
        if region.ext.flatten() == 0 {
            return Ok(());
        }
        let (dst, src) = (host(dst)?, host(src)?);
        let row = region.ext.x as usize * region.elem;
        with_pair(dst, src, |d, s| -> Result<()> {
            for z in 0..region.ext.z {
                for y in 0..region.ext.y {
                    let si = (((region.pos.z + z) * region.raw.y + region.pos.y + y)
                        * region.raw.x
                        + region.pos.x) as usize
                        * region.elem;
                    let di = dst_off + ((z * region.ext.y + y) * region.ext.x) as usize * region.elem;
                    row_bounds(s.len(), si, row)?;
                    row_bounds(d.len(), di, row)?;
                    d[di..di + row].copy_from_slice(&s[si..si + row]);
                }
            }
            Ok(())
        })?
    }

    fn unpack(
        &self,
        dst: &dyn DeviceBuffer,
        region: RegionSpec,
        src: &dyn DeviceBuffer,
        src_off: usize,
    ) -> Result<()> {
        if region.ext.flatten() == 0 {
            return Ok(());
        }
        let (dst, src) = (host(dst)?, host(src)?);
        let row = region.ext.x as usize * region.elem;
        with_pair(dst, src, |d, s| -> Result<()> {
            for z in 0..region.ext.z {
                for y in 0..region.ext.y {
                    let di = (((region.pos.z + z) * region.raw.y + region.pos.y + y)
                        * region.raw.x
                        + region.pos.x) as usize
                        * region.elem;
                    let si = src_off + ((z * region.ext.y + y) * region.ext.x) as usize * region.elem;
                    row_bounds(s.len(), si, row)?;
                    row_bounds(d.len(), di, row)?;
                    d[di..di + row].copy_from_slice(&s[si..si + row]);
                }
            }
            Ok(())
        })?
    }

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
    ) -> Result<()> {
        if ext.flatten() == 0 {
            return Ok(());
        }
        let (dst, src) = (host(dst)?, host(src)?);
        let row = ext.x as usize * elem;
        let src_index = |y: i64, z: i64| {
            (((src_pos.z + z) * src_raw.y + src_pos.y + y) * src_raw.x + src_pos.x) as usize * elem
        };
        let dst_index = |y: i64, z: i64| {
            (((dst_pos.z + z) * dst_raw.y + dst_pos.y + y) * dst_raw.x + dst_pos.x) as usize * elem
        };
        if dst.base == src.base {
            // Self-exchange under periodic wrap: one allocation, disjoint
            // rectangles.
            let mut g = dst.bytes.lock();
            for z in 0..ext.z {
                for y in 0..ext.y {
                    let (si, di) = (src_index(y, z), dst_index(y, z));
                    row_bounds(g.len(), si, row)?;
                    row_bounds(g.len(), di, row)?;
                    g.copy_within(si..si + row, di);
                }
            }
            return Ok(());
        }
        with_pair(dst, src, |d, s| -> Result<()> {
            for z in 0..ext.z {
                for y in 0..ext.y {
                    let (si, di) = (src_index(y, z), dst_index(y, z));
                    row_bounds(s.len(), si, row)?;
                    row_bounds(d.len(), di, row)?;
                    d[di..di + row].copy_from_slice(&s[si..si + row]);
                }
            }
            Ok(())
        })?
    }

    fn copy_d2d(
        &self,
        dst: &dyn DeviceBuffer,
        dst_off: usize,
        src: &dyn DeviceBuffer,
        src_off: usize,
        len: usize,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let (dst, src) = (host(dst)?, host(src)?);
        with_pair(dst, src, |d, s| -> Result<()> {
            row_bounds(s.len(), src_off, len)?;
            row_bounds(d.len(), dst_off, len)?;
            d[dst_off..dst_off + len].copy_from_slice(&s[src_off..src_off + len]);
            Ok(())
        })?
    }

    fn copy_to_host(&self, dst: &mut [u8], src: &dyn DeviceBuffer, src_off: usize) -> Result<()> {
        let src = host(src)?;
        let g = src.bytes.lock();
        row_bounds(g.len(), src_off, dst.len())?;
        dst.copy_from_slice(&g[src_off..src_off + dst.len()]);
        Ok(())
    }

    fn copy_from_host(&self, dst: &dyn DeviceBuffer, dst_off: usize, src: &[u8]) -> Result<()> {
        let dst = host(dst)?;
        let mut g = dst.bytes.lock();
        row_bounds(g.len(), dst_off, src.len())?;
        g[dst_off..dst_off + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        // Host work executes at call time.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(raw: Coord3, pos: Coord3, ext: Coord3, elem: usize) -> RegionSpec {
        RegionSpec { raw, pos, ext, elem }
    }

    #[test]
    fn pack_unpack_round_trip() {
        let platform = HostPlatform::new(1);
        let dev = platform.device(0).unwrap();
        let stream = dev.new_stream().unwrap();

        let raw = Coord3::new(4, 4, 4);
        let src = dev.alloc(raw.flatten() as usize * 4, 4).unwrap();
        let sibling = dev.alloc(raw.flatten() as usize * 4, 4).unwrap();

        // Distinct value per cell.
        let mut init = Vec::with_capacity(raw.flatten() as usize * 4);
        for i in 0..raw.flatten() as u32 {
            init.extend_from_slice(&i.to_le_bytes());
        }
        stream.copy_from_host(&*src, 0, &init).unwrap();

        let r = region(raw, Coord3::new(1, 1, 1), Coord3::new(2, 3, 2), 4);
        let stage = dev.alloc(r.bytes(), 4).unwrap();
        stream.pack(&*stage, 0, &*src, r).unwrap();
        stream.unpack(&*sibling, r, &*stage, 0).unwrap();

        let mut got = vec![0u8; r.bytes()];
        stream.pack(&*stage, 0, &*sibling, r).unwrap();
        stream.copy_to_host(&mut got, &*stage, 0).unwrap();

        let mut expect = vec![0u8; r.bytes()];
        stream.pack(&*stage, 0, &*src, r).unwrap();
        stream.copy_to_host(&mut expect, &*stage, 0).unwrap();
        assert_eq!(got, expect);
    }

    #[test]
    fn translate_within_one_allocation() {
        let platform = HostPlatform::new(1);
        let dev = platform.device(0).unwrap();
        let stream = dev.new_stream().unwrap();

        let raw = Coord3::new(4, 1, 1);
        let buf = dev.alloc(4, 1).unwrap();
        stream.copy_from_host(&*buf, 0, &[1, 2, 3, 4]).unwrap();
        stream
            .translate(
                &*buf,
                raw,
                Coord3::new(2, 0, 0),
                &*buf,
                raw,
                Coord3::new(0, 0, 0),
                Coord3::new(2, 1, 1),
                1,
            )
            .unwrap();
        let mut got = [0u8; 4];
        stream.copy_to_host(&mut got, &*buf, 0).unwrap();
        assert_eq!(got, [1, 2, 1, 2]);
    }

    #[test]
    fn foreign_buffer_is_rejected() {
        struct Fake;
        impl DeviceBuffer for Fake {
            fn len(&self) -> usize {
                0
            }
            fn addr(&self) -> usize {
                0
            }
            fn device(&self) -> usize {
                0
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }
        let platform = HostPlatform::new(1);
        let stream = platform.device(0).unwrap().new_stream().unwrap();
        let mut out = [0u8; 1];
        assert!(stream.copy_to_host(&mut out, &Fake, 0).is_err());
    }

    #[test]
    fn peer_access_matches_construction() {
        let open = HostPlatform::new(2);
        assert!(open.enable_peer_access(0, 1));
        let closed = HostPlatform::without_peer(2);
        assert!(!closed.enable_peer_access(0, 1));
        assert!(closed.enable_peer_access(1, 1));
    }
}
