//! CUDA realizations of the device seam: context, buffer, and stream.

use std::any::Any;
use std::cell::UnsafeCell;
use std::sync::Arc;

use cudarc::driver::{CudaContext, CudaFunction, CudaModule, CudaSlice, CudaStream, DevicePtr, LaunchConfig, PushKernelArg};

use halogrid_core::device::{Device, DeviceBuffer, DeviceStream, RegionJob, RegionSpec};
use halogrid_core::error::{HaloError, Result};
use halogrid_core::geom::Coord3;

use crate::kernels::{
    grid_for, RegionBatch, BLOCK, FN_PACK, FN_PACK_MULTI, FN_TRANSLATE, FN_UNPACK,
    FN_UNPACK_MULTI, KERNEL_SOURCE, MAX_BATCH,
};

/// One CUDA device with its context and compiled region kernels.
pub struct CudaDeviceCtx {
    ctx: Arc<CudaContext>,
    module: Arc<CudaModule>,
    ordinal: usize,
    name: String,
}

impl CudaDeviceCtx {
    /// Bind the device, compile the region kernel module, and wrap it.
    pub fn new(ordinal: usize) -> Result<Self> {
        let ctx = CudaContext::new(ordinal).map_err(|e| {
            HaloError::BackendError(format!("failed to create CUDA context {ordinal}: {e}"))
        })?;
        let name = ctx
            .name()
            .map_err(|e| HaloError::BackendError(format!("failed to get device name: {e}")))?;

        let ptx = cudarc::nvrtc::compile_ptx(KERNEL_SOURCE)
            .map_err(|e| HaloError::BackendError(format!("NVRTC compilation failed: {e}")))?;
        let module = ctx
            .load_module(ptx)
            .map_err(|e| HaloError::BackendError(format!("failed to load region kernels: {e}")))?;

        tracing::info!(ordinal, name = %name, "initialized CUDA device");
        Ok(Self {
            ctx,
            module,
            ordinal,
            name,
        })
    }

    /// Device name as reported by the driver.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying cudarc context.
    pub fn context(&self) -> &Arc<CudaContext> {
        &self.ctx
    }
}

impl Device for CudaDeviceCtx {
    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn alloc(&self, len: usize, _align: usize) -> Result<Arc<dyn DeviceBuffer>> {
        // cuMemAlloc returns at least 256-byte aligned memory, which covers
        // every element size the engine registers.
        let stream = self.ctx.default_stream();
        // SAFETY: the buffer is written before any read by pack/unpack or a
        // message receive.
        let slice = unsafe { stream.alloc::<u8>(len.max(1)) }.map_err(|e| {
            HaloError::AllocationFailed {
                requested: len,
                device: self.ordinal,
                reason: e.to_string(),
            }
        })?;
        let addr = {
            let (ptr, _record) = slice.device_ptr(&stream);
            ptr as usize
        };
        Ok(Arc::new(CudaBuffer {
            slice: UnsafeCell::new(slice),
            len,
            addr,
            ordinal: self.ordinal,
        }))
    }

    fn new_stream(&self) -> Result<Arc<dyn DeviceStream>> {
        let stream = self
            .ctx
            .new_stream()
            .map_err(|e| HaloError::BackendError(format!("stream creation failed: {e}")))?;
        let load = |name: &str| -> Result<CudaFunction> {
            self.module
                .load_function(name)
                .map_err(|e| HaloError::BackendError(format!("kernel {name} not found: {e}")))
        };
        Ok(Arc::new(CudaStreamHandle {
            ctx: Arc::clone(&self.ctx),
            stream,
            ordinal: self.ordinal,
            pack_fn: load(FN_PACK)?,
            unpack_fn: load(FN_UNPACK)?,
            translate_fn: load(FN_TRANSLATE)?,
            pack_multi_fn: load(FN_PACK_MULTI)?,
            unpack_multi_fn: load(FN_UNPACK_MULTI)?,
        }))
    }
}

/// A device allocation owned by one [`CudaDeviceCtx`].
pub struct CudaBuffer {
    slice: UnsafeCell<CudaSlice<u8>>,
    len: usize,
    addr: usize,
    ordinal: usize,
}

// SAFETY: the slice is only dropped through the owning Arc; concurrent
// device-side access is ordered by streams, and the host never reads
// through the UnsafeCell.
unsafe impl Send for CudaBuffer {}
unsafe impl Sync for CudaBuffer {}

impl DeviceBuffer for CudaBuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn addr(&self) -> usize {
        self.addr
    }

    fn device(&self) -> usize {
        self.ordinal
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn cuda(buf: &dyn DeviceBuffer) -> Result<&CudaBuffer> {
    buf.as_any()
        .downcast_ref::<CudaBuffer>()
        .ok_or_else(|| HaloError::BackendError("buffer does not belong to the CUDA platform".to_string()))
}

fn check_span(buf: &CudaBuffer, off: usize, len: usize) -> Result<u64> {
    if off + len > buf.len {
        return Err(HaloError::TransferFailed(format!(
            "span [{off}, {}) exceeds allocation of {} bytes",
            off + len,
            buf.len
        )));
    }
    Ok((buf.addr + off) as u64)
}

/// An ordered CUDA stream carrying the region kernels.
pub struct CudaStreamHandle {
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    #[allow(dead_code)]
    ordinal: usize,
    pack_fn: CudaFunction,
    unpack_fn: CudaFunction,
    translate_fn: CudaFunction,
    pack_multi_fn: CudaFunction,
    unpack_multi_fn: CudaFunction,
}

impl CudaStreamHandle {
    fn launch_err(e: impl std::fmt::Display) -> HaloError {
        HaloError::BackendError(format!("kernel launch failed: {e}"))
    }

    fn config(ext: Coord3) -> LaunchConfig {
        LaunchConfig {
            grid_dim: grid_for(ext),
            block_dim: BLOCK,
            shared_mem_bytes: 0,
        }
    }
}

impl DeviceStream for CudaStreamHandle {
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
        let dst_ptr = check_span(cuda(dst)?, dst_off, region.bytes())?;
        let src_ptr = cuda(src)?.addr as u64;
        let cfg = Self::config(region.ext);
        // SAFETY: pointers address live allocations; the kernel bounds its
        // threads to the region extent.
        unsafe {
            self.stream
                .launch_builder(&self.pack_fn)
                .arg(&dst_ptr)
                .arg(&src_ptr)
                .arg(&region.raw.x)
                .arg(&region.raw.y)
                .arg(&region.pos.x)
                .arg(&region.pos.y)
                .arg(&region.pos.z)
                .arg(&region.ext.x)
                .arg(&region.ext.y)
                .arg(&region.ext.z)
                .arg(&(region.elem as i64))
                .launch(cfg)
        }
        .map(|_| ())
        .map_err(Self::launch_err)
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
        let dst_ptr = cuda(dst)?.addr as u64;
        let src_ptr = check_span(cuda(src)?, src_off, region.bytes())?;
        let cfg = Self::config(region.ext);
        // SAFETY: as for pack.
        unsafe {
            self.stream
                .launch_builder(&self.unpack_fn)
                .arg(&dst_ptr)
                .arg(&src_ptr)
                .arg(&region.raw.x)
                .arg(&region.raw.y)
                .arg(&region.pos.x)
                .arg(&region.pos.y)
                .arg(&region.pos.z)
                .arg(&region.ext.x)
                .arg(&region.ext.y)
                .arg(&region.ext.z)
                .arg(&(region.elem as i64))
                .launch(cfg)
        }
        .map(|_| ())
        .map_err(Self::launch_err)
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
        let dst_ptr = cuda(dst)?.addr as u64;
        let src_ptr = cuda(src)?.addr as u64;
        let cfg = Self::config(ext);
        // SAFETY: peer access between the two devices was verified by the
        // planner before this transport was selected.
        unsafe {
            self.stream
                .launch_builder(&self.translate_fn)
                .arg(&dst_ptr)
                .arg(&src_ptr)
                .arg(&dst_raw.x)
                .arg(&dst_raw.y)
                .arg(&dst_pos.x)
                .arg(&dst_pos.y)
                .arg(&dst_pos.z)
                .arg(&src_raw.x)
                .arg(&src_raw.y)
                .arg(&src_pos.x)
                .arg(&src_pos.y)
                .arg(&src_pos.z)
                .arg(&ext.x)
                .arg(&ext.y)
                .arg(&ext.z)
                .arg(&(elem as i64))
                .launch(cfg)
        }
        .map(|_| ())
        .map_err(Self::launch_err)
    }

    fn pack_many(&self, dst: &dyn DeviceBuffer, jobs: &[RegionJob<'_>]) -> Result<()> {
        self.launch_many(dst, jobs, true)
    }

    fn unpack_many(&self, src: &dyn DeviceBuffer, jobs: &[RegionJob<'_>]) -> Result<()> {
        self.launch_many(src, jobs, false)
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
        let dst_ptr = check_span(cuda(dst)?, dst_off, len)?;
        let src_ptr = check_span(cuda(src)?, src_off, len)?;
        self.ctx
            .bind_to_thread()
            .map_err(|e| HaloError::BackendError(e.to_string()))?;
        // SAFETY: both spans are live; unified addressing routes peer and
        // same-device copies alike.
        unsafe {
            cudarc::driver::result::memcpy_dtod_async(dst_ptr, src_ptr, len, self.stream.cu_stream())
        }
        .map_err(|e| HaloError::TransferFailed(format!("DtoD copy failed: {e}")))
    }

    fn copy_to_host(&self, dst: &mut [u8], src: &dyn DeviceBuffer, src_off: usize) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let src_ptr = check_span(cuda(src)?, src_off, dst.len())?;
        self.ctx
            .bind_to_thread()
            .map_err(|e| HaloError::BackendError(e.to_string()))?;
        // SAFETY: the span is live; the synchronize below fences the copy
        // before the borrow ends.
        unsafe { cudarc::driver::result::memcpy_dtoh_async(dst, src_ptr, self.stream.cu_stream()) }
            .map_err(|e| HaloError::TransferFailed(format!("DtoH copy failed: {e}")))?;
        self.synchronize()
    }

    fn copy_from_host(&self, dst: &dyn DeviceBuffer, dst_off: usize, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        let dst_ptr = check_span(cuda(dst)?, dst_off, src.len())?;
        self.ctx
            .bind_to_thread()
            .map_err(|e| HaloError::BackendError(e.to_string()))?;
        // SAFETY: the span is live; the synchronize below fences the copy
        // before the borrow ends.
        unsafe { cudarc::driver::result::memcpy_htod_async(dst_ptr, src, self.stream.cu_stream()) }
            .map_err(|e| HaloError::TransferFailed(format!("HtoD copy failed: {e}")))?;
        self.synchronize()
    }

    fn synchronize(&self) -> Result<()> {
        self.stream
            .synchronize()
            .map_err(|e| HaloError::BackendError(format!("stream synchronize failed: {e}")))
    }
}

impl CudaStreamHandle {
    /// One batched launch per [`MAX_BATCH`] fields. All jobs of one
    /// direction share the region geometry; only pointers and element sizes
    /// vary per field.
    fn launch_many(&self, stage: &dyn DeviceBuffer, jobs: &[RegionJob<'_>], pack: bool) -> Result<()> {
        let Some(first) = jobs.first() else {
            return Ok(());
        };
        let ext = first.region.ext;
        if ext.flatten() == 0 {
            return Ok(());
        }
        let raw = first.region.raw;
        let pos = first.region.pos;
        let stage_buf = cuda(stage)?;

        let mut off = 0usize;
        for chunk in jobs.chunks(MAX_BATCH) {
            let mut batch = RegionBatch::default();
            for (i, job) in chunk.iter().enumerate() {
                debug_assert_eq!(job.region.ext, ext);
                batch.packed[i] = check_span(stage_buf, off, job.region.bytes())?;
                batch.strided[i] = cuda(job.buf)?.addr as u64;
                batch.elem[i] = job.region.elem as i64;
                off += job.region.bytes();
            }
            batch.n = chunk.len() as i64;

            let (gx, gy, gz) = grid_for(ext);
            let zb = gz.max(1) as i64;
            let cfg = LaunchConfig {
                grid_dim: (gx, gy, gz.max(1) * chunk.len() as u32),
                block_dim: BLOCK,
                shared_mem_bytes: 0,
            };
            let func = if pack {
                &self.pack_multi_fn
            } else {
                &self.unpack_multi_fn
            };
            // SAFETY: every table entry addresses a live allocation; the
            // kernel bounds threads to (field, extent).
            unsafe {
                self.stream
                    .launch_builder(func)
                    .arg(&batch)
                    .arg(&zb)
                    .arg(&raw.x)
                    .arg(&raw.y)
                    .arg(&pos.x)
                    .arg(&pos.y)
                    .arg(&pos.z)
                    .arg(&ext.x)
                    .arg(&ext.y)
                    .arg(&ext.z)
                    .launch(cfg)
            }
            .map_err(Self::launch_err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halogrid_core::device::Platform;

    #[test]
    #[ignore] // Requires CUDA hardware
    fn pack_unpack_round_trip_on_device() {
        let platform = crate::CudaPlatform::new().unwrap();
        let dev = platform.device(0).unwrap();
        let stream = dev.new_stream().unwrap();

        let raw = Coord3::splat(8);
        let buf = dev.alloc(raw.flatten() as usize * 4, 4).unwrap();
        let sibling = dev.alloc(raw.flatten() as usize * 4, 4).unwrap();

        let init: Vec<u8> = (0..raw.flatten() as usize * 4).map(|i| i as u8).collect();
        stream.copy_from_host(&*buf, 0, &init).unwrap();

        let region = RegionSpec {
            raw,
            pos: Coord3::splat(2),
            ext: Coord3::splat(4),
            elem: 4,
        };
        let stage = dev.alloc(region.bytes(), 4).unwrap();
        stream.pack(&*stage, 0, &*buf, region).unwrap();
        stream.unpack(&*sibling, region, &*stage, 0).unwrap();
        stream.synchronize().unwrap();

        let stage2 = dev.alloc(region.bytes(), 4).unwrap();
        stream.pack(&*stage2, 0, &*sibling, region).unwrap();
        let mut a = vec![0u8; region.bytes()];
        let mut b = vec![0u8; region.bytes()];
        stream.copy_to_host(&mut a, &*stage, 0).unwrap();
        stream.copy_to_host(&mut b, &*stage2, 0).unwrap();
        assert_eq!(a, b);
    }
}
