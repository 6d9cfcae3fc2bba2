//! CUDA platform: device enumeration and peer-access probing.

use std::sync::Arc;

use cudarc::driver::sys;
use cudarc::driver::CudaContext;

use halogrid_core::device::{Device, Platform};
use halogrid_core::error::{HaloError, Result};

use crate::device::CudaDeviceCtx;

/// All CUDA devices visible to this process.
pub struct CudaPlatform {
    devices: Vec<Arc<CudaDeviceCtx>>,
}

impl CudaPlatform {
    /// Bind every visible device and compile its region kernels.
    pub fn new() -> Result<Self> {
        let count = CudaContext::device_count()
            .map_err(|e| HaloError::BackendError(format!("failed to count CUDA devices: {e}")))?
            as usize;
        if count == 0 {
            return Err(HaloError::BackendError(
                "no CUDA devices visible".to_string(),
            ));
        }
        let mut devices = Vec::with_capacity(count);
        for ordinal in 0..count {
            devices.push(Arc::new(CudaDeviceCtx::new(ordinal)?));
        }
        Ok(Self { devices })
    }
}

impl Platform for CudaPlatform {
    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device(&self, ordinal: usize) -> Result<Arc<dyn Device>> {
        self.devices
            .get(ordinal)
            .cloned()
            .map(|d| d as Arc<dyn Device>)
            .ok_or_else(|| HaloError::BackendError(format!("no CUDA device {ordinal}")))
    }

    /// Attempt to enable peer access `from -> to`. Denials, including
    /// attempts between devices that cannot reach each other, demote the
    /// pair; they are never fatal.
    fn enable_peer_access(&self, from: usize, to: usize) -> bool {
        if from == to {
            return true;
        }
        let (Some(src), Some(dst)) = (self.devices.get(from), self.devices.get(to)) else {
            return false;
        };

        let mut can = 0i32;
        // SAFETY: plain driver query over valid ordinals.
        let rc = unsafe { sys::cuDeviceCanAccessPeer(&mut can, from as i32, to as i32) };
        if rc != sys::cudaError_enum::CUDA_SUCCESS || can == 0 {
            return false;
        }

        if src.context().bind_to_thread().is_err() {
            return false;
        }
        // SAFETY: the source context is current; flags must be zero.
        let rc = unsafe { sys::cuCtxEnablePeerAccess(dst.context().cu_ctx(), 0) };
        match rc {
            sys::cudaError_enum::CUDA_SUCCESS
            | sys::cudaError_enum::CUDA_ERROR_PEER_ACCESS_ALREADY_ENABLED => true,
            other => {
                tracing::warn!(from, to, ?other, "peer access enable failed, demoting pair");
                false
            }
        }
    }
}
