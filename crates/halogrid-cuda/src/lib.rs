//! # HaloGrid CUDA
//!
//! CUDA realization of the halogrid device seam via `cudarc`.
//!
//! [`CudaPlatform`] enumerates the visible devices, probes pairwise peer
//! access, and hands out [`CudaDeviceCtx`] handles whose streams carry the
//! NVRTC-compiled pack/unpack/translate region kernels. Plug it into
//! `DistributedGrid` in place of the host reference backend:
//!
//! ```ignore
//! use std::sync::Arc;
//! use halogrid_core::prelude::*;
//! use halogrid_cuda::CudaPlatform;
//!
//! let platform = Arc::new(CudaPlatform::new()?);
//! let mut grid = DistributedGrid::new(comm, platform, 512, 512, 512)?;
//! ```
//!
//! All tests touching hardware are `#[ignore]`d; run them on a CUDA machine
//! with `cargo test -- --ignored`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod device;
pub mod kernels;
pub mod platform;

pub use device::{CudaBuffer, CudaDeviceCtx, CudaStreamHandle};
pub use platform::CudaPlatform;
