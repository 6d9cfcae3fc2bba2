//! NVRTC-compiled region kernels: pack, unpack, translate.
//!
//! One module per device context. Each kernel runs over a 3-D thread grid
//! covering the region extent, with 4- and 8-byte element fast paths when
//! the addresses allow word access and a byte loop otherwise. The batched
//! variants carry up to [`MAX_BATCH`] fields per launch, multiplexed over
//! the grid's z dimension, so one direction needs one launch regardless of
//! the field count.

/// Fields per batched launch; more fields fall back to chunked launches.
pub const MAX_BATCH: usize = 8;

/// Exported kernel names.
pub const FN_PACK: &str = "pack_region";
pub const FN_UNPACK: &str = "unpack_region";
pub const FN_TRANSLATE: &str = "translate_region";
pub const FN_PACK_MULTI: &str = "pack_region_multi";
pub const FN_UNPACK_MULTI: &str = "unpack_region_multi";

/// Per-launch field table for the batched kernels. Mirrors `region_batch`
/// in the CUDA source; field pointers are pre-offset device addresses.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RegionBatch {
    /// Packed-side address per field (staging buffer plus offset).
    pub packed: [u64; MAX_BATCH],
    /// Strided-side address per field (field allocation).
    pub strided: [u64; MAX_BATCH],
    /// Element size in bytes per field.
    pub elem: [i64; MAX_BATCH],
    /// Number of valid entries.
    pub n: i64,
}

// SAFETY: repr(C) plain-old-data, matches the kernel parameter layout.
unsafe impl cudarc::driver::DeviceRepr for RegionBatch {}

impl Default for RegionBatch {
    fn default() -> Self {
        Self {
            packed: [0; MAX_BATCH],
            strided: [0; MAX_BATCH],
            elem: [0; MAX_BATCH],
            n: 0,
        }
    }
}

/// CUDA C source for the region kernel module.
pub const KERNEL_SOURCE: &str = r#"
typedef long long i64;
typedef unsigned char u8;
typedef unsigned long long u64;

struct region_batch {
    u64 packed[8];
    u64 strided[8];
    i64 elem[8];
    i64 n;
};

// Copy one element, using word access when both addresses permit it.
__device__ __forceinline__ void copy_elem(u8 *dst, const u8 *src, i64 elem) {
    if (elem == 4 && ((((u64)dst) | ((u64)src)) & 3) == 0) {
        *(unsigned int *)dst = *(const unsigned int *)src;
    } else if (elem == 8 && ((((u64)dst) | ((u64)src)) & 7) == 0) {
        *(u64 *)dst = *(const u64 *)src;
    } else {
        for (i64 b = 0; b < elem; ++b) {
            dst[b] = src[b];
        }
    }
}

extern "C" __global__ void pack_region(u8 *dst, const u8 *src,
                                       i64 sx, i64 sy,
                                       i64 px, i64 py, i64 pz,
                                       i64 ex, i64 ey, i64 ez,
                                       i64 elem) {
    i64 x = blockIdx.x * blockDim.x + threadIdx.x;
    i64 y = blockIdx.y * blockDim.y + threadIdx.y;
    i64 z = blockIdx.z * blockDim.z + threadIdx.z;
    if (x >= ex || y >= ey || z >= ez) {
        return;
    }
    i64 si = ((pz + z) * sy + py + y) * sx + px + x;
    i64 di = (z * ey + y) * ex + x;
    copy_elem(dst + di * elem, src + si * elem, elem);
}

extern "C" __global__ void unpack_region(u8 *dst, const u8 *src,
                                         i64 sx, i64 sy,
                                         i64 px, i64 py, i64 pz,
                                         i64 ex, i64 ey, i64 ez,
                                         i64 elem) {
    i64 x = blockIdx.x * blockDim.x + threadIdx.x;
    i64 y = blockIdx.y * blockDim.y + threadIdx.y;
    i64 z = blockIdx.z * blockDim.z + threadIdx.z;
    if (x >= ex || y >= ey || z >= ez) {
        return;
    }
    i64 di = ((pz + z) * sy + py + y) * sx + px + x;
    i64 si = (z * ey + y) * ex + x;
    copy_elem(dst + di * elem, src + si * elem, elem);
}

extern "C" __global__ void translate_region(u8 *dst, const u8 *src,
                                            i64 dx, i64 dy,
                                            i64 dpx, i64 dpy, i64 dpz,
                                            i64 sx, i64 sy,
                                            i64 spx, i64 spy, i64 spz,
                                            i64 ex, i64 ey, i64 ez,
                                            i64 elem) {
    i64 x = blockIdx.x * blockDim.x + threadIdx.x;
    i64 y = blockIdx.y * blockDim.y + threadIdx.y;
    i64 z = blockIdx.z * blockDim.z + threadIdx.z;
    if (x >= ex || y >= ey || z >= ez) {
        return;
    }
    i64 si = ((spz + z) * sy + spy + y) * sx + spx + x;
    i64 di = ((dpz + z) * dy + dpy + y) * dx + dpx + x;
    copy_elem(dst + di * elem, src + si * elem, elem);
}

// Batched variants: blockIdx.z multiplexes (field, z-block).
extern "C" __global__ void pack_region_multi(region_batch b, i64 zb,
                                             i64 sx, i64 sy,
                                             i64 px, i64 py, i64 pz,
                                             i64 ex, i64 ey, i64 ez) {
    i64 f = blockIdx.z / zb;
    i64 x = blockIdx.x * blockDim.x + threadIdx.x;
    i64 y = blockIdx.y * blockDim.y + threadIdx.y;
    i64 z = (blockIdx.z % zb) * blockDim.z + threadIdx.z;
    if (f >= b.n || x >= ex || y >= ey || z >= ez) {
        return;
    }
    i64 elem = b.elem[f];
    u8 *dst = (u8 *)b.packed[f];
    const u8 *src = (const u8 *)b.strided[f];
    i64 si = ((pz + z) * sy + py + y) * sx + px + x;
    i64 di = (z * ey + y) * ex + x;
    copy_elem(dst + di * elem, src + si * elem, elem);
}

extern "C" __global__ void unpack_region_multi(region_batch b, i64 zb,
                                               i64 sx, i64 sy,
                                               i64 px, i64 py, i64 pz,
                                               i64 ex, i64 ey, i64 ez) {
    i64 f = blockIdx.z / zb;
    i64 x = blockIdx.x * blockDim.x + threadIdx.x;
    i64 y = blockIdx.y * blockDim.y + threadIdx.y;
    i64 z = (blockIdx.z % zb) * blockDim.z + threadIdx.z;
    if (f >= b.n || x >= ex || y >= ey || z >= ez) {
        return;
    }
    i64 elem = b.elem[f];
    const u8 *src = (const u8 *)b.packed[f];
    u8 *dst = (u8 *)b.strided[f];
    i64 di = ((pz + z) * sy + py + y) * sx + px + x;
    i64 si = (z * ey + y) * ex + x;
    copy_elem(dst + di * elem, src + si * elem, elem);
}
"#;

/// Thread block shape shared by all region kernels.
pub const BLOCK: (u32, u32, u32) = (8, 8, 8);

/// Grid dimensions covering `ext` with [`BLOCK`].
pub fn grid_for(ext: halogrid_core::Coord3) -> (u32, u32, u32) {
    let div = |n: i64, d: u32| -> u32 { ((n as u64 + d as u64 - 1) / d as u64) as u32 };
    (
        div(ext.x.max(0), BLOCK.0),
        div(ext.y.max(0), BLOCK.1),
        div(ext.z.max(0), BLOCK.2),
    )
}
