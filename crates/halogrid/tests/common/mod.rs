//! Shared helpers: coordinate-coded field initialization and verification.
//!
//! Fields are seeded so every compute cell stores its own global coordinate
//! (plus a per-field tag) and every halo cell a sentinel. After an
//! exchange, every cell of the full allocation - halo included - must hold
//! the periodic wrap of its global coordinate, which checks all 26
//! directions at once and that the compute region was left untouched.

use halogrid::prelude::*;

/// Pack a global coordinate and a field tag into one 32-bit value.
pub fn encode(g: Coord3, tag: u32) -> u32 {
    debug_assert!(g.x >= 0 && g.x < 256 && g.y >= 0 && g.y < 256 && g.z >= 0 && g.z < 256);
    (g.x as u32) | ((g.y as u32) << 8) | ((g.z as u32) << 16) | (tag << 24)
}

/// Seed `f`: compute cells get their encoded global coordinate, halo cells
/// the all-ones sentinel.
pub fn seed_field(sd: &Subdomain, f: FieldId, tag: u32) {
    let raw = sd.raw_size();
    let ofs = sd.radius().neg();
    let sz = sd.size();
    let elem = sd.elem_size(f);
    let mut bytes = Vec::with_capacity(raw.flatten() as usize * elem);
    for z in 0..raw.z {
        for y in 0..raw.y {
            for x in 0..raw.x {
                let c = Coord3::new(x, y, z) - ofs;
                let inside = c.x >= 0
                    && c.x < sz.x
                    && c.y >= 0
                    && c.y < sz.y
                    && c.z >= 0
                    && c.z < sz.z;
                let v: u64 = if inside {
                    encode(sd.origin() + c, tag) as u64
                } else {
                    u64::MAX
                };
                match elem {
                    4 => bytes.extend_from_slice(&(v as u32).to_le_bytes()),
                    8 => bytes.extend_from_slice(&v.to_le_bytes()),
                    other => panic!("unsupported element size {other}"),
                }
            }
        }
    }
    sd.region_from_host(Coord3::ZERO, raw, f, &bytes).unwrap();
}

/// Check every cell of the full allocation: its value must be the encoded
/// periodic wrap of its global coordinate.
pub fn verify_field(sd: &Subdomain, f: FieldId, tag: u32, global: Coord3) {
    let raw = sd.raw_size();
    let ofs = sd.radius().neg();
    let elem = sd.elem_size(f);
    let bytes = sd.region_to_host(Coord3::ZERO, raw, f).unwrap();
    for z in 0..raw.z {
        for y in 0..raw.y {
            for x in 0..raw.x {
                let cell = Coord3::new(x, y, z);
                let g = (sd.origin() + cell - ofs).wrap(global);
                let want = encode(g, tag) as u64;
                let i = cell.linear_in(raw) as usize * elem;
                let got = match elem {
                    4 => bytemuck::pod_read_unaligned::<u32>(&bytes[i..i + 4]) as u64,
                    8 => bytemuck::pod_read_unaligned::<u64>(&bytes[i..i + 8]),
                    other => panic!("unsupported element size {other}"),
                };
                assert_eq!(
                    got, want,
                    "domain {} field {} cell {cell}: got {got:#x}, want {want:#x}",
                    sd.index(),
                    sd.field_name(f),
                );
            }
        }
    }
}

/// Seed, exchange once, and verify every field of every local subdomain.
pub fn seed_exchange_verify(grid: &mut DistributedGrid, fields: &[FieldId], global: Coord3) {
    for sd in grid.domains() {
        for (tag, f) in fields.iter().enumerate() {
            seed_field(sd, *f, tag as u32);
        }
    }
    grid.exchange().unwrap();
    for sd in grid.domains() {
        for (tag, f) in fields.iter().enumerate() {
            verify_field(sd, *f, tag as u32, global);
        }
    }
}
