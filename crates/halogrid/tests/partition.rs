//! Partition scenarios against the public API.

use halogrid::prelude::*;

/// S3: odd partition of 7x5x3 across four ranks. Local sizes sum to the
/// global extent componentwise and the remainder lands on lower indices.
#[test]
fn odd_partition_across_four_ranks() {
    let p = Partition::new(Coord3::new(7, 5, 3), 4, 1);
    let grid = p.grid_dim();
    assert_eq!(grid.flatten(), 4);

    // Componentwise cover of the global volume.
    let mut cells = 0i64;
    for lin in 0..grid.flatten() {
        let idx = Coord3::from_linear(lin, grid);
        cells += p.local_size(idx).flatten();
    }
    assert_eq!(cells, 7 * 5 * 3);

    // Along x the grid splits in two; exactly 7 mod 2 = 1 position keeps
    // the larger extent, at the lower index.
    assert_eq!(grid.x, 2);
    let lo = p.local_size(Coord3::new(0, 0, 0)).x;
    let hi = p.local_size(Coord3::new(1, 0, 0)).x;
    assert_eq!(lo + hi, 7);
    assert_eq!(lo - hi, 1);
}

/// Subdomain compute regions are disjoint and their union is the global
/// volume, across a partition with every axis indivisible.
#[test]
fn compute_regions_tile_the_volume() {
    let size = Coord3::new(13, 11, 7);
    let p = Partition::new(size, 6, 1);
    let grid = p.grid_dim();

    let mut covered = vec![0u8; size.flatten() as usize];
    for lin in 0..grid.flatten() {
        let idx = Coord3::from_linear(lin, grid);
        let o = p.origin(idx);
        let s = p.local_size(idx);
        for z in 0..s.z {
            for y in 0..s.y {
                for x in 0..s.x {
                    let g = o + Coord3::new(x, y, z);
                    covered[g.linear_in(size) as usize] += 1;
                }
            }
        }
    }
    assert!(covered.iter().all(|c| *c == 1));
}

/// The rank/gpu maps agree with their inverses over the whole grid.
#[test]
fn ownership_maps_are_inverse() {
    let p = Partition::new(Coord3::new(32, 32, 32), 6, 4);
    for rank in 0..6 {
        for gpu in 0..4 {
            let idx = p.dom_idx(rank, gpu);
            assert_eq!(p.rank_of(idx), rank);
            assert_eq!(p.gpu_of(idx), gpu);
        }
    }
}
