//! Single-process exchange scenarios over the host backend.

mod common;

use std::sync::Arc;

use common::{seed_exchange_verify, seed_field, verify_field};
use halogrid::prelude::*;

fn single_rank(
    size: (i64, i64, i64),
    radius: i64,
    devices: usize,
    fields: &[(usize, &str)],
) -> (DistributedGrid, Vec<FieldId>) {
    let group = LocalGroup::new(1);
    let mut builder = GridBuilder::new(size.0, size.1, size.2).radius(radius);
    for (elem, name) in fields {
        builder = builder.field(*elem, name);
    }
    builder
        .build_with_fields(
            Arc::new(group.communicator(0)),
            Arc::new(HostPlatform::new(devices)),
        )
        .unwrap()
}

/// S1: single-process identity wrap on a 10^3 volume, radius 1. Every halo
/// cell must hold the periodic wrap of its own coordinate, and the compute
/// region must be bitwise unchanged.
#[test]
fn single_process_identity_wrap() {
    let (mut grid, fields) = single_rank((10, 10, 10), 1, 1, &[(4, "f")]);
    let f = fields[0];

    let sd = Arc::clone(&grid.domains()[0]);
    seed_field(&sd, f, 0);
    let interior_before = sd
        .region_to_host(sd.radius().neg(), sd.size(), f)
        .unwrap();

    grid.exchange().unwrap();

    verify_field(&sd, f, 0, Coord3::splat(10));
    let interior_after = sd
        .region_to_host(sd.radius().neg(), sd.size(), f)
        .unwrap();
    assert_eq!(interior_before, interior_after, "exchange wrote the compute region");
}

/// Exchange is idempotent when no interior write happens between calls.
#[test]
fn exchange_is_idempotent() {
    let (mut grid, fields) = single_rank((10, 10, 10), 1, 1, &[(4, "f")]);
    let f = fields[0];
    let sd = Arc::clone(&grid.domains()[0]);

    seed_field(&sd, f, 0);
    grid.exchange().unwrap();
    let first = sd.region_to_host(Coord3::ZERO, sd.raw_size(), f).unwrap();
    grid.exchange().unwrap();
    let second = sd.region_to_host(Coord3::ZERO, sd.raw_size(), f).unwrap();
    assert_eq!(first, second);
}

/// S5: swap exchanges curr/next; two swaps restore the original pointers.
#[test]
fn swap_cycle_restores_pointers() {
    let (grid, fields) = single_rank((10, 10, 10), 1, 1, &[(4, "f")]);
    let f = fields[0];
    let p = grid.domains()[0].curr(f).addr();
    grid.swap();
    let q = grid.domains()[0].curr(f).addr();
    assert_ne!(q, p);
    grid.swap();
    assert_eq!(grid.domains()[0].curr(f).addr(), p);
}

/// Radius 0 is accepted and reduces exchange to a no-op.
#[test]
fn radius_zero_is_a_noop() {
    let (mut grid, fields) = single_rank((10, 10, 10), 0, 1, &[(4, "f")]);
    let f = fields[0];
    let sd = Arc::clone(&grid.domains()[0]);

    seed_field(&sd, f, 0);
    let before = sd.region_to_host(Coord3::ZERO, sd.raw_size(), f).unwrap();
    grid.exchange().unwrap();
    let after = sd.region_to_host(Coord3::ZERO, sd.raw_size(), f).unwrap();
    assert_eq!(before, after);
}

/// S6: radius 3 on a 2x2x2 device grid; all 26 directions of all eight
/// subdomains round-trip across devices.
#[test]
fn eight_devices_radius_three() {
    let (mut grid, fields) = single_rank((16, 16, 16), 3, 8, &[(4, "f")]);
    assert_eq!(grid.partition().unwrap().gpu_dim(), Coord3::splat(2));
    assert_eq!(grid.domains().len(), 8);
    seed_exchange_verify(&mut grid, &fields, Coord3::splat(16));
}

/// The plan matches: for every (subdomain, direction) the sender's byte
/// count equals the receiving side's halo byte count at the neighbor.
#[test]
fn plan_byte_counts_match() {
    let (grid, _fields) = single_rank((16, 16, 16), 3, 8, &[(4, "a"), (8, "b")]);
    let partition = grid.partition().unwrap();
    let gridsz = partition.grid_dim();
    for sd in grid.domains() {
        for d in directions() {
            let nbr_idx = (sd.index() + d).wrap(gridsz);
            let nbr = grid
                .domains()
                .iter()
                .find(|n| n.index() == nbr_idx)
                .expect("single-rank run owns every neighbor");
            assert_eq!(sd.send_bytes(d), nbr.halo_bytes(-d));
            // Extent flatten symmetry for symmetric radii.
            assert_eq!(
                sd.halo_extent(d).flatten(),
                sd.halo_extent(-d).flatten()
            );
        }
    }
}

/// Indivisible extents: the remainder distribution still yields a correct
/// exchange (properties 4 and 5 exercised end to end).
#[test]
fn odd_extents_across_four_devices() {
    let (mut grid, fields) = single_rank((11, 7, 5), 1, 4, &[(4, "f")]);
    let total: i64 = grid.domains().iter().map(|d| d.size().flatten()).sum();
    assert_eq!(total, 11 * 7 * 5);
    seed_exchange_verify(&mut grid, &fields, Coord3::new(11, 7, 5));
}

/// Same-rank transports restricted to the bounce path (no peer access)
/// still produce correct halos.
#[test]
fn bounce_copier_without_peer_access() {
    let group = LocalGroup::new(1);
    let (mut grid, fields) = GridBuilder::new(12, 6, 6)
        .radius(1)
        .field(4, "f")
        .build_with_fields(
            Arc::new(group.communicator(0)),
            Arc::new(HostPlatform::without_peer(2)),
        )
        .unwrap();
    seed_exchange_verify(&mut grid, &fields, Coord3::new(12, 6, 6));
}

/// Forcing the staged peer copier (no translate kernels) is equivalent.
#[test]
fn peer_copier_only() {
    let group = LocalGroup::new(1);
    let (mut grid, fields) = GridBuilder::new(12, 6, 6)
        .radius(1)
        .methods(Methods::SAME_RANK_PEER)
        .field(4, "f")
        .build_with_fields(
            Arc::new(group.communicator(0)),
            Arc::new(HostPlatform::new(2)),
        )
        .unwrap();
    seed_exchange_verify(&mut grid, &fields, Coord3::new(12, 6, 6));
}

/// A method set with no usable same-rank variant fails at realize with a
/// configuration diagnostic, not later.
#[test]
fn unusable_method_set_fails_at_realize() {
    let group = LocalGroup::new(1);
    let err = GridBuilder::new(12, 6, 6)
        .radius(1)
        .methods(Methods::COLOCATED_STAGED)
        .field(4, "f")
        .build(
            Arc::new(group.communicator(0)),
            Arc::new(HostPlatform::new(2)),
        )
        .unwrap_err();
    assert!(matches!(err, HaloError::InvalidConfig(_)));
}

/// Interior/exterior rectangles tile the compute region for overlap of
/// compute and communication.
#[test]
fn interior_exterior_queries() {
    let (grid, _) = single_rank((16, 16, 16), 2, 1, &[(4, "f")]);
    let interior = grid.interior();
    let exterior = grid.exterior();
    assert_eq!(interior.len(), 1);
    let compute = grid.domains()[0].size().flatten();
    let covered: i64 =
        interior[0].volume() + exterior[0].iter().map(|b| b.volume()).sum::<i64>();
    assert_eq!(covered, compute);
}
