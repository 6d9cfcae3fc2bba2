//! Multi-rank exchange scenarios: in-process ranks on threads, colocated
//! and simulated multi-node layouts.

mod common;

use std::sync::Arc;
use std::thread;

use common::seed_exchange_verify;
use halogrid::prelude::*;

/// Run one closure per rank on its own thread and propagate panics.
fn run_ranks(group: &LocalGroup, world: usize, f: impl Fn(usize, LocalComm) + Send + Sync) {
    thread::scope(|scope| {
        for rank in 0..world {
            let comm = group.communicator(rank);
            let f = &f;
            scope.spawn(move || f(rank, comm));
        }
    });
}

fn two_rank_face_exchange(group: LocalGroup) {
    run_ranks(&group, 2, |_rank, comm| {
        let (mut grid, fields) = GridBuilder::new(20, 10, 10)
            .radius(1)
            .field(4, "f")
            .build_with_fields(Arc::new(comm), Arc::new(HostPlatform::new(1)))
            .unwrap();

        let partition = grid.partition().unwrap();
        assert_eq!(partition.rank_dim(), Coord3::new(2, 1, 1));
        assert_eq!(grid.domains()[0].size(), Coord3::splat(10));

        // Full-volume verification covers rank 0's +x halo against rank 1's
        // -x interior and the periodic wrap pairing in one sweep.
        seed_exchange_verify(&mut grid, &fields, Coord3::new(20, 10, 10));
    });
}

/// S2 with both ranks on one node: the colocated staged path.
#[test]
fn two_ranks_colocated() {
    two_rank_face_exchange(LocalGroup::new(2));
}

/// S2 across two simulated nodes: the remote staged path.
#[test]
fn two_ranks_remote() {
    two_rank_face_exchange(LocalGroup::with_nodes(vec![0, 1]));
}

/// S2 over a device-aware transport: staging buffers go on the wire.
#[test]
fn two_ranks_device_aware() {
    two_rank_face_exchange(LocalGroup::with_nodes_device_aware(vec![0, 1]));
}

/// S4: one i32 and one i64 field. Message lengths are the per-field sums
/// and both fields round-trip independently.
#[test]
fn mixed_element_sizes() {
    let group = LocalGroup::new(2);
    run_ranks(&group, 2, |_rank, comm| {
        let (mut grid, fields) = GridBuilder::new(20, 10, 10)
            .radius(1)
            .field(4, "ints")
            .field(8, "longs")
            .build_with_fields(Arc::new(comm), Arc::new(HostPlatform::new(1)))
            .unwrap();

        for sd in grid.domains() {
            for d in directions() {
                let cells = sd.halo_extent(d).flatten() as usize;
                assert_eq!(sd.halo_bytes(d), 4 * cells + 8 * cells);
            }
        }

        seed_exchange_verify(&mut grid, &fields, Coord3::new(20, 10, 10));
    });
}

/// Four ranks over two simulated nodes with node-aware placement: ranks on
/// one node occupy contiguous grid positions and the exchange stays
/// correct under the permutation.
#[test]
fn node_aware_placement() {
    let group = LocalGroup::with_nodes(vec![0, 1, 0, 1]);
    run_ranks(&group, 4, |_rank, comm| {
        let (mut grid, fields) = GridBuilder::new(20, 10, 10)
            .radius(1)
            .placement(Placement::NodeAware)
            .field(4, "f")
            .build_with_fields(Arc::new(comm), Arc::new(HostPlatform::new(1)))
            .unwrap();
        seed_exchange_verify(&mut grid, &fields, Coord3::new(20, 10, 10));
    });
}

/// Two ranks, two devices each: same-rank peer traffic and cross-rank
/// staged traffic in one plan.
#[test]
fn mixed_local_and_remote_transports() {
    let group = LocalGroup::with_nodes(vec![0, 1]);
    run_ranks(&group, 2, |_rank, comm| {
        let (mut grid, fields) = GridBuilder::new(16, 8, 8)
            .radius(1)
            .field(4, "f")
            .build_with_fields(Arc::new(comm), Arc::new(HostPlatform::new(2)))
            .unwrap();
        assert_eq!(grid.domains().len(), 2);
        seed_exchange_verify(&mut grid, &fields, Coord3::new(16, 8, 8));
    });
}

/// Repeated rounds with swaps in between keep the plan stable and correct.
#[test]
fn repeated_rounds_with_swap() {
    let group = LocalGroup::new(2);
    run_ranks(&group, 2, |_rank, comm| {
        let (mut grid, fields) = GridBuilder::new(20, 10, 10)
            .radius(1)
            .field(4, "f")
            .build_with_fields(Arc::new(comm), Arc::new(HostPlatform::new(1)))
            .unwrap();
        for _round in 0..3 {
            // Reseed after each swap: the back buffer starts zeroed.
            seed_exchange_verify(&mut grid, &fields, Coord3::new(20, 10, 10));
            grid.swap();
        }
    });
}
