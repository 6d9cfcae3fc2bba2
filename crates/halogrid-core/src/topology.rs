//! Node and device topology probe.
//!
//! At engine construction the probe records which ranks share this host and
//! which local device pairs have peer access. Peer-enable failures demote
//! the pair to the non-peer transports; they are never fatal.

use std::collections::BTreeSet;

use crate::comm::Communicator;
use crate::device::Platform;

/// The observed topology for one rank.
#[derive(Debug, Clone)]
pub struct Topology {
    colocated: BTreeSet<usize>,
    peer: Vec<Vec<bool>>,
}

impl Topology {
    /// Probe the communicator for the colocated set and the platform for
    /// pairwise peer access between all visible devices.
    pub fn probe(comm: &dyn Communicator, platform: &dyn Platform) -> Self {
        let colocated: BTreeSet<usize> = comm.colocated().into_iter().collect();
        debug_assert!(colocated.contains(&comm.rank()), "colocated with self");

        let n = platform.device_count();
        let mut peer = vec![vec![false; n]; n];
        for (src, row) in peer.iter_mut().enumerate() {
            for (dst, cell) in row.iter_mut().enumerate() {
                *cell = platform.enable_peer_access(src, dst);
                if src != dst && !*cell {
                    tracing::debug!(src, dst, "peer access unavailable, demoting pair");
                }
            }
        }
        tracing::debug!(
            colocated = colocated.len(),
            devices = n,
            "topology probe complete"
        );
        Self { colocated, peer }
    }

    /// Ranks on this host, ascending, including this rank.
    pub fn colocated(&self) -> &BTreeSet<usize> {
        &self.colocated
    }

    /// Whether `rank` shares this host.
    pub fn is_colocated(&self, rank: usize) -> bool {
        self.colocated.contains(&rank)
    }

    /// Whether device `from` can address device `to` directly.
    pub fn peer_access(&self, from: usize, to: usize) -> bool {
        self.peer
            .get(from)
            .and_then(|row| row.get(to))
            .copied()
            .unwrap_or(false)
    }

    /// Number of devices the probe saw.
    pub fn device_count(&self) -> usize {
        self.peer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::local::LocalGroup;
    use crate::device::host::HostPlatform;

    #[test]
    fn probe_records_colocation_and_peers() {
        let group = LocalGroup::with_nodes(vec![0, 0, 1]);
        let comm = group.communicator(1);
        let platform = HostPlatform::new(2);
        let topo = Topology::probe(&comm, &platform);

        assert!(topo.is_colocated(0));
        assert!(topo.is_colocated(1));
        assert!(!topo.is_colocated(2));
        assert!(topo.peer_access(0, 1));
        assert!(topo.peer_access(1, 1));
        assert_eq!(topo.device_count(), 2);
    }

    #[test]
    fn denied_peers_are_demoted_not_fatal() {
        let group = LocalGroup::new(1);
        let platform = HostPlatform::without_peer(3);
        let topo = Topology::probe(&group.communicator(0), &platform);
        assert!(!topo.peer_access(0, 2));
        assert!(topo.peer_access(2, 2));
    }
}
