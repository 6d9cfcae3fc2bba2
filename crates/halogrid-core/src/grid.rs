//! The distributed grid engine: construction, planning, and the exchange
//! driver.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::comm::{halo_tag, Communicator};
use crate::config::{Methods, Placement};
use crate::device::Platform;
use crate::direction::{directions, DirectionMap};
use crate::error::{HaloError, Result};
use crate::geom::{Box3, Coord3, Radius};
use crate::partition::Partition;
use crate::subdomain::{FieldId, FieldSpec, Subdomain};
use crate::topology::Topology;
use crate::transport::{
    BounceCopier, HaloReceiver, HaloSender, PeerCopier, PeerTranslator, StagedReceiver,
    StagedSender, Staging,
};

/// The per-subdomain communication plan, immutable after `realize`.
struct DomainPlan {
    senders: DirectionMap<Option<Box<dyn HaloSender>>>,
    receivers: DirectionMap<Option<Box<dyn HaloReceiver>>>,
}

/// A distributed 3-D volume with replicated halos.
///
/// Construction probes the topology; `realize` partitions the volume,
/// allocates every local subdomain and builds the communication plan; each
/// `exchange` then synchronizes all 26 halos of every local subdomain.
pub struct DistributedGrid {
    size: Coord3,
    radius: Radius,
    methods: Methods,
    placement: Placement,
    comm: Arc<dyn Communicator>,
    platform: Arc<dyn Platform>,
    topology: Topology,
    devices: Vec<usize>,
    field_specs: Vec<FieldSpec>,
    partition: Option<Partition>,
    domains: Vec<Arc<Subdomain>>,
    plans: Vec<DomainPlan>,
    grid_rank: Vec<usize>,
    comm_rank: Vec<usize>,
}

impl std::fmt::Debug for DistributedGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedGrid")
            .field("size", &self.size)
            .field("radius", &self.radius)
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

impl DistributedGrid {
    /// Create an engine for a global volume of `(x, y, z)` cells.
    ///
    /// Probes the colocated rank set and device peer matrix, and assigns
    /// this rank its devices: colocated ranks round-robin the node's
    /// devices, or share them when ranks outnumber devices.
    pub fn new(
        comm: Arc<dyn Communicator>,
        platform: Arc<dyn Platform>,
        x: i64,
        y: i64,
        z: i64,
    ) -> Result<Self> {
        let size = Coord3::new(x, y, z);
        if !size.all_positive() {
            return Err(HaloError::InvalidConfig(format!(
                "domain extent must be positive, got {size}"
            )));
        }
        let start = Instant::now();
        let topology = Topology::probe(&*comm, &*platform);

        let colocated: Vec<usize> = topology.colocated().iter().copied().collect();
        let shm_rank = colocated
            .iter()
            .position(|r| *r == comm.rank())
            .ok_or_else(|| HaloError::CommError("rank missing from its own colocated set".into()))?;
        let shm_size = colocated.len();
        let dev_count = platform.device_count();
        if dev_count == 0 {
            return Err(HaloError::InvalidConfig("no devices visible".to_string()));
        }

        // Fewer colocated ranks than devices: round-robin devices to ranks.
        // More ranks than devices: share.
        let devices: Vec<usize> = if shm_size <= dev_count {
            (0..dev_count).filter(|g| g % shm_size == shm_rank).collect()
        } else {
            vec![shm_rank % dev_count]
        };

        tracing::info!(
            rank = comm.rank(),
            world = comm.world_size(),
            local_rank = shm_rank,
            devices = ?devices,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "probed topology"
        );

        Ok(Self {
            size,
            radius: Radius::uniform(0),
            methods: Methods::all(),
            placement: Placement::Trivial,
            comm,
            platform,
            topology,
            devices,
            field_specs: Vec::new(),
            partition: None,
            domains: Vec::new(),
            plans: Vec::new(),
            grid_rank: Vec::new(),
            comm_rank: Vec::new(),
        })
    }

    fn ensure_unrealized(&self, what: &str) -> Result<()> {
        if self.partition.is_some() {
            return Err(HaloError::InvalidConfig(format!(
                "{what} must be called before realize"
            )));
        }
        Ok(())
    }

    /// Set the stencil radius; scalar or per-axis-per-side.
    pub fn set_radius(&mut self, r: impl Into<Radius>) -> Result<()> {
        self.ensure_unrealized("set_radius")?;
        self.radius = r.into();
        Ok(())
    }

    /// Restrict the transfer strategies the planner may select. An empty
    /// set enables all of them.
    pub fn set_methods(&mut self, methods: Methods) -> Result<()> {
        self.ensure_unrealized("set_methods")?;
        self.methods = if methods.is_empty() {
            Methods::all()
        } else {
            methods
        };
        Ok(())
    }

    /// Choose how comm ranks map onto the rank grid.
    pub fn set_placement(&mut self, placement: Placement) -> Result<()> {
        self.ensure_unrealized("set_placement")?;
        self.placement = placement;
        Ok(())
    }

    /// Register a field of `elem_size`-byte elements. The engine records
    /// only the byte size, never an element type.
    pub fn add_data(&mut self, elem_size: usize, name: &str) -> Result<FieldId> {
        self.ensure_unrealized("add_data")?;
        if elem_size == 0 {
            return Err(HaloError::InvalidConfig(format!(
                "field {name:?} has zero element size"
            )));
        }
        self.field_specs.push(FieldSpec {
            elem_size,
            name: name.to_string(),
        });
        Ok(FieldId(self.field_specs.len() - 1))
    }

    /// The local subdomains, one per assigned device. Empty before
    /// `realize`.
    pub fn domains(&self) -> &[Arc<Subdomain>] {
        &self.domains
    }

    /// The partition, once realized.
    pub fn partition(&self) -> Option<&Partition> {
        self.partition.as_ref()
    }

    /// The probed topology.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Per-subdomain boxes whose stencil reads need no halo data.
    pub fn interior(&self) -> Vec<Box3> {
        self.domains.iter().map(|d| d.interior_box()).collect()
    }

    /// Per-subdomain slabs whose stencil reads depend on halo data.
    pub fn exterior(&self) -> Vec<Vec<Box3>> {
        self.domains.iter().map(|d| d.exterior_boxes()).collect()
    }

    /// Allocate every local subdomain and build the communication plan.
    pub fn realize(&mut self) -> Result<()> {
        if self.partition.is_some() {
            return Err(HaloError::InvalidConfig("already realized".to_string()));
        }
        let start = Instant::now();
        let world = self.comm.world_size();

        // Every rank must drive the same number of devices for the product
        // grid to be well-formed.
        let counts = self.comm.allgather_u64(self.devices.len() as u64)?;
        if counts.iter().any(|c| *c != counts[0]) {
            return Err(HaloError::InvalidConfig(format!(
                "uneven devices per rank: {counts:?}"
            )));
        }
        let gpus = counts[0] as usize;

        self.build_placement()?;
        let partition = Partition::new(self.size, world, gpus);

        // The halo must fit strictly inside the smallest subdomain.
        let min_local = partition.min_local_size();
        for axis in 0..3usize {
            let r = self.radius.neg().axis(axis).max(self.radius.pos().axis(axis));
            if r > 0 && r >= min_local.axis(axis) {
                return Err(HaloError::InvalidConfig(format!(
                    "radius {r} does not fit the local extent {} on axis {axis}",
                    min_local.axis(axis)
                )));
            }
        }

        let my_grid_rank = self.grid_rank[self.comm.rank()];
        let mut domains = Vec::with_capacity(self.devices.len());
        for (slot, ordinal) in self.devices.iter().enumerate() {
            let idx = partition.dom_idx(my_grid_rank, slot);
            let sub = Subdomain::new(
                idx,
                partition.origin(idx),
                partition.local_size(idx),
                self.radius,
                self.platform.device(*ordinal)?,
                &self.field_specs,
            )?;
            tracing::debug!(
                rank = self.comm.rank(),
                device = ordinal,
                index = %idx,
                size = %sub.size(),
                origin = %sub.origin(),
                "realized subdomain"
            );
            domains.push(Arc::new(sub));
        }
        self.domains = domains;

        let plans = self.build_plans(&partition)?;
        self.plans = plans;
        self.partition = Some(partition);

        tracing::info!(
            rank = self.comm.rank(),
            domains = self.domains.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "realize complete"
        );
        Ok(())
    }

    /// Build the comm-rank ↔ grid-rank maps for the placement strategy.
    fn build_placement(&mut self) -> Result<()> {
        let world = self.comm.world_size();
        match self.placement {
            Placement::Trivial => {
                self.grid_rank = (0..world).collect();
                self.comm_rank = (0..world).collect();
            }
            Placement::NodeAware => {
                // Group ranks by node leader (lowest colocated rank) so each
                // node occupies a contiguous block of the rank grid.
                let leader = *self
                    .topology
                    .colocated()
                    .iter()
                    .next()
                    .ok_or_else(|| HaloError::CommError("empty colocated set".into()))?;
                let leaders = self.comm.allgather_u64(leader as u64)?;
                let mut order: Vec<usize> = (0..world).collect();
                order.sort_by_key(|r| (leaders[*r], *r));
                let mut grid_rank = vec![0usize; world];
                for (pos, r) in order.iter().enumerate() {
                    grid_rank[*r] = pos;
                }
                self.comm_rank = order;
                self.grid_rank = grid_rank;
            }
        }
        Ok(())
    }

    /// Classify every (subdomain, direction) pair and instantiate its
    /// transports.
    fn build_plans(&self, partition: &Partition) -> Result<Vec<DomainPlan>> {
        let me = self.comm.rank();
        let grid = partition.grid_dim();
        let grid_vol = grid.flatten();

        let local_slot: HashMap<Coord3, usize> = self
            .domains
            .iter()
            .enumerate()
            .map(|(i, d)| (d.index(), i))
            .collect();

        let mut plans = Vec::with_capacity(self.domains.len());
        for dom in &self.domains {
            let idx = dom.index();
            let mut senders: DirectionMap<Option<Box<dyn HaloSender>>> = DirectionMap::default();
            let mut receivers: DirectionMap<Option<Box<dyn HaloReceiver>>> =
                DirectionMap::default();

            for d in directions() {
                let nbr_idx = (idx + d).wrap(grid);
                let nbr_rank = self.comm_rank[partition.rank_of(nbr_idx)];

                let mut sender: Box<dyn HaloSender> = if nbr_rank == me {
                    let slot = *local_slot.get(&nbr_idx).ok_or_else(|| {
                        HaloError::InvalidConfig(format!(
                            "planner: subdomain {nbr_idx} not found on its own rank"
                        ))
                    })?;
                    let peer_dom = Arc::clone(&self.domains[slot]);
                    let peer = self
                        .topology
                        .peer_access(dom.device().ordinal(), peer_dom.device().ordinal());
                    if peer && self.methods.contains(Methods::KERNEL_PEER) {
                        Box::new(PeerTranslator::new(Arc::clone(dom), peer_dom, d))
                    } else if peer && self.methods.contains(Methods::SAME_RANK_PEER) {
                        Box::new(PeerCopier::new(Arc::clone(dom), peer_dom, d))
                    } else if self.methods.contains(Methods::SAME_RANK_COPY) {
                        Box::new(BounceCopier::new(Arc::clone(dom), peer_dom, d))
                    } else {
                        return Err(HaloError::InvalidConfig(format!(
                            "no enabled same-rank transport for direction {d}"
                        )));
                    }
                } else {
                    let staging = self.staging_for(nbr_rank)?;
                    let tag = halo_tag(idx.linear_in(grid), nbr_idx.linear_in(grid), grid_vol, d);
                    Box::new(StagedSender::new(
                        Arc::clone(dom),
                        d,
                        nbr_rank,
                        tag,
                        staging,
                        Arc::clone(&self.comm),
                    ))
                };
                sender.allocate()?;

                // The halo on the d side is fed by the neighbor at idx + d;
                // a receiver exists only when that neighbor is remote. Its
                // message is tagged with the neighbor's send direction, -d.
                let receiver: Option<Box<dyn HaloReceiver>> = if nbr_rank == me {
                    None
                } else {
                    let staging = self.staging_for(nbr_rank)?;
                    let tag =
                        halo_tag(nbr_idx.linear_in(grid), idx.linear_in(grid), grid_vol, -d);
                    let mut rx = Box::new(StagedReceiver::new(
                        Arc::clone(dom),
                        d,
                        nbr_rank,
                        tag,
                        staging,
                        Arc::clone(&self.comm),
                    ));
                    rx.allocate()?;
                    Some(rx)
                };

                *senders.at_mut(d) = Some(sender);
                *receivers.at_mut(d) = receiver;
            }
            plans.push(DomainPlan { senders, receivers });
        }
        Ok(plans)
    }

    /// Staging choice for traffic with `rank`; both endpoints compute the
    /// same answer from global configuration, so the plan matches.
    fn staging_for(&self, rank: usize) -> Result<Staging> {
        let m = self.methods;
        if self.topology.is_colocated(rank) && m.contains(Methods::COLOCATED_STAGED) {
            return Ok(Staging::Host);
        }
        if m.contains(Methods::DEVICE_AWARE_REMOTE) && self.comm.device_aware() {
            return Ok(Staging::Device);
        }
        if m.contains(Methods::REMOTE_STAGED) {
            return Ok(Staging::Host);
        }
        Err(HaloError::InvalidConfig(format!(
            "no enabled transport for traffic with rank {rank}"
        )))
    }

    /// One halo round: entry barrier, asynchronous send/recv issue over all
    /// subdomains, wait for completion, exit barrier. After return, every
    /// halo of every local subdomain is up to date on its device.
    pub fn exchange(&mut self) -> Result<()> {
        if self.partition.is_none() {
            return Err(HaloError::InvalidConfig(
                "exchange called before realize".to_string(),
            ));
        }
        let start = Instant::now();
        self.comm.barrier()?;

        // Send-issue and recv-issue per subdomain are independent host-side
        // work items; dispatch them through the pool.
        let first_err: Mutex<Option<HaloError>> = Mutex::new(None);
        rayon::scope(|scope| {
            for plan in self.plans.iter_mut() {
                let senders = &mut plan.senders;
                let receivers = &mut plan.receivers;
                let err_s = &first_err;
                let err_r = &first_err;
                scope.spawn(move |_| {
                    for (_, cell) in senders.iter_mut() {
                        if let Some(tx) = cell {
                            if let Err(e) = tx.send() {
                                let mut g = err_s.lock();
                                if g.is_none() {
                                    *g = Some(e);
                                }
                                return;
                            }
                        }
                    }
                });
                scope.spawn(move |_| {
                    for (_, cell) in receivers.iter_mut() {
                        if let Some(rx) = cell {
                            if let Err(e) = rx.recv() {
                                let mut g = err_r.lock();
                                if g.is_none() {
                                    *g = Some(e);
                                }
                                return;
                            }
                        }
                    }
                });
            }
        });
        if let Some(e) = first_err.into_inner() {
            return Err(e);
        }

        // Wait order does not affect correctness.
        for plan in self.plans.iter_mut() {
            for (_, cell) in plan.receivers.iter_mut() {
                if let Some(rx) = cell {
                    rx.wait()?;
                }
            }
            for (_, cell) in plan.senders.iter_mut() {
                if let Some(tx) = cell {
                    tx.wait()?;
                }
            }
        }

        self.comm.barrier()?;
        tracing::debug!(
            rank = self.comm.rank(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "exchange complete"
        );
        Ok(())
    }

    /// Exchange `curr`/`next` pointers of every field of every local
    /// subdomain. Must not run concurrently with `exchange`.
    pub fn swap(&self) {
        for d in &self.domains {
            d.swap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::local::LocalGroup;
    use crate::device::host::HostPlatform;

    fn engine(devices: usize) -> DistributedGrid {
        let group = LocalGroup::new(1);
        DistributedGrid::new(
            Arc::new(group.communicator(0)),
            Arc::new(HostPlatform::new(devices)),
            10,
            10,
            10,
        )
        .unwrap()
    }

    #[test]
    fn configuration_is_frozen_by_realize() {
        let mut grid = engine(1);
        grid.set_radius(1).unwrap();
        grid.add_data(4, "f").unwrap();
        grid.realize().unwrap();
        assert!(grid.set_radius(2).is_err());
        assert!(grid.add_data(8, "g").is_err());
        assert!(grid.realize().is_err());
    }

    #[test]
    fn oversized_radius_is_rejected() {
        let mut grid = engine(8);
        grid.set_radius(5).unwrap(); // local extent is 5 on a 2×2×2 device grid
        grid.add_data(4, "f").unwrap();
        let err = grid.realize().unwrap_err();
        assert!(matches!(err, HaloError::InvalidConfig(_)));
    }

    #[test]
    fn zero_element_field_is_rejected() {
        let mut grid = engine(1);
        assert!(grid.add_data(0, "broken").is_err());
    }

    #[test]
    fn empty_method_set_means_all() {
        let mut grid = engine(1);
        grid.set_methods(Methods::empty()).unwrap();
        grid.set_radius(1).unwrap();
        grid.add_data(4, "f").unwrap();
        grid.realize().unwrap();
        grid.exchange().unwrap();
    }

    #[test]
    fn exchange_before_realize_fails() {
        let mut grid = engine(1);
        assert!(grid.exchange().is_err());
    }

    #[test]
    fn nonpositive_extent_is_rejected() {
        let group = LocalGroup::new(1);
        let r = DistributedGrid::new(
            Arc::new(group.communicator(0)),
            Arc::new(HostPlatform::new(1)),
            0,
            4,
            4,
        );
        assert!(r.is_err());
    }
}
