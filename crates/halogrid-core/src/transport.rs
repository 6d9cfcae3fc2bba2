//! Neighbor transports: one send-or-receive of one direction's halo.
//!
//! The planner instantiates exactly one sender per (subdomain, direction)
//! and, for neighbors on other ranks, one receiver. The exchange driver
//! only ever calls the small capability set `allocate`/`send`/`recv`/
//! `wait`/`bytes`; it never branches on the concrete variant.

use std::sync::Arc;

use crate::comm::{Communicator, PendingRecv, PendingSend, Tag};
use crate::device::DeviceBuffer;
use crate::error::{HaloError, Result};
use crate::geom::Coord3;
use crate::subdomain::Subdomain;

/// Transport lifecycle; `send`/`recv` require `Allocated` or `Idle`, `wait`
/// requires the matching active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Created,
    Allocated,
    Sending,
    Receiving,
    Idle,
}

impl TxState {
    fn name(self) -> &'static str {
        match self {
            TxState::Created => "Created",
            TxState::Allocated => "Allocated",
            TxState::Sending => "Sending",
            TxState::Receiving => "Receiving",
            TxState::Idle => "Idle",
        }
    }
}

fn step(state: &mut TxState, from: &[TxState], to: TxState, op: &'static str) -> Result<()> {
    if !from.contains(state) {
        return Err(HaloError::InvalidStateTransition {
            op,
            state: state.name(),
        });
    }
    *state = to;
    Ok(())
}

/// Sender half of one plan cell.
pub trait HaloSender: Send {
    /// Size internal buffers; called once after planning.
    fn allocate(&mut self) -> Result<()>;
    /// Issue the send without blocking on completion.
    fn send(&mut self) -> Result<()>;
    /// Block until the local side of the send is complete.
    fn wait(&mut self) -> Result<()>;
    /// Bytes this sender ships per exchange.
    fn bytes(&self) -> usize;
}

/// Receiver half of one plan cell; only present for remote neighbors.
pub trait HaloReceiver: Send {
    /// Size internal buffers; called once after planning.
    fn allocate(&mut self) -> Result<()>;
    /// Post the receive without blocking.
    fn recv(&mut self) -> Result<()>;
    /// Block until the halo region has been updated on the device.
    fn wait(&mut self) -> Result<()>;
    /// Bytes this receiver accepts per exchange.
    fn bytes(&self) -> usize;
}

/// Pack every field's interior slab for direction `d` into `stage`,
/// registration order, no padding between fields. One multi-field launch
/// per direction where the backend supports it.
fn pack_fields(domain: &Subdomain, d: Coord3, stage: &dyn DeviceBuffer) -> Result<()> {
    let raw = domain.raw_size();
    let pos = domain.halo_pos(d, false);
    let ext = domain.send_extent(d);
    let bufs = domain.curr_buffers();
    let jobs: Vec<crate::device::RegionJob<'_>> = bufs
        .iter()
        .map(|(elem, buf)| crate::device::RegionJob {
            buf: &**buf,
            region: crate::device::RegionSpec {
                raw,
                pos,
                ext,
                elem: *elem,
            },
        })
        .collect();
    domain.stream().pack_many(stage, &jobs)
}

/// Scatter `stage` into every field's halo region on the `d` side; the
/// layout mirrors [`pack_fields`] on the sending subdomain.
fn unpack_fields(domain: &Subdomain, d: Coord3, stage: &dyn DeviceBuffer) -> Result<()> {
    let raw = domain.raw_size();
    let pos = domain.halo_pos(d, true);
    let ext = domain.halo_extent(d);
    let bufs = domain.curr_buffers();
    let jobs: Vec<crate::device::RegionJob<'_>> = bufs
        .iter()
        .map(|(elem, buf)| crate::device::RegionJob {
            buf: &**buf,
            region: crate::device::RegionSpec {
                raw,
                pos,
                ext,
                elem: *elem,
            },
        })
        .collect();
    domain.stream().unpack_many(stage, &jobs)
}

// ---------------------------------------------------------------------------
// Same-rank variants (no receiver object)
// ---------------------------------------------------------------------------

/// Same rank, peer access: translate kernels write the destination
/// subdomain's halo directly from the source interior. No staging.
pub struct PeerTranslator {
    src: Arc<Subdomain>,
    dst: Arc<Subdomain>,
    dir: Coord3,
    state: TxState,
}

impl PeerTranslator {
    pub(crate) fn new(src: Arc<Subdomain>, dst: Arc<Subdomain>, dir: Coord3) -> Self {
        Self {
            src,
            dst,
            dir,
            state: TxState::Created,
        }
    }
}

impl HaloSender for PeerTranslator {
    fn allocate(&mut self) -> Result<()> {
        step(&mut self.state, &[TxState::Created], TxState::Allocated, "allocate")
    }

    fn send(&mut self) -> Result<()> {
        step(
            &mut self.state,
            &[TxState::Allocated, TxState::Idle],
            TxState::Sending,
            "send",
        )?;
        let d = self.dir;
        let ext = self.src.send_extent(d);
        let stream = self.src.stream();
        let dst_fields = self.dst.curr_buffers();
        for ((elem, src_buf), (_, dst_buf)) in
            self.src.curr_buffers().into_iter().zip(dst_fields)
        {
            stream.translate(
                &*dst_buf,
                self.dst.raw_size(),
                self.dst.halo_pos(-d, true),
                &*src_buf,
                self.src.raw_size(),
                self.src.halo_pos(d, false),
                ext,
                elem,
            )?;
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        step(&mut self.state, &[TxState::Sending], TxState::Idle, "wait")?;
        self.src.stream().synchronize()
    }

    fn bytes(&self) -> usize {
        self.src.send_bytes(self.dir)
    }
}

/// Same rank, peer access: pack on the source device, one linear peer copy,
/// unpack on the destination device.
pub struct PeerCopier {
    src: Arc<Subdomain>,
    dst: Arc<Subdomain>,
    dir: Coord3,
    stage_src: Option<Arc<dyn DeviceBuffer>>,
    stage_dst: Option<Arc<dyn DeviceBuffer>>,
    state: TxState,
}

impl PeerCopier {
    pub(crate) fn new(src: Arc<Subdomain>, dst: Arc<Subdomain>, dir: Coord3) -> Self {
        Self {
            src,
            dst,
            dir,
            stage_src: None,
            stage_dst: None,
            state: TxState::Created,
        }
    }

    fn stages(&self) -> Result<(&Arc<dyn DeviceBuffer>, &Arc<dyn DeviceBuffer>)> {
        match (&self.stage_src, &self.stage_dst) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(HaloError::InvalidStateTransition {
                op: "send",
                state: "Created",
            }),
        }
    }
}

impl HaloSender for PeerCopier {
    fn allocate(&mut self) -> Result<()> {
        step(&mut self.state, &[TxState::Created], TxState::Allocated, "allocate")?;
        let len = self.bytes();
        self.stage_src = Some(self.src.device().alloc(len, STAGE_ALIGN)?);
        self.stage_dst = Some(self.dst.device().alloc(len, STAGE_ALIGN)?);
        Ok(())
    }

    fn send(&mut self) -> Result<()> {
        step(
            &mut self.state,
            &[TxState::Allocated, TxState::Idle],
            TxState::Sending,
            "send",
        )?;
        let (stage_src, _) = self.stages()?;
        pack_fields(&self.src, self.dir, &**stage_src)
    }

    fn wait(&mut self) -> Result<()> {
        step(&mut self.state, &[TxState::Sending], TxState::Idle, "wait")?;
        let (stage_src, stage_dst) = self.stages()?;
        let len = stage_src.len();
        self.src.stream().synchronize()?;
        self.dst
            .stream()
            .copy_d2d(&**stage_dst, 0, &**stage_src, 0, len)?;
        unpack_fields(&self.dst, -self.dir, &**stage_dst)?;
        self.dst.stream().synchronize()
    }

    fn bytes(&self) -> usize {
        self.src.send_bytes(self.dir)
    }
}

/// Same rank, no peer access: pack, bounce through a host buffer, unpack.
pub struct BounceCopier {
    src: Arc<Subdomain>,
    dst: Arc<Subdomain>,
    dir: Coord3,
    stage_src: Option<Arc<dyn DeviceBuffer>>,
    stage_dst: Option<Arc<dyn DeviceBuffer>>,
    bounce: Vec<u8>,
    state: TxState,
}

impl BounceCopier {
    pub(crate) fn new(src: Arc<Subdomain>, dst: Arc<Subdomain>, dir: Coord3) -> Self {
        Self {
            src,
            dst,
            dir,
            stage_src: None,
            stage_dst: None,
            bounce: Vec::new(),
            state: TxState::Created,
        }
    }
}

impl HaloSender for BounceCopier {
    fn allocate(&mut self) -> Result<()> {
        step(&mut self.state, &[TxState::Created], TxState::Allocated, "allocate")?;
        let len = self.bytes();
        self.stage_src = Some(self.src.device().alloc(len, STAGE_ALIGN)?);
        self.stage_dst = Some(self.dst.device().alloc(len, STAGE_ALIGN)?);
        self.bounce = vec![0u8; len];
        Ok(())
    }

    fn send(&mut self) -> Result<()> {
        step(
            &mut self.state,
            &[TxState::Allocated, TxState::Idle],
            TxState::Sending,
            "send",
        )?;
        let stage = self.stage_src.as_ref().ok_or(HaloError::InvalidStateTransition {
            op: "send",
            state: "Created",
        })?;
        pack_fields(&self.src, self.dir, &**stage)
    }

    fn wait(&mut self) -> Result<()> {
        step(&mut self.state, &[TxState::Sending], TxState::Idle, "wait")?;
        let (stage_src, stage_dst) = match (&self.stage_src, &self.stage_dst) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                return Err(HaloError::InvalidStateTransition {
                    op: "wait",
                    state: "Created",
                })
            }
        };
        self.src.stream().synchronize()?;
        self.src
            .stream()
            .copy_to_host(&mut self.bounce, &**stage_src, 0)?;
        self.dst
            .stream()
            .copy_from_host(&**stage_dst, 0, &self.bounce)?;
        unpack_fields(&self.dst, -self.dir, &**stage_dst)?;
        self.dst.stream().synchronize()
    }

    fn bytes(&self) -> usize {
        self.src.send_bytes(self.dir)
    }
}

// ---------------------------------------------------------------------------
// Cross-rank staged variants
// ---------------------------------------------------------------------------

/// Where the message leaves from: a host bounce buffer, or the device
/// staging buffer itself when the transport is device-aware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staging {
    /// Pack, copy to host, message the host bytes.
    Host,
    /// Pack, message the device buffer directly.
    Device,
}

/// Sender toward a subdomain owned by another rank.
pub struct StagedSender {
    domain: Arc<Subdomain>,
    dir: Coord3,
    dst_rank: usize,
    tag: Tag,
    staging: Staging,
    comm: Arc<dyn Communicator>,
    stage: Option<Arc<dyn DeviceBuffer>>,
    bounce: Vec<u8>,
    pending: Option<Box<dyn PendingSend>>,
    state: TxState,
}

impl StagedSender {
    pub(crate) fn new(
        domain: Arc<Subdomain>,
        dir: Coord3,
        dst_rank: usize,
        tag: Tag,
        staging: Staging,
        comm: Arc<dyn Communicator>,
    ) -> Self {
        Self {
            domain,
            dir,
            dst_rank,
            tag,
            staging,
            comm,
            stage: None,
            bounce: Vec::new(),
            pending: None,
            state: TxState::Created,
        }
    }
}

impl HaloSender for StagedSender {
    fn allocate(&mut self) -> Result<()> {
        step(&mut self.state, &[TxState::Created], TxState::Allocated, "allocate")?;
        let len = self.bytes();
        self.stage = Some(self.domain.device().alloc(len, STAGE_ALIGN)?);
        if self.staging == Staging::Host {
            self.bounce = vec![0u8; len];
        }
        Ok(())
    }

    fn send(&mut self) -> Result<()> {
        step(
            &mut self.state,
            &[TxState::Allocated, TxState::Idle],
            TxState::Sending,
            "send",
        )?;
        let stage = self.stage.as_ref().ok_or(HaloError::InvalidStateTransition {
            op: "send",
            state: "Created",
        })?;
        pack_fields(&self.domain, self.dir, &**stage)?;
        let stream = self.domain.stream();
        let pending = match self.staging {
            Staging::Host => {
                stream.copy_to_host(&mut self.bounce, &**stage, 0)?;
                stream.synchronize()?;
                self.comm.send(self.dst_rank, self.tag, &self.bounce)?
            }
            Staging::Device => {
                stream.synchronize()?;
                self.comm
                    .send_device(self.dst_rank, self.tag, stage.addr(), stage.len())?
            }
        };
        self.pending = Some(pending);
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        step(&mut self.state, &[TxState::Sending], TxState::Idle, "wait")?;
        match self.pending.take() {
            Some(p) => p.wait(),
            None => Err(HaloError::InvalidStateTransition {
                op: "wait",
                state: "Idle",
            }),
        }
    }

    fn bytes(&self) -> usize {
        self.domain.send_bytes(self.dir)
    }
}

/// Receiver for the halo on the `dir` side, fed by the neighbor at
/// `(idx + dir) mod grid` on another rank.
pub struct StagedReceiver {
    domain: Arc<Subdomain>,
    dir: Coord3,
    src_rank: usize,
    tag: Tag,
    staging: Staging,
    comm: Arc<dyn Communicator>,
    stage: Option<Arc<dyn DeviceBuffer>>,
    pending: Option<Box<dyn PendingRecv>>,
    state: TxState,
}

impl StagedReceiver {
    pub(crate) fn new(
        domain: Arc<Subdomain>,
        dir: Coord3,
        src_rank: usize,
        tag: Tag,
        staging: Staging,
        comm: Arc<dyn Communicator>,
    ) -> Self {
        Self {
            domain,
            dir,
            src_rank,
            tag,
            staging,
            comm,
            stage: None,
            pending: None,
            state: TxState::Created,
        }
    }
}

impl HaloReceiver for StagedReceiver {
    fn allocate(&mut self) -> Result<()> {
        step(&mut self.state, &[TxState::Created], TxState::Allocated, "allocate")?;
        let len = self.bytes();
        self.stage = Some(self.domain.device().alloc(len, STAGE_ALIGN)?);
        Ok(())
    }

    fn recv(&mut self) -> Result<()> {
        step(
            &mut self.state,
            &[TxState::Allocated, TxState::Idle],
            TxState::Receiving,
            "recv",
        )?;
        let stage = self.stage.as_ref().ok_or(HaloError::InvalidStateTransition {
            op: "recv",
            state: "Created",
        })?;
        let pending = match self.staging {
            Staging::Host => self.comm.recv(self.src_rank, self.tag, stage.len())?,
            Staging::Device => {
                self.comm
                    .recv_device(self.src_rank, self.tag, stage.addr(), stage.len())?
            }
        };
        self.pending = Some(pending);
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        step(&mut self.state, &[TxState::Receiving], TxState::Idle, "wait")?;
        let pending = self.pending.take().ok_or(HaloError::InvalidStateTransition {
            op: "wait",
            state: "Idle",
        })?;
        let stage = self.stage.as_ref().ok_or(HaloError::InvalidStateTransition {
            op: "wait",
            state: "Created",
        })?;
        let stream = self.domain.stream();
        match self.staging {
            Staging::Host => {
                let bytes = pending.wait()?;
                stream.copy_from_host(&**stage, 0, &bytes)?;
            }
            Staging::Device => {
                pending.wait()?;
            }
        }
        unpack_fields(&self.domain, self.dir, &**stage)?;
        stream.synchronize()
    }

    fn bytes(&self) -> usize {
        self.domain.halo_bytes(self.dir)
    }
}

/// Staging buffer alignment; covers every element size in use.
const STAGE_ALIGN: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::local::LocalGroup;
    use crate::device::host::HostPlatform;
    use crate::device::Platform;
    use crate::geom::Radius;
    use crate::subdomain::FieldSpec;

    fn pair() -> (Arc<Subdomain>, Arc<Subdomain>) {
        let platform = HostPlatform::new(2);
        let specs = [FieldSpec {
            elem_size: 4,
            name: "f".to_string(),
        }];
        let a = Subdomain::new(
            Coord3::ZERO,
            Coord3::ZERO,
            Coord3::splat(4),
            Radius::uniform(1),
            platform.device(0).unwrap(),
            &specs,
        )
        .unwrap();
        let b = Subdomain::new(
            Coord3::new(1, 0, 0),
            Coord3::new(4, 0, 0),
            Coord3::splat(4),
            Radius::uniform(1),
            platform.device(1).unwrap(),
            &specs,
        )
        .unwrap();
        (Arc::new(a), Arc::new(b))
    }

    #[test]
    fn send_before_allocate_is_a_programmer_error() {
        let (a, b) = pair();
        let mut tx = PeerCopier::new(a, b, Coord3::new(1, 0, 0));
        let err = tx.send().unwrap_err();
        assert!(matches!(
            err,
            HaloError::InvalidStateTransition { op: "send", .. }
        ));
    }

    #[test]
    fn wait_requires_an_active_transfer() {
        let (a, b) = pair();
        let mut tx = PeerTranslator::new(a, b, Coord3::new(1, 0, 0));
        tx.allocate().unwrap();
        let err = tx.wait().unwrap_err();
        assert!(matches!(
            err,
            HaloError::InvalidStateTransition { op: "wait", .. }
        ));
        tx.send().unwrap();
        tx.wait().unwrap();
        // Idle again: another round is legal.
        tx.send().unwrap();
        tx.wait().unwrap();
    }

    #[test]
    fn double_allocate_is_rejected() {
        let (a, b) = pair();
        let mut tx = BounceCopier::new(a, b, Coord3::new(1, 0, 0));
        tx.allocate().unwrap();
        assert!(tx.allocate().is_err());
    }

    #[test]
    fn staged_pair_round_trips_one_face() {
        let (a, b) = pair();
        let dir = Coord3::new(1, 0, 0);
        let group = LocalGroup::new(1);
        let comm: Arc<dyn Communicator> = Arc::new(group.communicator(0));

        // Distinct bytes in a's interior slab.
        let f = crate::subdomain::FieldId(0);
        let raw = a.raw_size();
        let init: Vec<u8> = (0..raw.flatten() as usize * 4).map(|i| i as u8).collect();
        a.region_from_host(Coord3::ZERO, raw, f, &init).unwrap();

        let mut tx = StagedSender::new(Arc::clone(&a), dir, 0, 42, Staging::Host, Arc::clone(&comm));
        let mut rx = StagedReceiver::new(Arc::clone(&b), -dir, 0, 42, Staging::Host, comm);
        tx.allocate().unwrap();
        rx.allocate().unwrap();
        assert_eq!(tx.bytes(), rx.bytes());

        rx.recv().unwrap();
        tx.send().unwrap();
        rx.wait().unwrap();
        tx.wait().unwrap();

        let sent = a
            .region_to_host(a.halo_pos(dir, false), a.send_extent(dir), f)
            .unwrap();
        let got = b
            .region_to_host(b.halo_pos(-dir, true), b.halo_extent(-dir), f)
            .unwrap();
        assert_eq!(sent, got);
    }
}
