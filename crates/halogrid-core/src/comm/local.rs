//! In-process multi-rank process group over shared mailboxes.
//!
//! Each "rank" is a thread holding one [`LocalComm`] cloned from the same
//! [`LocalGroup`]. Messages travel through a keyed mailbox map guarded by a
//! mutex and condvar; the barrier is a shared reusable [`std::sync::Barrier`].
//! A group can simulate a multi-node layout by assigning ranks to nodes,
//! which drives the colocated sets the topology probe observes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Barrier};

use parking_lot::{Condvar, Mutex};

use crate::comm::{Communicator, PendingRecv, PendingSend, Tag};
use crate::error::{HaloError, Result};

/// Tag reserved for the allgather collective; halo tags never reach it.
const TAG_ALLGATHER: Tag = Tag::MAX;

type MailKey = (usize, usize, Tag);

struct Shared {
    world: usize,
    node_of: Vec<usize>,
    device_aware: bool,
    mail: Mutex<HashMap<MailKey, VecDeque<Vec<u8>>>>,
    mail_cv: Condvar,
    barrier: Barrier,
}

impl Shared {
    fn push(&self, key: MailKey, payload: Vec<u8>) {
        let mut mail = self.mail.lock();
        mail.entry(key).or_default().push_back(payload);
        self.mail_cv.notify_all();
    }

    fn pop_blocking(&self, key: MailKey) -> Vec<u8> {
        let mut mail = self.mail.lock();
        loop {
            if let Some(q) = mail.get_mut(&key) {
                if let Some(msg) = q.pop_front() {
                    return msg;
                }
            }
            self.mail_cv.wait(&mut mail);
        }
    }
}

/// A group of in-process ranks sharing one mailbox universe.
pub struct LocalGroup {
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Create a group of `world` ranks, all colocated on one node.
    pub fn new(world: usize) -> Self {
        Self::with_nodes(vec![0; world])
    }

    /// Create a group whose rank `r` lives on node `node_of[r]`. Colocated
    /// sets follow the node assignment, which lets tests exercise the
    /// remote transports without leaving the process.
    pub fn with_nodes(node_of: Vec<usize>) -> Self {
        Self::build(node_of, false)
    }

    /// Variant whose communicators advertise device-aware messaging. Only
    /// meaningful with host-visible device memory such as `HostPlatform`.
    pub fn with_nodes_device_aware(node_of: Vec<usize>) -> Self {
        Self::build(node_of, true)
    }

    fn build(node_of: Vec<usize>, device_aware: bool) -> Self {
        assert!(!node_of.is_empty());
        let world = node_of.len();
        Self {
            shared: Arc::new(Shared {
                world,
                node_of,
                device_aware,
                mail: Mutex::new(HashMap::new()),
                mail_cv: Condvar::new(),
                barrier: Barrier::new(world),
            }),
        }
    }

    /// The communicator endpoint for `rank`.
    pub fn communicator(&self, rank: usize) -> LocalComm {
        assert!(rank < self.shared.world);
        LocalComm {
            rank,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// One rank's endpoint in a [`LocalGroup`].
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    shared: Arc<Shared>,
}

struct LocalPendingSend;

impl PendingSend for LocalPendingSend {
    fn wait(self: Box<Self>) -> Result<()> {
        // Delivery copied the payload into the mailbox at post time.
        Ok(())
    }
}

struct LocalPendingRecv {
    shared: Arc<Shared>,
    key: MailKey,
    expected: usize,
    dst_addr: Option<usize>,
}

impl PendingRecv for LocalPendingRecv {
    fn wait(self: Box<Self>) -> Result<Vec<u8>> {
        let msg = self.shared.pop_blocking(self.key);
        if msg.len() != self.expected {
            return Err(HaloError::LengthMismatch {
                expected: self.expected,
                actual: msg.len(),
            });
        }
        if let Some(addr) = self.dst_addr {
            // SAFETY: the posting transport owns [addr, addr+len) for the
            // lifetime of this receive and issues no device work on it until
            // wait returns.
            unsafe {
                std::ptr::copy_nonoverlapping(msg.as_ptr(), addr as *mut u8, msg.len());
            }
            return Ok(Vec::new());
        }
        Ok(msg)
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world
    }

    fn colocated(&self) -> Vec<usize> {
        let my_node = self.shared.node_of[self.rank];
        (0..self.shared.world)
            .filter(|r| self.shared.node_of[*r] == my_node)
            .collect()
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn send(&self, dst: usize, tag: Tag, payload: &[u8]) -> Result<Box<dyn PendingSend>> {
        if dst >= self.shared.world {
            return Err(HaloError::CommError(format!("no such rank {dst}")));
        }
        self.shared.push((self.rank, dst, tag), payload.to_vec());
        Ok(Box::new(LocalPendingSend))
    }

    fn recv(&self, src: usize, tag: Tag, len: usize) -> Result<Box<dyn PendingRecv>> {
        if src >= self.shared.world {
            return Err(HaloError::CommError(format!("no such rank {src}")));
        }
        Ok(Box::new(LocalPendingRecv {
            shared: Arc::clone(&self.shared),
            key: (src, self.rank, tag),
            expected: len,
            dst_addr: None,
        }))
    }

    fn allgather_u64(&self, value: u64) -> Result<Vec<u64>> {
        for dst in 0..self.shared.world {
            self.shared
                .push((self.rank, dst, TAG_ALLGATHER), value.to_le_bytes().to_vec());
        }
        let mut out = Vec::with_capacity(self.shared.world);
        for src in 0..self.shared.world {
            let msg = self.shared.pop_blocking((src, self.rank, TAG_ALLGATHER));
            let bytes: [u8; 8] = msg
                .as_slice()
                .try_into()
                .map_err(|_| HaloError::CommError("malformed allgather message".to_string()))?;
            out.push(u64::from_le_bytes(bytes));
        }
        Ok(out)
    }

    fn device_aware(&self) -> bool {
        self.shared.device_aware
    }

    fn send_device(
        &self,
        dst: usize,
        tag: Tag,
        addr: usize,
        len: usize,
    ) -> Result<Box<dyn PendingSend>> {
        if !self.shared.device_aware {
            return Err(HaloError::NotSupported(
                "device-resident messaging".to_string(),
            ));
        }
        // SAFETY: the sending transport owns [addr, addr+len) host-visible
        // staging memory and has synchronized its stream before posting.
        let payload = unsafe { std::slice::from_raw_parts(addr as *const u8, len) }.to_vec();
        self.shared.push((self.rank, dst, tag), payload);
        Ok(Box::new(LocalPendingSend))
    }

    fn recv_device(
        &self,
        src: usize,
        tag: Tag,
        addr: usize,
        len: usize,
    ) -> Result<Box<dyn PendingRecv>> {
        if !self.shared.device_aware {
            return Err(HaloError::NotSupported(
                "device-resident messaging".to_string(),
            ));
        }
        Ok(Box::new(LocalPendingRecv {
            shared: Arc::clone(&self.shared),
            key: (src, self.rank, tag),
            expected: len,
            dst_addr: Some(addr),
        }))
    }
}
