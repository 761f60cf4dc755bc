//! Thin façade over intra-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* of arbitrary length. All handles are
//! **waitable** but non-blocking: callers post every send and receive of a
//! round, then `.wait()` on each before trusting the received buffer.
//!
//! Between one `(source, destination, tag)` triple, messages are delivered in
//! the order they were sent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use crate::topology::ids::Rank;

/// Non-blocking communication interface.
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// Post a send of `buf` to `peer`.
    fn isend(&self, peer: Rank, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive of the next message from `peer` carrying `tag`.
    fn irecv(&self, peer: Rank, tag: u16) -> Self::RecvHandle;

    /// This process' rank.
    fn rank(&self) -> Rank;
    /// Number of processes in the communicator.
    fn size(&self) -> usize;
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Single-process communicator for serial runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: Rank, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: Rank, _tag: u16) {}

    fn rank(&self) -> Rank {
        0
    }
    fn size(&self) -> usize {
        1
    }
}

/// Message tag newtype.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommTag(u16);

impl CommTag {
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
    #[inline]
    pub const fn offset(self, off: u16) -> Self {
        Self(self.0.wrapping_add(off))
    }
}

/// Tags used by the collective phases of the DOF map.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DofMapCommTags {
    pub reduce: CommTag,
    pub ghost_dofs: CommTag,
    pub scatter_constraints: CommTag,
    pub gather_constraints: CommTag,
    pub sparsity: CommTag,
}

impl DofMapCommTags {
    /// Consecutive tags starting at `base`.
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            reduce: base,
            ghost_dofs: base.offset(1),
            scatter_constraints: base.offset(2),
            gather_constraints: base.offset(3),
            sparsity: base.offset(4),
        }
    }
}

impl Default for DofMapCommTags {
    fn default() -> Self {
        Self::from_base(CommTag::new(0xD0F0))
    }
}

// --- ThreadComm: one process, one thread per rank ---

type Key = (usize, Rank, Rank, u16); // (world, src, dst, tag)

static MAILBOX: Lazy<DashMap<Key, VecDeque<Bytes>>> = Lazy::new(DashMap::new);
static DELIVERED: Lazy<(Mutex<u64>, Condvar)> = Lazy::new(|| (Mutex::new(0), Condvar::new()));
static NEXT_WORLD: AtomicUsize = AtomicUsize::new(0);

const RECV_TIMEOUT: Duration = Duration::from_secs(120);

/// Intra-process communicator: each rank of a world is driven by its own thread.
///
/// Worlds are isolated from one another, so concurrently running tests never
/// see each other's messages.
#[derive(Clone, Debug)]
pub struct ThreadComm {
    world: usize,
    rank: Rank,
    size: usize,
}

impl ThreadComm {
    /// Create a fresh world of `size` ranks.
    pub fn world(size: usize) -> Vec<ThreadComm> {
        let world = NEXT_WORLD.fetch_add(1, Ordering::Relaxed);
        (0..size).map(|rank| ThreadComm { world, rank, size }).collect()
    }
}

/// Pending receive on a [`ThreadComm`].
#[derive(Debug)]
pub struct ThreadRecv {
    key: Key,
}

/// Pop the next message and drop the channel once it is drained.
fn try_pop(key: &Key) -> Option<Bytes> {
    let msg = MAILBOX.get_mut(key).and_then(|mut q| q.pop_front());
    if msg.is_some() {
        MAILBOX.remove_if(key, |_, q| q.is_empty());
    }
    msg
}

impl Wait for ThreadRecv {
    fn wait(self) -> Option<Vec<u8>> {
        let (lock, cvar) = &*DELIVERED;
        loop {
            let mut seen = lock.lock();
            if let Some(bytes) = try_pop(&self.key) {
                return Some(bytes.to_vec());
            }
            if cvar.wait_for(&mut seen, RECV_TIMEOUT).timed_out() {
                drop(seen);
                return try_pop(&self.key).map(|b| b.to_vec());
            }
        }
    }
}

impl Communicator for ThreadComm {
    type SendHandle = ();
    type RecvHandle = ThreadRecv;

    fn isend(&self, peer: Rank, tag: u16, buf: &[u8]) {
        let key = (self.world, self.rank, peer, tag);
        MAILBOX
            .entry(key)
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
        let (lock, cvar) = &*DELIVERED;
        let mut n = lock.lock();
        *n = n.wrapping_add(1);
        cvar.notify_all();
    }

    fn irecv(&self, peer: Rank, tag: u16) -> ThreadRecv {
        ThreadRecv {
            key: (self.world, peer, self.rank, tag),
        }
    }

    fn rank(&self) -> Rank {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::environment::Universe;
    use mpi::request::StaticScope;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;
    use std::sync::Arc;

    /// Communicator over `MPI_COMM_WORLD`.
    pub struct MpiComm {
        _universe: Arc<Universe>,
        world: SimpleCommunicator,
        rank: Rank,
        size: usize,
    }

    impl MpiComm {
        /// Initialize MPI; returns `None` if it was already initialized.
        pub fn new() -> Option<Self> {
            let universe = mpi::initialize()?;
            let world = universe.world();
            let rank = world.rank() as Rank;
            let size = world.size() as usize;
            Some(Self {
                _universe: Arc::new(universe),
                world,
                rank,
                size,
            })
        }
    }

    /// In-flight send; owns its buffer until completion.
    pub struct MpiSend {
        req: mpi::request::Request<'static, [u8], StaticScope>,
        buf: *mut [u8],
    }

    impl Wait for MpiSend {
        fn wait(self) -> Option<Vec<u8>> {
            self.req.wait();
            // SAFETY: `buf` was leaked in `isend` and the request is complete.
            drop(unsafe { Box::from_raw(self.buf) });
            None
        }
    }

    /// Completed receive. Matching happens when the receive is posted, so
    /// callers post every send of a round before its receives.
    pub struct MpiRecv(Vec<u8>);

    impl Wait for MpiRecv {
        fn wait(self) -> Option<Vec<u8>> {
            Some(self.0)
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSend;
        type RecvHandle = MpiRecv;

        fn isend(&self, peer: Rank, tag: u16, buf: &[u8]) -> MpiSend {
            let leaked: &'static mut [u8] = Box::leak(buf.to_vec().into_boxed_slice());
            let ptr: *mut [u8] = leaked;
            // SAFETY: the buffer stays alive until `MpiSend::wait` reclaims it.
            let data: &'static [u8] = unsafe { &*ptr };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, data, tag as i32);
            MpiSend { req, buf: ptr }
        }

        fn irecv(&self, peer: Rank, tag: u16) -> MpiRecv {
            let (data, _status) = self
                .world
                .process_at_rank(peer as i32)
                .receive_vec_with_tag::<u8>(tag as i32);
            MpiRecv(data)
        }

        fn rank(&self) -> Rank {
            self.rank
        }
        fn size(&self) -> usize {
            self.size
        }
    }

}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
