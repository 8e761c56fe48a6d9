//! The process-global message pool.
//!
//! Recycled records form a free list threaded through their own `next`
//! links, capped at [`MAX_POOL_SIZE`]. Beyond the cap, recycled records
//! are simply dropped for the allocator to reclaim.

use crate::message::Message;
use crate::sync::Mutex;

const MAX_POOL_SIZE: usize = 50;

struct Pool {
    free: Option<Box<Message>>,
    size: usize,
    reused: u64,
    allocated: u64,
    recycled: u64,
    dropped: u64,
}

static POOL: Mutex<Pool> = Mutex::new(Pool {
    free: None,
    size: 0,
    reused: 0,
    allocated: 0,
    recycled: 0,
    dropped: 0,
});

/// Usage counters for the global message pool.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Records currently parked in the free list.
    pub pooled: usize,
    /// Obtain calls satisfied from the free list.
    pub reused: u64,
    /// Obtain calls that had to allocate a fresh record.
    pub allocated: u64,
    /// Records accepted back into the free list.
    pub recycled: u64,
    /// Records dropped because the free list was full.
    pub dropped: u64,
}

/// Snapshot of the pool counters.
pub fn pool_stats() -> PoolStats {
    let pool = POOL.lock();
    PoolStats {
        pooled: pool.size,
        reused: pool.reused,
        allocated: pool.allocated,
        recycled: pool.recycled,
        dropped: pool.dropped,
    }
}

pub(crate) fn obtain() -> Box<Message> {
    {
        let mut pool = POOL.lock();
        if let Some(mut msg) = pool.free.take() {
            pool.free = msg.next.take();
            pool.size -= 1;
            pool.reused += 1;
            // Pooled records keep the in-use mark; it falls away here.
            msg.flags = 0;
            return msg;
        }
        pool.allocated += 1;
    }
    Box::new(Message::new())
}

/// Clears `msg` and parks it in the free list if there is room.
///
/// This is the unchecked path used after dispatch and by queue-internal
/// removal; callers outside the runtime go through [`Message::recycle`],
/// which refuses in-use records.
pub(crate) fn recycle(mut msg: Box<Message>) {
    msg.clear();
    let mut pool = POOL.lock();
    if pool.size < MAX_POOL_SIZE {
        msg.next = pool.free.take();
        pool.free = Some(msg);
        pool.size += 1;
        pool.recycled += 1;
    } else {
        pool.dropped += 1;
    }
}
