//! C10: inter-core communication built on the hardware SIO-style FIFO —
//! a fixed-size message ring per target core, plus a barrier rendezvous.
//! Gated by the `multi_core` feature (§6's `ENABLE_MULTI_CORE`).
//!
//! Grounded in the same ring-buffer shape `crate::smp`'s `MigrationRing`
//! uses, parameterized over [`Message`] instead of a migration request.
//! `Hal::fifo_try_send`/`fifo_try_recv` carry only a wakeup hint (the
//! hardware FIFO is a single 32-bit lane, too narrow for a whole message);
//! the payload itself lives in this per-core ring, which both cores can
//! read since it's ordinary shared RAM guarded by the cross-core lock.
use crate::cfg::IPC_RING_LEN;
use crate::hal::{CoreId, Hal, RawFifoWord};
use crate::klock::{CpuLockToken, KCell};

/// A wakeup token pushed through the raw hardware FIFO lane to nudge the
/// other core into draining its ring; carries no payload of its own.
const FIFO_WAKE: RawFifoWord = RawFifoWord(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Wakeup,
    TaskReady,
    MigrationRequest,
    SyncBarrier,
    UserDefined,
}

#[derive(Debug, Clone, Copy)]
pub struct Message {
    pub kind: MsgKind,
    pub source_core: CoreId,
    pub data0: u32,
    pub data1: u32,
    pub timestamp_us: u64,
}

/// A bounded FIFO of messages addressed to one core. Indexed by the
/// *receiver*; `crate::Kernel::ipc_send` pushes into the target's ring,
/// `ipc_receive` pops from the caller's own.
struct MsgRing<H: Hal> {
    slots: [KCell<H, Option<Message>>; IPC_RING_LEN],
    head: KCell<H, usize>,
    len: KCell<H, usize>,
    dropped_count: KCell<H, u32>,
}

impl<H: Hal> MsgRing<H> {
    const fn new() -> Self {
        Self {
            slots: [const { KCell::new(None) }; IPC_RING_LEN],
            head: KCell::new(0),
            len: KCell::new(0),
            dropped_count: KCell::new(0),
        }
    }

    fn try_push(&self, tok: &CpuLockToken<H>, msg: Message) -> bool {
        let len = self.len.get(tok);
        if len == IPC_RING_LEN {
            *self.dropped_count.write(tok) += 1;
            return false;
        }
        let tail = (self.head.get(tok) + len) % IPC_RING_LEN;
        self.slots[tail].set(tok, Some(msg));
        self.len.set(tok, len + 1);
        true
    }

    fn pop(&self, tok: &CpuLockToken<H>) -> Option<Message> {
        if self.len.get(tok) == 0 {
            return None;
        }
        let head = self.head.get(tok);
        let msg = self.slots[head].replace(tok, None);
        self.head.set(tok, (head + 1) % IPC_RING_LEN);
        self.len.set(tok, self.len.get(tok) - 1);
        msg
    }
}

/// Barrier rendezvous state. One instance covers one rendezvous point;
/// `required_mask` names the cores that must arrive before anyone is
/// released (§4.10).
pub struct Barrier<H: Hal> {
    required_mask: KCell<H, u32>,
    arrived_mask: KCell<H, u32>,
}

impl<H: Hal> Barrier<H> {
    pub const fn new(required_mask: u32) -> Self {
        Self {
            required_mask: KCell::new(required_mask),
            arrived_mask: KCell::new(0),
        }
    }
}

/// Per-core message rings plus the set of barriers this kernel tracks.
/// Sized to [`crate::cfg::NUM_CORES`]; `rings[core.index()]` is the ring
/// *targeting* `core`.
pub struct IpcState<H: Hal> {
    rings: [MsgRing<H>; crate::cfg::NUM_CORES],
}

impl<H: Hal> IpcState<H> {
    pub const fn new() -> Self {
        Self {
            rings: [const { MsgRing::new() }; crate::cfg::NUM_CORES],
        }
    }
}

impl<H: Hal> crate::Kernel<H> {
    /// Sends `msg` (kind/data filled in by the caller; `source_core` and
    /// `timestamp_us` are stamped here) to `target`'s ring. On a full ring,
    /// either drops immediately (`timeout_ms == TIMEOUT_IMMEDIATE`) or
    /// spins with a brief critical-section release between attempts until
    /// `timeout_ms` elapses (§4.10's "drops, or retries until timeout").
    /// Always nudges the hardware FIFO so the target notices even if it
    /// isn't actively polling.
    pub fn ipc_send(&'static self, target: CoreId, kind: MsgKind, data0: u32, data1: u32, timeout_ms: u32) -> bool {
        let deadline_us = if timeout_ms == crate::timeout::TIMEOUT_INFINITE {
            None
        } else {
            Some(H::now_us() + timeout_ms as u64 * 1000)
        };
        loop {
            let guard = crate::klock::lock_cpu::<H>();
            let tok = guard.token();
            let msg = Message {
                kind,
                source_core: H::current_core(),
                data0,
                data1,
                timestamp_us: H::now_us(),
            };
            let pushed = self.ipc.rings[target.index()].try_push(tok, msg);
            drop(guard);
            if pushed {
                H::fifo_try_send(FIFO_WAKE);
                return true;
            }
            match deadline_us {
                None => return false,
                Some(d) if H::now_us() >= d => return false,
                Some(_) => self.yield_now(),
            }
        }
    }

    /// Pops the next message addressed to this core, blocking up to
    /// `timeout_ms` (spin-with-yield; the hardware FIFO wakeup is a hint,
    /// not a synchronous notification this kernel turns into a wait-queue
    /// wait, since an inter-core message can arrive from an ISR context
    /// with no task to enroll).
    pub fn ipc_receive(&'static self, timeout_ms: u32) -> Option<Message> {
        let deadline_us = if timeout_ms == crate::timeout::TIMEOUT_INFINITE {
            None
        } else {
            Some(H::now_us() + timeout_ms as u64 * 1000)
        };
        loop {
            let guard = crate::klock::lock_cpu::<H>();
            let tok = guard.token();
            let core = H::current_core();
            let msg = self.ipc.rings[core.index()].pop(tok);
            drop(guard);
            if msg.is_some() {
                return msg;
            }
            if timeout_ms == crate::timeout::TIMEOUT_IMMEDIATE {
                return None;
            }
            while let Some(word) = H::fifo_try_recv() {
                let _ = word;
            }
            match deadline_us {
                Some(d) if H::now_us() >= d => return None,
                _ => self.yield_now(),
            }
        }
    }

    /// Marks this core arrived at `barrier`. If this is the last required
    /// core, clears the mask and broadcasts a `SyncBarrier` message to
    /// every other required core to release them. Otherwise spins with
    /// periodic yield until released, or until `timeout_ms` elapses, in
    /// which case it removes its own arrival bit and returns `false`
    /// (§4.10).
    pub fn barrier_wait(&'static self, barrier: &Barrier<H>, timeout_ms: u32) -> bool {
        let core = H::current_core();
        let bit = 1u32 << core.index();
        let deadline_us = if timeout_ms == crate::timeout::TIMEOUT_INFINITE {
            None
        } else {
            Some(H::now_us() + timeout_ms as u64 * 1000)
        };

        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let required = barrier.required_mask.get(tok);
        let arrived = barrier.arrived_mask.get(tok) | bit;
        barrier.arrived_mask.set(tok, arrived);
        let released = arrived & required == required;
        if released {
            barrier.arrived_mask.set(tok, 0);
        }
        drop(guard);

        if released {
            for target_idx in 0..crate::cfg::NUM_CORES {
                let target = CoreId::from_index(target_idx);
                if target != core && required & (1 << target_idx) != 0 {
                    self.ipc_send(target, MsgKind::SyncBarrier, 0, 0, crate::timeout::TIMEOUT_IMMEDIATE);
                }
            }
            return true;
        }

        loop {
            let guard = crate::klock::lock_cpu::<H>();
            let tok = guard.token();
            let still_waiting = barrier.arrived_mask.get(tok) & bit != 0;
            drop(guard);
            if !still_waiting {
                return true;
            }
            match deadline_us {
                Some(d) if H::now_us() >= d => {
                    let guard = crate::klock::lock_cpu::<H>();
                    let tok = guard.token();
                    *barrier.arrived_mask.write(tok) &= !bit;
                    return false;
                }
                _ => self.yield_now(),
            }
        }
    }
}
