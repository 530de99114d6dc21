//! C4-adjacent (per SPEC_FULL.md's message-passing module): fixed-capacity
//! message queues, each message a single `u32` payload word — wide enough
//! to carry a pointer, a small struct's handle, or a packed event, matching
//! the "one word per slot" shape `r3_kernel`'s own data queue uses at the
//! primitive layer, with framing left to the caller.
//!
//! Two wait queues per object (send side blocks on "full", receive side on
//! "empty"), both built on the shared [`crate::wait::WaitQueue`].
use crate::cfg::MAX_QUEUES;
use crate::error::{KernelError, ParameterError, ResourceError};
use crate::hal::Hal;
use crate::klock::{CpuLockToken, KCell};
use crate::task::BlockReason;
use crate::timeout::{TIMEOUT_IMMEDIATE, TIMEOUT_INFINITE};
use crate::wait::WaitQueue;

/// Largest ring buffer a single queue can be created with.
pub const MAX_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueHandle(u16);

struct QueueCb<H: Hal> {
    in_use: KCell<H, bool>,
    buf: KCell<H, [u32; MAX_QUEUE_CAPACITY]>,
    capacity: KCell<H, usize>,
    head: KCell<H, usize>,
    len: KCell<H, usize>,
    not_empty: WaitQueue<H>,
    not_full: WaitQueue<H>,
}

impl<H: Hal> QueueCb<H> {
    const fn vacant() -> Self {
        Self {
            in_use: KCell::new(false),
            buf: KCell::new([0; MAX_QUEUE_CAPACITY]),
            capacity: KCell::new(0),
            head: KCell::new(0),
            len: KCell::new(0),
            not_empty: WaitQueue::new(),
            not_full: WaitQueue::new(),
        }
    }
}

pub struct QueuePool<H: Hal> {
    slots: [QueueCb<H>; MAX_QUEUES],
}

impl<H: Hal> QueuePool<H> {
    pub const fn new() -> Self {
        Self {
            slots: [const { QueueCb::vacant() }; MAX_QUEUES],
        }
    }
}

impl<H: Hal> crate::Kernel<H> {
    pub fn queue_create(&self, capacity: usize) -> Result<QueueHandle, KernelError> {
        if capacity == 0 || capacity > MAX_QUEUE_CAPACITY {
            return Err(ParameterError::BadBlockSize.into());
        }
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let idx = self
            .queues
            .slots
            .iter()
            .position(|q| !q.in_use.get(tok))
            .ok_or(KernelError::from(ResourceError::NoFreeObjectSlot))?;
        let q = &self.queues.slots[idx];
        q.in_use.set(tok, true);
        q.capacity.set(tok, capacity);
        q.head.set(tok, 0);
        q.len.set(tok, 0);
        Ok(QueueHandle(idx as u16))
    }

    pub fn queue_delete(&self, handle: QueueHandle) -> Result<(), KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let q = self.queue(tok, handle)?;
        q.in_use.set(tok, false);
        Ok(())
    }

    /// Enqueues `msg` at the tail, blocking up to `timeout_ms` while full.
    pub fn queue_send(&'static self, handle: QueueHandle, msg: u32, timeout_ms: u32) -> Result<(), KernelError> {
        loop {
            let guard = crate::klock::lock_cpu::<H>();
            let tok = guard.token();
            let idx = self.queue_index(tok, handle)?;
            let q = &self.queues.slots[idx];
            let cap = q.capacity.get(tok);
            let len = q.len.get(tok);
            if len < cap {
                let head = q.head.get(tok);
                let tail = (head + len) % cap;
                q.buf.write(tok)[tail] = msg;
                q.len.set(tok, len + 1);
                self.wake_one(tok, &q.not_empty, Ok(()));
                return Ok(());
            }
            if timeout_ms == TIMEOUT_IMMEDIATE {
                return Err(ResourceError::QueueFull.into());
            }

            let core = H::current_core();
            let caller = self
                .core(core)
                .running
                .get(tok)
                .expect("queue_send called with no running task");
            if timeout_ms != TIMEOUT_INFINITE {
                self.timeout_arm(tok, caller, timeout_ms, None);
            }
            self.block_on(tok, &q.not_full, BlockReason::Queue);
            drop(guard);
            self.check_preemption(core);

            let guard2 = crate::klock::lock_cpu::<H>();
            let tok2 = guard2.token();
            self.tasks.get(caller).wait_result(tok2)?;
            // Woken because a slot opened up; loop around to actually claim
            // it (another sender may have raced us to it).
        }
    }

    /// Dequeues the head message, blocking up to `timeout_ms` while empty.
    pub fn queue_receive(&'static self, handle: QueueHandle, timeout_ms: u32) -> Result<u32, KernelError> {
        loop {
            let guard = crate::klock::lock_cpu::<H>();
            let tok = guard.token();
            let idx = self.queue_index(tok, handle)?;
            let q = &self.queues.slots[idx];
            let len = q.len.get(tok);
            if len > 0 {
                let head = q.head.get(tok);
                let msg = q.buf.read(tok)[head];
                q.head.set(tok, (head + 1) % q.capacity.get(tok));
                q.len.set(tok, len - 1);
                self.wake_one(tok, &q.not_full, Ok(()));
                return Ok(msg);
            }
            if timeout_ms == TIMEOUT_IMMEDIATE {
                return Err(crate::error::TimingError::TimedOut.into());
            }

            let core = H::current_core();
            let caller = self
                .core(core)
                .running
                .get(tok)
                .expect("queue_receive called with no running task");
            if timeout_ms != TIMEOUT_INFINITE {
                self.timeout_arm(tok, caller, timeout_ms, None);
            }
            self.block_on(tok, &q.not_empty, BlockReason::Queue);
            drop(guard);
            self.check_preemption(core);

            let guard2 = crate::klock::lock_cpu::<H>();
            let tok2 = guard2.token();
            self.tasks.get(caller).wait_result(tok2)?;
        }
    }

    pub fn queue_len(&self, handle: QueueHandle) -> Result<usize, KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        Ok(self.queue(tok, handle)?.len.get(tok))
    }

    fn queue_index(&self, tok: &CpuLockToken<H>, handle: QueueHandle) -> Result<usize, KernelError> {
        let idx = handle.0 as usize;
        if self.queues.slots[idx].in_use.get(tok) {
            Ok(idx)
        } else {
            Err(ParameterError::UnknownObjectId.into())
        }
    }

    fn queue(&self, tok: &CpuLockToken<H>, handle: QueueHandle) -> Result<&QueueCb<H>, KernelError> {
        let idx = self.queue_index(tok, handle)?;
        Ok(&self.queues.slots[idx])
    }
}
