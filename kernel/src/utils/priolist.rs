//! A generic priority-ordered, FIFO-within-priority intrusive list.
//!
//! Both the per-core ready queue (§4.8) and every blocking primitive's wait
//! queue (§4.3) need the exact same ordering rule ("highest priority first;
//! ties broken by arrival order") over the exact same kind of storage: a
//! doubly-linked list threaded through fields living in the fixed task
//! arena, addressed by an integer id rather than a pointer (Design Notes §9).
//! Rather than duplicate the walk/splice logic in both `task.rs` and
//! `wait.rs`, it lives once here, generic over whichever arena type provides
//! the link fields through [`PriorityListOps`].
use crate::hal::Hal;
use crate::klock::{CpuLockToken, KCell};

/// Accessor trait implemented by whatever arena owns the linked items
/// (`task::TaskRegistry` for both ready queues and wait queues). Kept
/// separate from the arena's own type so this module doesn't need to know
/// about [`crate::task::TaskCb`].
pub trait PriorityListOps<H: Hal, Id: Copy + Eq> {
    fn priority_of(&self, id: Id, tok: &CpuLockToken<H>) -> u8;
    fn link_prev(&self, id: Id, tok: &CpuLockToken<H>) -> Option<Id>;
    fn set_link_prev(&self, id: Id, tok: &CpuLockToken<H>, v: Option<Id>);
    fn link_next(&self, id: Id, tok: &CpuLockToken<H>) -> Option<Id>;
    fn set_link_next(&self, id: Id, tok: &CpuLockToken<H>, v: Option<Id>);
}

/// The head/tail of a [`PriorityListOps`]-threaded list. Empty state is
/// `(None, None)`.
pub struct PriorityListHead<H: Hal, Id> {
    head: KCell<H, Option<Id>>,
    tail: KCell<H, Option<Id>>,
}

impl<H: Hal, Id: Copy + Eq> PriorityListHead<H, Id> {
    pub const fn new() -> Self {
        Self {
            head: KCell::new(None),
            tail: KCell::new(None),
        }
    }

    pub fn front(&self, tok: &CpuLockToken<H>) -> Option<Id> {
        self.head.read(tok).clone()
    }

    pub fn is_empty(&self, tok: &CpuLockToken<H>) -> bool {
        self.head.read(tok).is_none()
    }

    /// Inserts `id` keeping the list sorted by ascending numeric priority
    /// (0 = highest urgency, per §3), appended after any existing entries of
    /// equal priority (FIFO within a level, §4.3/§4.8).
    pub fn insert<A: PriorityListOps<H, Id>>(&self, arena: &A, tok: &CpuLockToken<H>, id: Id) {
        let prio = arena.priority_of(id, tok);
        arena.set_link_prev(id, tok, None);
        arena.set_link_next(id, tok, None);

        let mut cursor = self.head.read(tok).clone();
        while let Some(cur) = cursor {
            if arena.priority_of(cur, tok) > prio {
                break;
            }
            cursor = arena.link_next(cur, tok);
        }

        match cursor {
            Some(before) => {
                let prev = arena.link_prev(before, tok);
                arena.set_link_next(id, tok, Some(before));
                arena.set_link_prev(id, tok, prev);
                arena.set_link_prev(before, tok, Some(id));
                match prev {
                    Some(p) => arena.set_link_next(p, tok, Some(id)),
                    None => self.head.set(tok, Some(id)),
                }
            }
            None => {
                // Append at the tail.
                let old_tail = self.tail.read(tok).clone();
                arena.set_link_prev(id, tok, old_tail);
                match old_tail {
                    Some(t) => arena.set_link_next(t, tok, Some(id)),
                    None => self.head.set(tok, Some(id)),
                }
                self.tail.set(tok, Some(id));
            }
        }
    }

    /// Removes `id` from wherever it currently sits in the list. No-op if
    /// `id` is not linked (both neighbours `None` and it isn't the sole
    /// element); callers are expected to know whether `id` is a member.
    pub fn remove<A: PriorityListOps<H, Id>>(&self, arena: &A, tok: &CpuLockToken<H>, id: Id) {
        let prev = arena.link_prev(id, tok);
        let next = arena.link_next(id, tok);
        match prev {
            Some(p) => arena.set_link_next(p, tok, next),
            None => self.head.set(tok, next),
        }
        match next {
            Some(n) => arena.set_link_prev(n, tok, prev),
            None => self.tail.set(tok, prev),
        }
        arena.set_link_prev(id, tok, None);
        arena.set_link_next(id, tok, None);
    }

    pub fn pop_front<A: PriorityListOps<H, Id>>(&self, arena: &A, tok: &CpuLockToken<H>) -> Option<Id> {
        let id = self.front(tok)?;
        self.remove(arena, tok, id);
        Some(id)
    }

    pub fn iter<'a, A: PriorityListOps<H, Id>>(
        &'a self,
        arena: &'a A,
        tok: &'a CpuLockToken<H>,
    ) -> PriorityListIter<'a, H, Id, A> {
        PriorityListIter {
            arena,
            tok,
            cursor: self.front(tok),
        }
    }
}

pub struct PriorityListIter<'a, H: Hal, Id, A: PriorityListOps<H, Id>> {
    arena: &'a A,
    tok: &'a CpuLockToken<H>,
    cursor: Option<Id>,
}

impl<'a, H: Hal, Id: Copy + Eq, A: PriorityListOps<H, Id>> Iterator for PriorityListIter<'a, H, Id, A> {
    type Item = Id;
    fn next(&mut self) -> Option<Id> {
        let cur = self.cursor?;
        self.cursor = self.arena.link_next(cur, self.tok);
        Some(cur)
    }
}
