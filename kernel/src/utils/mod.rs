//! Small, dependency-free data-structure helpers shared by several
//! subsystems. Grounded in `r3_kernel::utils`, but index-based rather than
//! pointer-based throughout: every intrusive list here threads through a
//! fixed task arena addressed by [`crate::task::TaskId`], per Design Notes
//! §9 ("a dense task arena indexed by task handle... timeouts carry an
//! integer back-reference, never a pointer that could dangle").

pub mod priolist;
pub mod prio_bitmap;
