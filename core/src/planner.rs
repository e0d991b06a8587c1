//! Liveness-interval layout planner for the activations arena.
//!
//! Each activation tensor is live over `[first, last]`, counted in chain
//! positions: `first` is the node that produces it (0 for the network input),
//! `last` the last node that reads it (one past the terminal node for the
//! network output). Tensors whose intervals intersect get disjoint bytes;
//! everything else may share.
//!
//! Placement is first-fit in largest-first order. It runs once, when the
//! graph is built, never during inference.

use crate::arena::{align_up, ARENA_ALIGN};

/// Inclusive range of chain positions during which a tensor is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveInterval {
    pub first: usize,
    pub last: usize,
}

impl LiveInterval {
    pub const fn new(first: usize, last: usize) -> Self {
        Self { first, last }
    }

    pub const fn at(step: usize) -> Self {
        Self::new(step, step)
    }

    pub const fn overlaps(&self, other: &LiveInterval) -> bool {
        !(self.last < other.first || other.last < self.first)
    }

    /// Stretch to also cover `step`.
    pub fn extend_to(&mut self, step: usize) {
        self.first = self.first.min(step);
        self.last = self.last.max(step);
    }
}

/// One tensor to place: its size, its lifetime, and (after planning) its offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanRequest {
    pub size: usize,
    pub live: LiveInterval,
    pub offset: usize,
}

impl PlanRequest {
    pub const fn new(size: usize, live: LiveInterval) -> Self {
        Self { size, live, offset: 0 }
    }

    /// A request that already has its offset, for checking a finished layout.
    pub const fn placed(offset: usize, size: usize, live: LiveInterval) -> Self {
        Self { size, live, offset }
    }

    const fn end(&self) -> usize {
        self.offset + self.size
    }

    /// Both alive at once and sharing at least one byte.
    pub const fn conflicts(&self, other: &PlanRequest) -> bool {
        self.size != 0
            && other.size != 0
            && self.live.overlaps(&other.live)
            && self.offset < other.end()
            && other.offset < self.end()
    }
}

/// Assign an offset to every request; returns the arena size needed.
///
/// `order` is caller-provided scratch of at least `requests.len()` entries,
/// so planning needs no allocation.
pub fn plan_offsets(requests: &mut [PlanRequest], order: &mut [usize]) -> usize {
    let count = requests.len();
    let order = &mut order[..count];
    for (i, slot) in order.iter_mut().enumerate() {
        *slot = i;
    }
    // Largest first; longer lifetime first among equals; stable on index.
    order.sort_unstable_by(|&a, &b| {
        let (ra, rb) = (&requests[a], &requests[b]);
        let span_a = ra.live.last - ra.live.first;
        let span_b = rb.live.last - rb.live.first;
        rb.size
            .cmp(&ra.size)
            .then(span_b.cmp(&span_a))
            .then(a.cmp(&b))
    });

    let mut total = 0;
    for placed in 0..count {
        let current = order[placed];
        let mut candidate = requests[current];
        candidate.offset = 0;

        // Bump past every conflicting neighbour until none is left.
        loop {
            let mut moved = false;
            for &other in &order[..placed] {
                let other = &requests[other];
                if candidate.conflicts(other) {
                    candidate.offset = align_up(other.end(), ARENA_ALIGN);
                    moved = true;
                }
            }
            if !moved {
                break;
            }
        }

        requests[current].offset = candidate.offset;
        total = total.max(candidate.end());
    }
    align_up(total, ARENA_ALIGN)
}

/// Indices of the first conflicting pair, if any.
pub fn find_conflict(requests: &[PlanRequest]) -> Option<(usize, usize)> {
    for (i, a) in requests.iter().enumerate() {
        for (j, b) in requests.iter().enumerate().skip(i + 1) {
            if a.conflicts(b) {
                return Some((i, j));
            }
        }
    }
    None
}
