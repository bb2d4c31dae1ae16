//! Pooled segment storage.
//!
//! Slots form an intrusive free list: a freed slot stores the index of the
//! next free slot, so reuse needs no side table and a stale id can never
//! read another segment's leftovers (freeing scrubs the slot). A segment
//! must not be freed while a live segment still names it as caller; debug
//! builds assert this.

use crate::ids::SegmentId;
use crate::segment::Segment;

enum Slot {
    Live(Segment),
    Free { next_free: Option<SegmentId> },
}

pub struct SegmentArena {
    slots: Vec<Slot>,
    free_head: Option<SegmentId>,
    live: usize,
}

impl SegmentArena {
    pub fn new() -> Self {
        SegmentArena {
            slots: Vec::new(),
            free_head: None,
            live: 0,
        }
    }

    pub fn alloc(&mut self, segment: Segment) -> SegmentId {
        self.live += 1;
        match self.free_head {
            Some(id) => {
                let slot = &mut self.slots[id.index()];
                let next = match slot {
                    Slot::Free { next_free } => *next_free,
                    Slot::Live(_) => unreachable!("free head points at a live slot"),
                };
                self.free_head = next;
                *slot = Slot::Live(segment);
                id
            }
            None => {
                let id = SegmentId::from_index(self.slots.len());
                self.slots.push(Slot::Live(segment));
                id
            }
        }
    }

    /// Scrub a slot and thread it onto the free list.
    ///
    /// Freeing an unknown or already-free id is a no-op, so callers may
    /// release segments without tracking which ones were recycled earlier.
    pub fn free(&mut self, id: SegmentId) {
        let Some(slot) = self.slots.get_mut(id.index()) else {
            return;
        };
        if matches!(slot, Slot::Free { .. }) {
            return;
        }
        *slot = Slot::Free {
            next_free: self.free_head,
        };
        self.free_head = Some(id);
        self.live -= 1;

        debug_assert!(
            self.iter().all(|(_, segment)| segment.caller != Some(id)),
            "freed segment {id:?} is still the caller of a live segment"
        );
    }

    pub fn get(&self, id: SegmentId) -> Option<&Segment> {
        match self.slots.get(id.index()) {
            Some(Slot::Live(segment)) => Some(segment),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: SegmentId) -> Option<&mut Segment> {
        match self.slots.get_mut(id.index()) {
            Some(Slot::Live(segment)) => Some(segment),
            _ => None,
        }
    }

    pub fn is_live(&self, id: SegmentId) -> bool {
        matches!(self.slots.get(id.index()), Some(Slot::Live(_)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (SegmentId, &Segment)> {
        self.slots.iter().enumerate().filter_map(|(idx, slot)| match slot {
            Slot::Live(segment) => Some((SegmentId::from_index(idx), segment)),
            Slot::Free { .. } => None,
        })
    }

    /// Number of live segments.
    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Total slots in the pool, live or free.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

impl Default for SegmentArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Marker;
    use proptest::prelude::*;

    fn seg() -> Segment {
        Segment::new(Marker::fresh(), None, vec![])
    }

    #[test]
    fn test_arena_alloc_and_get() {
        let mut arena = SegmentArena::new();

        let marker1 = Marker::fresh();
        let id1 = arena.alloc(Segment::new(marker1, None, vec![]));
        let id2 = arena.alloc(seg());

        assert_ne!(id1, id2);
        assert_eq!(arena.live_count(), 2);
        assert!(arena.is_live(id1));
        assert_eq!(arena.get(id1).unwrap().marker, marker1);
    }

    #[test]
    fn test_arena_free_scrubs_and_reuses_slot() {
        let mut arena = SegmentArena::new();
        let id1 = arena.alloc(seg());

        arena.free(id1);
        assert_eq!(arena.live_count(), 0);
        assert!(!arena.is_live(id1));
        assert!(arena.get(id1).is_none());

        let marker2 = Marker::fresh();
        let id2 = arena.alloc(Segment::new(marker2, None, vec![]));

        assert_eq!(id1, id2);
        assert_eq!(arena.slot_count(), 1);
        assert_eq!(arena.get(id2).unwrap().marker, marker2);
    }

    #[test]
    fn test_arena_free_list_is_lifo() {
        let mut arena = SegmentArena::new();
        let a = arena.alloc(seg());
        let b = arena.alloc(seg());

        arena.free(a);
        arena.free(b);

        // Most recently freed slot is reused first.
        assert_eq!(arena.alloc(seg()), b);
        assert_eq!(arena.alloc(seg()), a);
        assert_eq!(arena.slot_count(), 2);
    }

    #[test]
    fn test_arena_double_free_is_ignored() {
        let mut arena = SegmentArena::new();
        let id = arena.alloc(seg());

        arena.free(id);
        arena.free(id);
        arena.free(SegmentId::from_index(999));

        let a = arena.alloc(seg());
        let b = arena.alloc(seg());
        assert_ne!(a, b);
        assert_eq!(arena.live_count(), 2);
    }

    #[test]
    fn test_arena_get_mut() {
        let mut arena = SegmentArena::new();
        let id = arena.alloc(seg());

        {
            use crate::frame::Frame;
            use crate::ids::CallbackId;
            let seg_mut = arena.get_mut(id).unwrap();
            seg_mut.push_frame(Frame::native_return(CallbackId::fresh()));
        }

        assert_eq!(arena.get(id).unwrap().frame_count(), 1);
    }

    #[test]
    fn test_arena_iter_skips_free_slots() {
        let mut arena = SegmentArena::new();
        let a = arena.alloc(seg());
        let b = arena.alloc(seg());
        arena.free(a);

        let live: Vec<SegmentId> = arena.iter().map(|(id, _)| id).collect();
        assert_eq!(live, vec![b]);
    }

    proptest! {
        /// Alloc/free interleavings never hand out a live slot twice, and
        /// the live count tracks exactly the outstanding ids.
        #[test]
        fn prop_arena_never_aliases_live_slots(ops in proptest::collection::vec(0u8..3, 1..64)) {
            let mut arena = SegmentArena::new();
            let mut outstanding: Vec<SegmentId> = Vec::new();

            for op in ops {
                match op {
                    0 | 1 => {
                        let id = arena.alloc(seg());
                        prop_assert!(!outstanding.contains(&id));
                        outstanding.push(id);
                    }
                    _ => {
                        if let Some(id) = outstanding.pop() {
                            arena.free(id);
                            prop_assert!(!arena.is_live(id));
                        }
                    }
                }
            }
            prop_assert_eq!(arena.live_count(), outstanding.len());
            prop_assert!(outstanding.iter().all(|&id| arena.is_live(id)));
        }
    }
}
