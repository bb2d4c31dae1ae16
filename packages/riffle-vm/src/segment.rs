//! Segment types for delimited continuations.

use crate::frame::Frame;
use crate::ids::{Marker, SegmentId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentKind {
    Normal,
    /// Boundary installed by `WithHandler`; the handler returns here, never
    /// directly to user code.
    PromptBoundary { handled_marker: Marker },
}

/// A delimited-continuation frame.
///
/// The scope chain is the evidence vector captured at segment creation,
/// innermost marker first. It is fixed for the segment's lifetime.
#[derive(Debug)]
pub struct Segment {
    pub marker: Marker,
    /// Top of stack = last element; O(1) push/pop.
    pub frames: Vec<Frame>,
    /// Where to return when frames are exhausted. `None` means terminal.
    pub caller: Option<SegmentId>,
    pub scope_chain: Vec<Marker>,
    pub kind: SegmentKind,
}

impl Segment {
    pub fn new(marker: Marker, caller: Option<SegmentId>, scope_chain: Vec<Marker>) -> Self {
        Segment {
            marker,
            frames: Vec::new(),
            caller,
            scope_chain,
            kind: SegmentKind::Normal,
        }
    }

    pub fn new_prompt(
        marker: Marker,
        caller: Option<SegmentId>,
        scope_chain: Vec<Marker>,
        handled_marker: Marker,
    ) -> Self {
        Segment {
            marker,
            frames: Vec::new(),
            caller,
            scope_chain,
            kind: SegmentKind::PromptBoundary { handled_marker },
        }
    }

    pub fn push_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn pop_frame(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn has_frames(&self) -> bool {
        !self.frames.is_empty()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn is_prompt_boundary(&self) -> bool {
        matches!(self.kind, SegmentKind::PromptBoundary { .. })
    }

    pub fn handled_marker(&self) -> Option<Marker> {
        match &self.kind {
            SegmentKind::PromptBoundary { handled_marker } => Some(*handled_marker),
            SegmentKind::Normal => None,
        }
    }
}
