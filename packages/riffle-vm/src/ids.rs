//! Core identifier types for the VM.
//!
//! All IDs are lightweight Copy types using the newtype pattern for type
//! safety. Markers and continuation ids are never recycled for the life of
//! the process; they participate in equality checks across captured state.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Unique identifier for prompts/handlers.
///
/// A Marker identifies a handler installation point (prompt) in the
/// continuation stack. Each `WithHandler` creates a fresh Marker.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Marker(pub u64);

/// Unique identifier for segments (arena index).
///
/// Segments are stored in a Vec and referenced by index; indices may be
/// recycled through the arena free list because segment consumers are scoped.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SegmentId(pub u32);

/// Unique identifier for continuations (one-shot tracking).
///
/// Each captured continuation gets a unique ContinuationId to enforce
/// one-shot semantics.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ContinuationId(pub u64);

/// Unique identifier for dispatches.
///
/// Tracks the lifecycle of an effect dispatch through the handler chain.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DispatchId(pub u64);

/// Unique identifier for callbacks stored in the VM's callback table.
///
/// Callbacks are stored separately from Frames to allow Frame to be Clone.
/// The callback is consumed when executed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CallbackId(pub u32);

/// Unique identifier for spawned tasks.
///
/// Tasks are managed by the scheduler which maintains its own counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TaskId(pub u64);

/// Unique identifier for promises.
///
/// Promises are managed by the scheduler which maintains its own counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PromiseId(pub u64);

// Global counters for ID generation
static MARKER_COUNTER: AtomicU64 = AtomicU64::new(1);
static CONTINUATION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static DISPATCH_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static CALLBACK_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

impl Marker {
    /// Create a fresh unique Marker.
    pub fn fresh() -> Self {
        Marker(MARKER_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Reserved placeholder marker for unstarted continuations.
    pub fn placeholder() -> Self {
        Marker(0)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl ContinuationId {
    /// Create a fresh unique ContinuationId.
    pub fn fresh() -> Self {
        ContinuationId(CONTINUATION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl DispatchId {
    /// Create a fresh unique DispatchId.
    pub fn fresh() -> Self {
        DispatchId(DISPATCH_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl SegmentId {
    pub fn from_index(index: usize) -> Self {
        SegmentId(index as u32)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl CallbackId {
    pub fn fresh() -> Self {
        CallbackId(CALLBACK_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl TaskId {
    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn from_raw(value: u64) -> Self {
        TaskId(value)
    }
}

impl PromiseId {
    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn from_raw(value: u64) -> Self {
        PromiseId(value)
    }
}
