//! Continuation capture and materialization.

use std::sync::Arc;

use crate::do_ctrl::DoExpr;
use crate::frame::Frame;
use crate::handler::Handler;
use crate::ids::{ContinuationId, DispatchId, Marker};
use crate::segment::Segment;

/// Capturable continuation with a frozen frame snapshot.
///
/// Two states:
/// - **started = true** (captured): produced from a running segment via
///   [`Continuation::capture`]. Materializing clones the snapshot into a
///   fresh segment.
/// - **started = false** (unstarted): produced via [`Continuation::create`]
///   with a `(program, handlers)` pair; consuming it installs the handlers
///   outermost-first and starts the program.
///
/// Capture never mutates the source segment, and snapshots are immutable:
/// sharing a prefix between captures is allowed, re-use of one continuation
/// is not (the VM's consumed set enforces one-shot).
#[derive(Debug, Clone)]
pub struct Continuation {
    pub id: ContinuationId,
    pub frames_snapshot: Arc<Vec<Frame>>,
    pub scope_chain: Arc<Vec<Marker>>,
    pub marker: Marker,
    /// `Some(d)` iff this is the call-site continuation for dispatch `d`.
    pub dispatch_id: Option<DispatchId>,
    pub started: bool,
    /// Program to start when `started == false`.
    pub program: Option<Box<DoExpr>>,
    /// Handlers to install when `started == false`, outermost first.
    pub handlers: Vec<Handler>,
}

impl Continuation {
    pub fn capture(segment: &Segment, dispatch_id: Option<DispatchId>) -> Self {
        Continuation {
            id: ContinuationId::fresh(),
            frames_snapshot: Arc::new(segment.frames.clone()),
            scope_chain: Arc::new(segment.scope_chain.clone()),
            marker: segment.marker,
            dispatch_id,
            started: true,
            program: None,
            handlers: Vec::new(),
        }
    }

    pub fn create(program: DoExpr, handlers: Vec<Handler>) -> Self {
        Continuation {
            id: ContinuationId::fresh(),
            frames_snapshot: Arc::new(Vec::new()),
            scope_chain: Arc::new(Vec::new()),
            marker: Marker::placeholder(),
            dispatch_id: None,
            started: false,
            program: Some(Box::new(program)),
            handlers,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}
