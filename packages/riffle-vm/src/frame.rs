//! Frame types for the continuation stack.

use crate::handler::HandlerProgramRef;
use crate::ids::CallbackId;
use crate::program::CoroutineRef;

/// Metadata about a program call, for call-stack reconstruction.
///
/// Attached to host-coroutine frames when the call went through the
/// kleisli-call macro, so `GetCallStack` works without host cooperation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMetadata {
    pub function_name: String,
    pub source_file: String,
    pub source_line: u32,
}

impl CallMetadata {
    pub fn new(
        function_name: impl Into<String>,
        source_file: impl Into<String>,
        source_line: u32,
    ) -> Self {
        CallMetadata {
            function_name: function_name.into(),
            source_file: source_file.into(),
            source_line,
        }
    }
}

/// A frame in the continuation stack.
///
/// Frames must be Clone to allow continuation capture (Arc snapshots).
/// Native callbacks are stored in a separate table and referenced by
/// CallbackId so the frame itself stays cloneable.
#[derive(Debug, Clone)]
pub enum Frame {
    /// One-shot engine callback; consumes the delivered value and produces
    /// the next mode.
    NativeReturn { cb: CallbackId },
    /// A native handler program instance (generator-like, stepped in-engine
    /// with store access).
    NativeProgram { program: HandlerProgramRef },
    /// An opaque host coroutine, stepped by the driver.
    HostCoroutine {
        coroutine: CoroutineRef,
        started: bool,
        metadata: Option<CallMetadata>,
    },
}

impl Frame {
    pub fn native_return(cb: CallbackId) -> Self {
        Frame::NativeReturn { cb }
    }

    pub fn native_program(program: HandlerProgramRef) -> Self {
        Frame::NativeProgram { program }
    }

    pub fn host_coroutine(coroutine: CoroutineRef, metadata: Option<CallMetadata>) -> Self {
        Frame::HostCoroutine {
            coroutine,
            started: false,
            metadata,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(
            self,
            Frame::NativeReturn { .. } | Frame::NativeProgram { .. }
        )
    }

    pub fn is_host_coroutine(&self) -> bool {
        matches!(self, Frame::HostCoroutine { .. })
    }

    pub fn metadata(&self) -> Option<&CallMetadata> {
        match self {
            Frame::HostCoroutine { metadata, .. } => metadata.as_ref(),
            _ => None,
        }
    }
}
