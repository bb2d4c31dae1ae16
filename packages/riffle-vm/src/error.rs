//! Error types for the VM.

use thiserror::Error;

use crate::driver::VmException;
use crate::effect::Effect;
use crate::ids::{ContinuationId, Marker};

#[derive(Debug, Clone, Error)]
pub enum VMError {
    #[error("one-shot violation: continuation {} already consumed", .continuation_id.raw())]
    OneShotViolation { continuation_id: ContinuationId },

    #[error("unhandled effect: {}", .effect.type_name())]
    UnhandledEffect { effect: Effect },

    #[error("{operation} on unstarted continuation {}", .continuation_id.raw())]
    UnstartedMisuse {
        operation: &'static str,
        continuation_id: ContinuationId,
    },

    #[error("type error: {message}")]
    TypeError { message: String },

    #[error("{primitive} called outside of dispatch context")]
    DispatchContextMissing { primitive: &'static str },

    #[error("handler not found for marker {}", .marker.raw())]
    HandlerNotFound { marker: Marker },

    #[error("invalid segment: {message}")]
    InvalidSegment { message: String },

    #[error("internal error: {message}")]
    InternalError { message: String },

    #[error("uncaught exception: {}", .exception.message())]
    UncaughtException { exception: VmException },
}

impl VMError {
    pub fn one_shot_violation(continuation_id: ContinuationId) -> Self {
        VMError::OneShotViolation { continuation_id }
    }

    pub fn unhandled_effect(effect: Effect) -> Self {
        VMError::UnhandledEffect { effect }
    }

    pub fn unstarted_misuse(operation: &'static str, continuation_id: ContinuationId) -> Self {
        VMError::UnstartedMisuse {
            operation,
            continuation_id,
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        VMError::TypeError {
            message: message.into(),
        }
    }

    pub fn dispatch_context_missing(primitive: &'static str) -> Self {
        VMError::DispatchContextMissing { primitive }
    }

    pub fn handler_not_found(marker: Marker) -> Self {
        VMError::HandlerNotFound { marker }
    }

    pub fn invalid_segment(message: impl Into<String>) -> Self {
        VMError::InvalidSegment {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        VMError::InternalError {
            message: message.into(),
        }
    }

    pub fn uncaught_exception(exception: VmException) -> Self {
        VMError::UncaughtException { exception }
    }
}
