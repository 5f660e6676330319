//! Action protocol between tubes and the fiber scheduler
//!
//! A tube finishes every processing step by returning a [`NextAction`] that
//! tells the scheduler what to do with the fiber next: descend into another
//! tube, flip the processing direction, or park the fiber until an external
//! event resumes it. Actions are produced by tubes and interpreted only by
//! the scheduler loop.

#![forbid(unsafe_code)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
use std::fmt;

use crate::fiber::Fault;
use crate::tube::TubeRef;

/// Discriminant of a [`NextAction`], for logging and dispatch assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Descend into another tube and receive its response.
    Invoke,
    /// Descend into another tube without receiving its response.
    InvokeAndForget,
    /// Flip direction and drive response processing.
    Return,
    /// Flip direction and drive exception processing.
    Throw,
    /// Park the fiber until resumed.
    Suspend,
}

/// What a tube wants the scheduler to do after the current step.
///
/// Each variant owns exactly the data the scheduler needs for it; consuming
/// the action transfers packet and fault ownership back to the fiber.
pub enum NextAction<P> {
    /// Invoke `next.process_request(packet)`, then invoke the current tube's
    /// `process_response` with the response packet on the way back.
    Invoke {
        /// The tube whose request processing runs next.
        next: TubeRef<P>,
        /// The request packet handed to it.
        packet: P,
    },
    /// Invoke `next.process_request(packet)`; the current tube does not want
    /// the response packet back. The tube is not recorded on the continuation
    /// stack, so it will not see `process_exception` on unwind either.
    InvokeAndForget {
        /// The tube whose request processing runs next.
        next: TubeRef<P>,
        /// The request packet handed to it.
        packet: P,
    },
    /// Flip the processing direction and start response processing.
    Return {
        /// The response packet.
        packet: P,
    },
    /// Flip the processing direction and start exception processing.
    Throw {
        /// The fault that starts unwinding the continuation stack.
        error: Fault,
    },
    /// Park the fiber. Once [`resume`](crate::Fiber::resume)d, execution
    /// picks up with response processing from the last scheduled
    /// continuation.
    Suspend,
}

impl<P> NextAction<P> {
    /// Next action: invoke the given tube and receive its response.
    pub fn invoke(next: TubeRef<P>, packet: P) -> Self {
        Self::Invoke { next, packet }
    }

    /// Next action: invoke the given tube, discarding its response.
    pub fn invoke_and_forget(next: TubeRef<P>, packet: P) -> Self {
        Self::InvokeAndForget { next, packet }
    }

    /// Next action: flip direction and return the given response packet.
    pub fn return_with(packet: P) -> Self {
        Self::Return { packet }
    }

    /// Next action: flip direction and start exception processing.
    pub fn throw(error: impl Into<Fault>) -> Self {
        Self::Throw {
            error: error.into(),
        }
    }

    /// Next action: suspend the fiber.
    pub fn suspend() -> Self {
        Self::Suspend
    }

    /// The action's discriminant.
    #[must_use]
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Invoke { .. } => ActionKind::Invoke,
            Self::InvokeAndForget { .. } => ActionKind::InvokeAndForget,
            Self::Return { .. } => ActionKind::Return,
            Self::Throw { .. } => ActionKind::Throw,
            Self::Suspend => ActionKind::Suspend,
        }
    }
}

impl<P> fmt::Debug for NextAction<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Throw { error } => f.debug_struct("Throw").field("error", &error.to_string()).finish(),
            other => write!(f, "{:?}", other.kind()),
        }
    }
}
