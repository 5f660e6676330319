//! Tube contract for pipeline stages
//!
//! A tube is one stage of a tubeline: it acts on a request packet on the way
//! in, on the response packet on the way out, and on a fault while the
//! continuation stack unwinds. Stages hold their own per-stage state and are
//! non-reentrant; concurrent use of a tubeline requires cloning it first
//! (see [`TubeCloner`]).

#![forbid(unsafe_code)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
use std::sync::Arc;

use parking_lot::Mutex;

use crate::action::NextAction;
use crate::cloner::TubeCloner;
use crate::fiber::Fault;

/// Shared handle to a pipeline stage.
///
/// The mutex enforces the non-reentrancy contract: the scheduler holds the
/// lock for exactly one processing step, and a cloning episode holds it
/// while the stage's copy constructor runs.
pub type TubeRef<P> = Arc<Mutex<dyn Tube<P>>>;

/// Wraps a stage implementation into a shareable [`TubeRef`].
pub fn tube<P: 'static, T: Tube<P> + 'static>(stage: T) -> TubeRef<P> {
    Arc::new(Mutex::new(stage))
}

/// One stage of a tubeline.
///
/// All three processing methods are infallible at the interface: a stage
/// reports failure by returning a [`NextAction::Throw`], never by an error
/// return. A panic escaping a processing method is caught by the scheduler
/// and treated exactly like a returned `Throw`.
pub trait Tube<P>: Send {
    /// Acts on a request packet and performs some protocol specific
    /// operation, then directs the scheduler with the returned action.
    fn process_request(&mut self, request: P) -> NextAction<P>;

    /// Acts on a response packet on the way back out.
    ///
    /// Once `process_request` has produced an [`NextAction::Invoke`], this
    /// method is always invoked with the response before this stage
    /// processes another request.
    fn process_response(&mut self, response: P) -> NextAction<P>;

    /// Acts on a fault while the continuation stack unwinds.
    ///
    /// Returning [`NextAction::Throw`] continues unwinding; returning
    /// `Return` or `Invoke` converts the fault back into normal response
    /// processing.
    fn process_exception(&mut self, error: Fault) -> NextAction<P>;

    /// Invoked before the last copy of the tubeline is discarded, to give
    /// stages a chance to release resources. When multiple copies of a
    /// tubeline exist this is called on only one of them.
    fn pre_destroy(&mut self) {}

    /// Creates an isomorphic copy of this stage for concurrent use.
    ///
    /// `origin` is the handle this stage is reachable through. The
    /// implementation must call [`TubeCloner::add`] with `origin` and the
    /// fresh copy *before* copying any tube references it owns via
    /// [`TubeCloner::copy`]; registering first is what terminates cycles
    /// and preserves shared subgraphs.
    fn copy(&self, origin: &TubeRef<P>, cloner: &mut TubeCloner<P>) -> TubeRef<P>;
}

/// A tube whose forward link can be inspected and rewired after assembly.
pub trait ModifiableTube<P>: Tube<P> {
    /// Replaces the stage's forward link.
    fn set_next(&mut self, next: Option<TubeRef<P>>);

    /// The stage's current forward link.
    fn next_tube(&self) -> Option<TubeRef<P>>;
}
