//! Context-switch interception around fiber execution.

#![forbid(unsafe_code)]

use crate::fiber::Fiber;
use crate::tube::TubeRef;

/// The opaque slice of fiber execution handed to an interceptor.
///
/// The parameter and return value belong to the scheduler; interceptors pass
/// them through untouched.
pub trait FiberWork<P: Send + 'static> {
    /// Has the current thread execute the fiber, returning when it stops
    /// doing so.
    fn execute(&mut self, next: Option<TubeRef<P>>) -> Option<TubeRef<P>>;
}

/// Interception of a fiber context switch.
///
/// Even though a tubeline runs asynchronously, it is sometimes desirable to
/// bind state to the thread currently carrying a fiber — a security context,
/// a transaction scope. An interceptor runs code before and after every
/// driving pass, with the whole pass encapsulated in one opaque
/// [`FiberWork::execute`] invocation so cleanup can sit in a single scope:
///
/// ```ignore
/// fn execute(&self, fiber: &Fiber<P>, next: Option<TubeRef<P>>,
///            work: &mut dyn FiberWork<P>) -> Option<TubeRef<P>> {
///     let _scope = self.enter();
///     work.execute(next)
/// }
/// ```
///
/// An interceptor must invoke `work.execute(next)` exactly once.
///
/// Interceptors are installed per fiber with
/// [`Fiber::add_interceptor`]; installation and removal take effect at the
/// next tube boundary, never inside the current one.
pub trait FiberContextSwitchInterceptor<P: Send + 'static>: Send + Sync {
    /// Wraps one driving pass of `fiber`.
    fn execute(
        &self,
        fiber: &Fiber<P>,
        next: Option<TubeRef<P>>,
        work: &mut dyn FiberWork<P>,
    ) -> Option<TubeRef<P>>;
}
