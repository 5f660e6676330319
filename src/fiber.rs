//! Cooperative fiber scheduler
//!
//! A [`Fiber`] represents the execution of one request/response flow through
//! a tubeline. Many flows can be in flight at once on a small number of
//! threads: a fiber remembers where in the tubeline processing is at, which
//! stages still need to run on the way back out, and the rest of the state
//! specific to its flow, so a thread can put it down at any suspension point
//! and pick up another runnable fiber.
//!
//! # Suspend/resume
//!
//! A tube suspends its fiber by returning [`NextAction::Suspend`], typically
//! after hooking the fiber up with some external completion mechanism. The
//! external mechanism wakes the fiber with [`Fiber::resume`]. Resume is
//! race-free: it may fire even before the tube has returned the suspend
//! action, and the delivered packet is preserved.
//!
//! # Context
//!
//! Like a thread, a fiber carries an ambient context value. The context is
//! installed on the carrying thread for the duration of every driving pass
//! and the thread's previous value is restored on every exit path; see
//! [`current_context`]. [`FiberContextSwitchInterceptor`]s generalize this to
//! arbitrary thread-bound state.
//!
//! # Debugging aid
//!
//! Because a fiber keeps its continuations on its own stack rather than the
//! call stack, debugging can be harder than usual. `debug`-level tracing
//! gives basic start/stop/suspend/resume events; `trace`-level shows which
//! tubes execute in what order and how they behaved. When debugging
//! multi-threaded runs, consider [`set_serialize_execution`] to force
//! driving passes to run one at a time process-wide (also enabled by the
//! `TUBE_PULSE_SERIALIZE` environment variable).

#![forbid(unsafe_code)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::{Condvar, Mutex, ReentrantMutex};
use thiserror::Error;

use crate::action::NextAction;
use crate::engine::Engine;
use crate::interceptor::{FiberContextSwitchInterceptor, FiberWork};
use crate::tube::TubeRef;

#[cfg(feature = "tracing")]
use tracing::{debug, trace};

/// In-flight fault carried by a fiber while the continuation stack unwinds.
pub type Fault = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Ambient value a fiber installs on its carrying thread for the duration of
/// each driving pass.
pub type FiberContext = Arc<dyn Any + Send + Sync>;

/// Callback invoked when a fiber finishes execution.
///
/// Fibers run asynchronously, so the callback may be invoked by a different
/// thread than any of the threads that started the fiber or ran a part of
/// its tubeline.
pub type CompletionCallback<P> = Box<dyn FnOnce(Result<P, Fault>) + Send + 'static>;

/// Fault produced when a tube method panics instead of returning a
/// [`NextAction::Throw`]. The scheduler treats the panic exactly like a
/// returned throw: it starts unwinding the continuation stack.
#[derive(Debug, Error)]
#[error("tube panicked: {message}")]
pub struct TubePanicked {
    message: String,
}

impl TubePanicked {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self { message }
    }
}

/// Process-wide switch that forces driving passes to run one at a time.
/// Initialized from the `TUBE_PULSE_SERIALIZE` environment variable.
static SERIALIZE_EXECUTION: LazyLock<AtomicBool> =
    LazyLock::new(|| AtomicBool::new(std::env::var_os("TUBE_PULSE_SERIALIZE").is_some()));

/// Reentrant so a tube that drives a nested synchronous run does not
/// deadlock against its own pass.
static SERIALIZED_EXECUTION_LOCK: LazyLock<ReentrantMutex<()>> =
    LazyLock::new(|| ReentrantMutex::new(()));

/// Whether driving passes are forced to run serially process-wide.
#[must_use]
pub fn serialize_execution() -> bool {
    SERIALIZE_EXECUTION.load(Ordering::Relaxed)
}

/// Forces driving passes to run serially, one fiber at a time, across the
/// whole process. Intended as a debugging aid; see the module docs.
pub fn set_serialize_execution(serialize: bool) {
    SERIALIZE_EXECUTION.store(serialize, Ordering::Relaxed);
}

/// Allocates unique fiber numbers.
static FIBER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_FIBER: RefCell<Option<Arc<dyn Any + Send + Sync>>> =
        const { RefCell::new(None) };
    static CURRENT_CONTEXT: RefCell<Option<FiberContext>> = const { RefCell::new(None) };
}

/// The context installed by the fiber currently executing on this thread,
/// if any. Only meaningful from within a tube.
#[must_use]
pub fn current_context() -> Option<FiberContext> {
    CURRENT_CONTEXT.with(|slot| slot.borrow().clone())
}

/// User-level task driving one request/response flow through a tubeline.
///
/// Created in a suspended state by [`Engine::create_fiber`]; launched either
/// asynchronously with [`start`](Fiber::start) or on the caller's thread
/// with [`run_sync`](Fiber::run_sync). A fiber is driven by at most one
/// thread at any instant.
pub struct Fiber<P: Send + 'static> {
    inner: Arc<FiberInner<P>>,
}

impl<P: Send + 'static> Clone for Fiber<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct FiberInner<P: Send + 'static> {
    id: u64,
    engine: Engine<P>,
    state: Mutex<FiberState<P>>,
    condvar: Condvar,
}

struct FiberState<P> {
    /// Tubes whose `process_response` (or `process_exception`) still needs
    /// to run on the way back. Strict LIFO.
    conts: Vec<TubeRef<P>>,
    /// When set, the next instruction is to call this tube's
    /// `process_request`; otherwise the instruction is to drain `conts`.
    next: Option<TubeRef<P>>,
    packet: Option<P>,
    fault: Option<Fault>,
    /// 0 = not suspended, 1 = suspended. Becomes −1 when a resume arrives
    /// before the suspend it belongs to; the suspend then proceeds without
    /// parking and the resumed packet is preserved.
    suspended_count: i32,
    completed: bool,
    started: bool,
    synchronous: bool,
    interceptors: Vec<Arc<dyn FiberContextSwitchInterceptor<P>>>,
    /// Set when the interceptor list changes mid-pass. The scheduler then
    /// exits the current interceptor stack and re-enters it, so the new set
    /// takes effect at the next tube boundary, never inside the current one.
    needs_to_reenter: bool,
    callback: Option<CompletionCallback<P>>,
    context: Option<FiberContext>,
}

impl<P: Send + 'static> Fiber<P> {
    pub(crate) fn new(engine: Engine<P>) -> Self {
        let id = FIBER_ID.fetch_add(1, Ordering::Relaxed);
        // A fiber created from within another fiber inherits that fiber's
        // context, the same way a fiber inherits its creating thread's.
        let context = current_context();

        #[cfg(feature = "tracing")]
        debug!(engine = engine.id(), fiber = id, "fiber created");

        Self {
            inner: Arc::new(FiberInner {
                id,
                engine,
                state: Mutex::new(FiberState {
                    conts: Vec::with_capacity(16),
                    next: None,
                    packet: None,
                    fault: None,
                    suspended_count: 0,
                    completed: false,
                    started: false,
                    synchronous: false,
                    interceptors: Vec::new(),
                    needs_to_reenter: false,
                    callback: None,
                    context,
                }),
                condvar: Condvar::new(),
            }),
        }
    }

    /// This fiber's unique number.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The engine that owns this fiber.
    #[must_use]
    pub fn engine(&self) -> &Engine<P> {
        &self.inner.engine
    }

    /// Starts the execution of this fiber asynchronously.
    ///
    /// Works like spawning a thread: the engine's executor drives the
    /// tubeline starting at `tubeline.process_request(request)`. When the
    /// flow reaches its terminal state, `callback` receives the response
    /// packet or the unconverted fault.
    pub fn start(
        &self,
        tubeline: TubeRef<P>,
        request: P,
        callback: Option<CompletionCallback<P>>,
    ) {
        {
            let mut st = self.inner.state.lock();
            st.next = Some(tubeline);
            st.packet = Some(request);
            st.callback = callback;
            st.started = true;
        }

        #[cfg(feature = "tracing")]
        debug!(fiber = self.inner.id, "fiber started");

        self.inner.engine.add_runnable(self.clone());
    }

    /// Runs the given tubeline (and everything thereafter) synchronously on
    /// the caller's thread, returning only when all successive tubes have
    /// completed their request/response processing.
    ///
    /// May also be called from *within* a tube to fall back to synchronous
    /// processing; the fiber's pending continuations are set aside for the
    /// duration of the nested run.
    ///
    /// # Errors
    ///
    /// A fault that reaches the end of the continuation stack unconverted is
    /// returned as `Err`.
    pub fn run_sync(&self, tubeline: TubeRef<P>, request: P) -> Result<P, Fault> {
        let (old_conts, old_synchronous) = {
            let mut st = self.inner.state.lock();
            let old_conts = mem::take(&mut st.conts);
            let old_synchronous = mem::replace(&mut st.synchronous, true);
            st.packet = Some(request);
            (old_conts, old_synchronous)
        };

        self.do_run(Some(tubeline));

        let (result, started) = {
            let mut st = self.inner.state.lock();
            let result = match st.fault.take() {
                Some(fault) => Err(fault),
                None => Ok(st.packet.take()),
            };
            st.conts = old_conts;
            st.synchronous = old_synchronous;
            (result, st.started)
        };
        if !started {
            self.completion_check();
        }

        match result {
            Err(fault) => Err(fault),
            Ok(Some(packet)) => Ok(packet),
            Ok(None) => Err("fiber completed without a response packet".into()),
        }
    }

    /// Wakes up a suspended fiber with the given response packet.
    ///
    /// If the fiber suspended from `process_request`, execution resumes at
    /// the same tube's `process_response`; if it suspended from
    /// `process_response`, execution resumes at the next pending
    /// continuation.
    ///
    /// This method is race-free: another thread may invoke it even before
    /// the fiber has finished going into suspension, so the code arranging
    /// the external wakeup need not synchronize with the returned
    /// [`NextAction::Suspend`].
    pub fn resume(&self, response: P) {
        #[cfg(feature = "tracing")]
        debug!(fiber = self.inner.id, "fiber resumed");

        let mut st = self.inner.state.lock();
        st.packet = Some(response);
        st.suspended_count -= 1;
        if st.suspended_count == 0 {
            if st.synchronous {
                self.inner.condvar.notify_all();
            } else {
                drop(st);
                self.inner.engine.add_runnable(self.clone());
            }
        }
    }

    /// Adds a context-switch interceptor to this fiber.
    ///
    /// Takes effect immediately after the current tube returns, before the
    /// next tube begins processing: when the tubeline is X→Y and X installs
    /// an interceptor from its `process_request`, the interceptor wraps Y's
    /// invocation but not the remainder of X's.
    pub fn add_interceptor(&self, interceptor: Arc<dyn FiberContextSwitchInterceptor<P>>) {
        let mut st = self.inner.state.lock();
        st.interceptors.push(interceptor);
        st.needs_to_reenter = true;
    }

    /// Removes a previously added interceptor, by identity.
    ///
    /// Like installation, removal takes effect at the next tube boundary.
    /// Returns false if the interceptor was not registered with this fiber.
    pub fn remove_interceptor(
        &self,
        interceptor: &Arc<dyn FiberContextSwitchInterceptor<P>>,
    ) -> bool {
        let mut st = self.inner.state.lock();
        match st
            .interceptors
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate, interceptor))
        {
            Some(index) => {
                st.interceptors.remove(index);
                st.needs_to_reenter = true;
                true
            }
            None => false,
        }
    }

    /// The fiber's context value.
    #[must_use]
    pub fn context(&self) -> Option<FiberContext> {
        self.inner.state.lock().context.clone()
    }

    /// Sets the fiber's context value, returning the previous one. The new
    /// value is installed on the carrying thread starting with the next
    /// driving pass.
    pub fn set_context(&self, context: Option<FiberContext>) -> Option<FiberContext> {
        mem::replace(&mut self.inner.state.lock().context, context)
    }

    /// The packet currently associated with this fiber, if any.
    #[must_use]
    pub fn packet(&self) -> Option<P>
    where
        P: Clone,
    {
        self.inner.state.lock().packet.clone()
    }

    /// True while the fiber is still running or suspended.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.inner.state.lock().completed
    }

    /// The fiber currently executing on this thread.
    ///
    /// Works like thread-current access and is only valid from within a
    /// tube; see [`try_current`](Self::try_current) for the non-panicking
    /// variant.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tube, or from a tube whose fiber
    /// carries a different packet type.
    #[must_use]
    pub fn current() -> Fiber<P> {
        Self::try_current().expect("Fiber::current() can only be used from within a tube")
    }

    /// The fiber currently executing on this thread, or `None` when called
    /// outside a tube (or across a packet-type boundary).
    #[must_use]
    pub fn try_current() -> Option<Fiber<P>> {
        CURRENT_FIBER
            .with(|slot| slot.borrow().clone())
            .and_then(|any| any.downcast::<FiberInner<P>>().ok())
            .map(|inner| Fiber { inner })
    }

    /// Whether the current fiber is being driven synchronously.
    ///
    /// Advanced tubes can use this as a strategy hint: a tube that would
    /// install an interceptor for asynchronous execution may find it faster
    /// to fall back to [`run_sync`](Self::run_sync) when the fiber is
    /// already synchronous.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tube.
    #[must_use]
    pub fn is_synchronous() -> bool {
        Self::current().inner.state.lock().synchronous
    }

    /// One asynchronous driving pass, executed on the engine's executor.
    pub(crate) fn run_pass(&self) {
        let next = {
            let mut st = self.inner.state.lock();
            debug_assert!(!st.synchronous);
            st.next.take()
        };
        let next = self.do_run(next);
        self.inner.state.lock().next = next;
        self.completion_check();
    }

    /// Delivers the terminal state at most once: when the continuation
    /// stack is empty and no forward tube remains, the fiber is done.
    fn completion_check(&self) {
        let callback = {
            let mut st = self.inner.state.lock();
            if st.completed || !st.conts.is_empty() || st.next.is_some() {
                None
            } else {
                #[cfg(feature = "tracing")]
                debug!(fiber = self.inner.id, "fiber completed");

                st.completed = true;
                self.inner.condvar.notify_all();
                match st.callback.take() {
                    Some(callback) => {
                        if let Some(fault) = st.fault.take() {
                            Some((callback, Err(fault)))
                        } else if let Some(packet) = st.packet.take() {
                            Some((callback, Ok(packet)))
                        } else {
                            // A synchronous driver already claimed the
                            // result; it owns delivery.
                            None
                        }
                    }
                    None => None,
                }
            }
        };
        if let Some((callback, result)) = callback {
            callback(result);
        }
    }

    /// One driving pass, with the global serialization gate applied.
    fn do_run(&self, next: Option<TubeRef<P>>) -> Option<TubeRef<P>> {
        #[cfg(feature = "tracing")]
        debug!(
            fiber = self.inner.id,
            thread = ?std::thread::current().name(),
            "fiber running"
        );

        if serialize_execution() {
            let _serial = SERIALIZED_EXECUTION_LOCK.lock();
            self.drive_intercepted(next)
        } else {
            self.drive_intercepted(next)
        }
    }

    /// Installs the fiber's context, then runs the scheduler loop through
    /// the interceptor chain, re-entering the chain whenever the interceptor
    /// list changed mid-pass.
    fn drive_intercepted(&self, mut next: Option<TubeRef<P>>) -> Option<TubeRef<P>> {
        let _context = ContextGuard::install(self.context());

        loop {
            let interceptors = {
                let mut st = self.inner.state.lock();
                st.needs_to_reenter = false;
                st.interceptors.clone()
            };

            next = if interceptors.is_empty() {
                self.drive_loop(next)
            } else {
                let mut chain = InterceptorChain {
                    fiber: self,
                    stack: interceptors,
                    idx: 0,
                };
                chain.execute(next)
            };

            if !self.inner.state.lock().needs_to_reenter {
                break;
            }
        }
        next
    }

    /// Executes the fiber as much as possible: one tube invocation at a
    /// time until the fiber completes, blocks on suspension, or has to
    /// re-enter the interceptor chain.
    ///
    /// Returns the tube whose `process_request` should run when execution
    /// next resumes, or `None` when the remaining work is draining the
    /// continuation stack (or the fiber is done).
    fn drive_loop(&self, mut next: Option<TubeRef<P>>) -> Option<TubeRef<P>> {
        let _current = CurrentFiberGuard::enter(
            Arc::clone(&self.inner) as Arc<dyn Any + Send + Sync>
        );

        loop {
            {
                let mut st = self.inner.state.lock();
                if st.synchronous {
                    while st.suspended_count == 1 {
                        #[cfg(feature = "tracing")]
                        debug!(
                            fiber = self.inner.id,
                            thread = ?std::thread::current().name(),
                            "fiber blocking thread"
                        );
                        self.inner.condvar.wait(&mut st);
                    }
                } else if st.suspended_count == 1 {
                    // Yield the carrying thread; resume() resubmits.
                    return next;
                }
                if st.needs_to_reenter {
                    return next;
                }
            }

            let step = {
                let mut st = self.inner.state.lock();
                if let Some(fault) = st.fault.take() {
                    match st.conts.pop() {
                        Some(last) => Step::Exception(last, fault),
                        None => {
                            // Terminal fault: leave it for the driver.
                            st.fault = Some(fault);
                            Step::Done
                        }
                    }
                } else if let Some(tube) = &next {
                    Step::Request(Arc::clone(tube), st.packet.take())
                } else {
                    match st.conts.pop() {
                        Some(last) => Step::Response(last, st.packet.take()),
                        None => Step::Done,
                    }
                }
            };

            let (last, outcome) = match step {
                Step::Done => return None,
                Step::Request(tube, packet) => {
                    let packet =
                        packet.expect("scheduler invariant: a packet is staged before each step");

                    #[cfg(feature = "tracing")]
                    trace!(fiber = self.inner.id, "process_request");

                    let outcome =
                        panic::catch_unwind(AssertUnwindSafe(|| tube.lock().process_request(packet)));
                    (tube, outcome)
                }
                Step::Response(tube, packet) => {
                    let packet =
                        packet.expect("scheduler invariant: a packet is staged before each step");

                    #[cfg(feature = "tracing")]
                    trace!(fiber = self.inner.id, "process_response");

                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        tube.lock().process_response(packet)
                    }));
                    (tube, outcome)
                }
                Step::Exception(tube, fault) => {
                    #[cfg(feature = "tracing")]
                    trace!(fiber = self.inner.id, %fault, "process_exception");

                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        tube.lock().process_exception(fault)
                    }));
                    (tube, outcome)
                }
            };

            let action = match outcome {
                Ok(action) => action,
                Err(payload) => {
                    let fault = TubePanicked::from_payload(payload);

                    #[cfg(feature = "tracing")]
                    trace!(fiber = self.inner.id, %fault, "caught panic, start stack unwinding");

                    self.inner.state.lock().fault = Some(Box::new(fault));
                    continue;
                }
            };

            #[cfg(feature = "tracing")]
            trace!(fiber = self.inner.id, action = ?action.kind(), "tube returned");

            // Interpret the action. A racing resume may already have
            // delivered the response packet; Suspend must not clobber it.
            let mut st = self.inner.state.lock();
            match action {
                NextAction::Invoke { next: tube, packet } => {
                    st.packet = Some(packet);
                    st.conts.push(last);
                    next = Some(tube);
                }
                NextAction::InvokeAndForget { next: tube, packet } => {
                    st.packet = Some(packet);
                    next = Some(tube);
                }
                NextAction::Return { packet } => {
                    st.packet = Some(packet);
                    next = None;
                }
                NextAction::Throw { error } => {
                    st.packet = None;
                    st.fault = Some(error);
                    next = None;
                }
                NextAction::Suspend => {
                    #[cfg(feature = "tracing")]
                    debug!(fiber = self.inner.id, "fiber suspended");

                    st.conts.push(last);
                    next = None;
                    st.suspended_count += 1;
                }
            }
        }
    }
}

/// One scheduler step: which method to call on which tube.
enum Step<P> {
    Request(TubeRef<P>, Option<P>),
    Response(TubeRef<P>, Option<P>),
    Exception(TubeRef<P>, Fault),
    Done,
}

impl<P: Send + 'static> fmt::Debug for Fiber<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "engine-{}-fiber-{}",
            self.inner.engine.id(),
            self.inner.id
        )
    }
}

/// Invokes all registered interceptors in order, innermost call being the
/// scheduler loop itself.
struct InterceptorChain<'f, P: Send + 'static> {
    fiber: &'f Fiber<P>,
    stack: Vec<Arc<dyn FiberContextSwitchInterceptor<P>>>,
    idx: usize,
}

impl<P: Send + 'static> FiberWork<P> for InterceptorChain<'_, P> {
    fn execute(&mut self, next: Option<TubeRef<P>>) -> Option<TubeRef<P>> {
        if self.idx == self.stack.len() {
            self.fiber.drive_loop(next)
        } else {
            let interceptor = Arc::clone(&self.stack[self.idx]);
            self.idx += 1;
            interceptor.execute(self.fiber, next, self)
        }
    }
}

/// Saves the thread's context slot on entry and restores it on every exit
/// path.
struct ContextGuard {
    saved: Option<FiberContext>,
}

impl ContextGuard {
    fn install(context: Option<FiberContext>) -> Self {
        let saved = CURRENT_CONTEXT.with(|slot| mem::replace(&mut *slot.borrow_mut(), context));
        Self { saved }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let saved = self.saved.take();
        CURRENT_CONTEXT.with(|slot| *slot.borrow_mut() = saved);
    }
}

/// Marks this fiber as the thread's current fiber for the duration of a
/// scheduler loop, restoring the previous one on exit (nested synchronous
/// runs stack).
struct CurrentFiberGuard {
    saved: Option<Arc<dyn Any + Send + Sync>>,
}

impl CurrentFiberGuard {
    fn enter(fiber: Arc<dyn Any + Send + Sync>) -> Self {
        let saved = CURRENT_FIBER.with(|slot| mem::replace(&mut *slot.borrow_mut(), Some(fiber)));
        Self { saved }
    }
}

impl Drop for CurrentFiberGuard {
    fn drop(&mut self) {
        let saved = self.saved.take();
        CURRENT_FIBER.with(|slot| *slot.borrow_mut() = saved);
    }
}
