//! Cooperative fiber engine for tube pipelines
//!
//! This crate runs a large number of request/response flows concurrently on a
//! small number of threads. Each flow is driven by a [`Fiber`] — a user-level
//! task that walks an ordered, possibly cyclic graph of [`Tube`] stages (a
//! *tubeline*), one stage at a time. A stage directs the scheduler by
//! returning a [`NextAction`]; a stage that needs to wait for an external
//! event suspends its fiber, and the carrying thread moves on to other
//! runnable fibers.
//!
//! # Example
//!
//! ```rust
//! use tube_pulse::{tube, Engine, NextAction, Tube, TubeCloner, TubeRef};
//!
//! struct Echo;
//!
//! impl Tube<String> for Echo {
//!     fn process_request(&mut self, request: String) -> NextAction<String> {
//!         NextAction::return_with(request)
//!     }
//!     fn process_response(&mut self, response: String) -> NextAction<String> {
//!         NextAction::return_with(response)
//!     }
//!     fn process_exception(&mut self, error: tube_pulse::Fault) -> NextAction<String> {
//!         NextAction::throw(error)
//!     }
//!     fn copy(&self, origin: &TubeRef<String>, cloner: &mut TubeCloner<String>) -> TubeRef<String> {
//!         let copy = tube(Echo);
//!         cloner.add(origin, copy.clone());
//!         copy
//!     }
//! }
//!
//! let engine = Engine::<String>::new("example");
//! let fiber = engine.create_fiber();
//! let response = fiber.run_sync(tube(Echo), "Howdy".to_string()).unwrap();
//! assert_eq!(response, "Howdy");
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Fiber engine for tube pipelines
/// Action protocol between tubes and the scheduler
pub mod action;
/// Isomorphism-preserving tubeline duplication
pub mod cloner;
/// Fiber container and thread executor
pub mod engine;
/// Cooperative fiber scheduler
pub mod fiber;
/// Context-switch interception around fiber execution
pub mod interceptor;
/// Tube contract for pipeline stages
pub mod tube;

// Public API exports
pub use action::{ActionKind, NextAction};
pub use cloner::TubeCloner;
pub use engine::{
    Engine, EngineMetrics, EngineMetricsSnapshot, Executor, PoolConfig, Task, WorkerPool,
};
pub use fiber::{
    current_context, serialize_execution, set_serialize_execution, CompletionCallback, Fault,
    Fiber, FiberContext, TubePanicked,
};
pub use interceptor::{FiberContextSwitchInterceptor, FiberWork};
pub use tube::{tube, ModifiableTube, Tube, TubeRef};
