//! Shared helpers for integration tests: a counting stage and tubeline
//! builders.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use tube_pulse::{tube, Fault, ModifiableTube, NextAction, Tube, TubeCloner, TubeRef};

/// Per-stage invocation counters, shared with the test body.
#[derive(Debug, Default)]
pub struct Counters {
    pub requests: AtomicU32,
    pub responses: AtomicU32,
    pub exceptions: AtomicU32,
    pub copies: AtomicU32,
    pub destroys: AtomicU32,
}

impl Counters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn responses(&self) -> u32 {
        self.responses.load(Ordering::Relaxed)
    }

    pub fn exceptions(&self) -> u32 {
        self.exceptions.load(Ordering::Relaxed)
    }

    pub fn copies(&self) -> u32 {
        self.copies.load(Ordering::Relaxed)
    }

    pub fn destroys(&self) -> u32 {
        self.destroys.load(Ordering::Relaxed)
    }
}

/// Counters of every stage copied during cloning episodes, in traversal
/// order (head first for a straight tubeline).
pub type CopyCounters = Arc<Mutex<Vec<Arc<Counters>>>>;

/// Straight-through stage: forwards the request to `next` when present,
/// otherwise returns it; counts every invocation.
pub struct CountingTube {
    pub next: Option<TubeRef<String>>,
    pub counters: Arc<Counters>,
    pub copy_log: CopyCounters,
}

impl CountingTube {
    /// Builds a straight tubeline of `len` counting stages. Returns the
    /// entry tube, per-stage counters front to back, and the log that
    /// collects counters of any copies made later.
    pub fn chain(len: usize) -> (TubeRef<String>, Vec<Arc<Counters>>, CopyCounters) {
        let copy_log: CopyCounters = Arc::default();
        let mut counters = Vec::with_capacity(len);
        let mut head: Option<TubeRef<String>> = None;
        for _ in 0..len {
            let stage_counters = Counters::new();
            head = Some(tube(CountingTube {
                next: head.take(),
                counters: Arc::clone(&stage_counters),
                copy_log: Arc::clone(&copy_log),
            }));
            counters.push(stage_counters);
        }
        counters.reverse();
        (head.expect("chain of at least one tube"), counters, copy_log)
    }
}

impl Tube<String> for CountingTube {
    fn process_request(&mut self, request: String) -> NextAction<String> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        match &self.next {
            Some(next) => NextAction::invoke(Arc::clone(next), request),
            None => NextAction::return_with(request),
        }
    }

    fn process_response(&mut self, response: String) -> NextAction<String> {
        self.counters.responses.fetch_add(1, Ordering::Relaxed);
        NextAction::return_with(response)
    }

    fn process_exception(&mut self, error: Fault) -> NextAction<String> {
        self.counters.exceptions.fetch_add(1, Ordering::Relaxed);
        NextAction::throw(error)
    }

    fn pre_destroy(&mut self) {
        self.counters.destroys.fetch_add(1, Ordering::Relaxed);
    }

    fn copy(&self, origin: &TubeRef<String>, cloner: &mut TubeCloner<String>) -> TubeRef<String> {
        self.counters.copies.fetch_add(1, Ordering::Relaxed);
        let fresh = Counters::new();
        self.copy_log.lock().push(Arc::clone(&fresh));

        let concrete = Arc::new(Mutex::new(CountingTube {
            next: None,
            counters: fresh,
            copy_log: Arc::clone(&self.copy_log),
        }));
        let copy: TubeRef<String> = concrete.clone();
        cloner.add(origin, copy.clone());
        concrete.lock().next = self.next.as_ref().map(|next| cloner.copy(next));
        copy
    }
}

impl ModifiableTube<String> for CountingTube {
    fn set_next(&mut self, next: Option<TubeRef<String>>) {
        self.next = next;
    }

    fn next_tube(&self) -> Option<TubeRef<String>> {
        self.next.clone()
    }
}
