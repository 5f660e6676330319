//! Isomorphism-preserving tubeline duplication
//!
//! Tubes may form an arbitrary directed graph, so someone has to keep track
//! of isomorphism for a clone to come out correctly: in the diamond
//! `A→B, A→C, B→D, C→D` a naive copy would produce two distinct copies of
//! `D`, and a cyclic graph would never terminate. A [`TubeCloner`] holds the
//! original-to-copy mapping for exactly one cloning episode and serves both
//! cases.

#![forbid(unsafe_code)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
use std::collections::HashMap;
use std::sync::Arc;

use crate::tube::TubeRef;

#[cfg(feature = "tracing")]
use tracing::trace;

/// Original-to-copy mapping for one cloning episode.
///
/// Created fresh by [`TubeCloner::clone_tubeline`] and discarded when the
/// top-level clone call returns.
pub struct TubeCloner<P> {
    master2copy: HashMap<usize, TubeRef<P>>,
}

/// Identity of a tube: the address of its shared allocation.
fn identity<P>(tube: &TubeRef<P>) -> usize {
    Arc::as_ptr(tube) as *const () as usize
}

impl<P: 'static> TubeCloner<P> {
    /// Clones the whole tubeline reachable from `root`.
    ///
    /// Stages implementing [`Tube::copy`](crate::Tube::copy) must use
    /// [`copy`](Self::copy) for every tube reference they own.
    #[must_use]
    pub fn clone_tubeline(root: &TubeRef<P>) -> TubeRef<P> {
        let mut cloner = TubeCloner {
            master2copy: HashMap::new(),
        };
        cloner.copy(root)
    }

    /// Copies one tube reference within the current episode.
    ///
    /// If the tube was already copied in this episode the recorded copy is
    /// returned without touching the original; this is what makes shared
    /// subgraphs stay shared and cycles terminate.
    ///
    /// # Panics
    ///
    /// Panics if the stage's `copy` implementation returns without having
    /// registered its own copy via [`add`](Self::add).
    pub fn copy(&mut self, tube: &TubeRef<P>) -> TubeRef<P> {
        if let Some(copy) = self.master2copy.get(&identity(tube)) {
            return Arc::clone(copy);
        }
        let copy = tube.lock().copy(tube, self);
        // The stage must register itself before copying its own references.
        // Skipping that step turns a cyclic graph into a re-lock of the
        // original's mutex instead of a map hit; the acyclic variant of the
        // mistake is caught here.
        let recorded = self.master2copy.get(&identity(tube));
        assert!(
            recorded.is_some_and(|r| Arc::ptr_eq(r, &copy)),
            "a tube must call TubeCloner::add(origin, copy) before copying its own tube references"
        );
        copy
    }

    /// Records the copy made for `original`.
    ///
    /// Must be called from within [`Tube::copy`](crate::Tube::copy), before
    /// the stage copies the tube references it owns.
    ///
    /// # Panics
    ///
    /// Panics if `original` is already mapped in this episode.
    pub fn add(&mut self, original: &TubeRef<P>, copy: TubeRef<P>) {
        #[cfg(feature = "tracing")]
        trace!(original = identity(original), "tube copy registered");

        let previous = self.master2copy.insert(identity(original), copy);
        assert!(
            previous.is_none(),
            "tube registered twice in one cloning episode"
        );
    }
}
