// src/core/buffer.rs
use tracing::debug;

use crate::core::entity::{apply_patch, Entity, FieldPatch};

/// Reconcile a fresh server read with the user's in-progress copy.
///
/// A read for a different entity replaces the buffer wholesale. For the same
/// entity the local copy wins everywhere except the derived fields, which
/// only the backend computes.
pub fn merge<E: Entity>(base: &E, local: &E, incoming: &E) -> E {
    if incoming.id() != base.id() {
        return incoming.clone();
    }
    let mut next = local.clone();
    next.adopt_derived(incoming);
    next
}

/// Shadow copy of one entity owned by an edit session.
#[derive(Debug, Clone)]
pub struct LocalBuffer<E: Entity> {
    /// Last entity the server confirmed.
    base: E,
    /// `base` plus unacknowledged local edits.
    local: E,
}

impl<E: Entity> LocalBuffer<E> {
    pub fn new(seed: E) -> Self {
        Self {
            local: seed.clone(),
            base: seed,
        }
    }

    pub fn local(&self) -> &E {
        &self.local
    }

    pub fn base(&self) -> &E {
        &self.base
    }

    pub fn id(&self) -> &str {
        self.base.id()
    }

    /// The part of `patch` a local edit may change: the identifier and the
    /// derived fields are removed.
    pub fn editable(patch: &FieldPatch) -> FieldPatch {
        let mut clean = patch.clone();
        if clean.remove(E::ID_FIELD).is_some() {
            debug!("Dropping local edit to identifier of {}", E::KIND);
        }
        for field in E::DERIVED_FIELDS {
            if clean.remove(*field).is_some() {
                debug!("Dropping local edit to derived field '{}' on {}", field, E::KIND);
            }
        }
        clean
    }

    /// Apply a local edit optimistically.
    ///
    /// Only the `editable` part is applied; the returned patch is what should
    /// be committed to the backend. On error the buffer is left unchanged.
    pub fn apply(&mut self, patch: &FieldPatch) -> Result<FieldPatch, serde_json::Error> {
        let clean = Self::editable(patch);
        if clean.is_empty() {
            return Ok(clean);
        }
        self.local = apply_patch(&self.local, &clean)?;
        Ok(clean)
    }

    /// Fold a server read into the buffer.
    pub fn reconcile(&mut self, incoming: E) {
        self.local = merge(&self.base, &self.local, &incoming);
        self.base = incoming;
    }

    /// Discard everything and start over from `seed`.
    pub fn reseed(&mut self, seed: E) {
        *self = Self::new(seed);
    }
}
