// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shard-local identifier index: `(kind, scope, value)` to session key.
//!
//! Bi-directional consistency with the session arena is the engine's core
//! invariant; every mutation goes through this type so the periodic audit
//! has one structure to check.

use std::collections::HashMap;

use crate::{
    correlate::session::SessionKey,
    proto::ident::{Identifier, IdentifierKind, IndexKey},
};

#[derive(Debug, Default)]
pub struct IdentifierIndex {
    entries: HashMap<IndexKey, SessionKey>,
}

impl IdentifierIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, id: &Identifier) -> Option<SessionKey> {
        self.entries.get(&id.index_key()).copied()
    }

    pub fn lookup_key(&self, key: &IndexKey) -> Option<SessionKey> {
        self.entries.get(key).copied()
    }

    /// Points `id` at `session`; returns the previous owner when the entry
    /// was already taken by a different session (a merge trigger).
    pub fn insert(&mut self, id: &Identifier, session: SessionKey) -> Option<SessionKey> {
        match self.entries.insert(id.index_key(), session) {
            Some(prev) if prev != session => Some(prev),
            _ => None,
        }
    }

    /// Redirects every entry of `from` to `to`; used by merge so absorbed
    /// identifiers resolve to the survivor.
    pub fn redirect(&mut self, from: SessionKey, to: SessionKey) {
        for target in self.entries.values_mut() {
            if *target == from {
                *target = to;
            }
        }
    }

    /// Drops the given identifiers as long as they still point at `session`.
    pub fn remove_session<'a>(
        &mut self,
        ids: impl IntoIterator<Item = &'a Identifier>,
        session: SessionKey,
    ) {
        for id in ids {
            let key = id.index_key();
            if self.entries.get(&key) == Some(&session) {
                self.entries.remove(&key);
            }
        }
    }

    /// Entries of a given kind, for diagnostics.
    pub fn count_kind(&self, kind: IdentifierKind) -> usize {
        self.entries.keys().filter(|k| k.kind == kind).count()
    }

    /// All `(key, session)` pairs; the audit walks this.
    pub fn iter(&self) -> impl Iterator<Item = (&IndexKey, &SessionKey)> {
        self.entries.iter()
    }
}
