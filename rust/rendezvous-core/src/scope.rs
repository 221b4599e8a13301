// rust/rendezvous-core/src/scope.rs

//! Hierarchical variable scopes.
//!
//! A [`Scope`] is a named-variable namespace. Rendezvous calls never write
//! into a long-lived scope directly: they open a child with
//! [`Scope::new_child`] and the returned [`LocalScope`] guard deletes the
//! child, and wipes its variables, when it goes out of scope. That happens on
//! every exit path, including early returns, panics and dropped futures.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

/// A namespace of named byte variables with an optional parent.
#[derive(Debug)]
pub struct Scope {
    id: u64,
    parent: Option<Weak<Scope>>,
    vars: RwLock<HashMap<String, Vec<u8>>>,
    kids: RwLock<HashMap<u64, Arc<Scope>>>,
    next_kid: AtomicU64,
}

impl Scope {
    /// Creates a scope with no parent.
    pub fn new_root() -> Arc<Self> {
        Arc::new(Self::with_parent(0, None))
    }

    fn with_parent(id: u64, parent: Option<Weak<Scope>>) -> Self {
        Self {
            id,
            parent,
            vars: RwLock::new(HashMap::new()),
            kids: RwLock::new(HashMap::new()),
            next_kid: AtomicU64::new(1),
        }
    }

    /// Opens a child scope owned by `self` until the guard is dropped.
    pub fn new_child(self: &Arc<Self>) -> LocalScope {
        let id = self.next_kid.fetch_add(1, Ordering::Relaxed);
        let child = Arc::new(Self::with_parent(id, Some(Arc::downgrade(self))));
        self.kids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, child.clone());

        tracing::trace!(parent = self.id, child = id, "scope created");
        LocalScope {
            parent: self.clone(),
            scope: child,
        }
    }

    /// Stores `value` under `name`, replacing any previous value.
    pub fn set(&self, name: impl Into<String>, value: Vec<u8>) {
        self.vars
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value);
    }

    /// Looks up `name` in this scope only.
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.vars
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Looks up `name` here, then in each ancestor.
    pub fn find(&self, name: &str) -> Option<Vec<u8>> {
        if let Some(value) = self.get(name) {
            return Some(value);
        }
        self.parent
            .as_ref()
            .and_then(Weak::upgrade)
            .and_then(|parent| parent.find(name))
    }

    /// Names of the variables held in this scope, sorted.
    pub fn var_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .vars
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Number of live child scopes.
    pub fn child_count(&self) -> usize {
        self.kids.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    // Wipes this scope and every descendant, detaching them all.
    fn purge(&self) {
        let kids: Vec<Arc<Scope>> = self
            .kids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, kid)| kid)
            .collect();
        for kid in kids {
            kid.purge();
        }
        self.vars
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn delete_child(&self, id: u64) {
        let removed = self
            .kids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(child) = removed {
            child.purge();
            tracing::trace!(parent = self.id, child = id, "scope deleted");
        }
    }
}

/// A child scope that is deleted from its parent on drop.
#[derive(Debug)]
pub struct LocalScope {
    parent: Arc<Scope>,
    scope: Arc<Scope>,
}

impl LocalScope {
    /// Shared handle to the child, e.g. for RPC handlers.
    ///
    /// Handles outliving the guard see an empty scope.
    pub fn handle(&self) -> Arc<Scope> {
        self.scope.clone()
    }
}

impl Deref for LocalScope {
    type Target = Scope;

    fn deref(&self) -> &Scope {
        &self.scope
    }
}

impl Drop for LocalScope {
    fn drop(&mut self) {
        self.parent.delete_child(self.scope.id);
    }
}
