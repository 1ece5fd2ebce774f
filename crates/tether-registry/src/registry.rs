//! The method registry: maps normalized names to handlers.
//!
//! # Concurrency
//!
//! Registration, removal and lookup can come from any task, so the map
//! sits behind a single coarse `Mutex`. The lock is only ever held for
//! the map operation itself: [`MethodRegistry::lookup`] clones the entry
//! out, and the caller runs the handler with the lock released. A slow
//! handler therefore never blocks a concurrent `register`.
//!
//! # Duplicate names
//!
//! - [`MethodRegistry::register`] overwrites: the last registration of a
//!   name wins, and the replaced handler is dropped.
//! - [`MethodRegistry::register_object`] first de-duplicates its own
//!   enumeration, keeping the first entry for each resolved name, and then
//!   registers the survivors with the overwrite rule above.
//! - [`MethodRegistry::register_new`] never overwrites; a taken name is
//!   an error.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{
    MethodMetadata, MethodSource, NamingConvention, RegisteredMethod, RegistryError,
};

/// Thread-safe map from method name to [`RegisteredMethod`].
pub struct MethodRegistry<H> {
    methods: Mutex<HashMap<String, RegisteredMethod<H>>>,
    naming: NamingConvention,
}

impl<H: Clone> MethodRegistry<H> {
    /// Creates an empty registry that folds names with `naming`.
    pub fn new(naming: NamingConvention) -> Self {
        Self {
            methods: Mutex::new(HashMap::new()),
            naming,
        }
    }

    /// The convention this registry applies.
    pub fn naming(&self) -> NamingConvention {
        self.naming
    }

    /// Applies the registry's naming convention to `name`.
    pub fn normalize(&self, name: &str) -> String {
        self.naming.apply(name)
    }

    /// Registers a handler and returns the normalized name it lives under.
    ///
    /// An existing method with the same normalized name is replaced.
    ///
    /// # Errors
    /// Returns [`RegistryError::EmptyName`] if the name normalizes to `""`.
    pub fn register(
        &self,
        name: &str,
        handler: H,
        metadata: MethodMetadata,
    ) -> Result<String, RegistryError> {
        let normalized = self.checked_name(name)?;
        let method = RegisteredMethod::new(normalized.clone(), handler, metadata);

        if self.lock().insert(normalized.clone(), method).is_some() {
            tracing::debug!(name = %normalized, "method overwritten");
        } else {
            tracing::debug!(name = %normalized, "method registered");
        }
        Ok(normalized)
    }

    /// Registers a handler only if the name is free.
    ///
    /// # Errors
    /// [`RegistryError::AlreadyRegistered`] if another method holds the
    /// normalized name; the existing entry is left alone.
    pub fn register_new(
        &self,
        name: &str,
        handler: H,
        metadata: MethodMetadata,
    ) -> Result<String, RegistryError> {
        let normalized = self.checked_name(name)?;
        let mut methods = self.lock();
        if methods.contains_key(&normalized) {
            return Err(RegistryError::AlreadyRegistered(normalized));
        }
        let method = RegisteredMethod::new(normalized.clone(), handler, metadata);
        methods.insert(normalized.clone(), method);
        drop(methods);

        tracing::debug!(name = %normalized, "method registered");
        Ok(normalized)
    }

    /// Removes a method. Returns the removed entry, if there was one.
    pub fn unregister(&self, name: &str) -> Option<RegisteredMethod<H>> {
        let normalized = self.normalize(name);
        let removed = self.lock().remove(&normalized);
        if removed.is_some() {
            tracing::debug!(name = %normalized, "method unregistered");
        }
        removed
    }

    /// Removes `name` only while `owns` accepts the entry found there.
    pub fn unregister_if(
        &self,
        name: &str,
        owns: impl FnOnce(&RegisteredMethod<H>) -> bool,
    ) -> Option<RegisteredMethod<H>> {
        let normalized = self.normalize(name);
        let mut methods = self.lock();
        if !methods.get(&normalized).is_some_and(owns) {
            return None;
        }
        let removed = methods.remove(&normalized);
        drop(methods);

        tracing::debug!(name = %normalized, "method unregistered");
        removed
    }

    /// Looks a method up by name.
    ///
    /// Returns a clone so the caller can invoke the handler without
    /// holding the registry lock.
    pub fn lookup(&self, name: &str) -> Option<RegisteredMethod<H>> {
        let normalized = self.normalize(name);
        self.lock().get(&normalized).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        let normalized = self.normalize(name);
        self.lock().contains_key(&normalized)
    }

    /// All registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Every method whose metadata asks for a peer-side proxy, sorted by
    /// name.
    pub fn proxy_injected(&self) -> Vec<RegisteredMethod<H>> {
        let mut methods: Vec<_> = self
            .lock()
            .values()
            .filter(|method| method.metadata.proxy_injection)
            .cloned()
            .collect();
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        methods
    }

    /// Removes every method whose name matches `predicate` and returns the
    /// removed names.
    pub fn remove_where(&self, mut predicate: impl FnMut(&str) -> bool) -> Vec<String> {
        let mut methods = self.lock();
        let doomed: Vec<String> = methods
            .keys()
            .filter(|name| predicate(name))
            .cloned()
            .collect();
        for name in &doomed {
            methods.remove(name);
        }
        doomed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // -----------------------------------------------------------------------
    // Object / scope registration
    // -----------------------------------------------------------------------

    /// Resolves a method source under an optional dotted scope.
    ///
    /// Each entry becomes `scope.name` (or `name` without a scope),
    /// normalized. When several entries resolve to the same name, the
    /// first one enumerated is kept and the rest are dropped.
    ///
    /// # Errors
    /// Returns [`RegistryError::EmptyName`] if any entry resolves to `""`.
    pub fn resolve_object(
        &self,
        scope: Option<&str>,
        source: &impl MethodSource<H>,
    ) -> Result<Vec<RegisteredMethod<H>>, RegistryError> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();

        for mut method in source.methods() {
            let full = match scope.filter(|s| !s.is_empty()) {
                Some(scope) => format!("{scope}.{}", method.name),
                None => method.name.clone(),
            };
            let name = self.checked_name(&full)?;
            if seen.insert(name.clone()) {
                method.name = name;
                resolved.push(method);
            } else {
                tracing::trace!(%name, "shadowed method skipped");
            }
        }
        Ok(resolved)
    }

    /// Registers every method of `source` under `scope`.
    ///
    /// Nothing is registered if any entry has an empty name. Returns the
    /// entries as registered (with their resolved names).
    pub fn register_object(
        &self,
        scope: Option<&str>,
        source: &impl MethodSource<H>,
    ) -> Result<Vec<RegisteredMethod<H>>, RegistryError> {
        let resolved = self.resolve_object(scope, source)?;

        let mut methods = self.lock();
        for method in &resolved {
            methods.insert(method.name.clone(), method.clone());
        }
        drop(methods);

        tracing::debug!(
            scope = scope.unwrap_or(""),
            count = resolved.len(),
            "object registered"
        );
        Ok(resolved)
    }

    /// Removes exactly the set of names [`Self::register_object`] would
    /// register for the same `scope` and `source`. Returns what was removed.
    pub fn unregister_object(
        &self,
        scope: Option<&str>,
        source: &impl MethodSource<H>,
    ) -> Result<Vec<RegisteredMethod<H>>, RegistryError> {
        let resolved = self.resolve_object(scope, source)?;

        let mut methods = self.lock();
        let removed: Vec<_> = resolved
            .iter()
            .filter_map(|method| methods.remove(&method.name))
            .collect();
        drop(methods);

        tracing::debug!(
            scope = scope.unwrap_or(""),
            count = removed.len(),
            "object unregistered"
        );
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn checked_name(&self, name: &str) -> Result<String, RegistryError> {
        let normalized = self.normalize(name);
        if normalized.is_empty() {
            return Err(RegistryError::EmptyName(name.to_owned()));
        }
        Ok(normalized)
    }

    /// A panicking handler elsewhere can't poison the map for good: the
    /// map is never left half-updated, so the guard is recovered.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, RegisteredMethod<H>>> {
        self.methods.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<H: Clone> Default for MethodRegistry<H> {
    fn default() -> Self {
        Self::new(NamingConvention::default())
    }
}

// =========================================================================
// Tests
// =========================================================================
