//! Registered methods, their metadata, and method sources.
//!
//! The registry never discovers methods by itself. Something outside it
//! (an explicit builder, generated code, a declarative table) implements
//! [`MethodSource`] and hands over `(name, handler, metadata)` triples.

use std::fmt;

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// How severe a method's deprecation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeprecationLevel {
    /// The method still works; callers get a warning.
    Warning,
    /// Callers on the peer side are refused.
    Error,
}

/// Deprecation notice attached to a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deprecation {
    pub level: DeprecationLevel,
    pub message: Option<String>,
}

/// Per-method options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodMetadata {
    /// Whether the peer should get a generated proxy for this method.
    /// Internal handlers (closure trampolines, cancellation hooks) turn
    /// this off.
    pub proxy_injection: bool,

    /// Set when the method is deprecated.
    pub deprecation: Option<Deprecation>,
}

impl Default for MethodMetadata {
    fn default() -> Self {
        Self {
            proxy_injection: true,
            deprecation: None,
        }
    }
}

impl MethodMetadata {
    /// Metadata for a method the peer can call but never sees a proxy for.
    pub fn hidden() -> Self {
        Self {
            proxy_injection: false,
            deprecation: None,
        }
    }

    /// Marks the method as deprecated.
    pub fn deprecated(
        mut self,
        level: DeprecationLevel,
        message: Option<impl Into<String>>,
    ) -> Self {
        self.deprecation = Some(Deprecation {
            level,
            message: message.map(Into::into),
        });
        self
    }
}

// ---------------------------------------------------------------------------
// RegisteredMethod
// ---------------------------------------------------------------------------

/// A named handler plus its metadata.
///
/// `H` is whatever the layer above uses as a callable handle; the
/// registry only needs to clone it out of the map.
#[derive(Clone)]
pub struct RegisteredMethod<H> {
    pub name: String,
    pub handler: H,
    pub metadata: MethodMetadata,
}

impl<H> RegisteredMethod<H> {
    pub fn new(name: impl Into<String>, handler: H, metadata: MethodMetadata) -> Self {
        Self {
            name: name.into(),
            handler,
            metadata,
        }
    }
}

impl<H> fmt::Debug for RegisteredMethod<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredMethod")
            .field("name", &self.name)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// MethodSource
// ---------------------------------------------------------------------------

/// Anything that can enumerate a bundle of methods.
///
/// Enumeration order matters for object registration: when two entries
/// resolve to the same name, the one enumerated first is kept. Sources
/// that flatten a layered handler set should therefore yield the most
/// specific handlers first.
pub trait MethodSource<H> {
    fn methods(&self) -> Vec<RegisteredMethod<H>>;
}

/// A plain, ordered list of methods built by hand.
///
/// ```rust
/// use tether_registry::{HandlerSet, MethodMetadata, MethodSource};
///
/// let calc = HandlerSet::new()
///     .method("Add", "add-handler")
///     .method_with("Sub", "sub-handler", MethodMetadata::hidden());
///
/// assert_eq!(calc.methods().len(), 2);
/// ```
#[derive(Clone)]
pub struct HandlerSet<H> {
    entries: Vec<RegisteredMethod<H>>,
}

impl<H> Default for HandlerSet<H> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<H> HandlerSet<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a method with default metadata.
    pub fn method(self, name: impl Into<String>, handler: H) -> Self {
        self.method_with(name, handler, MethodMetadata::default())
    }

    /// Adds a method with explicit metadata.
    pub fn method_with(
        mut self,
        name: impl Into<String>,
        handler: H,
        metadata: MethodMetadata,
    ) -> Self {
        self.entries.push(RegisteredMethod::new(name, handler, metadata));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<H: Clone> MethodSource<H> for HandlerSet<H> {
    fn methods(&self) -> Vec<RegisteredMethod<H>> {
        self.entries.clone()
    }
}
