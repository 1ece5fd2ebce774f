//! Method registry for Tether.
//!
//! - [`MethodRegistry`] maps names to handlers under a coarse lock and
//!   never holds that lock while a handler runs.
//! - [`NamingConvention`] folds names so registration and lookup agree.
//! - [`MethodSource`] / [`HandlerSet`] feed bundles of methods in, and
//!   [`MethodRegistry::register_object`] binds a bundle under a dotted
//!   scope so the peer sees it as one namespaced object.
//!
//! The registry is generic over the handler type; it has no idea what
//! calling a handler means.

mod error;
mod method;
mod naming;
mod registry;

pub use error::RegistryError;
pub use method::{
    Deprecation, DeprecationLevel, HandlerSet, MethodMetadata, MethodSource,
    RegisteredMethod,
};
pub use naming::NamingConvention;
pub use registry::MethodRegistry;
