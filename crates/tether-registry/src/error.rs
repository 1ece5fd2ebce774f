//! Error types for the registry layer.

/// Errors that can occur while registering methods.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The name is empty once the naming convention has been applied
    /// (e.g. `""` or `"..."`).
    #[error("method name '{0}' is empty after normalization")]
    EmptyName(String),

    /// [`MethodRegistry::register_new`](crate::MethodRegistry::register_new)
    /// found the name taken.
    #[error("method '{0}' is already registered")]
    AlreadyRegistered(String),
}
