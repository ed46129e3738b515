//! Throttle key generation.

/// A key that identifies one subject within one throttle scope.
///
/// Rendered as `throttle_{scope}_{ident}`, so the same subject is counted
/// separately under each scope it is checked against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThrottleKey {
    /// The throttle scope, e.g. `user` or `anon`
    pub scope: String,
    /// The subject identifier, e.g. a user id or client address
    pub ident: String,
}

impl ThrottleKey {
    pub fn new(scope: &str, ident: &str) -> Self {
        Self {
            scope: scope.to_string(),
            ident: ident.to_string(),
        }
    }

    /// The store key for this scope and subject.
    pub fn to_cache_key(&self) -> String {
        format!("throttle_{}_{}", self.scope, self.ident)
    }
}

impl std::fmt::Display for ThrottleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_cache_key())
    }
}
