use std::fmt;

use http::Method;

/// Identity of a cached resource. Two requests share an entry iff their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    key_base: String,
}

impl ResourceKey {
    /// Key for `method` on an already normalized absolute `uri`.
    pub fn new(method: &Method, uri: &str) -> Self {
        Self::from_key_base(format!("{}::{}", method, uri))
    }

    pub fn from_key_base(key_base: impl Into<String>) -> Self {
        Self {
            key_base: key_base.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key_base
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key_base)
    }
}
