//! Glob matching for key invalidation patterns.
//!
//! Patterns use glob syntax as compiled by `globset`: `*` matches any run of
//! characters (including `:`), `?` exactly one. The manager only emits `*`.

use globset::{Glob, GlobMatcher};

use crate::{MuninnError, Result};

/// A compiled invalidation pattern.
///
/// A trailing `:*` segment is optional, so `cloud_api:aws:compute:*:*`
/// covers both `cloud_api:aws:compute:us-east-1` and its parameterised
/// variants.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    full: GlobMatcher,
    without_tail: Option<GlobMatcher>,
}

impl KeyPattern {
    /// Compile `pattern`. Fails with [`MuninnError::Configuration`] on
    /// malformed globs such as an unclosed `[`.
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(Self {
            full: compile(pattern)?,
            without_tail: pattern.strip_suffix(":*").map(compile).transpose()?,
        })
    }

    pub fn is_match(&self, key: &str) -> bool {
        self.full.is_match(key) || self.without_tail.as_ref().is_some_and(|m| m.is_match(key))
    }
}

fn compile(pattern: &str) -> Result<GlobMatcher> {
    Glob::new(pattern)
        .map(|glob| glob.compile_matcher())
        .map_err(|e| MuninnError::Configuration(format!("invalid key pattern {pattern:?}: {e}")))
}
