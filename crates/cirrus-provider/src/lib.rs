//! Provider adapters for Cirrus.
//!
//! The engine never talks to a cloud directly: every create/update/delete and
//! every bind goes through a [`ProviderAdapter`], selected per resource kind by
//! an [`AdapterTable`]. Two adapters ship with the crate: [`MockAdapter`]
//! (in-memory, scriptable failures) and [`LocalAdapter`] (JSON documents on
//! disk).

pub mod adapter;
pub mod local;
pub mod mock;

pub use adapter::{select_adapters, AdapterTable, ProviderAdapter};
pub use local::LocalAdapter;
pub use mock::{MockAdapter, MockCall, Operation};

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Worth retrying: throttling, timeouts, temporary unavailability.
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// The permanent form of this error, used once retries are exhausted.
    #[must_use]
    pub fn into_permanent(self) -> Self {
        match self {
            ProviderError::Transient(msg) => ProviderError::Permanent(msg),
            permanent => permanent,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ProviderError::Transient(msg) | ProviderError::Permanent(msg) => msg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_becomes_permanent() {
        let e = ProviderError::Transient("throttled".to_owned());
        assert!(e.is_transient());
        let p = e.into_permanent();
        assert_eq!(p, ProviderError::Permanent("throttled".to_owned()));
        assert!(!p.is_transient());
    }

    #[test]
    fn display_distinguishes_kinds() {
        assert!(ProviderError::Transient("x".into())
            .to_string()
            .contains("transient"));
        assert_eq!(ProviderError::Permanent("x".into()).message(), "x");
    }
}
