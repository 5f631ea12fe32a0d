//! Failure isolation for calls into external engines (OCR, embedding models,
//! storage backends).
//!
//! Two independent mechanisms, composed per call site by [`CallGuard`]:
//! - bounded retry with exponential backoff ([`RetryPolicy`])
//! - per-dependency circuit breakers ([`CircuitBreaker`], owned by a
//!   [`BreakerRegistry`] that callers inject)
//!
//! [`run_with_fallback`] lets callers degrade instead of failing an item.

pub mod breaker;
pub mod fallback;
pub mod retry;

pub use breaker::*;
pub use fallback::*;
pub use retry::*;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse error taxonomy shared by every domain error in the crate.
///
/// Retry policies select on these kinds; breakers count dependency failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad path, empty query, invalid chunk text. Never retried.
    InvalidInput,
    Connection,
    Timeout,
    /// The engine ran and reported a failure.
    Engine,
    Decode,
    /// Dimension or schema incompatibility. Retrying cannot fix it.
    Structural,
    /// The call was not attempted because the dependency is presumed down.
    CircuitOpen,
    Storage,
    Other,
}

impl ErrorKind {
    /// Kinds that represent a flaky dependency rather than a bad request.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection | Self::Timeout)
    }

    /// Kinds a breaker counts. Bad input or an undecodable payload says
    /// nothing about the health of the dependency.
    pub fn is_dependency_failure(&self) -> bool {
        !matches!(self, Self::InvalidInput | Self::Decode)
    }

    /// The dependency is down or misbehaving, so callers may degrade
    /// instead of failing. Structural and input errors are never outages.
    pub fn is_outage(&self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Timeout | Self::Engine | Self::CircuitOpen
        )
    }
}

/// Maps an error value onto the shared [`ErrorKind`] taxonomy.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

/// Returned instead of calling a dependency whose breaker is open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit breaker '{dependency}' is open; call not attempted")]
pub struct CircuitOpenError {
    pub dependency: String,
}

impl Classify for CircuitOpenError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::CircuitOpen
    }
}

/// Retry around breaker for one external-call site.
///
/// Each attempt passes through the breaker, so an open breaker surfaces
/// `CircuitOpen` on the first attempt (that kind is never in a retry set
/// built from config unless explicitly listed).
#[derive(Clone)]
pub struct CallGuard {
    site: String,
    retry: RetryPolicy,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl CallGuard {
    pub fn new(site: &str, retry: RetryPolicy, breaker: Option<Arc<CircuitBreaker>>) -> Self {
        Self {
            site: site.to_string(),
            retry,
            breaker,
        }
    }

    /// Single attempt, no breaker. Used when no resilience config is wired in.
    pub fn unguarded(site: &str) -> Self {
        Self::new(site, RetryPolicy::no_retry(), None)
    }

    /// Guard a site with the breaker registered under `dependency`.
    pub fn for_dependency(
        site: &str,
        retry: RetryPolicy,
        registry: &BreakerRegistry,
        dependency: &str,
    ) -> Self {
        Self::new(site, retry, Some(registry.get(dependency)))
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    pub fn call<T, E, F>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: From<CircuitOpenError> + Classify + std::fmt::Display,
    {
        self.retry.run(&self.site, || match &self.breaker {
            Some(breaker) => breaker.call(&mut op),
            None => op(),
        })
    }
}

impl std::fmt::Debug for CallGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallGuard")
            .field("site", &self.site)
            .field("retry", &self.retry)
            .field("breaker", &self.breaker.as_ref().map(|b| b.name().to_string()))
            .finish()
    }
}
