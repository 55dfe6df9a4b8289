//! Abstract interface to the cluster's leader-election primitive.
//!
//! The controller does not elect leaders itself. It registers candidates
//! with an external election framework and reacts to its callbacks: when
//! this node is elected for a candidate's group, the framework invokes
//! [`ElectionCandidate::instantiate_service_instance`] and, by contract,
//! treats the node as active only once that call returns. When leadership
//! is lost it invokes [`ElectionCandidate::close_service_instance`], which
//! must return promptly; shutdown proceeds in the background.
#![warn(missing_docs)]
#![warn(clippy::all)]

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Identifier of an election group. All candidates registered under the
/// same identifier compete for the same leadership.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceGroupIdentifier(String);

impl ServiceGroupIdentifier {
    /// Create a new group identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceGroupIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors surfaced by the election framework.
#[derive(Debug, Error)]
pub enum ElectionError {
    /// The framework rejected the candidate registration.
    #[error("registration rejected: {0}")]
    Registration(String),

    /// The registration was already closed.
    #[error("registration already closed")]
    AlreadyClosed,

    /// Shutting down a service instance failed.
    #[error("service instance shutdown failed: {0}")]
    Shutdown(String),
}

/// A candidate for group leadership.
///
/// `instantiate_service_instance` is synchronous by contract: it must
/// fully complete, or fail internally, before the framework considers
/// this node the active leader. `close_service_instance` is asynchronous
/// by contract: leadership handover must not be blocked on local
/// teardown.
#[async_trait]
pub trait ElectionCandidate: Send + Sync + 'static {
    /// The group this candidate competes in.
    fn identifier(&self) -> ServiceGroupIdentifier;

    /// This node was elected leader for the candidate's group.
    fn instantiate_service_instance(&self);

    /// Leadership was lost; release the service instance.
    async fn close_service_instance(&self) -> Result<(), ElectionError>;
}

/// Handle for a registered candidate. Closing it withdraws the candidate
/// from the election.
pub trait ElectionRegistration: Send + Sync {
    /// Withdraw the candidate. Idempotence is the implementor's choice;
    /// callers treat a failure as non-fatal.
    fn close(&self) -> Result<(), ElectionError>;
}

/// The election framework's registration surface.
pub trait ElectionProvider: Send + Sync + 'static {
    /// Register a candidate. A successful registration always yields a
    /// usable handle; failure to produce one is a configuration error on
    /// the caller's side.
    fn register(
        &self,
        candidate: Arc<dyn ElectionCandidate>,
    ) -> Result<Box<dyn ElectionRegistration>, ElectionError>;
}
