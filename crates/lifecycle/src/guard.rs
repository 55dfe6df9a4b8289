//! Lifecycle guard around a single sub-service
//!
//! Start and stop callbacks can arrive concurrently from election
//! framework threads and from local shutdown paths. The guard serializes
//! them through a mutex with wait-predicates so each transition is
//! atomic without the caller holding any lock itself.

use std::sync::Arc;

use flowctl_election::ServiceGroupIdentifier;
use futures::future;
use parking_lot::{Condvar, Mutex};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::{ContextResult, Error};
use crate::traits::OwnedContext;
use crate::types::CloseHandle;

/// Start/stop state of a guarded sub-service.
///
/// Variant order matters: everything up to and including `Running` still
/// accepts a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum GuardState {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

struct GuardInner {
    delegate: Arc<dyn OwnedContext>,
    state: Mutex<GuardState>,
    state_changed: Condvar,
}

impl GuardInner {
    fn transition(&self, to: GuardState) {
        let mut state = self.state.lock();
        *state = to;
        self.state_changed.notify_all();
    }
}

/// Decorator enforcing the start/stop state machine on one sub-service.
pub struct GuardedContext {
    inner: Arc<GuardInner>,
    executor: Handle,
}

impl GuardedContext {
    /// Wrap a sub-service. Background closes run on `executor`.
    pub fn new(delegate: Arc<dyn OwnedContext>, executor: Handle) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                delegate,
                state: Mutex::new(GuardState::New),
                state_changed: Condvar::new(),
            }),
            executor,
        }
    }

    /// Service group of the wrapped sub-service.
    pub fn identifier(&self) -> ServiceGroupIdentifier {
        self.inner.delegate.identifier()
    }

    /// Start the wrapped sub-service on the calling thread.
    ///
    /// Permitted only from `New` or `Terminated`; an in-flight stop is
    /// waited out first. A start request in any other state signals an
    /// upstream coordination bug and is returned as an invalid-state
    /// error rather than absorbed.
    pub fn instantiate(&self) -> ContextResult<()> {
        {
            let mut state = self.inner.state.lock();
            while *state == GuardState::Stopping {
                self.inner.state_changed.wait(&mut state);
            }
            match *state {
                GuardState::New | GuardState::Terminated => *state = GuardState::Starting,
                other => {
                    return Err(Error::invalid_state(format!(
                        "service {} cannot start from {:?}",
                        self.inner.delegate.identifier(),
                        other
                    )));
                }
            }
        }

        match self.inner.delegate.instantiate_service_instance() {
            Ok(()) => {
                // A stop may have been accepted while the delegate was
                // still starting; its state transition wins over ours.
                let mut state = self.inner.state.lock();
                if *state == GuardState::Starting {
                    *state = GuardState::Running;
                    self.inner.state_changed.notify_all();
                    debug!("Service {} started", self.inner.delegate.identifier());
                }
                Ok(())
            }
            Err(err) => {
                self.inner.transition(GuardState::Failed);
                Err(err)
            }
        }
    }

    /// Stop the wrapped sub-service without blocking the caller.
    ///
    /// Accepted while the service is at most `Running` (a stop racing a
    /// start is fine; the start settles first under the guard's lock).
    /// Stop is idempotent: once the service is already stopping or
    /// stopped, the state is forced to `Terminated` and an
    /// already-successful handle is returned.
    pub fn close_service_instance(&self) -> CloseHandle {
        {
            let mut state = self.inner.state.lock();
            if *state > GuardState::Running {
                *state = GuardState::Terminated;
                return Box::pin(future::ready(Ok(())));
            }
            *state = GuardState::Stopping;
        }

        let inner = self.inner.clone();
        let task = self.executor.spawn(async move {
            let result = inner.delegate.close_service_instance().await;
            match &result {
                Ok(()) => inner.transition(GuardState::Terminated),
                Err(err) => {
                    warn!(
                        "Service {} failed to stop: {}",
                        inner.delegate.identifier(),
                        err
                    );
                    inner.transition(GuardState::Failed);
                }
            }
            result
        });

        Box::pin(async move { task.await? })
    }

    /// Hard-fail teardown. The state is pinned to `Failed` before the
    /// delegate is asked to close, so a partially started service cannot
    /// be restarted while its close is still in flight.
    pub fn close(&self) -> ContextResult<()> {
        {
            let mut state = self.inner.state.lock();
            if *state == GuardState::Failed {
                return Err(Error::invalid_state(format!(
                    "service {} already failed",
                    self.inner.delegate.identifier()
                )));
            }
            *state = GuardState::Failed;
            self.inner.state_changed.notify_all();
        }

        let inner = self.inner.clone();
        self.executor.spawn(async move {
            if let Err(err) = inner.delegate.close_service_instance().await {
                warn!(
                    "Service {} failed to close: {}",
                    inner.delegate.identifier(),
                    err
                );
            }
        });
        Ok(())
    }
}
