//! Cluster singleton adapter for one context chain
//!
//! Bridges a [`ContextChain`] to the external leader-election primitive:
//! the framework's elected/lost callbacks become chain start/stop, and
//! chain teardown withdraws the candidate and fires the device-removed
//! handlers exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use flowctl_election::{
    ElectionCandidate, ElectionError, ElectionProvider, ElectionRegistration,
    ServiceGroupIdentifier,
};

use crate::chain::ContextChain;
use crate::error::{ContextResult, Error};
use crate::traits::{DeviceRemovedHandler, MastershipWatcher};
use crate::types::DatapathId;

/// Election candidate standing in for one device's context chain.
pub struct ChainSingleton {
    device: DatapathId,
    identifier: ServiceGroupIdentifier,
    chain: Mutex<Weak<ContextChain>>,
    watcher: Arc<dyn MastershipWatcher>,
    registration: Mutex<Option<Box<dyn ElectionRegistration>>>,
    device_removed_handlers: Mutex<Vec<Arc<dyn DeviceRemovedHandler>>>,
    closed: AtomicBool,
}

impl ChainSingleton {
    /// Create the adapter for a device. The chain is bound separately
    /// once it has been constructed.
    pub fn new(device: DatapathId, watcher: Arc<dyn MastershipWatcher>) -> Self {
        Self {
            device,
            identifier: ServiceGroupIdentifier::new(format!("openflow:{device}")),
            chain: Mutex::new(Weak::new()),
            watcher,
            registration: Mutex::new(None),
            device_removed_handlers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Bind the chain this adapter drives. The adapter holds the chain
    /// weakly; registry ownership decides the chain's lifetime.
    pub fn bind_chain(&self, chain: &Arc<ContextChain>) {
        *self.chain.lock() = Arc::downgrade(chain);
    }

    /// Append a handler fired once when the device is removed.
    pub fn register_device_removed_handler(&self, handler: Arc<dyn DeviceRemovedHandler>) {
        self.device_removed_handlers.lock().push(handler);
    }

    /// Register this adapter as an election candidate. A provider that
    /// cannot produce a registration is a fatal configuration error.
    pub fn register_service(
        self: &Arc<Self>,
        provider: &dyn ElectionProvider,
    ) -> ContextResult<()> {
        let registration = provider.register(self.clone()).map_err(|err| {
            Error::configuration(format!(
                "election registration for device {} failed: {err}",
                self.device
            ))
        })?;
        *self.registration.lock() = Some(registration);
        debug!("Election candidate registered for device {}", self.device);
        Ok(())
    }

    /// Withdraw the candidate and fire the device-removed handlers.
    /// Idempotent; handlers run exactly once. A failing registration
    /// close is logged and swallowed.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let handlers: Vec<_> = {
            let mut handlers = self.device_removed_handlers.lock();
            handlers.drain(..).collect()
        };
        for handler in handlers {
            handler.on_device_removed(self.device);
        }

        if let Some(registration) = self.registration.lock().take() {
            if let Err(err) = registration.close() {
                warn!(
                    "Failed to close election registration for device {}: {}",
                    self.device, err
                );
            }
        }
    }
}

#[async_trait]
impl ElectionCandidate for ChainSingleton {
    fn identifier(&self) -> ServiceGroupIdentifier {
        self.identifier.clone()
    }

    fn instantiate_service_instance(&self) {
        let Some(chain) = self.chain.lock().upgrade() else {
            debug!(
                "Elected for device {} but its chain is already gone",
                self.device
            );
            return;
        };

        info!("Elected master candidate for device {}", self.device);
        if let Err(err) = chain.instantiate() {
            warn!(
                "Not able to start mastership for device {}: {}",
                self.device, err
            );
            chain.mark_start_failed();
            self.watcher
                .on_not_able_to_start_mastership(self.device, &err.to_string(), true);
        }
    }

    async fn close_service_instance(&self) -> Result<(), ElectionError> {
        let Some(chain) = self.chain.lock().upgrade() else {
            return Ok(());
        };
        chain
            .close_service_instance()
            .await
            .map_err(|err| ElectionError::Shutdown(err.to_string()))
    }
}
