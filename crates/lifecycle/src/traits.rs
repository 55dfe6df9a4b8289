//! Traits at the boundary of the context chain subsystem
//!
//! The chain coordinates collaborators it does not implement: connections
//! owned by the connection layer, sub-services built by external managers,
//! and a watcher consumed by the surrounding orchestration. Everything
//! here is a seam; the concrete implementations live outside this crate.

use std::sync::Arc;

use async_trait::async_trait;
use flowctl_election::ServiceGroupIdentifier;

use crate::error::ContextResult;
use crate::types::{ConnectionState, DatapathId, MastershipState};

/// A physical connection to a device.
///
/// A device has exactly one primary connection (`auxiliary_id() == 0`)
/// and zero or more auxiliary connections.
pub trait ConnectionContext: Send + Sync + 'static {
    /// Datapath id of the device behind this connection.
    fn datapath_id(&self) -> DatapathId;

    /// Auxiliary id, 0 for the primary connection.
    fn auxiliary_id(&self) -> u8;

    /// Current state of the connection.
    fn state(&self) -> ConnectionState;

    /// Hold inbound data-plane traffic until the device's contexts are
    /// fully wired.
    fn enable_inbound_filtering(&self);

    /// Close the connection.
    fn close_connection(&self);
}

/// A sub-service owned by exactly one context chain.
///
/// `instantiate_service_instance` is synchronous by contract; the chain
/// must not be considered started until it returns.
/// `close_service_instance` is asynchronous and best-effort.
#[async_trait]
pub trait OwnedContext: Send + Sync + 'static {
    /// Service group this context belongs to.
    fn identifier(&self) -> ServiceGroupIdentifier;

    /// Start the service instance on the calling thread.
    fn instantiate_service_instance(&self) -> ContextResult<()>;

    /// Release the service instance.
    async fn close_service_instance(&self) -> ContextResult<()>;
}

/// The device sub-service: transaction chains, the device's operational
/// representation, and its wire role.
#[async_trait]
pub trait DeviceContext: OwnedContext {
    /// The device context is fully wired and visible to other subsystems.
    fn on_published(&self);

    /// Demote the node's wire role on the device to SLAVE.
    async fn make_device_slave(&self) -> ContextResult<()>;
}

/// The RPC sub-service.
pub trait RpcContext: OwnedContext {}

/// The statistics sub-service.
#[async_trait]
pub trait StatisticsContext: OwnedContext {
    /// Resume initial statistics gathering after reconciliation.
    async fn continue_initialization(&self) -> ContextResult<()>;
}

/// Callback invoked exactly once when a device's chain is closed for good.
pub trait DeviceRemovedHandler: Send + Sync + 'static {
    /// The device was removed from the controller.
    fn on_device_removed(&self, device: DatapathId);
}

/// Observer of per-device mastership changes.
pub trait MastershipWatcher: Send + Sync + 'static {
    /// A readiness signal was reported for the device.
    fn on_master_role_acquired(&self, device: DatapathId, signal: MastershipState);

    /// The device's chain could not be started. When `mandatory` is set
    /// the chain cannot function and should be torn down.
    fn on_not_able_to_start_mastership(&self, device: DatapathId, reason: &str, mandatory: bool);

    /// The node settled into the slave role for the device.
    fn on_slave_role_acquired(&self, device: DatapathId);

    /// Demoting the node's wire role failed.
    fn on_slave_role_not_acquired(&self, device: DatapathId, reason: &str);
}

/// Builder of device sub-services, one per connected device.
pub trait DeviceContextManager: DeviceRemovedHandler {
    /// Create the device context for a new primary connection.
    fn create_context(
        &self,
        connection: Arc<dyn ConnectionContext>,
        watcher: Arc<dyn MastershipWatcher>,
    ) -> Arc<dyn DeviceContext>;
}

/// Builder of RPC sub-services.
pub trait RpcContextManager: DeviceRemovedHandler {
    /// Create the RPC context on top of an existing device context.
    fn create_context(
        &self,
        device: &Arc<dyn DeviceContext>,
        watcher: Arc<dyn MastershipWatcher>,
    ) -> Arc<dyn RpcContext>;
}

/// Builder of statistics sub-services.
pub trait StatisticsContextManager: DeviceRemovedHandler {
    /// Create the statistics context on top of an existing device context.
    fn create_context(
        &self,
        device: &Arc<dyn DeviceContext>,
        watcher: Arc<dyn MastershipWatcher>,
    ) -> Arc<dyn StatisticsContext>;
}
