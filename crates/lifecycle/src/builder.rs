//! Assembly of a device's sub-service list
//!
//! Pure construction: given a new primary connection, build the device,
//! RPC and statistics contexts through their managers and fix the order
//! in which the chain starts them. Inbound data-plane filtering is turned
//! on before any context exists, so no traffic is processed while the
//! contexts are still being wired.

use std::sync::Arc;

use tracing::debug;

use crate::traits::{
    ConnectionContext, DeviceContext, DeviceContextManager, MastershipWatcher, OwnedContext,
    RpcContext, RpcContextManager, StatisticsContext, StatisticsContextManager,
};

/// Builder of the ordered sub-service list for a new device connection.
pub struct ContextListBuilder {
    device_manager: Arc<dyn DeviceContextManager>,
    rpc_manager: Arc<dyn RpcContextManager>,
    statistics_manager: Arc<dyn StatisticsContextManager>,
}

/// The sub-services of one device, in start order.
pub struct BuiltContexts {
    /// The device context.
    pub device: Arc<dyn DeviceContext>,
    /// The RPC context, built on top of the device context.
    pub rpc: Arc<dyn RpcContext>,
    /// The statistics context, built on top of the device context.
    pub statistics: Arc<dyn StatisticsContext>,
}

impl BuiltContexts {
    /// The start order; reversed, it is the stop order.
    pub fn ordered(&self) -> Vec<Arc<dyn OwnedContext>> {
        vec![
            self.device.clone(),
            self.rpc.clone(),
            self.statistics.clone(),
        ]
    }
}

impl ContextListBuilder {
    /// Create a builder over the three registered managers.
    pub fn new(
        device_manager: Arc<dyn DeviceContextManager>,
        rpc_manager: Arc<dyn RpcContextManager>,
        statistics_manager: Arc<dyn StatisticsContextManager>,
    ) -> Self {
        Self {
            device_manager,
            rpc_manager,
            statistics_manager,
        }
    }

    /// Build the sub-services for `connection` and announce the device
    /// context as published.
    pub fn build(
        &self,
        connection: &Arc<dyn ConnectionContext>,
        watcher: &Arc<dyn MastershipWatcher>,
    ) -> BuiltContexts {
        let device_id = connection.datapath_id();
        connection.enable_inbound_filtering();

        let device = self
            .device_manager
            .create_context(connection.clone(), watcher.clone());
        debug!("Device context created for device {}", device_id);

        let rpc = self.rpc_manager.create_context(&device, watcher.clone());
        debug!("RPC context created for device {}", device_id);

        let statistics = self
            .statistics_manager
            .create_context(&device, watcher.clone());
        debug!("Statistics context created for device {}", device_id);

        device.on_published();
        BuiltContexts {
            device,
            rpc,
            statistics,
        }
    }
}
