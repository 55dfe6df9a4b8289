//! Process-wide registry of context chains
//!
//! The holder is the exclusive owner of chain identity: it is the only
//! component that creates or destroys chains, and every other component
//! must resolve a device to its current chain through it. Holding on to
//! a chain across a disconnect is unsound, the stale chain may already
//! be terminating.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use flowctl_election::ElectionProvider;

use crate::builder::ContextListBuilder;
use crate::chain::ContextChain;
use crate::config::HolderConfig;
use crate::error::{ContextResult, Error};
use crate::singleton::ChainSingleton;
use crate::traits::{
    ConnectionContext, DeviceContextManager, MastershipWatcher, RpcContextManager,
    StatisticsContextManager,
};
use crate::types::{
    ChainLifecycleState, ConnectionState, ConnectionStatus, ContextChainState, DatapathId,
    MastershipState, RoleFuture,
};

/// One of the external sub-service builders the holder composes chains
/// from. Registration order does not matter; start order is fixed by the
/// context list builder.
pub enum ContextManager {
    /// The device context builder.
    Device(Arc<dyn DeviceContextManager>),
    /// The RPC context builder.
    Rpc(Arc<dyn RpcContextManager>),
    /// The statistics context builder.
    Statistics(Arc<dyn StatisticsContextManager>),
}

/// Registry mapping each connected device to its context chain and its
/// most recent connection.
pub struct ContextChainHolder {
    config: HolderConfig,
    chains: DashMap<DatapathId, Arc<ContextChain>>,
    connections: DashMap<DatapathId, Arc<dyn ConnectionContext>>,
    device_manager: Mutex<Option<Arc<dyn DeviceContextManager>>>,
    rpc_manager: Mutex<Option<Arc<dyn RpcContextManager>>>,
    statistics_manager: Mutex<Option<Arc<dyn StatisticsContextManager>>>,
    provider: Arc<dyn ElectionProvider>,
    executor: Handle,
    self_ref: Weak<Self>,
    role_timer_running: AtomicBool,
    shutdown: watch::Sender<bool>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ContextChainHolder {
    /// Create the holder. Background work (role checks, deferred
    /// teardown) runs on `executor`.
    pub fn new(
        provider: Arc<dyn ElectionProvider>,
        config: HolderConfig,
        executor: Handle,
    ) -> Arc<Self> {
        info!("Context chain holder created");
        let (shutdown, _) = watch::channel(false);
        Arc::new_cyclic(|self_ref| Self {
            config,
            chains: DashMap::new(),
            connections: DashMap::new(),
            device_manager: Mutex::new(None),
            rpc_manager: Mutex::new(None),
            statistics_manager: Mutex::new(None),
            provider,
            executor,
            self_ref: self_ref.clone(),
            role_timer_running: AtomicBool::new(false),
            shutdown,
            background_tasks: Mutex::new(Vec::new()),
        })
    }

    /// Register a sub-service builder. The first registration per kind
    /// wins; later ones are ignored.
    pub fn add_manager(&self, manager: ContextManager) {
        match manager {
            ContextManager::Device(manager) => {
                let mut slot = self.device_manager.lock();
                if slot.is_none() {
                    trace!("Context chain holder: device manager OK");
                    *slot = Some(manager);
                }
            }
            ContextManager::Rpc(manager) => {
                let mut slot = self.rpc_manager.lock();
                if slot.is_none() {
                    trace!("Context chain holder: RPC manager OK");
                    *slot = Some(manager);
                }
            }
            ContextManager::Statistics(manager) => {
                let mut slot = self.statistics_manager.lock();
                if slot.is_none() {
                    trace!("Context chain holder: statistics manager OK");
                    *slot = Some(manager);
                }
            }
        }
    }

    /// Record the latest known connection for its device.
    pub fn add_connection(&self, connection: Arc<dyn ConnectionContext>) {
        self.connections.insert(connection.datapath_id(), connection);
    }

    /// The current chain for a device, if any. Never retain the result
    /// across a disconnect; fetch it again instead.
    pub fn chain(&self, device: DatapathId) -> Option<Arc<ContextChain>> {
        self.chains.get(&device).map(|entry| entry.value().clone())
    }

    /// Devices this node currently masters.
    pub fn mastered_devices(&self) -> Vec<DatapathId> {
        self.chains
            .iter()
            .filter(|entry| entry.value().context_chain_state() == ContextChainState::WorkingMaster)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Build and register a new chain for a device whose connection was
    /// recorded via [`add_connection`](Self::add_connection). The handle
    /// resolves once the chain promotes, settles as slave, or fails to
    /// start.
    pub fn create_context_chain(&self, device: DatapathId) -> ContextResult<RoleFuture> {
        let connection = self
            .connections
            .get(&device)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found(format!("no connection recorded for device {device}")))?;

        let device_manager = self
            .device_manager
            .lock()
            .clone()
            .ok_or_else(|| Error::configuration("device context manager not registered"))?;
        let rpc_manager = self
            .rpc_manager
            .lock()
            .clone()
            .ok_or_else(|| Error::configuration("RPC context manager not registered"))?;
        let statistics_manager = self
            .statistics_manager
            .lock()
            .clone()
            .ok_or_else(|| Error::configuration("statistics context manager not registered"))?;

        let watcher: Arc<dyn MastershipWatcher> = self
            .self_ref
            .upgrade()
            .ok_or_else(|| Error::internal("holder dropped"))?;

        debug!("Creating a new context chain for device {}", device);
        let builder = ContextListBuilder::new(
            device_manager.clone(),
            rpc_manager.clone(),
            statistics_manager.clone(),
        );
        let built = builder.build(&connection, &watcher);

        let singleton = Arc::new(ChainSingleton::new(device, watcher.clone()));
        singleton.register_device_removed_handler(device_manager);
        singleton.register_device_removed_handler(rpc_manager);
        singleton.register_device_removed_handler(statistics_manager);

        let chain = Arc::new(ContextChain::new(
            connection,
            built.device.clone(),
            built.statistics.clone(),
            watcher,
            self.executor.clone(),
        ));
        for context in built.ordered() {
            chain.add_context(context)?;
        }
        chain.attach_singleton(singleton.clone());
        singleton.bind_chain(&chain);

        self.chains.insert(device, chain.clone());
        self.ensure_role_timer();
        chain.register_with_election(self.provider.as_ref())?;
        Ok(chain.wait_for_role())
    }

    /// A device connected. An auxiliary connection joins the existing
    /// chain; a duplicate primary connection tears the existing chain
    /// down and refuses the newcomer.
    pub async fn device_connected(
        &self,
        connection: Arc<dyn ConnectionContext>,
    ) -> ContextResult<ConnectionStatus> {
        let device = connection.datapath_id();
        info!("Device {} connected", device);

        if let Some(chain) = self.chain(device) {
            return if chain.add_auxiliary_connection(connection) {
                info!("An auxiliary connection was added to device {}", device);
                Ok(ConnectionStatus::MayContinue)
            } else {
                warn!(
                    "Device {} already connected, closing all connections to the device",
                    device
                );
                self.destroy_context_chain(device).await;
                Ok(ConnectionStatus::AlreadyConnected)
            };
        }

        self.add_connection(connection);
        let role = self.create_context_chain(device)?;
        self.observe_role(device, role);
        Ok(ConnectionStatus::MayContinue)
    }

    /// A connection dropped. An auxiliary drop only trims the chain's
    /// auxiliary set; a primary drop closes the chain.
    pub async fn device_disconnected(&self, connection: &Arc<dyn ConnectionContext>) {
        let device = connection.datapath_id();
        let Some(chain) = self.chain(device) else {
            return;
        };
        if chain.auxiliary_connection_dropped(connection) {
            info!("Auxiliary connection from device {} disconnected", device);
            return;
        }
        info!("Device {} disconnected", device);
        self.connection_lost(device).await;
    }

    /// Reconcile the latest recorded connection with whatever chain the
    /// device currently has. A live chain on the same connection is left
    /// alone; a stale or terminating chain is retired first and a fresh
    /// chain is built on the new connection.
    pub async fn pair_connection(&self, device: DatapathId) -> ContextResult<()> {
        let connection = self
            .connections
            .get(&device)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found(format!("no connection recorded for device {device}")))?;

        if let Some(chain) = self.chain(device) {
            if chain.lifecycle_state() != ChainLifecycleState::Termination
                && chain.primary_connection_state() == ConnectionState::Working
                && chain.uses_primary_connection(&connection)
            {
                debug!("Device {} already paired with its chain", device);
                return Ok(());
            }
            info!(
                "Device {} reconnected before its previous chain was retired",
                device
            );
            chain.close().await;
            self.chains
                .remove_if(&device, |_, current| Arc::ptr_eq(current, &chain));
        }

        let role = self.create_context_chain(device)?;
        self.observe_role(device, role);
        Ok(())
    }

    /// The device's primary connection is gone; close its chain. The
    /// registry entry is removed only after the close completes, and only
    /// if a racing reconnect has not already replaced the chain.
    pub async fn connection_lost(&self, device: DatapathId) {
        let Some(chain) = self.chain(device) else {
            return;
        };
        chain.close().await;
        self.chains
            .remove_if(&device, |_, current| Arc::ptr_eq(current, &chain));
        self.connections
            .remove_if(&device, |_, connection| chain.uses_primary_connection(connection));
    }

    /// Permanent device removal: drop the registry entries and close the
    /// chain unconditionally.
    pub async fn destroy_context_chain(&self, device: DatapathId) {
        self.connections.remove(&device);
        if let Some((_, chain)) = self.chains.remove(&device) {
            chain.close().await;
        }
    }

    /// Shut the holder down: stop background work, stop every mastered
    /// chain, close every chain.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<_> = {
            let mut tasks = self.background_tasks.lock();
            tasks.drain(..).collect()
        };
        for task in tasks {
            if let Err(err) = task.await {
                warn!("Error stopping background task: {}", err);
            }
        }

        let chains: Vec<_> = self
            .chains
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for chain in chains {
            if chain.is_mastered(MastershipState::Check) {
                if let Err(err) = chain.close_service_instance().await {
                    warn!(
                        "Failed to stop services for device {}: {}",
                        chain.datapath_id(),
                        err
                    );
                }
            }
            chain.close().await;
        }
        self.chains.clear();
        self.connections.clear();
    }

    /// Log the eventual role of a freshly created chain.
    fn observe_role(&self, device: DatapathId, role: RoleFuture) {
        self.executor.spawn(async move {
            match role.await {
                Ok(state) => debug!("Device {} settled into role {}", device, state),
                Err(err) => debug!("Device {} did not settle a role: {}", device, err),
            }
        });
    }

    /// Periodically demote chains that still have no negotiated role, so
    /// a node that never wins the election settles into a slave
    /// wire-role instead of staying undefined forever. The timer stops
    /// itself once no such chain remains and is re-armed by the next
    /// chain creation.
    fn ensure_role_timer(&self) {
        if self.role_timer_running.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("There is a context chain without a role, starting timer");

        let holder = self.self_ref.clone();
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.config.role_check_interval;
        let task = self.executor.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(holder) = holder.upgrade() else { break };
                        let mut undefined = 0usize;
                        for entry in holder.chains.iter() {
                            let chain = entry.value().clone();
                            if chain.context_chain_state() == ContextChainState::Undefined {
                                undefined += 1;
                                debug!(
                                    "Device {} still has no role, demoting to slave",
                                    chain.datapath_id()
                                );
                                chain.make_device_slave();
                            }
                        }
                        if undefined == 0 {
                            holder.role_timer_running.store(false, Ordering::SeqCst);
                            // A chain registered after the flag flip re-arms
                            // the timer itself; one that slipped in before it
                            // is picked up here instead.
                            let raced = holder.chains.iter().any(|entry| {
                                entry.value().context_chain_state()
                                    == ContextChainState::Undefined
                            });
                            if !raced || holder.role_timer_running.swap(true, Ordering::SeqCst) {
                                debug!("No remaining devices without a role, stopping timer");
                                break;
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("Role check timer shutting down");
                        break;
                    }
                }
            }
        });
        self.background_tasks.lock().push(task);
    }
}

impl MastershipWatcher for ContextChainHolder {
    fn on_master_role_acquired(&self, device: DatapathId, signal: MastershipState) {
        let Some(chain) = self.chain(device) else {
            return;
        };
        if chain.is_mastered(signal) {
            info!("Role MASTER was granted to device {}", device);
        }
    }

    fn on_not_able_to_start_mastership(&self, device: DatapathId, reason: &str, mandatory: bool) {
        warn!(
            "Not able to set MASTER role on device {}, reason: {}",
            device, reason
        );
        if !mandatory {
            return;
        }
        let Some(holder) = self.self_ref.upgrade() else {
            return;
        };
        self.executor.spawn(async move {
            if let Some(chain) = holder.chain(device) {
                if let Err(err) = chain.close_service_instance().await {
                    warn!("Failed to stop services for device {}: {}", device, err);
                }
            }
            holder.destroy_context_chain(device).await;
        });
    }

    fn on_slave_role_acquired(&self, device: DatapathId) {
        if let Some(chain) = self.chain(device) {
            chain.make_context_chain_state_slave();
        }
    }

    fn on_slave_role_not_acquired(&self, device: DatapathId, reason: &str) {
        warn!(
            "Not able to set SLAVE role on device {}, reason: {}",
            device, reason
        );
        let Some(holder) = self.self_ref.upgrade() else {
            return;
        };
        self.executor.spawn(async move {
            holder.destroy_context_chain(device).await;
        });
    }
}
