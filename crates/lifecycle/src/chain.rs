//! Per-device context chain
//!
//! A [`ContextChain`] owns every sub-service of one connected device plus
//! its primary and auxiliary connections, and tracks the device's
//! mastership. Promotion to master is gated on four independent readiness
//! flags reported by independent subsystems; the fifth flag (initial flow
//! registry fill) is advisory only.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use flowctl_election::ElectionProvider;

use crate::error::{ContextResult, Error};
use crate::guard::GuardedContext;
use crate::singleton::ChainSingleton;
use crate::traits::{
    ConnectionContext, DeviceContext, DeviceRemovedHandler, MastershipWatcher, OwnedContext,
    StatisticsContext,
};
use crate::types::{
    ChainLifecycleState, CloseHandle, ConnectionState, ContextChainState, DatapathId,
    MastershipState, RoleFuture,
};

/// Outcome of a chain's first role negotiation, observed through
/// [`ContextChain::wait_for_role`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoleResolution {
    Pending,
    Master,
    Slave,
    StartFailed,
}

/// Coordinator for one device's sub-services and mastership status.
pub struct ContextChain {
    device: DatapathId,
    primary_connection: Arc<dyn ConnectionContext>,
    auxiliary_connections: Mutex<Vec<Arc<dyn ConnectionContext>>>,
    contexts: Mutex<Vec<Arc<GuardedContext>>>,
    device_context: Arc<dyn DeviceContext>,
    statistics_context: Arc<dyn StatisticsContext>,
    watcher: Arc<dyn MastershipWatcher>,
    singleton: Mutex<Option<Arc<ChainSingleton>>>,

    chain_state: Mutex<ContextChainState>,
    lifecycle_state: Mutex<ChainLifecycleState>,
    role_tx: watch::Sender<RoleResolution>,

    // Readiness flags, independent and monotonic within one promotion
    // cycle. The mastered check is a plain conjunction, so no ordering
    // between them is required.
    master_on_device: AtomicBool,
    initial_gathering: AtomicBool,
    initial_submitting: AtomicBool,
    registry_filling: AtomicBool,
    rpc_registration: AtomicBool,

    instantiated: AtomicBool,
    executor: Handle,
}

impl ContextChain {
    /// Create a chain for a device's primary connection.
    pub fn new(
        primary_connection: Arc<dyn ConnectionContext>,
        device_context: Arc<dyn DeviceContext>,
        statistics_context: Arc<dyn StatisticsContext>,
        watcher: Arc<dyn MastershipWatcher>,
        executor: Handle,
    ) -> Self {
        let device = primary_connection.datapath_id();
        let (role_tx, _) = watch::channel(RoleResolution::Pending);
        Self {
            device,
            primary_connection,
            auxiliary_connections: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
            device_context,
            statistics_context,
            watcher,
            singleton: Mutex::new(None),
            chain_state: Mutex::new(ContextChainState::Undefined),
            lifecycle_state: Mutex::new(ChainLifecycleState::Initialization),
            role_tx,
            master_on_device: AtomicBool::new(false),
            initial_gathering: AtomicBool::new(false),
            initial_submitting: AtomicBool::new(false),
            registry_filling: AtomicBool::new(false),
            rpc_registration: AtomicBool::new(false),
            instantiated: AtomicBool::new(false),
            executor,
        }
    }

    /// The device this chain coordinates.
    pub fn datapath_id(&self) -> DatapathId {
        self.device
    }

    /// Current role of this node towards the device.
    pub fn context_chain_state(&self) -> ContextChainState {
        *self.chain_state.lock()
    }

    /// Current lifecycle state of the chain.
    pub fn lifecycle_state(&self) -> ChainLifecycleState {
        *self.lifecycle_state.lock()
    }

    /// Whether `connection` is this chain's primary connection.
    pub fn uses_primary_connection(&self, connection: &Arc<dyn ConnectionContext>) -> bool {
        Arc::ptr_eq(&self.primary_connection, connection)
    }

    /// State of the chain's primary connection.
    pub fn primary_connection_state(&self) -> ConnectionState {
        self.primary_connection.state()
    }

    /// Append a sub-service to the start-order list, wrapping it in a
    /// lifecycle guard. Valid only before the chain is first started.
    pub fn add_context(&self, context: Arc<dyn OwnedContext>) -> ContextResult<()> {
        if self.instantiated.load(Ordering::SeqCst) {
            return Err(Error::invalid_state(format!(
                "chain for device {} already instantiated, cannot add context {}",
                self.device,
                context.identifier()
            )));
        }
        self.contexts
            .lock()
            .push(Arc::new(GuardedContext::new(context, self.executor.clone())));
        Ok(())
    }

    /// Attach the cluster singleton adapter created for this chain.
    pub fn attach_singleton(&self, singleton: Arc<ChainSingleton>) {
        *self.singleton.lock() = Some(singleton);
    }

    /// Register this chain as an election candidate and move to the
    /// `Working` lifecycle state.
    pub fn register_with_election(&self, provider: &dyn ElectionProvider) -> ContextResult<()> {
        let singleton = self
            .singleton
            .lock()
            .clone()
            .ok_or_else(|| Error::invalid_state("chain has no singleton adapter attached"))?;
        singleton.register_service(provider)?;
        *self.lifecycle_state.lock() = ChainLifecycleState::Working;
        info!("Context chain for device {} is working", self.device);
        Ok(())
    }

    /// Register a callback fired exactly once when the chain closes.
    pub fn register_device_removed_handler(
        &self,
        handler: Arc<dyn DeviceRemovedHandler>,
    ) -> ContextResult<()> {
        let singleton = self
            .singleton
            .lock()
            .clone()
            .ok_or_else(|| Error::invalid_state("chain has no singleton adapter attached"))?;
        singleton.register_device_removed_handler(handler);
        Ok(())
    }

    /// Start every sub-service synchronously, in registration order.
    ///
    /// Invoked by the election adapter when this node becomes leader for
    /// the device; by contract it must complete, or fail, before the
    /// framework treats the node as active. The error is returned to the
    /// adapter, which reports it through the mastership watcher.
    pub fn instantiate(&self) -> ContextResult<()> {
        self.instantiated.store(true, Ordering::SeqCst);
        info!("Starting services for device {}", self.device);

        let contexts: Vec<_> = self.contexts.lock().clone();
        for context in contexts {
            context.instantiate().map_err(|err| {
                Error::startup_failed(format!(
                    "service {} for device {}: {}",
                    context.identifier(),
                    self.device,
                    err
                ))
            })?;
        }
        Ok(())
    }

    /// Tear down the service instances on mastership loss.
    ///
    /// The watcher learns about the slave role immediately, so dependents
    /// stop treating this node as master with no delay; sub-services are
    /// then closed in reverse registration order, best-effort. The handle
    /// completes once every close has finished or failed.
    pub fn close_service_instance(&self) -> CloseHandle {
        info!("Closing service instances for device {}", self.device);
        self.watcher.on_slave_role_acquired(self.device);

        let handles: Vec<CloseHandle> = {
            let contexts = self.contexts.lock();
            contexts
                .iter()
                .rev()
                .map(|context| context.close_service_instance())
                .collect()
        };

        let device = self.device;
        Box::pin(async move {
            for result in future::join_all(handles).await {
                if let Err(err) = result {
                    warn!("Service close failed for device {}: {}", device, err);
                }
            }
            Ok(())
        })
    }

    /// Record a readiness signal and report whether the chain holds all
    /// mandatory flags. Promotes the chain to `WorkingMaster` when the
    /// conjunction holds and the signal was not a pure check.
    pub fn is_mastered(&self, signal: MastershipState) -> bool {
        match signal {
            MastershipState::InitialGathering => {
                self.initial_gathering.store(true, Ordering::SeqCst);
                debug!("Device {} reported {}", self.device, signal);
            }
            MastershipState::MasterOnDevice => {
                self.master_on_device.store(true, Ordering::SeqCst);
                debug!("Device {} reported {}", self.device, signal);
            }
            MastershipState::RpcRegistration => {
                self.rpc_registration.store(true, Ordering::SeqCst);
                debug!("Device {} reported {}", self.device, signal);
            }
            MastershipState::InitialSubmit => {
                self.initial_submitting.store(true, Ordering::SeqCst);
                debug!("Device {} reported {}", self.device, signal);
            }
            MastershipState::InitialFlowRegistryFill => {
                self.registry_filling.store(true, Ordering::SeqCst);
                // Registry fill also emits the same readiness snapshot a
                // plain check does.
                self.trace_readiness();
            }
            MastershipState::Check => self.trace_readiness(),
        }

        let mastered = self.master_on_device.load(Ordering::SeqCst)
            && self.initial_gathering.load(Ordering::SeqCst)
            && self.initial_submitting.load(Ordering::SeqCst)
            && self.rpc_registration.load(Ordering::SeqCst);

        if mastered && signal != MastershipState::Check {
            let mut role = self.chain_state.lock();
            if *role != ContextChainState::WorkingMaster {
                *role = ContextChainState::WorkingMaster;
                if self.registry_filling.load(Ordering::SeqCst) {
                    info!("Device {} is able to work as master", self.device);
                } else {
                    info!(
                        "Device {} is able to work as master, initial flow registry fill not finished",
                        self.device
                    );
                }
                drop(role);
                self.role_tx.send_replace(RoleResolution::Master);
            }
        }
        mastered
    }

    /// Demote the node's wire role on the device, asynchronously. The
    /// readiness flags are reset up front regardless of the outcome; the
    /// watcher learns whether the demotion succeeded. Never fails the
    /// caller.
    pub fn make_device_slave(&self) {
        self.reset_flags();
        let device = self.device;
        let device_context = self.device_context.clone();
        let watcher = self.watcher.clone();
        self.executor.spawn(async move {
            match device_context.make_device_slave().await {
                Ok(()) => {
                    info!("Device {} wire role set to SLAVE", device);
                    watcher.on_slave_role_acquired(device);
                }
                Err(err) => {
                    warn!("Not able to set SLAVE role on device {}: {}", device, err);
                    watcher.on_slave_role_not_acquired(device, &err.to_string());
                }
            }
        });
    }

    /// Move the chain's role to `WorkingSlave` without touching the wire,
    /// used when there is no live connection left to negotiate with.
    pub fn make_context_chain_state_slave(&self) {
        self.reset_flags();
        {
            let mut role = self.chain_state.lock();
            if *role != ContextChainState::WorkingSlave {
                info!("Device {} working as SLAVE", self.device);
                *role = ContextChainState::WorkingSlave;
            }
        }
        self.role_tx.send_replace(RoleResolution::Slave);
    }

    /// Resume statistics initialization after reconciliation and re-check
    /// promotion.
    pub async fn continue_initialization(&self) {
        match self.statistics_context.continue_initialization().await {
            Ok(()) => {
                self.is_mastered(MastershipState::InitialSubmit);
            }
            Err(err) => {
                warn!(
                    "Reconciliation for device {} did not complete: {}",
                    self.device, err
                );
                self.watcher
                    .on_not_able_to_start_mastership(self.device, &err.to_string(), false);
            }
        }
    }

    /// Record that the chain's services could not be started, resolving
    /// any pending role waiters.
    pub fn mark_start_failed(&self) {
        self.role_tx.send_replace(RoleResolution::StartFailed);
    }

    /// Accept an auxiliary connection. Rejected when the connection is a
    /// primary one or when the chain's primary connection is already gone.
    pub fn add_auxiliary_connection(&self, connection: Arc<dyn ConnectionContext>) -> bool {
        if connection.auxiliary_id() == 0 {
            return false;
        }
        if self.primary_connection.state() == ConnectionState::Rip {
            return false;
        }
        self.auxiliary_connections.lock().push(connection);
        true
    }

    /// Drop an auxiliary connection. Returns whether the connection was
    /// one of this chain's auxiliaries.
    pub fn auxiliary_connection_dropped(&self, connection: &Arc<dyn ConnectionContext>) -> bool {
        let mut auxiliaries = self.auxiliary_connections.lock();
        let before = auxiliaries.len();
        auxiliaries.retain(|candidate| !Arc::ptr_eq(candidate, connection));
        before != auxiliaries.len()
    }

    /// Terminal teardown. Idempotent: only the first call has any effect.
    ///
    /// Closes every connection and sub-service, withdraws the election
    /// candidate and fires the device-removed handlers exactly once. The
    /// sub-service close order is not significant here, the device is
    /// already gone.
    pub async fn close(&self) {
        {
            let mut lifecycle = self.lifecycle_state.lock();
            if *lifecycle == ChainLifecycleState::Termination {
                debug!("Context chain for device {} already terminated", self.device);
                return;
            }
            *lifecycle = ChainLifecycleState::Termination;
        }
        info!("Closing context chain for device {}", self.device);
        self.watcher.on_slave_role_acquired(self.device);

        let auxiliaries: Vec<_> = {
            let mut auxiliaries = self.auxiliary_connections.lock();
            auxiliaries.drain(..).collect()
        };
        for connection in auxiliaries {
            connection.close_connection();
        }
        self.primary_connection.close_connection();

        let handles: Vec<CloseHandle> = {
            let contexts = self.contexts.lock();
            contexts
                .iter()
                .map(|context| context.close_service_instance())
                .collect()
        };
        for result in future::join_all(handles).await {
            if let Err(err) = result {
                warn!("Service close failed for device {}: {}", self.device, err);
            }
        }

        if let Some(singleton) = self.singleton.lock().take() {
            singleton.close();
        }

        self.role_tx.send_if_modified(|resolution| {
            if *resolution == RoleResolution::Pending {
                *resolution = RoleResolution::Slave;
                true
            } else {
                false
            }
        });
    }

    /// Handle resolving once the chain promotes to master, settles as
    /// slave, or fails to start.
    pub fn wait_for_role(&self) -> RoleFuture {
        let mut role_rx = self.role_tx.subscribe();
        let device = self.device;
        Box::pin(async move {
            loop {
                let resolution = *role_rx.borrow_and_update();
                match resolution {
                    RoleResolution::Master => return Ok(ContextChainState::WorkingMaster),
                    RoleResolution::Slave => return Ok(ContextChainState::WorkingSlave),
                    RoleResolution::StartFailed => {
                        return Err(Error::startup_failed(format!(
                            "services for device {device} could not be started"
                        )));
                    }
                    RoleResolution::Pending => {}
                }
                if role_rx.changed().await.is_err() {
                    return Err(Error::invalid_state(format!(
                        "chain for device {device} dropped before role resolution"
                    )));
                }
            }
        })
    }

    fn reset_flags(&self) {
        self.master_on_device.store(false, Ordering::SeqCst);
        self.initial_gathering.store(false, Ordering::SeqCst);
        self.initial_submitting.store(false, Ordering::SeqCst);
        self.registry_filling.store(false, Ordering::SeqCst);
        self.rpc_registration.store(false, Ordering::SeqCst);
    }

    fn trace_readiness(&self) {
        trace!(
            "Device {} readiness: master_on_device={} initial_gathering={} initial_submitting={} registry_filling={} rpc_registration={}",
            self.device,
            self.master_on_device.load(Ordering::SeqCst),
            self.initial_gathering.load(Ordering::SeqCst),
            self.initial_submitting.load(Ordering::SeqCst),
            self.registry_filling.load(Ordering::SeqCst),
            self.rpc_registration.load(Ordering::SeqCst),
        );
    }
}
