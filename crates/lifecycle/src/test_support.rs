//! Mock collaborators shared by the unit tests

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use flowctl_election::{
    ElectionCandidate, ElectionError, ElectionProvider, ElectionRegistration,
    ServiceGroupIdentifier,
};

use crate::error::{ContextResult, Error};
use crate::traits::{
    ConnectionContext, DeviceContext, DeviceContextManager, DeviceRemovedHandler,
    MastershipWatcher, OwnedContext, RpcContext, RpcContextManager, StatisticsContext,
    StatisticsContextManager,
};
use crate::types::{ConnectionState, DatapathId, MastershipState};

pub(crate) type SharedLog = Arc<Mutex<Vec<String>>>;

pub(crate) struct MockConnection {
    device: DatapathId,
    auxiliary_id: u8,
    state: Mutex<ConnectionState>,
    filtering: AtomicBool,
    closes: AtomicUsize,
}

impl MockConnection {
    pub(crate) fn primary(device: u64) -> Arc<Self> {
        Self::with_auxiliary_id(device, 0)
    }

    pub(crate) fn auxiliary(device: u64, auxiliary_id: u8) -> Arc<Self> {
        Self::with_auxiliary_id(device, auxiliary_id)
    }

    fn with_auxiliary_id(device: u64, auxiliary_id: u8) -> Arc<Self> {
        Arc::new(Self {
            device: DatapathId::new(device),
            auxiliary_id,
            state: Mutex::new(ConnectionState::Working),
            filtering: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
        })
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn filtering_enabled(&self) -> bool {
        self.filtering.load(Ordering::SeqCst)
    }
}

impl ConnectionContext for MockConnection {
    fn datapath_id(&self) -> DatapathId {
        self.device
    }

    fn auxiliary_id(&self) -> u8 {
        self.auxiliary_id
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn enable_inbound_filtering(&self) {
        self.filtering.store(true, Ordering::SeqCst);
    }

    fn close_connection(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = ConnectionState::Rip;
    }
}

#[derive(Debug, Clone)]
pub(crate) enum WatcherEvent {
    MasterSignal(DatapathId, MastershipState),
    NotAbleToStart(DatapathId, String, bool),
    SlaveAcquired(DatapathId),
    SlaveNotAcquired(DatapathId, String),
}

pub(crate) struct MockWatcher {
    events: Mutex<Vec<WatcherEvent>>,
    notify: Notify,
}

impl MockWatcher {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    fn record(&self, event: WatcherEvent) {
        self.events.lock().push(event);
        self.notify.notify_waiters();
    }

    pub(crate) fn events_of(&self, predicate: impl Fn(&WatcherEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    /// Wait until at least one matching event was recorded.
    pub(crate) async fn wait_for(&self, predicate: impl Fn(&WatcherEvent) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if self.events_of(&predicate) > 0 {
                    return;
                }
                let notified = self.notify.notified();
                if self.events_of(&predicate) > 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("watcher event not recorded in time");
    }
}

impl MastershipWatcher for MockWatcher {
    fn on_master_role_acquired(&self, device: DatapathId, signal: MastershipState) {
        self.record(WatcherEvent::MasterSignal(device, signal));
    }

    fn on_not_able_to_start_mastership(&self, device: DatapathId, reason: &str, mandatory: bool) {
        self.record(WatcherEvent::NotAbleToStart(
            device,
            reason.to_string(),
            mandatory,
        ));
    }

    fn on_slave_role_acquired(&self, device: DatapathId) {
        self.record(WatcherEvent::SlaveAcquired(device));
    }

    fn on_slave_role_not_acquired(&self, device: DatapathId, reason: &str) {
        self.record(WatcherEvent::SlaveNotAcquired(device, reason.to_string()));
    }
}

pub(crate) struct MockContext {
    name: String,
    log: SharedLog,
    fail_start: bool,
}

impl MockContext {
    pub(crate) fn shared_log() -> SharedLog {
        Arc::new(Mutex::new(Vec::new()))
    }

    pub(crate) fn in_log(name: &str, log: &SharedLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: log.clone(),
            fail_start: false,
        })
    }

    pub(crate) fn failing_start(name: &str, log: &SharedLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: log.clone(),
            fail_start: true,
        })
    }
}

#[async_trait]
impl OwnedContext for MockContext {
    fn identifier(&self) -> ServiceGroupIdentifier {
        ServiceGroupIdentifier::new(format!("mock:{}", self.name))
    }

    fn instantiate_service_instance(&self) -> ContextResult<()> {
        self.log.lock().push(format!("start {}", self.name));
        if self.fail_start {
            Err(Error::startup_failed(format!("{} refused to start", self.name)))
        } else {
            Ok(())
        }
    }

    async fn close_service_instance(&self) -> ContextResult<()> {
        self.log.lock().push(format!("close {}", self.name));
        Ok(())
    }
}

pub(crate) struct MockDeviceContext {
    name: String,
    log: Option<SharedLog>,
    published: AtomicBool,
    fail_slave: bool,
}

impl MockDeviceContext {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: None,
            published: AtomicBool::new(false),
            fail_slave: false,
        })
    }

    pub(crate) fn in_log(name: &str, log: &SharedLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: Some(log.clone()),
            published: AtomicBool::new(false),
            fail_slave: false,
        })
    }

    pub(crate) fn failing_slave(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: None,
            published: AtomicBool::new(false),
            fail_slave: true,
        })
    }

    pub(crate) fn published(&self) -> bool {
        self.published.load(Ordering::SeqCst)
    }

    fn record(&self, action: &str) {
        if let Some(log) = &self.log {
            log.lock().push(format!("{action} {}", self.name));
        }
    }
}

#[async_trait]
impl OwnedContext for MockDeviceContext {
    fn identifier(&self) -> ServiceGroupIdentifier {
        ServiceGroupIdentifier::new(format!("mock:{}", self.name))
    }

    fn instantiate_service_instance(&self) -> ContextResult<()> {
        self.record("start");
        Ok(())
    }

    async fn close_service_instance(&self) -> ContextResult<()> {
        self.record("close");
        Ok(())
    }
}

#[async_trait]
impl DeviceContext for MockDeviceContext {
    fn on_published(&self) {
        self.published.store(true, Ordering::SeqCst);
    }

    async fn make_device_slave(&self) -> ContextResult<()> {
        if self.fail_slave {
            Err(Error::internal("wire role change refused"))
        } else {
            Ok(())
        }
    }
}

pub(crate) struct MockRpcContext {
    inner: MockContext,
}

impl MockRpcContext {
    pub(crate) fn in_log(name: &str, log: &SharedLog) -> Arc<Self> {
        Arc::new(Self {
            inner: MockContext {
                name: name.to_string(),
                log: log.clone(),
                fail_start: false,
            },
        })
    }
}

#[async_trait]
impl OwnedContext for MockRpcContext {
    fn identifier(&self) -> ServiceGroupIdentifier {
        self.inner.identifier()
    }

    fn instantiate_service_instance(&self) -> ContextResult<()> {
        self.inner.instantiate_service_instance()
    }

    async fn close_service_instance(&self) -> ContextResult<()> {
        self.inner.close_service_instance().await
    }
}

impl RpcContext for MockRpcContext {}

pub(crate) struct MockStatisticsContext {
    name: String,
    log: Option<SharedLog>,
    fail_reconciliation: bool,
}

impl MockStatisticsContext {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: None,
            fail_reconciliation: false,
        })
    }

    pub(crate) fn in_log(name: &str, log: &SharedLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: Some(log.clone()),
            fail_reconciliation: false,
        })
    }

    pub(crate) fn failing_reconciliation(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: None,
            fail_reconciliation: true,
        })
    }

    fn record(&self, action: &str) {
        if let Some(log) = &self.log {
            log.lock().push(format!("{action} {}", self.name));
        }
    }
}

#[async_trait]
impl OwnedContext for MockStatisticsContext {
    fn identifier(&self) -> ServiceGroupIdentifier {
        ServiceGroupIdentifier::new(format!("mock:{}", self.name))
    }

    fn instantiate_service_instance(&self) -> ContextResult<()> {
        self.record("start");
        Ok(())
    }

    async fn close_service_instance(&self) -> ContextResult<()> {
        self.record("close");
        Ok(())
    }
}

#[async_trait]
impl StatisticsContext for MockStatisticsContext {
    async fn continue_initialization(&self) -> ContextResult<()> {
        if self.fail_reconciliation {
            Err(Error::internal("reconciliation failed"))
        } else {
            Ok(())
        }
    }
}

pub(crate) struct MockManagerSet {
    pub(crate) log: SharedLog,
    pub(crate) device: Arc<MockDeviceManager>,
    pub(crate) rpc: Arc<MockRpcManager>,
    pub(crate) statistics: Arc<MockStatisticsManager>,
}

impl MockManagerSet {
    pub(crate) fn new() -> Self {
        let log = MockContext::shared_log();
        Self {
            device: Arc::new(MockDeviceManager {
                log: log.clone(),
                removed: Mutex::new(Vec::new()),
                created: Mutex::new(Vec::new()),
            }),
            rpc: Arc::new(MockRpcManager {
                log: log.clone(),
                removed: Mutex::new(Vec::new()),
            }),
            statistics: Arc::new(MockStatisticsManager {
                log: log.clone(),
                removed: Mutex::new(Vec::new()),
            }),
            log,
        }
    }
}

pub(crate) struct MockDeviceManager {
    log: SharedLog,
    pub(crate) removed: Mutex<Vec<DatapathId>>,
    pub(crate) created: Mutex<Vec<Arc<MockDeviceContext>>>,
}

impl DeviceRemovedHandler for MockDeviceManager {
    fn on_device_removed(&self, device: DatapathId) {
        self.removed.lock().push(device);
    }
}

impl DeviceContextManager for MockDeviceManager {
    fn create_context(
        &self,
        _connection: Arc<dyn ConnectionContext>,
        _watcher: Arc<dyn MastershipWatcher>,
    ) -> Arc<dyn DeviceContext> {
        let context = MockDeviceContext::in_log("device", &self.log);
        self.created.lock().push(context.clone());
        context
    }
}

pub(crate) struct MockRpcManager {
    log: SharedLog,
    pub(crate) removed: Mutex<Vec<DatapathId>>,
}

impl DeviceRemovedHandler for MockRpcManager {
    fn on_device_removed(&self, device: DatapathId) {
        self.removed.lock().push(device);
    }
}

impl RpcContextManager for MockRpcManager {
    fn create_context(
        &self,
        _device: &Arc<dyn DeviceContext>,
        _watcher: Arc<dyn MastershipWatcher>,
    ) -> Arc<dyn RpcContext> {
        MockRpcContext::in_log("rpc", &self.log)
    }
}

pub(crate) struct MockStatisticsManager {
    log: SharedLog,
    pub(crate) removed: Mutex<Vec<DatapathId>>,
}

impl DeviceRemovedHandler for MockStatisticsManager {
    fn on_device_removed(&self, device: DatapathId) {
        self.removed.lock().push(device);
    }
}

impl StatisticsContextManager for MockStatisticsManager {
    fn create_context(
        &self,
        _device: &Arc<dyn DeviceContext>,
        _watcher: Arc<dyn MastershipWatcher>,
    ) -> Arc<dyn StatisticsContext> {
        MockStatisticsContext::in_log("statistics", &self.log)
    }
}

pub(crate) struct MockElectionProvider {
    pub(crate) candidates: Mutex<Vec<Arc<dyn ElectionCandidate>>>,
    pub(crate) closed_registrations: Arc<AtomicUsize>,
    reject: bool,
}

impl MockElectionProvider {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            candidates: Mutex::new(Vec::new()),
            closed_registrations: Arc::new(AtomicUsize::new(0)),
            reject: false,
        })
    }

    pub(crate) fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            candidates: Mutex::new(Vec::new()),
            closed_registrations: Arc::new(AtomicUsize::new(0)),
            reject: true,
        })
    }

    pub(crate) fn last_candidate(&self) -> Arc<dyn ElectionCandidate> {
        self.candidates.lock().last().expect("no candidate").clone()
    }

    pub(crate) fn closed_registration_count(&self) -> usize {
        self.closed_registrations.load(Ordering::SeqCst)
    }
}

impl ElectionProvider for MockElectionProvider {
    fn register(
        &self,
        candidate: Arc<dyn ElectionCandidate>,
    ) -> Result<Box<dyn ElectionRegistration>, ElectionError> {
        if self.reject {
            return Err(ElectionError::Registration("rejected by test".to_string()));
        }
        self.candidates.lock().push(candidate);
        Ok(Box::new(MockRegistration {
            closed: self.closed_registrations.clone(),
        }))
    }
}

struct MockRegistration {
    closed: Arc<AtomicUsize>,
}

impl ElectionRegistration for MockRegistration {
    fn close(&self) -> Result<(), ElectionError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
