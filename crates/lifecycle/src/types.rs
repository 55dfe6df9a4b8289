//! Core types shared across the context chain subsystem

use std::fmt;

use futures::future::BoxFuture;

use crate::error::ContextResult;

/// Handle for an asynchronous close. The underlying work keeps running
/// even if the handle is dropped.
pub type CloseHandle = BoxFuture<'static, ContextResult<()>>;

/// Handle resolving once a chain settles its role towards its device.
pub type RoleFuture = BoxFuture<'static, ContextResult<ContextChainState>>;

/// OpenFlow datapath identifier of a switch. Used as the process-wide
/// device key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatapathId(u64);

impl DatapathId {
    /// Create a datapath id from its raw value.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw datapath id.
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DatapathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for DatapathId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// State of a physical connection to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The connection is live.
    Working,
    /// The connection is gone and will not come back.
    Rip,
}

/// Outcome reported to the connection layer when a device connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// The connection was accepted; the handshake may continue.
    MayContinue,
    /// The device is already connected; this connection was refused.
    AlreadyConnected,
}

/// Role of a context chain towards its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextChainState {
    /// No role has been negotiated yet.
    Undefined,
    /// This node owns the device.
    WorkingMaster,
    /// Another node owns the device.
    WorkingSlave,
}

impl fmt::Display for ContextChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextChainState::Undefined => write!(f, "UNDEFINED"),
            ContextChainState::WorkingMaster => write!(f, "WORKING_MASTER"),
            ContextChainState::WorkingSlave => write!(f, "WORKING_SLAVE"),
        }
    }
}

/// Overall lifecycle of a context chain. Monotonic: a chain never leaves
/// `Termination`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainLifecycleState {
    /// Built but not yet registered with the election framework.
    Initialization,
    /// Registered and participating in the election.
    Working,
    /// Closed; all further operations are no-ops.
    Termination,
}

/// Readiness signals reported into a chain by independent subsystems.
///
/// Each signal sets one flag; `Check` sets nothing and only queries the
/// current conjunction of the mandatory flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MastershipState {
    /// Initial statistics gathering completed.
    InitialGathering,
    /// MASTER role committed on the device itself.
    MasterOnDevice,
    /// RPC services registered.
    RpcRegistration,
    /// Initial flow registry fill completed (advisory, not mandatory).
    InitialFlowRegistryFill,
    /// Initial data submitted to the operational store.
    InitialSubmit,
    /// Pure query, mutates nothing.
    Check,
}

impl fmt::Display for MastershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MastershipState::InitialGathering => write!(f, "INITIAL_GATHERING"),
            MastershipState::MasterOnDevice => write!(f, "MASTER_ON_DEVICE"),
            MastershipState::RpcRegistration => write!(f, "RPC_REGISTRATION"),
            MastershipState::InitialFlowRegistryFill => write!(f, "INITIAL_FLOW_REGISTRY_FILL"),
            MastershipState::InitialSubmit => write!(f, "INITIAL_SUBMIT"),
            MastershipState::Check => write!(f, "CHECK"),
        }
    }
}
