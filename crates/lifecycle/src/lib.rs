//! Per-device lifecycle coordination for OpenFlow switches under a
//! clustered control plane.
//!
//! Every connected switch gets a [`ContextChain`]: an ordered list of
//! sub-services (device, RPC, statistics) started together when this
//! node wins the device's leader election and stopped together when it
//! loses it. The [`ContextChainHolder`] is the process-wide registry
//! that creates, looks up and retires chains as connections come and go.
//!
//! Mastership is not a single event. The chain promotes a device to
//! `WORKING_MASTER` only once every mandatory readiness signal has
//! arrived, and demotes it the moment leadership or the connection is
//! lost.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod builder;
mod chain;
mod config;
mod error;
mod guard;
mod holder;
mod singleton;
mod traits;
mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use builder::{BuiltContexts, ContextListBuilder};
pub use chain::ContextChain;
pub use config::HolderConfig;
pub use error::{ContextResult, Error, ErrorContext, ErrorKind};
pub use guard::GuardedContext;
pub use holder::{ContextChainHolder, ContextManager};
pub use singleton::ChainSingleton;
pub use traits::{
    ConnectionContext, DeviceContext, DeviceContextManager, DeviceRemovedHandler,
    MastershipWatcher, OwnedContext, RpcContext, RpcContextManager, StatisticsContext,
    StatisticsContextManager,
};
pub use types::{
    ChainLifecycleState, CloseHandle, ConnectionState, ConnectionStatus, ContextChainState,
    DatapathId, MastershipState, RoleFuture,
};
