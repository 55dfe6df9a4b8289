//! Configuration for the context chain holder

use std::time::Duration;

/// Configuration for [`ContextChainHolder`](crate::holder::ContextChainHolder).
#[derive(Debug, Clone)]
pub struct HolderConfig {
    /// How often chains that still have no negotiated role are nudged
    /// towards a slave wire-role.
    pub role_check_interval: Duration,
}

impl Default for HolderConfig {
    fn default() -> Self {
        Self {
            role_check_interval: Duration::from_secs(10),
        }
    }
}
