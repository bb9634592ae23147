//! Transaction manager configuration.

use std::time::Duration;

/// Configuration for a [`TransactionManager`](crate::TransactionManager).
#[derive(Debug, Clone)]
pub struct TmConfig {
    /// Identifies this transaction manager. Baked into every generated GTRID,
    /// so it must be unique among managers sharing resources.
    pub server_id: String,

    /// Timeout applied by `begin`.
    pub default_timeout: Duration,

    /// How long `shutdown` waits for in-flight transactions.
    pub graceful_shutdown_interval: Duration,

    /// Run each phase's branches of equal ordering position concurrently.
    pub asynchronous_2pc: bool,

    /// Log a warning when a transaction without resources completes.
    pub warn_about_zero_resource_transactions: bool,
}

impl Default for TmConfig {
    fn default() -> Self {
        Self {
            server_id: "xatm".to_string(),
            default_timeout: Duration::from_secs(60),
            graceful_shutdown_interval: Duration::from_secs(60),
            asynchronous_2pc: false,
            warn_about_zero_resource_transactions: true,
        }
    }
}

impl TmConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the server id.
    #[must_use]
    pub fn server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = server_id.into();
        self
    }

    /// Sets the default transaction timeout.
    #[must_use]
    pub const fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Sets the graceful shutdown interval.
    #[must_use]
    pub const fn graceful_shutdown_interval(mut self, interval: Duration) -> Self {
        self.graceful_shutdown_interval = interval;
        self
    }

    /// Enables or disables concurrent phase execution.
    #[must_use]
    pub const fn asynchronous_2pc(mut self, enabled: bool) -> Self {
        self.asynchronous_2pc = enabled;
        self
    }

    /// Enables or disables the zero-resource warning.
    #[must_use]
    pub const fn warn_about_zero_resource_transactions(mut self, enabled: bool) -> Self {
        self.warn_about_zero_resource_transactions = enabled;
        self
    }
}
