use std::time::Duration;

use clap::Args;

use crate::secret::DeletePolicy;

/// Tunables of the bootstrap flow. Every field can also be set through the
/// environment.
#[derive(Args, Clone, Debug)]
pub struct Settings {
    /// Seconds to wait for the cluster to sign a CSR
    #[arg(long, env = "CSR_TIMEOUT_SECONDS", default_value_t = 60)]
    pub csr_timeout_seconds: u64,

    /// Seconds between two reads of a pending CSR
    #[arg(long, env = "CSR_POLL_INTERVAL_SECONDS", default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    pub csr_poll_interval_seconds: u64,

    /// Requested lifetime of issued client certificates
    #[arg(long, env = "CSR_EXPIRATION_SECONDS", default_value_t = 24 * 60 * 60)]
    pub csr_expiration_seconds: i32,

    /// What to do when removing a stale credential secret fails
    #[arg(long, env = "SECRET_DELETE_POLICY", value_enum, default_value_t = DeletePolicy::Strict)]
    pub secret_delete_policy: DeletePolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            csr_timeout_seconds: 60,
            csr_poll_interval_seconds: 5,
            csr_expiration_seconds: 24 * 60 * 60,
            secret_delete_policy: DeletePolicy::Strict,
        }
    }
}

impl Settings {
    pub fn csr_timeout(&self) -> Duration {
        Duration::from_secs(self.csr_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.csr_poll_interval_seconds.max(1))
    }
}
