//! Router configuration, derived with `clap::Parser`. The option table
//! matches §6 of the component design exactly, one field per row.

use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use strum_macros::EnumString;

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub enum SlaveSelectionCriteria {
    LeastCurrentOperations,
    LeastBehindMaster,
    LeastGlobalConnections,
    LeastRouterConnections,
    AdaptiveRouting,
}

impl Default for SlaveSelectionCriteria {
    fn default() -> Self {
        SlaveSelectionCriteria::LeastCurrentOperations
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum MasterFailureMode {
    FailInstantly,
    ErrorOnWrite,
    FailOnWrite,
}

impl Default for MasterFailureMode {
    fn default() -> Self {
        MasterFailureMode::FailInstantly
    }
}

/// Configuration for the read/write-split router core. Every option here
/// maps one-to-one to a row of the core's external configuration table.
#[derive(Parser, Debug, Clone)]
#[clap(
    name = "rwsplit",
    version = "0.1.0",
    about = "MySQL/MariaDB read/write split router"
)]
pub struct RouterConfig {
    #[clap(long, default_value_t = 4)]
    pub works: usize,
    #[clap(long, default_value_t = 3310)]
    pub port: u16,
    #[clap(long, default_value_t = 9000)]
    pub http_port: u16,
    #[clap(long, default_value_t = false)]
    pub enable_metrics: bool,
    #[clap(long, default_value_t = false)]
    pub enable_rest: bool,
    #[clap(long)]
    pub log_level: Option<String>,

    /// Comma-separated `name@host:port` backend server list. The first
    /// server whose role resolves to primary is the cluster's writer.
    #[clap(long, value_delimiter = ',')]
    pub backend: Vec<String>,
    #[clap(long, default_value = "router")]
    pub backend_user: String,
    #[clap(long, default_value = "")]
    pub backend_password: String,

    #[clap(long, default_value = "LEAST_CURRENT_OPERATIONS")]
    pub slave_selection_criteria_raw: String,
    #[clap(long, default_value_t = 255)]
    pub max_slave_connections: usize,
    #[clap(long, default_value_t = -1)]
    pub max_slave_replication_lag: i64,
    #[clap(long, default_value_t = false)]
    pub master_accept_reads: bool,
    #[clap(long, default_value_t = false)]
    pub master_reconnection: bool,
    #[clap(long, default_value = "fail_instantly")]
    pub master_failure_mode_raw: String,
    #[clap(long, default_value_t = true)]
    pub strict_multi_stmt: bool,
    #[clap(long, default_value_t = true)]
    pub strict_sp_calls: bool,
    #[clap(long, default_value_t = true)]
    pub retry_failed_reads: bool,
    #[clap(long, default_value_t = 300)]
    pub connection_keepalive_secs: u64,
    #[clap(long, default_value_t = false)]
    pub disable_sescmd_history: bool,
    #[clap(long, default_value_t = 50)]
    pub max_sescmd_history: usize,
    #[clap(long, default_value_t = false)]
    pub causal_reads: bool,
    #[clap(long, default_value_t = 10)]
    pub causal_reads_timeout_secs: u64,

    /// Maximum number of client statements the query queue may hold before
    /// the router fails a statement rather than growing unboundedly (§5).
    #[clap(long, default_value_t = 64)]
    pub max_query_queue: usize,
}

impl RouterConfig {
    pub fn slave_selection_criteria(&self) -> SlaveSelectionCriteria {
        SlaveSelectionCriteria::from_str(&self.slave_selection_criteria_raw)
            .unwrap_or_default()
    }

    pub fn master_failure_mode(&self) -> MasterFailureMode {
        MasterFailureMode::from_str(&self.master_failure_mode_raw).unwrap_or_default()
    }

    pub fn connection_keepalive(&self) -> Duration {
        Duration::from_secs(self.connection_keepalive_secs)
    }

    pub fn causal_reads_timeout(&self) -> Duration {
        Duration::from_secs(self.causal_reads_timeout_secs)
    }

    pub fn max_slave_replication_lag(&self) -> Option<u64> {
        if self.max_slave_replication_lag < 0 {
            None
        } else {
            Some(self.max_slave_replication_lag as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_lag_means_unlimited() {
        let mut cfg = RouterConfig::parse_from(["rwsplit"]);
        cfg.max_slave_replication_lag = -1;
        assert_eq!(cfg.max_slave_replication_lag(), None);
        cfg.max_slave_replication_lag = 50;
        assert_eq!(cfg.max_slave_replication_lag(), Some(50));
    }

    #[test]
    fn raw_enum_fields_parse_with_fallback() {
        let cfg = RouterConfig::parse_from(["rwsplit", "--master-failure-mode-raw", "error_on_write"]);
        assert_eq!(cfg.master_failure_mode(), MasterFailureMode::ErrorOnWrite);
    }
}
