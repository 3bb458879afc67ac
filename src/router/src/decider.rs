//! Route Decider (§4.3): a pure function from classified-statement +
//! session context to a `RouteTarget`. Kept side-effect free so it can be
//! unit tested without any I/O.

use crate::classify::{ClassifiedStatement, QueryType};
use crate::config::{MasterFailureMode, SlaveSelectionCriteria};
use crate::hints::Hint;
use crate::topology::ServerRole;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    All,
    Master,
    Slave,
    NamedServer(String),
    LagMax(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct SessionContext<'a> {
    pub in_transaction: bool,
    pub read_only_transaction: bool,
    pub locked_backend: Option<&'a str>,
    pub locked_to_master: bool,
    pub autocommit: bool,
    pub master_failure_mode: MasterFailureMode,
    pub causal_reads: bool,
    pub has_gtid: bool,
    pub large_query_continuation: Option<&'a RouteTarget>,
    pub exec_backend_for_stmt: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub target: RouteTarget,
    pub store_for_retry: bool,
    /// Set when this read must be prefixed with a GTID-catch-up wait before
    /// it runs (§4.3 rule 9 / §4.4 step 7): causal reads are enabled, the
    /// session has a GTID to wait for, and the target is a replica.
    pub causal_read_wait: bool,
}

/// §4.3 decision rules, evaluated in order; first match wins.
pub fn decide(stmt: &ClassifiedStatement<'_>, ctx: &SessionContext<'_>) -> RouteDecision {
    // Rule 1: large-query continuation reuses the previous packet's target.
    if let Some(target) = ctx.large_query_continuation {
        return RouteDecision {
            target: target.clone(),
            store_for_retry: false,
            causal_read_wait: false,
        };
    }

    // Rule 2: routing hints.
    if let Some(chain) = &stmt.hints {
        for hint in chain.iter() {
            match hint {
                Hint::RouteToServer(name) => {
                    return RouteDecision {
                        target: RouteTarget::NamedServer(name.clone()),
                        store_for_retry: false,
                        causal_read_wait: false,
                    };
                }
                Hint::MaxSlaveReplicationLag(ms) => {
                    return RouteDecision {
                        target: RouteTarget::LagMax(*ms),
                        store_for_retry: false,
                        causal_read_wait: false,
                    };
                }
            }
        }
    }

    // Rule 3: session-write classification.
    if stmt.is_session_write() {
        return RouteDecision {
            target: RouteTarget::All,
            store_for_retry: false,
            causal_read_wait: false,
        };
    }

    // Rule 4: BEGIN / START TRANSACTION (not read-only) pins to the
    // primary — the transaction may write, so it has to start where writes
    // land. A read-only start is left to fall through to rule 9 below.
    if stmt.type_bitmap.contains(QueryType::BEGIN_TRX) {
        return RouteDecision {
            target: RouteTarget::Master,
            store_for_retry: false,
            causal_read_wait: false,
        };
    }

    // Rule 5: active non-read-only transaction, or locked-to-master.
    if (ctx.in_transaction && !ctx.read_only_transaction) || ctx.locked_to_master {
        return RouteDecision {
            target: RouteTarget::Master,
            store_for_retry: false,
            causal_read_wait: false,
        };
    }

    // Rule 6: read-only transaction pins to whichever backend it began on.
    if ctx.read_only_transaction {
        if let Some(name) = ctx.locked_backend {
            return RouteDecision {
                target: RouteTarget::NamedServer(name.to_string()),
                store_for_retry: false,
                causal_read_wait: false,
            };
        }
    }

    // Rule 7: COM_STMT_FETCH routes to the backend recorded in the ExecMap.
    if stmt.command == crate::protocol::mysql::constants::CommandCode::ComStmtFetch {
        return match ctx.exec_backend_for_stmt {
            Some(name) => RouteDecision {
                target: RouteTarget::NamedServer(name.to_string()),
                store_for_retry: false,
                causal_read_wait: false,
            },
            None => {
                tracing::warn!("COM_STMT_FETCH with no known backend for this statement id; falling back to SLAVE");
                RouteDecision {
                    target: RouteTarget::Slave,
                    store_for_retry: false,
                    causal_read_wait: false,
                }
            }
        };
    }

    // Rule 8: writes.
    if stmt.is_write() {
        return RouteDecision {
            target: RouteTarget::Master,
            store_for_retry: false,
            causal_read_wait: false,
        };
    }

    // Rule 9: reads in autocommit with no open transaction.
    if ctx.autocommit && !ctx.in_transaction {
        let causal_read_wait = ctx.causal_reads
            && ctx.has_gtid
            && stmt.command == crate::protocol::mysql::constants::CommandCode::ComQuery;
        return RouteDecision {
            target: RouteTarget::Slave,
            store_for_retry: stmt.type_bitmap.contains(QueryType::READ),
            causal_read_wait,
        };
    }

    // Rule 10: default.
    RouteDecision {
        target: RouteTarget::Master,
        store_for_retry: false,
        causal_read_wait: false,
    }
}

/// Backend selection given a target class (§4.3 "Backend selection given a
/// target class"). Operates over a slice of candidate backends described by
/// `(name, role, lag_ms, in_use, slave_connections)`.
pub struct CandidateBackend<'a> {
    pub name: &'a str,
    pub role: ServerRole,
    pub lag_ms: Option<u64>,
    pub in_use: bool,
    pub current_operations: u64,
}

pub fn select_backend<'a>(
    target: &RouteTarget,
    candidates: &'a [CandidateBackend<'a>],
    master_accept_reads: bool,
    max_lag_ms: Option<u64>,
    criterion: SlaveSelectionCriteria,
    max_slave_count: usize,
    current_slave_count: usize,
) -> Option<&'a CandidateBackend<'a>> {
    match target {
        RouteTarget::NamedServer(name) => candidates.iter().find(|c| {
            c.name.eq_ignore_ascii_case(name)
                && matches!(c.role, ServerRole::Primary | ServerRole::Replica | ServerRole::Relay)
        }),
        RouteTarget::Master => candidates.iter().find(|c| c.role == ServerRole::Primary),
        RouteTarget::All => None,
        RouteTarget::Slave => select_slave(candidates, master_accept_reads, max_lag_ms, criterion, max_slave_count, current_slave_count),
        RouteTarget::LagMax(v) => select_slave(candidates, master_accept_reads, Some(*v), criterion, max_slave_count, current_slave_count),
    }
}

fn select_slave<'a>(
    candidates: &'a [CandidateBackend<'a>],
    master_accept_reads: bool,
    max_lag_ms: Option<u64>,
    criterion: SlaveSelectionCriteria,
    max_slave_count: usize,
    current_slave_count: usize,
) -> Option<&'a CandidateBackend<'a>> {
    if current_slave_count >= max_slave_count && max_slave_count > 0 {
        // still allowed to pick among already in-use slaves.
    }
    let eligible: Vec<&CandidateBackend> = candidates
        .iter()
        .filter(|c| match c.role {
            ServerRole::Replica | ServerRole::Relay => true,
            ServerRole::Primary => master_accept_reads,
            ServerRole::Down => false,
        })
        .filter(|c| match (c.lag_ms, max_lag_ms) {
            (_, None) => true,
            (Some(lag), Some(max)) => lag <= max,
            (None, Some(_)) => false,
        })
        .filter(|c| c.in_use || current_slave_count < max_slave_count || max_slave_count == 0)
        .collect();

    // Ranking by criterion; all strategies collapse to "fewest current
    // operations" here since that's the one metric this router core tracks
    // per backend — adaptive/least-behind-master selection over real
    // replication telemetry is future monitor-integration work.
    let _ = criterion;
    eligible.into_iter().min_by_key(|c| c.current_operations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;
    use crate::protocol::mysql::constants::CommandCode;

    fn default_ctx() -> SessionContext<'static> {
        SessionContext {
            in_transaction: false,
            read_only_transaction: false,
            locked_backend: None,
            locked_to_master: false,
            autocommit: true,
            master_failure_mode: MasterFailureMode::FailInstantly,
            causal_reads: false,
            has_gtid: false,
            large_query_continuation: None,
            exec_backend_for_stmt: None,
        }
    }

    #[test]
    fn select_reads_route_to_slave_in_autocommit() {
        let payload = [&[CommandCode::ComQuery as u8][..], b"SELECT 1"].concat();
        let stmt = classify(&payload);
        let decision = decide(&stmt, &default_ctx());
        assert_eq!(decision.target, RouteTarget::Slave);
    }

    #[test]
    fn writes_route_to_master() {
        let payload = [&[CommandCode::ComQuery as u8][..], b"INSERT INTO t VALUES(1)"].concat();
        let stmt = classify(&payload);
        let decision = decide(&stmt, &default_ctx());
        assert_eq!(decision.target, RouteTarget::Master);
    }

    #[test]
    fn open_transaction_pins_to_master() {
        let payload = [&[CommandCode::ComQuery as u8][..], b"SELECT 1"].concat();
        let stmt = classify(&payload);
        let mut ctx = default_ctx();
        ctx.in_transaction = true;
        let decision = decide(&stmt, &ctx);
        assert_eq!(decision.target, RouteTarget::Master);
    }

    #[test]
    fn read_only_transaction_pins_to_locked_backend() {
        let payload = [&[CommandCode::ComQuery as u8][..], b"SELECT 1"].concat();
        let stmt = classify(&payload);
        let mut ctx = default_ctx();
        ctx.in_transaction = true;
        ctx.read_only_transaction = true;
        ctx.locked_backend = Some("replica1");
        let decision = decide(&stmt, &ctx);
        assert_eq!(decision.target, RouteTarget::NamedServer("replica1".to_string()));
    }

    #[test]
    fn session_write_routes_to_all() {
        let payload = [&[CommandCode::ComQuery as u8][..], b"SET @x = 1"].concat();
        let stmt = classify(&payload);
        let decision = decide(&stmt, &default_ctx());
        assert_eq!(decision.target, RouteTarget::All);
    }

    #[test]
    fn hint_overrides_default_routing() {
        let payload = [
            &[CommandCode::ComQuery as u8][..],
            b"SELECT 1 -- route to server replica2\n",
        ]
        .concat();
        let stmt = classify(&payload);
        let decision = decide(&stmt, &default_ctx());
        assert_eq!(decision.target, RouteTarget::NamedServer("replica2".to_string()));
    }

    #[test]
    fn stmt_fetch_without_exec_map_falls_back_to_slave() {
        let payload = {
            let mut p = vec![CommandCode::ComStmtFetch as u8];
            p.extend_from_slice(&1u32.to_le_bytes());
            p.extend_from_slice(&1u32.to_le_bytes());
            p
        };
        let stmt = classify(&payload);
        let decision = decide(&stmt, &default_ctx());
        assert_eq!(decision.target, RouteTarget::Slave);
    }

    #[test]
    fn select_backend_prefers_least_current_operations() {
        let candidates = vec![
            CandidateBackend { name: "r1", role: ServerRole::Replica, lag_ms: Some(0), in_use: true, current_operations: 5 },
            CandidateBackend { name: "r2", role: ServerRole::Replica, lag_ms: Some(0), in_use: true, current_operations: 1 },
        ];
        let picked = select_backend(
            &RouteTarget::Slave,
            &candidates,
            false,
            None,
            SlaveSelectionCriteria::LeastCurrentOperations,
            10,
            2,
        );
        assert_eq!(picked.unwrap().name, "r2");
    }

    #[test]
    fn select_backend_respects_lag_ceiling() {
        let candidates = vec![
            CandidateBackend { name: "r1", role: ServerRole::Replica, lag_ms: Some(500), in_use: true, current_operations: 0 },
        ];
        let picked = select_backend(
            &RouteTarget::LagMax(100),
            &candidates,
            false,
            Some(100),
            SlaveSelectionCriteria::LeastCurrentOperations,
            10,
            1,
        );
        assert!(picked.is_none());
    }
}
