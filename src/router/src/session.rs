//! Router Session (§4.4): the top-level state machine. Consumes one client
//! packet at a time, drives the classifier, decider, session-command log,
//! prepared-statement manager and backend connections, and produces a
//! client-visible response stream in submission order.

use std::collections::VecDeque;
use std::io::Write as _;
use std::sync::Arc;

use tokio::io::AsyncWrite;

use crate::backend::{Backend, ReplyState, ResponseMode};
use crate::classify::{classify, ClassifiedStatement, QueryType};
use crate::config::{MasterFailureMode, RouterConfig};
use crate::decider::{decide, CandidateBackend, RouteDecision, RouteTarget, SessionContext};
use crate::errors::{RouterError, RouterResult};
use crate::metrics::RouterMetrics;
use crate::prepared::{parse_prepare_ok_stmt_id, rewrite_statement_id, PreparedStatementManager};
use crate::protocol::mysql::basic::extract_gtid_from_ok;
use crate::protocol::mysql::constants::CommandCode;
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers::write_err_packet;
use crate::sescmd::{ResponseOutcome, SessionCommandLog};
use crate::topology::{ServerRole, TopologyHandle};

const MAX_PACKET_LEN_WITH_HEADER: usize = crate::protocol::mysql::constants::MAX_PAYLOAD_LEN + 4;

/// A client statement deferred because its target backend still has
/// session commands queued ahead of it (§4.4 step 4).
struct QueuedStatement {
    payload: Vec<u8>,
    target: RouteTarget,
}

pub struct RouterSession {
    config: Arc<RouterConfig>,
    topology: TopologyHandle,
    metrics: RouterMetrics,

    backends: hashbrown::HashMap<String, Backend>,
    locked_backend: Option<String>,
    locked_to_master: bool,

    in_transaction: bool,
    read_only_transaction: bool,
    autocommit: bool,

    sescmd_log: SessionCommandLog,
    prepared: PreparedStatementManager,
    /// A COM_STMT_PREPARE's sescmd-log position to the client-visible id the
    /// router minted for it, consulted once backend replies start arriving
    /// so each backend's own assigned id can be recorded (§4.5).
    pending_prepare_external_id: hashbrown::HashMap<u64, u32>,

    query_queue: VecDeque<QueuedStatement>,
    large_query_target: Option<RouteTarget>,
    /// A multi-packet session write (routed `ALL`) needs its continuation
    /// fragments forwarded to every backend that saw the first fragment,
    /// not re-appended to the session-command log as new commands.
    large_query_is_session_write: bool,

    gtid: Option<String>,
    sent_sescmd: u64,
    recv_sescmd: u64,
    expected_responses: u64,
}

impl RouterSession {
    pub fn new(config: Arc<RouterConfig>, topology: TopologyHandle, metrics: RouterMetrics) -> Self {
        let max_history = if config.disable_sescmd_history {
            0
        } else {
            config.max_sescmd_history
        };
        Self {
            config,
            topology,
            metrics,
            backends: hashbrown::HashMap::new(),
            locked_backend: None,
            locked_to_master: false,
            in_transaction: false,
            read_only_transaction: false,
            autocommit: true,
            sescmd_log: SessionCommandLog::new(max_history),
            prepared: PreparedStatementManager::new(),
            pending_prepare_external_id: hashbrown::HashMap::new(),
            query_queue: VecDeque::new(),
            large_query_target: None,
            large_query_is_session_write: false,
            gtid: None,
            sent_sescmd: 0,
            recv_sescmd: 0,
            expected_responses: 0,
        }
    }

    fn candidates(&self) -> Vec<CandidateBackend<'_>> {
        self.topology
            .current()
            .servers()
            .iter()
            .map(|s| CandidateBackend {
                name: &s.name,
                role: s.role,
                lag_ms: s.lag_ms,
                in_use: self.backends.contains_key(&s.name),
                current_operations: self
                    .backends
                    .get(&s.name)
                    .map(|_| 0)
                    .unwrap_or(0),
            })
            .collect()
    }

    fn session_context<'a>(&'a self, large_query_target: Option<&'a RouteTarget>, exec_backend: Option<&'a str>) -> SessionContext<'a> {
        SessionContext {
            in_transaction: self.in_transaction,
            read_only_transaction: self.read_only_transaction,
            locked_backend: self.locked_backend.as_deref(),
            locked_to_master: self.locked_to_master,
            autocommit: self.autocommit,
            master_failure_mode: self.config.master_failure_mode(),
            causal_reads: self.config.causal_reads,
            has_gtid: self.gtid.is_some(),
            large_query_continuation: large_query_target,
            exec_backend_for_stmt: exec_backend,
        }
    }

    /// Ensures a backend named `name` is open, connecting it (and replaying
    /// the session-command log onto it) if it isn't.
    async fn ensure_backend(&mut self, name: &str) -> RouterResult<()> {
        if self.backends.contains_key(name) {
            return Ok(());
        }
        let server = self
            .topology
            .current()
            .by_name(name)
            .cloned()
            .ok_or_else(|| RouterError::NoSuitableBackend {
                target: name.to_string(),
            })?;
        if !Backend::can_connect(server.role) {
            return Err(RouterError::NoSuitableBackend {
                target: name.to_string(),
            });
        }
        let backend = Backend::connect(
            &server.name,
            &server.addr,
            server.role,
            &self.config.backend_user,
            &self.config.backend_password,
            &self.sescmd_log,
        )
        .await?;
        self.backends.insert(server.name.clone(), backend);
        Ok(())
    }

    fn resolve_target_name(&mut self, target: &RouteTarget) -> RouterResult<String> {
        match target {
            RouteTarget::NamedServer(name) => Ok(name.clone()),
            RouteTarget::Master => {
                let topology_primary = self.topology.current().primary().map(|s| s.name.clone());
                let currently_pinned = self
                    .backends
                    .values()
                    .find(|b| b.role == ServerRole::Primary)
                    .map(|b| b.name.clone());
                let name = match (currently_pinned, topology_primary) {
                    (Some(pinned), Some(candidate)) if pinned == candidate => pinned,
                    (Some(pinned), Some(candidate)) => {
                        // Topology moved the primary elsewhere. Only follow
                        // it if failover adoption is enabled and nothing
                        // pins this session to the one it already has.
                        if self.config.master_reconnection && !self.in_transaction && !self.locked_to_master {
                            candidate
                        } else {
                            pinned
                        }
                    }
                    (Some(pinned), None) => pinned,
                    (None, Some(candidate)) => candidate,
                    (None, None) => {
                        return Err(RouterError::NoSuitableBackend {
                            target: "MASTER".to_string(),
                        })
                    }
                };
                Ok(name)
            }
            RouteTarget::Slave | RouteTarget::LagMax(_) => {
                let candidates = self.candidates();
                let max_lag = match target {
                    RouteTarget::LagMax(v) => Some(*v),
                    _ => self.config.max_slave_replication_lag(),
                };
                let current_slave_count = self
                    .backends
                    .values()
                    .filter(|b| b.role == ServerRole::Replica || b.role == ServerRole::Relay)
                    .count();
                let picked = crate::decider::select_backend(
                    target,
                    &candidates,
                    self.config.master_accept_reads,
                    max_lag,
                    self.config.slave_selection_criteria(),
                    self.config.max_slave_connections,
                    current_slave_count,
                )
                .map(|c| c.name.to_string());
                picked.ok_or_else(|| RouterError::NoSuitableBackend {
                    target: format!("{:?}", target),
                })
            }
            RouteTarget::All => unreachable!("ALL is handled by the caller before reaching here"),
        }
    }

    /// Handles one client packet end to end, writing any reply directly to
    /// `client_writer`. §4.4's full per-statement lifecycle.
    pub async fn handle_packet<W: AsyncWrite + Unpin + Send>(
        &mut self,
        payload: &[u8],
        wire_len: usize,
        client_writer: &mut PacketWriter<W>,
        client_capabilities_deprecate_eof: bool,
    ) -> RouterResult<()> {
        let is_continuation = self.large_query_target.is_some() || self.large_query_is_session_write;
        let more_to_come = wire_len == MAX_PACKET_LEN_WITH_HEADER;
        let stmt = classify(payload);

        if is_continuation && self.large_query_is_session_write {
            // A continuation fragment carries no command byte of its own;
            // only the final fragment gets a reply, per the original command.
            self.broadcast_continuation_to_all(payload, client_writer, client_capabilities_deprecate_eof, !more_to_come)
                .await?;
        } else if is_continuation {
            self.route_and_write(
                &stmt,
                payload,
                client_writer,
                client_capabilities_deprecate_eof,
                Some(!more_to_come),
            )
            .await?;
        } else if stmt.command == CommandCode::ComStmtClose {
            // COM_STMT_CLOSE carries no reply and each backend may know the
            // statement under its own id, so it's forwarded directly rather
            // than replayed verbatim through the session-command log.
            if let Some(external_id) = stmt.prepared_stmt_id {
                self.close_prepared_statement(external_id).await?;
            }
        } else if stmt.is_session_write() {
            self.broadcast_session_command(&stmt, payload, client_writer, client_capabilities_deprecate_eof)
                .await?;
        } else {
            self.route_and_write(&stmt, payload, client_writer, client_capabilities_deprecate_eof, None)
                .await?;
        }

        // §4.4 step 8: large-query continuation bookkeeping. A full-length
        // packet means the logical statement isn't finished yet.
        if more_to_come {
            if self.large_query_target.is_none() && !self.large_query_is_session_write && !is_continuation {
                if stmt.is_session_write() {
                    self.large_query_is_session_write = true;
                } else {
                    let exec_backend = self.prepared_exec_backend(&stmt);
                    let decision = decide(&stmt, &self.session_context(None, exec_backend.as_deref()));
                    self.large_query_target = Some(decision.target);
                }
            }
        } else {
            self.large_query_target = None;
            self.large_query_is_session_write = false;
        }

        Ok(())
    }

    fn prepared_exec_backend(&self, stmt: &ClassifiedStatement<'_>) -> Option<String> {
        stmt.prepared_stmt_id
            .and_then(|id| self.prepared.exec_backend(id))
            .map(|s| s.to_string())
    }

    /// §4.2's append-and-broadcast flow for session writes (routed `ALL`).
    async fn broadcast_session_command<W: AsyncWrite + Unpin + Send>(
        &mut self,
        stmt: &ClassifiedStatement<'_>,
        payload: &[u8],
        client_writer: &mut PacketWriter<W>,
        deprecate_eof: bool,
    ) -> RouterResult<()> {
        self.apply_autocommit_toggle(stmt);

        let command_byte = payload.first().copied().unwrap_or(CommandCode::ComQuery as u8);
        let cmd = self
            .sescmd_log
            .append(command_byte, payload.to_vec(), stmt.expects_response);
        self.sent_sescmd = cmd.position;
        self.metrics.record_session_command();

        if command_byte == CommandCode::ComStmtPrepare as u8 {
            let external_id = self.prepared.register(payload.to_vec());
            self.pending_prepare_external_id.insert(cmd.position, external_id);
        }

        let names: Vec<String> = self.backends.keys().cloned().collect();
        if names.is_empty() {
            // No backend open yet: nothing to broadcast to right now, the
            // command is already durably queued for whichever backend
            // connects next.
            return Ok(());
        }
        for name in &names {
            if let Some(backend) = self.backends.get_mut(name) {
                backend.append_session_command(cmd.clone());
            }
        }
        self.drain_ready_backends(client_writer, deprecate_eof).await
    }

    /// Forwards a continuation fragment of a multi-packet session write to
    /// every currently open backend, without appending a second entry to
    /// the session-command log (the first fragment already did that).
    async fn broadcast_continuation_to_all<W: AsyncWrite + Unpin + Send>(
        &mut self,
        payload: &[u8],
        client_writer: &mut PacketWriter<W>,
        deprecate_eof: bool,
        expects_response: bool,
    ) -> RouterResult<()> {
        let response_mode = if expects_response {
            ResponseMode::ExpectResponse
        } else {
            ResponseMode::NoResponse
        };
        let names: Vec<String> = self.backends.keys().cloned().collect();
        for name in &names {
            if let Some(backend) = self.backends.get_mut(name) {
                backend.write(payload, response_mode).await?;
            }
        }
        if !expects_response {
            return Ok(());
        }
        let mut forwarded = false;
        for name in &names {
            loop {
                let packet = {
                    let Some(backend) = self.backends.get_mut(name) else { break };
                    backend.read_reply_packet(deprecate_eof).await?
                };
                let Some(packet) = packet else { break };
                if !forwarded {
                    client_writer.write_all(packet.as_ref()).map_err(|e| RouterError::BackendIo {
                        backend: name.clone(),
                        source: e,
                    })?;
                    client_writer.end_packet().await.map_err(|e| RouterError::BackendIo {
                        backend: name.clone(),
                        source: e,
                    })?;
                }
                let backend = self.backends.get_mut(name).unwrap();
                if backend.reply_state() == ReplyState::Done {
                    backend.ack_reply();
                    break;
                }
            }
            forwarded = true;
        }
        client_writer.flush_all().await.map_err(|e| RouterError::BackendIo {
            backend: "client".to_string(),
            source: e,
        })
    }

    /// Drains any backend whose session-command queue is ready to run and
    /// forwards the first reply seen at each position to the client,
    /// absorbing later duplicates per §4.4's reply-coalescing rule.
    async fn drain_ready_backends<W: AsyncWrite + Unpin + Send>(
        &mut self,
        client_writer: &mut PacketWriter<W>,
        deprecate_eof: bool,
    ) -> RouterResult<()> {
        let names: Vec<String> = self.backends.keys().cloned().collect();
        for name in names {
            while self.backends.get(&name).map(|b| b.have_session_commands()).unwrap_or(false) {
                let cmd = {
                    let backend = self.backends.get_mut(&name).unwrap();
                    backend.execute_session_command().await?
                };
                let Some(cmd) = cmd else { break };
                let Some(mut reply) = self.collect_full_reply(&name, deprecate_eof).await? else {
                    continue;
                };

                // A COM_STMT_PREPARE_OK reply embeds the backend's own
                // statement id, which legitimately differs between
                // backends; canonicalize it to the client-visible id before
                // comparing against what's already recorded so that
                // per-backend id assignment alone is never mistaken for
                // divergence.
                if cmd.command_byte == CommandCode::ComStmtPrepare as u8 && reply.first().copied() == Some(0x00) {
                    if let Some(&external_id) = self.pending_prepare_external_id.get(&cmd.position) {
                        if let Some(backend_stmt_id) = parse_prepare_ok_stmt_id(&reply) {
                            self.prepared.mark_prepared_on(external_id, &name, backend_stmt_id);
                        }
                        if let Some(rewritten) = rewrite_statement_id(&reply, external_id) {
                            reply = rewritten;
                        }
                    }
                }

                let is_err = reply.first().copied() == Some(0xffu8);
                let outcome = self.sescmd_log.record_response(cmd.position, reply.clone(), is_err);
                self.recv_sescmd = self.recv_sescmd.max(cmd.position + 1);

                match outcome {
                    ResponseOutcome::Diverged => {
                        tracing::warn!(
                            backend = %name,
                            position = cmd.position,
                            "backend's session-command reply diverged from the one already sent to the client; closing it"
                        );
                        if let Some(backend) = self.backends.get_mut(&name) {
                            backend.close();
                        }
                        self.backends.remove(&name);
                        break;
                    }
                    ResponseOutcome::FirstSeen if cmd.expects_response => {
                        client_writer.write_all(&reply).map_err(|e| RouterError::BackendIo {
                            backend: name.clone(),
                            source: e,
                        })?;
                        client_writer.end_packet().await.map_err(|e| RouterError::BackendIo {
                            backend: name.clone(),
                            source: e,
                        })?;
                    }
                    ResponseOutcome::FirstSeen | ResponseOutcome::Matches => {}
                }
            }
        }
        client_writer.flush_all().await.map_err(|e| RouterError::BackendIo {
            backend: "client".to_string(),
            source: e,
        })
    }

    /// Reads every packet of one reply from `backend` (possibly several,
    /// for a result set), concatenated as a single combined buffer for
    /// session-command coalescing purposes (only OK/ERR is ever checked).
    async fn collect_full_reply(&mut self, backend: &str, deprecate_eof: bool) -> RouterResult<Option<Vec<u8>>> {
        let b = self.backends.get_mut(backend).ok_or_else(|| RouterError::NoSuitableBackend {
            target: backend.to_string(),
        })?;
        let mut first_packet = None;
        loop {
            match b.read_reply_packet(deprecate_eof).await? {
                Some(packet) => {
                    if first_packet.is_none() {
                        first_packet = Some(packet.as_ref().to_vec());
                    }
                    if b.reply_state() == ReplyState::Done {
                        b.ack_reply();
                        break;
                    }
                }
                None => break,
            }
        }
        Ok(first_packet)
    }

    /// Ordinary (non-session-write) routing path: decide target, resolve
    /// and open the backend if needed, defer behind pending session
    /// commands, then write and forward the reply.
    async fn route_and_write<W: AsyncWrite + Unpin + Send>(
        &mut self,
        stmt: &ClassifiedStatement<'_>,
        payload: &[u8],
        client_writer: &mut PacketWriter<W>,
        deprecate_eof: bool,
        expects_response_override: Option<bool>,
    ) -> RouterResult<()> {
        let exec_backend = self.prepared_exec_backend(stmt);
        let large_query_target = self.large_query_target.clone();
        // `decide()` must see the transaction state as it was *before* this
        // statement, so a COMMIT/ROLLBACK still sees `in_transaction` true
        // and routes to the backend the transaction is pinned to.
        let decision: RouteDecision = decide(
            stmt,
            &self.session_context(large_query_target.as_ref(), exec_backend.as_deref()),
        );

        let backend_name = match self.resolve_target_name(&decision.target) {
            Ok(name) => name,
            Err(e) => return self.handle_primary_unavailable(&decision.target, e, client_writer).await,
        };
        if let Err(e) = self.ensure_backend(&backend_name).await {
            return self.handle_primary_unavailable(&decision.target, e, client_writer).await;
        }

        if self.backends.get(&backend_name).map(|b| b.have_session_commands()).unwrap_or(false) {
            if self.query_queue.len() >= self.config.max_query_queue {
                return Err(RouterError::QueueOverflow {
                    limit: self.config.max_query_queue,
                });
            }
            self.query_queue.push_back(QueuedStatement {
                payload: payload.to_vec(),
                target: decision.target.clone(),
            });
            self.expected_responses += 1;
            return Ok(());
        }

        if decision.causal_read_wait {
            self.causal_read_wait(&backend_name, deprecate_eof).await?;
        }

        self.dispatch_to_backend(
            &backend_name,
            stmt,
            payload,
            client_writer,
            deprecate_eof,
            expects_response_override,
        )
        .await?;

        match decision.target {
            RouteTarget::Master => self.metrics.record_primary(),
            RouteTarget::Slave | RouteTarget::LagMax(_) => self.metrics.record_replica(),
            RouteTarget::All => self.metrics.record_all(),
            RouteTarget::NamedServer(_) => {}
        }

        if stmt.command == CommandCode::ComStmtExecute {
            if let Some(id) = stmt.prepared_stmt_id {
                self.prepared.record_exec(id, &backend_name);
            }
        }

        // Mutate transaction state only *after* this statement has actually
        // landed on `backend_name` — that's the backend a read-only
        // transaction or a locked session pins to from here on.
        self.apply_transaction_state(stmt, &backend_name);

        self.drain_query_queue(client_writer, deprecate_eof).await
    }

    /// Applies the BEGIN/COMMIT/ROLLBACK and locked-to-master side effects
    /// of a just-dispatched statement (§4.4's transaction tracking, and the
    /// `strict_multi_stmt`/`strict_sp_calls` lock-in rules). `locked_to_master`
    /// is sticky for the rest of the session once set — it is never cleared
    /// by a COMMIT/ROLLBACK.
    fn apply_transaction_state(&mut self, stmt: &ClassifiedStatement<'_>, backend_name: &str) {
        if stmt.type_bitmap.contains(QueryType::BEGIN_TRX) {
            self.in_transaction = true;
            self.read_only_transaction = false;
            self.locked_backend = Some(backend_name.to_string());
        } else if stmt.type_bitmap.contains(QueryType::READ_ONLY_TRX_START) {
            self.in_transaction = true;
            self.read_only_transaction = true;
            self.locked_backend = Some(backend_name.to_string());
        } else if stmt.type_bitmap.contains(QueryType::COMMIT_OR_ROLLBACK) {
            self.in_transaction = false;
            self.read_only_transaction = false;
            self.locked_backend = None;
        }

        if self.config.strict_multi_stmt && stmt.type_bitmap.contains(QueryType::MULTI_STMT) {
            self.locked_to_master = true;
        }
        if self.config.strict_sp_calls && stmt.type_bitmap.contains(QueryType::STORED_PROC) {
            self.locked_to_master = true;
        }
    }

    /// SET AUTOCOMMIT toggles are session writes; this is a shallow sniff
    /// in the same style as `classify::classify_query_text`, not a parser.
    fn apply_autocommit_toggle(&mut self, stmt: &ClassifiedStatement<'_>) {
        if stmt.command != CommandCode::ComQuery {
            return;
        }
        let text = String::from_utf8_lossy(stmt.statement_text).to_ascii_lowercase();
        let Some(rest) = text.trim_start().strip_prefix("set ") else {
            return;
        };
        let Some(rest) = rest.trim_start().strip_prefix("autocommit") else {
            return;
        };
        let value = rest.trim_start().trim_start_matches('=').trim();
        if value.starts_with('0') || value.starts_with("off") || value.starts_with("false") {
            self.autocommit = false;
        } else if value.starts_with('1') || value.starts_with("on") || value.starts_with("true") {
            self.autocommit = true;
        }
    }

    /// §6's `master_failure_mode` dispatch. Only applies when the statement
    /// actually needed the primary:
    /// - `fail_instantly` propagates `err`, closing the client connection.
    /// - `error_on_write` reports the failure as an ordinary client error
    ///   and keeps the session (and any other open backend) alive.
    /// - `fail_on_write` additionally drops any lingering primary backend
    ///   connection this session still held open, then degrades the same
    ///   way `error_on_write` does — the session survives for reads, but
    ///   its stale primary handle is never reused.
    async fn handle_primary_unavailable<W: AsyncWrite + Unpin + Send>(
        &mut self,
        target: &RouteTarget,
        err: RouterError,
        client_writer: &mut PacketWriter<W>,
    ) -> RouterResult<()> {
        if !matches!(target, RouteTarget::Master) {
            return Err(err);
        }
        match self.config.master_failure_mode() {
            MasterFailureMode::FailInstantly => Err(err),
            MasterFailureMode::ErrorOnWrite | MasterFailureMode::FailOnWrite => {
                if matches!(self.config.master_failure_mode(), MasterFailureMode::FailOnWrite) {
                    let stale_primary = self
                        .backends
                        .values()
                        .find(|b| b.role == ServerRole::Primary)
                        .map(|b| b.name.clone());
                    if let Some(name) = stale_primary {
                        if let Some(backend) = self.backends.get_mut(&name) {
                            backend.close();
                        }
                        self.backends.remove(&name);
                    }
                }
                let msg = format!("primary is unavailable: {err}");
                write_err_packet(ErrorKind::ER_OPTION_PREVENTS_STATEMENT, msg.as_bytes(), client_writer)
                    .await
                    .map_err(|e| RouterError::BackendIo {
                        backend: "client".to_string(),
                        source: e,
                    })?;
                client_writer.flush_all().await.map_err(|e| RouterError::BackendIo {
                    backend: "client".to_string(),
                    source: e,
                })
            }
        }
    }

    /// Waits for `backend_name` to catch up to the session's last-seen
    /// GTID before a causal read runs on it (§4.4 step 7 / §8 scenario 6).
    /// Run as its own round trip rather than chained onto the real query:
    /// the reply-state machine this router uses tracks exactly one result
    /// set per write, so there's no safe way to pipeline a second statement
    /// ahead of it. A timed-out wait (`MASTER_GTID_WAIT` returning -1) isn't
    /// distinguished from a successful one here — only a hard backend error
    /// during the wait is surfaced, since judging the return value would
    /// require parsing the text-protocol result row this router otherwise
    /// never needs to.
    async fn causal_read_wait(&mut self, backend_name: &str, deprecate_eof: bool) -> RouterResult<()> {
        let Some(gtid) = self.gtid.clone() else {
            return Ok(());
        };
        let timeout_secs = self.config.causal_reads_timeout().as_secs();
        let mut payload = vec![CommandCode::ComQuery as u8];
        payload.extend_from_slice(format!("SELECT MASTER_GTID_WAIT('{gtid}', {timeout_secs})").as_bytes());

        let backend = self.backends.get_mut(backend_name).ok_or_else(|| RouterError::NoSuitableBackend {
            target: backend_name.to_string(),
        })?;
        backend.write(&payload, ResponseMode::ExpectResponse).await?;

        let mut saw_err = false;
        loop {
            let Some(packet) = backend.read_reply_packet(deprecate_eof).await? else {
                break;
            };
            saw_err |= packet.is_err_packet();
            if backend.reply_state() == ReplyState::Done {
                backend.ack_reply();
                break;
            }
        }
        if saw_err {
            return Err(RouterError::CausalReadTimeout {
                gtid,
                timeout_ms: timeout_secs * 1000,
            });
        }
        Ok(())
    }

    /// COM_STMT_CLOSE: closes the statement on every backend that actually
    /// prepared it, each addressed by its own backend-assigned id, then
    /// forgets the bookkeeping. Expects no reply, per protocol.
    async fn close_prepared_statement(&mut self, external_id: u32) -> RouterResult<()> {
        for (backend_name, backend_stmt_id) in self.prepared.close(external_id) {
            if let Some(backend) = self.backends.get_mut(&backend_name) {
                let mut payload = vec![CommandCode::ComStmtClose as u8];
                payload.extend_from_slice(&backend_stmt_id.to_le_bytes());
                backend.write(&payload, ResponseMode::NoResponse).await?;
            }
        }
        Ok(())
    }

    /// Lazily replays a COM_STMT_PREPARE onto `backend_name` the first time
    /// an EXECUTE needs to run there (§4.5: backends are prepared on first
    /// use, not eagerly on every connection).
    async fn prepare_for_execute(&mut self, external_id: u32, backend_name: &str, deprecate_eof: bool) -> RouterResult<()> {
        let original_packet = self
            .prepared
            .get(external_id)
            .map(|p| p.original_packet.clone())
            .ok_or_else(|| RouterError::Protocol {
                backend: backend_name.to_string(),
                reason: format!("no known PREPARE body for statement {external_id}"),
            })?;
        let backend = self.backends.get_mut(backend_name).ok_or_else(|| RouterError::NoSuitableBackend {
            target: backend_name.to_string(),
        })?;
        backend.write(&original_packet, ResponseMode::ExpectResponse).await?;

        let mut last_packet = None;
        loop {
            let Some(packet) = backend.read_reply_packet(deprecate_eof).await? else {
                break;
            };
            last_packet = Some(packet.as_ref().to_vec());
            if backend.reply_state() == ReplyState::Done {
                backend.ack_reply();
                break;
            }
        }
        let reply = last_packet.ok_or_else(|| RouterError::Protocol {
            backend: backend_name.to_string(),
            reason: "no reply to lazily-replayed PREPARE".to_string(),
        })?;
        if reply.first().copied() == Some(0xff) {
            return Err(RouterError::Protocol {
                backend: backend_name.to_string(),
                reason: "backend rejected lazily-replayed PREPARE".to_string(),
            });
        }
        let backend_stmt_id = parse_prepare_ok_stmt_id(&reply).ok_or_else(|| RouterError::Protocol {
            backend: backend_name.to_string(),
            reason: "malformed COM_STMT_PREPARE_OK reply".to_string(),
        })?;
        self.prepared.mark_prepared_on(external_id, backend_name, backend_stmt_id);
        Ok(())
    }

    /// Writes one statement to `backend_name` and forwards its reply,
    /// rewriting a COM_STMT_EXECUTE's embedded statement id to whatever
    /// `backend_name` itself assigned when it was prepared there (lazily
    /// preparing it first if needed), and capturing any GTID the reply
    /// reports for future causal reads.
    async fn dispatch_to_backend<W: AsyncWrite + Unpin + Send>(
        &mut self,
        backend_name: &str,
        stmt: &ClassifiedStatement<'_>,
        payload: &[u8],
        client_writer: &mut PacketWriter<W>,
        deprecate_eof: bool,
        expects_response_override: Option<bool>,
    ) -> RouterResult<()> {
        let effective_payload = if stmt.command == CommandCode::ComStmtExecute {
            match stmt.prepared_stmt_id {
                Some(external_id) => {
                    if !self.prepared.is_prepared_on(external_id, backend_name) {
                        self.prepare_for_execute(external_id, backend_name, deprecate_eof).await?;
                    }
                    match self.prepared.backend_id(external_id, backend_name) {
                        Some(backend_stmt_id) => rewrite_statement_id(payload, backend_stmt_id).unwrap_or_else(|| payload.to_vec()),
                        None => payload.to_vec(),
                    }
                }
                None => payload.to_vec(),
            }
        } else {
            payload.to_vec()
        };

        let last_reply = self
            .write_and_forward(
                backend_name,
                stmt,
                &effective_payload,
                client_writer,
                deprecate_eof,
                expects_response_override,
            )
            .await?;

        if let Some(gtid) = last_reply.as_ref().and_then(|r| extract_gtid_from_ok(r)) {
            self.gtid = Some(gtid);
        }
        Ok(())
    }

    /// Writes `payload` to `backend_name` and forwards every reply packet
    /// to the client, returning the last packet seen (if any) so the
    /// caller can inspect it (e.g. for GTID capture).
    async fn write_and_forward<W: AsyncWrite + Unpin + Send>(
        &mut self,
        backend_name: &str,
        stmt: &ClassifiedStatement<'_>,
        payload: &[u8],
        client_writer: &mut PacketWriter<W>,
        deprecate_eof: bool,
        expects_response_override: Option<bool>,
    ) -> RouterResult<Option<Vec<u8>>> {
        let expects_response = expects_response_override.unwrap_or(stmt.expects_response);
        let response_mode = if expects_response {
            ResponseMode::ExpectResponse
        } else {
            ResponseMode::NoResponse
        };
        let backend = self.backends.get_mut(backend_name).ok_or_else(|| RouterError::NoSuitableBackend {
            target: backend_name.to_string(),
        })?;
        backend.write(payload, response_mode).await?;
        if !expects_response {
            return Ok(None);
        }
        let mut last_packet = None;
        loop {
            let Some(packet) = backend.read_reply_packet(deprecate_eof).await? else {
                break;
            };
            client_writer.write_all(packet.as_ref()).map_err(|e| RouterError::BackendIo {
                backend: backend_name.to_string(),
                source: e,
            })?;
            client_writer.end_packet().await.map_err(|e| RouterError::BackendIo {
                backend: backend_name.to_string(),
                source: e,
            })?;
            last_packet = Some(packet.as_ref().to_vec());
            if backend.reply_state() == ReplyState::Done {
                backend.ack_reply();
                break;
            }
        }
        client_writer.flush_all().await.map_err(|e| RouterError::BackendIo {
            backend: backend_name.to_string(),
            source: e,
        })?;
        Ok(last_packet)
    }

    /// Re-drives statements that were deferred in §4.4 step 4 once their
    /// target backend's session-command queue has drained.
    async fn drain_query_queue<W: AsyncWrite + Unpin + Send>(
        &mut self,
        client_writer: &mut PacketWriter<W>,
        deprecate_eof: bool,
    ) -> RouterResult<()> {
        while let Some(front) = self.query_queue.front() {
            let name = match self.resolve_target_name(&front.target) {
                Ok(n) => n,
                Err(_) => break,
            };
            if self.backends.get(&name).map(|b| b.have_session_commands()).unwrap_or(true) {
                break;
            }
            let queued = self.query_queue.pop_front().unwrap();
            let stmt_owned = classify(&queued.payload);
            self.dispatch_to_backend(&name, &stmt_owned, &queued.payload, client_writer, deprecate_eof, None)
                .await?;
            self.expected_responses = self.expected_responses.saturating_sub(1);
        }
        Ok(())
    }

    /// Connection keep-alive (§4.4): pings any idle, non-awaiting backend
    /// past the configured interval.
    pub async fn keepalive_tick(&mut self) -> RouterResult<()> {
        let interval = self.config.connection_keepalive();
        if interval.is_zero() {
            return Ok(());
        }
        let names: Vec<String> = self.backends.keys().cloned().collect();
        for name in names {
            let should_ping = self
                .backends
                .get(&name)
                .map(|b| b.reply_state() == ReplyState::Idle && b.idle_for() >= interval)
                .unwrap_or(false);
            if should_ping {
                if let Some(backend) = self.backends.get_mut(&name) {
                    backend.ping().await?;
                    // Drain and discard the ignorable pong.
                    while let Some(packet) = backend.read_reply_packet(true).await? {
                        if backend.reply_state() == ReplyState::Done {
                            backend.ack_reply();
                            break;
                        }
                        let _ = packet;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }

    /// How many client statements are currently deferred behind a
    /// backend's pending session-command replay (§4.4 step 4).
    pub fn pending_responses(&self) -> u64 {
        self.expected_responses
    }

    /// `(sent_sescmd, recv_sescmd)`: the highest session-command position
    /// broadcast so far and the highest one fully acknowledged.
    pub fn sescmd_progress(&self) -> (u64, u64) {
        (self.sent_sescmd, self.recv_sescmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;
    use crate::topology::{Server, Topology, TopologyHandle};

    fn session_with(servers: Vec<Server>) -> RouterSession {
        let config = Arc::new(RouterConfig::parse_from(["rwsplit"]));
        let topology = TopologyHandle::new(Topology::new(servers));
        RouterSession::new(config, topology, RouterMetrics::default())
    }

    fn primary() -> Server {
        Server {
            name: "primary".to_string(),
            addr: "127.0.0.1:3306".to_string(),
            role: ServerRole::Primary,
            lag_ms: None,
        }
    }

    fn replica(name: &str, lag_ms: u64) -> Server {
        Server {
            name: name.to_string(),
            addr: "127.0.0.1:3307".to_string(),
            role: ServerRole::Replica,
            lag_ms: Some(lag_ms),
        }
    }

    #[test]
    fn fresh_session_has_no_pending_work() {
        let session = session_with(vec![primary()]);
        assert_eq!(session.pending_responses(), 0);
        assert_eq!(session.sescmd_progress(), (0, 0));
    }

    #[test]
    fn resolve_target_name_master_picks_the_primary() {
        let mut session = session_with(vec![primary(), replica("r1", 0)]);
        let name = session.resolve_target_name(&RouteTarget::Master).unwrap();
        assert_eq!(name, "primary");
    }

    #[test]
    fn resolve_target_name_master_fails_without_a_primary() {
        let mut session = session_with(vec![replica("r1", 0)]);
        let err = session.resolve_target_name(&RouteTarget::Master).unwrap_err();
        assert!(matches!(err, RouterError::NoSuitableBackend { .. }));
    }

    #[test]
    fn resolve_target_name_named_server_is_passthrough() {
        let mut session = session_with(vec![primary(), replica("r1", 0)]);
        let name = session
            .resolve_target_name(&RouteTarget::NamedServer("r1".to_string()))
            .unwrap();
        assert_eq!(name, "r1");
    }

    #[test]
    fn resolve_target_name_slave_respects_lag_cap() {
        let mut session = session_with(vec![primary(), replica("r1", 500)]);
        let err = session
            .resolve_target_name(&RouteTarget::LagMax(100))
            .unwrap_err();
        assert!(matches!(err, RouterError::NoSuitableBackend { .. }));
    }

    #[test]
    fn candidates_reflect_topology_and_in_use_state() {
        let session = session_with(vec![primary(), replica("r1", 0)]);
        let candidates = session.candidates();
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| !c.in_use));
    }

    #[test]
    fn session_context_carries_transaction_and_config_state() {
        let mut session = session_with(vec![primary()]);
        session.in_transaction = true;
        session.locked_to_master = true;
        let ctx = session.session_context(None, None);
        assert!(ctx.in_transaction);
        assert!(ctx.locked_to_master);
        assert!(ctx.autocommit);
        assert!(!ctx.has_gtid);
    }
}
