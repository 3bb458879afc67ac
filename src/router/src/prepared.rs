//! Prepared Statement Manager (§4.5 / §3 `PreparedStatement`/`ExecMap`):
//! maps client-visible prepared-statement ids to internal ids and the set
//! of backends each has actually been prepared on, rewriting
//! EXECUTE/CLOSE/FETCH payloads so each backend sees the id it knows about.

use hashbrown::HashMap;

#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub external_id: u32,
    pub original_packet: Vec<u8>,
    /// Each backend's own statement id for this prepare — backends are free
    /// to assign a different id than the one the client was told about.
    pub backend_ids: HashMap<String, u32>,
}

#[derive(Debug, Default)]
pub struct PreparedStatementManager {
    next_external_id: u32,
    by_external_id: HashMap<u32, PreparedStatement>,
    /// ExecMap: internal id -> backend name that last executed it, so
    /// COM_STMT_FETCH lands on the same connection.
    exec_map: HashMap<u32, String>,
}

impl PreparedStatementManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client's COM_STMT_PREPARE, minting and returning the
    /// client-visible statement id — the client has none of its own to
    /// offer until it's told one in the COM_STMT_PREPARE_OK reply. The
    /// backend map starts empty: nothing has prepared it yet, it'll be
    /// lazily replayed on first use per backend.
    pub fn register(&mut self, original_packet: Vec<u8>) -> u32 {
        let external_id = self.next_external_id;
        self.next_external_id += 1;
        self.by_external_id.insert(
            external_id,
            PreparedStatement {
                external_id,
                original_packet,
                backend_ids: HashMap::new(),
            },
        );
        external_id
    }

    pub fn get(&self, external_id: u32) -> Option<&PreparedStatement> {
        self.by_external_id.get(&external_id)
    }

    pub fn is_prepared_on(&self, external_id: u32, backend: &str) -> bool {
        self.by_external_id
            .get(&external_id)
            .map(|p| p.backend_ids.contains_key(backend))
            .unwrap_or(false)
    }

    /// The statement id `backend` itself assigned when it prepared this
    /// statement, if known.
    pub fn backend_id(&self, external_id: u32, backend: &str) -> Option<u32> {
        self.by_external_id
            .get(&external_id)
            .and_then(|p| p.backend_ids.get(backend))
            .copied()
    }

    pub fn mark_prepared_on(&mut self, external_id: u32, backend: &str, backend_stmt_id: u32) {
        if let Some(stmt) = self.by_external_id.get_mut(&external_id) {
            stmt.backend_ids.insert(backend.to_string(), backend_stmt_id);
        }
    }

    /// Records that `backend` last ran this statement's EXECUTE, so a
    /// follow-up COM_STMT_FETCH routes to the same place.
    pub fn record_exec(&mut self, external_id: u32, backend: &str) {
        self.exec_map.insert(external_id, backend.to_string());
    }

    pub fn exec_backend(&self, external_id: u32) -> Option<&str> {
        self.exec_map.get(&external_id).map(|s| s.as_str())
    }

    /// COM_STMT_CLOSE: forwarded to every backend that actually has the
    /// prepare, using that backend's own statement id, then the bookkeeping
    /// is dropped entirely.
    pub fn close(&mut self, external_id: u32) -> Vec<(String, u32)> {
        self.exec_map.remove(&external_id);
        self.by_external_id
            .remove(&external_id)
            .map(|p| p.backend_ids.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn session_ended(&mut self) {
        self.by_external_id.clear();
        self.exec_map.clear();
    }
}

/// Rewrites the 4-byte little-endian statement id embedded at the start of
/// an EXECUTE/CLOSE/FETCH payload's body (immediately after the command
/// byte) to `new_id`. Returns `None` if the payload is too short.
pub fn rewrite_statement_id(payload: &[u8], new_id: u32) -> Option<Vec<u8>> {
    if payload.len() < 5 {
        return None;
    }
    let mut rewritten = payload.to_vec();
    rewritten[1..5].copy_from_slice(&new_id.to_le_bytes());
    Some(rewritten)
}

/// Pulls the backend-assigned statement id out of a COM_STMT_PREPARE_OK
/// reply: byte 0 is the 0x00 status marker, bytes 1..5 are the LE u32 id.
pub fn parse_prepare_ok_stmt_id(reply: &[u8]) -> Option<u32> {
    if reply.len() < 5 || reply[0] != 0x00 {
        return None;
    }
    Some(u32::from_le_bytes(reply[1..5].try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_assigns_increasing_external_ids() {
        let mut mgr = PreparedStatementManager::new();
        let a = mgr.register(vec![0x16, b'?']);
        let b = mgr.register(vec![0x16, b'?']);
        assert_ne!(a, b);
    }

    #[test]
    fn tracks_which_backends_have_prepared() {
        let mut mgr = PreparedStatementManager::new();
        let id = mgr.register(vec![]);
        assert!(!mgr.is_prepared_on(id, "primary"));
        mgr.mark_prepared_on(id, "primary", 1);
        assert!(mgr.is_prepared_on(id, "primary"));
        assert!(!mgr.is_prepared_on(id, "replica1"));
    }

    #[test]
    fn remembers_each_backend_own_statement_id() {
        let mut mgr = PreparedStatementManager::new();
        let id = mgr.register(vec![]);
        mgr.mark_prepared_on(id, "primary", 7);
        mgr.mark_prepared_on(id, "replica1", 42);
        assert_eq!(mgr.backend_id(id, "primary"), Some(7));
        assert_eq!(mgr.backend_id(id, "replica1"), Some(42));
    }

    #[test]
    fn exec_map_remembers_last_backend() {
        let mut mgr = PreparedStatementManager::new();
        let id = mgr.register(vec![]);
        mgr.record_exec(id, "replica1");
        assert_eq!(mgr.exec_backend(id), Some("replica1"));
    }

    #[test]
    fn close_returns_every_backend_with_the_prepare_and_forgets_it() {
        let mut mgr = PreparedStatementManager::new();
        let id = mgr.register(vec![]);
        mgr.mark_prepared_on(id, "primary", 1);
        mgr.mark_prepared_on(id, "replica1", 9);
        let mut backends = mgr.close(id);
        backends.sort();
        assert_eq!(
            backends,
            vec![("primary".to_string(), 1), ("replica1".to_string(), 9)]
        );
        assert!(mgr.get(id).is_none());
    }

    #[test]
    fn parses_prepare_ok_statement_id() {
        let mut reply = vec![0x00];
        reply.extend_from_slice(&99u32.to_le_bytes());
        reply.extend_from_slice(&[0, 0, 0, 0, 0]);
        assert_eq!(parse_prepare_ok_stmt_id(&reply), Some(99));
        assert_eq!(parse_prepare_ok_stmt_id(&[0xff, 1, 2, 3, 4]), None);
        assert_eq!(parse_prepare_ok_stmt_id(&[0x00, 1, 2]), None);
    }

    #[test]
    fn rewrite_statement_id_replaces_the_four_bytes_after_command() {
        let payload = {
            let mut p = vec![0x17u8];
            p.extend_from_slice(&9u32.to_le_bytes());
            p.push(0);
            p
        };
        let rewritten = rewrite_statement_id(&payload, 42).unwrap();
        assert_eq!(u32::from_le_bytes(rewritten[1..5].try_into().unwrap()), 42);
    }
}
