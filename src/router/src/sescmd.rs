//! Session Command Log (§4.2): the ordered history of session-state
//! mutations that must be replayed identically on every backend a session
//! touches. Grounded on the append-only, position-keyed design in §3's
//! `SessionCommandLog` data model entry.

use std::sync::Arc;

use hashbrown::HashMap;

/// One state-mutating statement. Immutable once created; shared by `Arc`
/// with every backend queue that still needs to replay it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCommand {
    pub position: u64,
    pub command_byte: u8,
    pub payload: Vec<u8>,
    pub expects_response: bool,
}

impl SessionCommand {
    /// Two commands are textually equivalent if they'd produce the same
    /// effect when replayed — same command byte, same payload bytes.
    fn textually_equivalent(&self, other: &SessionCommand) -> bool {
        self.command_byte == other.command_byte && self.payload == other.payload
    }

    fn is_prepare(&self) -> bool {
        self.command_byte == crate::protocol::mysql::constants::CommandCode::ComStmtPrepare as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedResponse {
    pub packet: Vec<u8>,
    pub is_err: bool,
}

/// Outcome of recording one backend's reply to a session command. §4.2's
/// "at-most-one response per session command" rule needs `FirstSeen` to
/// know when to forward to the client; §7's divergence handling needs
/// `Diverged` to know when a backend must be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    FirstSeen,
    Matches,
    Diverged,
}

#[derive(Debug, Default)]
pub struct SessionCommandLog {
    entries: Vec<Arc<SessionCommand>>,
    response_by_position: HashMap<u64, RecordedResponse>,
    next_position: u64,
    history_disabled: bool,
    max_history: usize,
}

impl SessionCommandLog {
    pub fn new(max_history: usize) -> Self {
        Self {
            entries: Vec::new(),
            response_by_position: HashMap::new(),
            next_position: 0,
            history_disabled: false,
            max_history,
        }
    }

    pub fn history_disabled(&self) -> bool {
        self.history_disabled
    }

    pub fn last_position(&self) -> Option<u64> {
        self.next_position.checked_sub(1)
    }

    pub fn entries(&self) -> &[Arc<SessionCommand>] {
        &self.entries
    }

    /// Appends a new session command and runs the pruning rules from §4.2.
    /// Returns the appended command so the caller can broadcast it.
    pub fn append(&mut self, command_byte: u8, payload: Vec<u8>, expects_response: bool) -> Arc<SessionCommand> {
        let cmd = Arc::new(SessionCommand {
            position: self.next_position,
            command_byte,
            payload,
            expects_response,
        });
        self.next_position += 1;
        self.entries.push(cmd.clone());

        if self.history_disabled {
            // Latched mode: don't grow the retained log at all.
            self.entries.clear();
        } else if self.entries.len() > self.max_history && self.max_history > 0 {
            self.history_disabled = true;
            self.entries.clear();
            self.prune_responses_below(cmd.position);
        } else {
            self.purge_duplicates();
        }
        cmd
    }

    /// Keeps only the first and last occurrence of each textually-equivalent
    /// run of commands; never prunes COM_STMT_PREPARE. §4.2 rule 1.
    fn purge_duplicates(&mut self) {
        let mut keep = vec![true; self.entries.len()];
        for i in 0..self.entries.len() {
            if self.entries[i].is_prepare() {
                continue;
            }
            // find every other index with the same text.
            let matches: Vec<usize> = (0..self.entries.len())
                .filter(|&j| j != i && !self.entries[j].is_prepare())
                .filter(|&j| self.entries[j].textually_equivalent(&self.entries[i]))
                .collect();
            if matches.len() >= 2 {
                // more than one peer: this one is a "middle" occurrence
                // unless it's the global first or last among the equivalence class.
                let mut class: Vec<usize> = matches.clone();
                class.push(i);
                class.sort_unstable();
                if class.first() != Some(&i) && class.last() != Some(&i) {
                    keep[i] = false;
                }
            }
        }
        let mut idx = 0;
        self.entries.retain(|_| {
            let k = keep[idx];
            idx += 1;
            k
        });
    }

    fn prune_responses_below(&mut self, floor: u64) {
        self.response_by_position.retain(|pos, _| *pos >= floor);
    }

    /// Records the first OK/ERR seen for a position; later replies at the
    /// same position are compared against it rather than trusted blindly —
    /// a backend that disagrees with what's already been told to the
    /// client has diverged and must be closed (§7).
    pub fn record_response(&mut self, position: u64, packet: Vec<u8>, is_err: bool) -> ResponseOutcome {
        match self.response_by_position.get(&position) {
            None => {
                self.response_by_position
                    .insert(position, RecordedResponse { packet, is_err });
                ResponseOutcome::FirstSeen
            }
            Some(recorded) if recorded.packet == packet && recorded.is_err == is_err => {
                ResponseOutcome::Matches
            }
            Some(_) => ResponseOutcome::Diverged,
        }
    }

    pub fn response_at(&self, position: u64) -> Option<&RecordedResponse> {
        self.response_by_position.get(&position)
    }
}

/// Per-backend replay queue and cursor into the shared log. §4.1's backend
/// owns one of these; `SessionCommandLog` stays the single source of truth.
#[derive(Debug, Default)]
pub struct BackendCursor {
    pub next_to_replay: u64,
    queue: Vec<Arc<SessionCommand>>,
}

impl BackendCursor {
    pub fn append(&mut self, cmd: Arc<SessionCommand>) {
        self.queue.push(cmd);
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Pops the head of the queue and advances the cursor; the caller is
    /// responsible for actually writing it to the backend.
    pub fn pop_next(&mut self) -> Option<Arc<SessionCommand>> {
        if self.queue.is_empty() {
            return None;
        }
        let cmd = self.queue.remove(0);
        self.next_to_replay = cmd.position + 1;
        Some(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purge_duplicates_keeps_first_and_last() {
        let mut log = SessionCommandLog::new(50);
        log.append(3, b"USE a".to_vec(), true);
        log.append(3, b"SET @x = 1".to_vec(), true);
        log.append(3, b"USE a".to_vec(), true);
        assert_eq!(log.entries().len(), 3, "only two USEs exist, nothing to prune yet");

        log.append(3, b"USE a".to_vec(), true);
        // Now three "USE a" entries exist at positions 0, 2, 3: middle (2) should be pruned.
        let texts: Vec<_> = log.entries().iter().map(|c| c.payload.clone()).collect();
        assert_eq!(texts.len(), 3);
        assert_eq!(texts[0], b"USE a");
        assert_eq!(texts[1], b"SET @x = 1");
        assert_eq!(texts[2], b"USE a");
    }

    #[test]
    fn prepare_is_never_pruned() {
        let mut log = SessionCommandLog::new(50);
        let prepare = crate::protocol::mysql::constants::CommandCode::ComStmtPrepare as u8;
        log.append(prepare, b"SELECT ?".to_vec(), true);
        log.append(prepare, b"SELECT ?".to_vec(), true);
        log.append(prepare, b"SELECT ?".to_vec(), true);
        assert_eq!(log.entries().len(), 3);
    }

    #[test]
    fn exceeding_max_history_latches_disabled_mode() {
        let mut log = SessionCommandLog::new(2);
        log.append(3, b"SET @a=1".to_vec(), true);
        log.append(3, b"SET @a=2".to_vec(), true);
        log.append(3, b"SET @a=3".to_vec(), true);
        assert!(log.history_disabled());
        assert!(log.entries().is_empty());
    }

    #[test]
    fn response_recorded_once() {
        let mut log = SessionCommandLog::new(50);
        assert_eq!(log.record_response(0, vec![0x00], false), ResponseOutcome::FirstSeen);
        assert_eq!(log.record_response(0, vec![0x00], false), ResponseOutcome::Matches);
    }

    #[test]
    fn diverging_response_is_detected() {
        let mut log = SessionCommandLog::new(50);
        assert_eq!(log.record_response(0, vec![0x00], false), ResponseOutcome::FirstSeen);
        assert_eq!(log.record_response(0, vec![0xff], true), ResponseOutcome::Diverged);
    }

    #[test]
    fn backend_cursor_drains_in_order() {
        let mut cursor = BackendCursor::default();
        cursor.append(Arc::new(SessionCommand {
            position: 0,
            command_byte: 3,
            payload: vec![],
            expects_response: true,
        }));
        cursor.append(Arc::new(SessionCommand {
            position: 1,
            command_byte: 3,
            payload: vec![],
            expects_response: true,
        }));
        assert!(cursor.has_pending());
        assert_eq!(cursor.pop_next().unwrap().position, 0);
        assert_eq!(cursor.next_to_replay, 1);
        assert_eq!(cursor.pop_next().unwrap().position, 1);
        assert!(!cursor.has_pending());
    }
}
