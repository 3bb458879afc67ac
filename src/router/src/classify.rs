//! Statement classifier (§4.4 step 2): command byte plus a lightweight
//! parser yields `(command, type-bitmap, optional prepared-stmt id,
//! optional hints)`. Grounded on the command dispatch in
//! `protocol::mysql::basic::from_packet` (which already turns a raw packet
//! into a `Command`), extended with the session-write / read-write
//! classification the decider needs. Deliberately not a SQL parser: per the
//! non-goals, this only answers "is this a write?" and similar shallow
//! questions, via prefix/keyword sniffing.

use bitflags::bitflags;

use crate::hints::{parse_hints, HintNode};
use crate::protocol::mysql::basic::{from_packet, Command};
use crate::protocol::mysql::constants::CommandCode;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueryType: u32 {
        const SESSION_WRITE      = 0b0000_0001;
        const WRITE              = 0b0000_0010;
        const READ                = 0b0000_0100;
        const BEGIN_TRX          = 0b0000_1000;
        const READ_ONLY_TRX_START = 0b0001_0000;
        const COMMIT_OR_ROLLBACK = 0b0010_0000;
        const MULTI_STMT         = 0b0100_0000;
        const STORED_PROC        = 0b1000_0000;
    }
}

#[derive(Debug, Clone)]
pub struct ClassifiedStatement<'a> {
    pub command: CommandCode,
    pub type_bitmap: QueryType,
    pub prepared_stmt_id: Option<u32>,
    pub hints: Option<Box<HintNode>>,
    pub statement_text: &'a [u8],
    pub expects_response: bool,
}

impl ClassifiedStatement<'_> {
    pub fn is_session_write(&self) -> bool {
        self.type_bitmap.contains(QueryType::SESSION_WRITE)
    }

    pub fn is_write(&self) -> bool {
        self.type_bitmap.contains(QueryType::WRITE)
    }
}

fn keyword_prefix(text: &[u8], keyword: &str) -> bool {
    let trimmed = leading_trim(text);
    trimmed.len() >= keyword.len() && trimmed[..keyword.len()].eq_ignore_ascii_case(keyword.as_bytes())
}

fn leading_trim(text: &[u8]) -> &[u8] {
    let mut i = 0;
    while i < text.len() && text[i].is_ascii_whitespace() {
        i += 1;
    }
    &text[i..]
}

fn is_multi_statement(text: &[u8]) -> bool {
    // crude but sufficient: a `;` followed by anything other than
    // whitespace/comment means there's a second statement.
    let s = String::from_utf8_lossy(text);
    let mut parts = s.split(';');
    parts.next();
    parts.any(|rest| !rest.trim().is_empty())
}

fn classify_query_text(text: &[u8]) -> QueryType {
    let mut qt = QueryType::empty();
    if keyword_prefix(text, "set ") || keyword_prefix(text, "use ") {
        qt |= QueryType::SESSION_WRITE;
    } else if keyword_prefix(text, "start transaction read only") {
        qt |= QueryType::READ_ONLY_TRX_START;
    } else if keyword_prefix(text, "begin") || keyword_prefix(text, "start transaction") {
        qt |= QueryType::BEGIN_TRX;
    } else if keyword_prefix(text, "commit") || keyword_prefix(text, "rollback") {
        qt |= QueryType::COMMIT_OR_ROLLBACK;
    } else if keyword_prefix(text, "call ") {
        qt |= QueryType::STORED_PROC | QueryType::WRITE;
    } else if keyword_prefix(text, "insert")
        || keyword_prefix(text, "update")
        || keyword_prefix(text, "delete")
        || keyword_prefix(text, "replace")
        || keyword_prefix(text, "create")
        || keyword_prefix(text, "alter")
        || keyword_prefix(text, "drop")
        || keyword_prefix(text, "truncate")
        || keyword_prefix(text, "grant")
        || keyword_prefix(text, "revoke")
    {
        qt |= QueryType::WRITE;
    } else {
        qt |= QueryType::READ;
    }
    if is_multi_statement(text) {
        qt |= QueryType::MULTI_STMT;
    }
    qt
}

/// Classifies one client packet. `payload` is the packet body, command byte
/// included, exactly as read off the wire.
pub fn classify(payload: &[u8]) -> ClassifiedStatement<'_> {
    if payload.is_empty() {
        return ClassifiedStatement {
            command: CommandCode::ComSleep,
            type_bitmap: QueryType::empty(),
            prepared_stmt_id: None,
            hints: None,
            statement_text: payload,
            expects_response: false,
        };
    }
    let command_byte = payload[0];
    let command = num_traits::FromPrimitive::from_u8(command_byte).unwrap_or(CommandCode::ComSleep);

    match from_packet(payload) {
        Ok((_, Command::Query(text))) => ClassifiedStatement {
            command,
            type_bitmap: classify_query_text(text),
            prepared_stmt_id: None,
            hints: parse_hints(text),
            statement_text: text,
            expects_response: true,
        },
        Ok((_, Command::Prepare(text))) => ClassifiedStatement {
            command,
            type_bitmap: QueryType::SESSION_WRITE,
            prepared_stmt_id: None,
            hints: parse_hints(text),
            statement_text: text,
            expects_response: true,
        },
        Ok((_, Command::Execute { stmt, params })) => ClassifiedStatement {
            command,
            type_bitmap: QueryType::empty(),
            prepared_stmt_id: Some(stmt),
            hints: None,
            statement_text: params,
            expects_response: true,
        },
        Ok((_, Command::SendLongData { stmt, .. })) => ClassifiedStatement {
            command,
            type_bitmap: QueryType::empty(),
            prepared_stmt_id: Some(stmt),
            hints: None,
            statement_text: payload,
            expects_response: false,
        },
        Ok((_, Command::Close(stmt))) => ClassifiedStatement {
            command,
            type_bitmap: QueryType::SESSION_WRITE,
            prepared_stmt_id: Some(stmt),
            hints: None,
            statement_text: payload,
            expects_response: false,
        },
        Ok((_, Command::Init(text))) => ClassifiedStatement {
            command,
            type_bitmap: QueryType::SESSION_WRITE,
            prepared_stmt_id: None,
            hints: None,
            statement_text: text,
            expects_response: true,
        },
        Ok((_, Command::ListFields(text))) => ClassifiedStatement {
            command,
            type_bitmap: QueryType::READ,
            prepared_stmt_id: None,
            hints: None,
            statement_text: text,
            expects_response: true,
        },
        Ok((_, Command::Ping)) | Ok((_, Command::Quit)) => ClassifiedStatement {
            command,
            type_bitmap: QueryType::empty(),
            prepared_stmt_id: None,
            hints: None,
            statement_text: payload,
            expects_response: matches!(command, CommandCode::ComPing),
        },
        Err(_) => {
            // commands with no structural parser (CHANGE_USER, RESET_CONNECTION,
            // SET_OPTION, STMT_FETCH, STMT_RESET, ...): treated generically.
            let type_bitmap = match command {
                CommandCode::ComChangeUser
                | CommandCode::ComResetConnection
                | CommandCode::ComSetOption
                | CommandCode::ComStmtReset => QueryType::SESSION_WRITE,
                _ => QueryType::empty(),
            };
            ClassifiedStatement {
                command,
                type_bitmap,
                prepared_stmt_id: None,
                hints: None,
                statement_text: payload,
                expects_response: !matches!(command, CommandCode::ComStmtSendLongData),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_is_read() {
        let payload = [&[CommandCode::ComQuery as u8][..], b"SELECT 1"].concat();
        let c = classify(&payload);
        assert!(c.type_bitmap.contains(QueryType::READ));
        assert!(!c.is_write());
    }

    #[test]
    fn insert_is_write() {
        let payload = [&[CommandCode::ComQuery as u8][..], b"INSERT INTO t VALUES (1)"].concat();
        let c = classify(&payload);
        assert!(c.is_write());
    }

    #[test]
    fn set_is_session_write() {
        let payload = [&[CommandCode::ComQuery as u8][..], b"SET @x = 1"].concat();
        let c = classify(&payload);
        assert!(c.is_session_write());
    }

    #[test]
    fn stmt_execute_carries_prepared_id() {
        let mut payload = vec![CommandCode::ComStmtExecute as u8];
        payload.extend_from_slice(&7u32.to_le_bytes());
        payload.push(0); // flags
        payload.extend_from_slice(&0u32.to_le_bytes()); // iterations
        let c = classify(&payload);
        assert_eq!(c.prepared_stmt_id, Some(7));
    }

    #[test]
    fn multi_statement_is_flagged() {
        let payload = [
            &[CommandCode::ComQuery as u8][..],
            b"SELECT 1; SELECT 2",
        ]
        .concat();
        let c = classify(&payload);
        assert!(c.type_bitmap.contains(QueryType::MULTI_STMT));
    }
}
