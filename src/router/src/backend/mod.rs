//! Backend Connection (§4.1): an owned handle to one backend server plus
//! its per-session state — reply state, session-command replay cursor, and
//! idle bookkeeping. Connection setup builds a `std::net::TcpStream` first
//! so socket options can be set before handing the descriptor to tokio,
//! then performs a real `mysql_native_password` handshake against the
//! backend.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, WriteBytesExt};
use mysql_common::constants::CapabilityFlags;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::warn;

use crate::errors::{RouterError, RouterResult};
use crate::protocol::mysql::constants::{CommandCode, HeaderInfo, SCRAMBLE_SIZE};
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::Packet;
use crate::server::auth::{sha1_1, sha1_2, xor};
use crate::sescmd::{BackendCursor, SessionCommand, SessionCommandLog};
use crate::topology::ServerRole;

/// §4.1's reply-state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    Idle,
    ExpectingStart,
    ExpectingMore,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    NoResponse,
    ExpectResponse,
}

/// One open connection to a backend server, owned exclusively by the
/// `RouterSession` that created it.
pub struct Backend {
    pub name: String,
    pub addr: String,
    pub role: ServerRole,
    reader: PacketReader<OwnedReadHalf>,
    writer: PacketWriter<OwnedWriteHalf>,
    reply_state: ReplyState,
    cursor: BackendCursor,
    last_read_at: Instant,
    closed: bool,
}

const CLIENT_CAPABILITIES: u32 = CapabilityFlags::CLIENT_LONG_PASSWORD.bits()
    | CapabilityFlags::CLIENT_LONG_FLAG.bits()
    | CapabilityFlags::CLIENT_PROTOCOL_41.bits()
    | CapabilityFlags::CLIENT_SECURE_CONNECTION.bits()
    | CapabilityFlags::CLIENT_TRANSACTIONS.bits()
    | CapabilityFlags::CLIENT_MULTI_STATEMENTS.bits()
    | CapabilityFlags::CLIENT_MULTI_RESULTS.bits()
    | CapabilityFlags::CLIENT_PLUGIN_AUTH.bits()
    | CapabilityFlags::CLIENT_SESSION_TRACK.bits();

struct Greeting {
    connection_id: u32,
    scramble: [u8; SCRAMBLE_SIZE],
}

fn parse_greeting(payload: &[u8], backend: &str) -> RouterResult<Greeting> {
    let protocol_err = |reason: &str| RouterError::Protocol {
        backend: backend.to_string(),
        reason: reason.to_string(),
    };
    if payload.is_empty() || payload[0] != 0x0a {
        return Err(protocol_err("unsupported handshake protocol version"));
    }
    let mut i = 1;
    let version_end = payload[i..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| protocol_err("truncated server version"))?;
    i += version_end + 1;
    if payload.len() < i + 4 + 8 + 1 {
        return Err(protocol_err("truncated handshake"));
    }
    let connection_id = u32::from_le_bytes(payload[i..i + 4].try_into().unwrap());
    i += 4;
    let mut scramble = [0u8; SCRAMBLE_SIZE];
    scramble[..8].copy_from_slice(&payload[i..i + 8]);
    i += 8 + 1; // skip filler byte
    if payload.len() < i + 2 + 1 + 2 + 2 + 1 + 10 {
        return Err(protocol_err("truncated handshake capability block"));
    }
    i += 2 + 1 + 2 + 2; // capability_flags_1, charset, status_flags, capability_flags_2
    let auth_data_len = payload[i] as usize;
    i += 1 + 10; // auth-plugin-data-len byte + 10 reserved bytes
    let part2_len = std::cmp::max(13, auth_data_len.saturating_sub(8)).saturating_sub(1);
    if payload.len() < i + part2_len {
        return Err(protocol_err("truncated auth-plugin-data-part-2"));
    }
    let copy_len = std::cmp::min(part2_len, SCRAMBLE_SIZE - 8);
    scramble[8..8 + copy_len].copy_from_slice(&payload[i..i + copy_len]);
    Ok(Greeting {
        connection_id,
        scramble,
    })
}

fn native_password_token(password: &[u8], scramble: &[u8; SCRAMBLE_SIZE]) -> [u8; 20] {
    if password.is_empty() {
        return [0u8; 20];
    }
    let stage1 = sha1_1(password);
    let stage2 = sha1_1(stage1);
    xor(sha1_2(scramble, stage2), stage1)
}

fn build_handshake_response(user: &str, password: &str, scramble: &[u8; SCRAMBLE_SIZE]) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.write_u32::<LittleEndian>(CLIENT_CAPABILITIES)?;
    buf.write_u32::<LittleEndian>(16_777_216)?; // max packet size
    buf.write_u8(crate::protocol::mysql::charset::UTF8_GENERAL_CI as u8)?;
    buf.write_all(&[0u8; 23])?;
    buf.write_all(user.as_bytes())?;
    buf.write_u8(0)?;
    let token = native_password_token(password.as_bytes(), scramble);
    buf.write_u8(token.len() as u8)?;
    buf.write_all(&token)?;
    buf.write_all(b"mysql_native_password")?;
    buf.write_u8(0)?;
    Ok(buf)
}

impl Backend {
    /// §4.1 `can_connect()`: true if the server's observed role/reachability
    /// permits a new connection attempt.
    pub fn can_connect(role: ServerRole) -> bool {
        role != ServerRole::Down
    }

    /// §4.1 `connect(session, sescmd_log)`.
    pub async fn connect(
        name: &str,
        addr: &str,
        role: ServerRole,
        user: &str,
        password: &str,
        sescmd_log: &SessionCommandLog,
    ) -> RouterResult<Backend> {
        if sescmd_log.history_disabled() && sescmd_log.last_position().is_some() {
            return Err(RouterError::HistoryAlreadyDiverged {
                backend: name.to_string(),
            });
        }

        let stream = TcpStream::connect(addr).await.map_err(|e| RouterError::CannotConnect {
            backend: name.to_string(),
            reason: e.to_string(),
        })?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        let mut reader = PacketReader::new(read_half);
        let mut writer = PacketWriter::new(write_half);

        let (_seq, greeting_packet) = reader
            .next_async()
            .await
            .map_err(|e| io_err(name, e))?
            .ok_or_else(|| RouterError::Protocol {
                backend: name.to_string(),
                reason: "backend closed connection during handshake".to_string(),
            })?;
        let greeting = parse_greeting(&greeting_packet, name)?;
        let _ = greeting.connection_id;

        let response = build_handshake_response(user, password, &greeting.scramble)
            .map_err(|e| io_err(name, e))?;
        writer.set_seq(1);
        writer.write_all(&response).map_err(|e| io_err(name, e))?;
        writer.end_packet().await.map_err(|e| io_err(name, e))?;
        writer.flush_all().await.map_err(|e| io_err(name, e))?;

        let (_seq, auth_reply) = reader
            .next_async()
            .await
            .map_err(|e| io_err(name, e))?
            .ok_or_else(|| RouterError::Protocol {
                backend: name.to_string(),
                reason: "backend closed connection after auth".to_string(),
            })?;
        if !auth_reply.is_empty() && auth_reply[0] == HeaderInfo::ErrHeader as u8 {
            return Err(RouterError::CannotConnect {
                backend: name.to_string(),
                reason: format!("authentication rejected: {:?}", &auth_reply[..]),
            });
        }

        let mut backend = Backend {
            name: name.to_string(),
            addr: addr.to_string(),
            role,
            reader,
            writer,
            reply_state: ReplyState::Idle,
            cursor: BackendCursor::default(),
            last_read_at: Instant::now(),
            closed: false,
        };
        for cmd in sescmd_log.entries() {
            backend.append_session_command(cmd.clone());
        }
        Ok(backend)
    }

    pub fn reply_state(&self) -> ReplyState {
        self.reply_state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn idle_for(&self) -> Duration {
        self.last_read_at.elapsed()
    }

    /// §4.1 `write(packet, response_mode)`.
    pub async fn write(&mut self, payload: &[u8], response_mode: ResponseMode) -> RouterResult<()> {
        if self.reply_state != ReplyState::Idle {
            return Err(RouterError::Protocol {
                backend: self.name.clone(),
                reason: "write attempted while backend is not idle".to_string(),
            });
        }
        self.writer.reset_seq();
        self.writer.write_all(payload).map_err(|e| io_err(&self.name, e))?;
        self.writer.end_packet().await.map_err(|e| {
            self.closed = true;
            io_err(&self.name, e)
        })?;
        self.writer.flush_all().await.map_err(|e| {
            self.closed = true;
            io_err(&self.name, e)
        })?;
        if response_mode == ResponseMode::ExpectResponse {
            self.reply_state = ReplyState::ExpectingStart;
        }
        Ok(())
    }

    /// Reads the next reply packet, advancing the reply-state machine.
    /// Returns `None` once the reply is fully drained (state is `Done`);
    /// the owner must then call [`Backend::ack_reply`] before the next write.
    pub async fn read_reply_packet(&mut self, deprecate_eof: bool) -> RouterResult<Option<Packet>> {
        if self.reply_state == ReplyState::Idle || self.reply_state == ReplyState::Done {
            return Ok(None);
        }
        let (_seq, packet) = self
            .reader
            .next_async()
            .await
            .map_err(|e| {
                self.closed = true;
                io_err(&self.name, e)
            })?
            .ok_or_else(|| {
                self.closed = true;
                RouterError::Protocol {
                    backend: self.name.clone(),
                    reason: "backend closed connection mid-reply".to_string(),
                }
            })?;
        self.last_read_at = Instant::now();

        match self.reply_state {
            ReplyState::ExpectingStart => {
                if packet.is_err_packet() {
                    self.reply_state = ReplyState::Done;
                } else if packet.is_ok_packet() || packet.is_local_in_file_packet() {
                    self.reply_state = ReplyState::Done;
                } else {
                    self.reply_state = ReplyState::ExpectingMore;
                }
            }
            ReplyState::ExpectingMore => {
                let terminal = if deprecate_eof {
                    packet.is_result_set_eof_packet()
                } else {
                    packet.is_eof_packet()
                };
                if terminal {
                    self.reply_state = ReplyState::Done;
                }
            }
            ReplyState::Idle | ReplyState::Done => unreachable!(),
        }
        Ok(Some(packet))
    }

    /// Transitions DONE → IDLE once the owner has consumed the reply.
    pub fn ack_reply(&mut self) {
        if self.reply_state == ReplyState::Done {
            self.reply_state = ReplyState::Idle;
        }
    }

    pub fn append_session_command(&mut self, cmd: std::sync::Arc<SessionCommand>) {
        self.cursor.append(cmd);
    }

    /// §4.1 `have_session_commands()`.
    pub fn have_session_commands(&self) -> bool {
        self.cursor.has_pending()
    }

    /// §4.1 `execute_session_command()`: writes the head of the queue and
    /// advances the per-backend cursor.
    pub async fn execute_session_command(&mut self) -> RouterResult<Option<std::sync::Arc<SessionCommand>>> {
        let Some(cmd) = self.cursor.pop_next() else {
            return Ok(None);
        };
        let response_mode = if cmd.expects_response {
            ResponseMode::ExpectResponse
        } else {
            ResponseMode::NoResponse
        };
        self.write(&cmd.payload, response_mode).await?;
        Ok(Some(cmd))
    }

    pub async fn ping(&mut self) -> RouterResult<()> {
        self.write(&[CommandCode::ComPing as u8], ResponseMode::ExpectResponse).await
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}

fn io_err(backend: &str, source: io::Error) -> RouterError {
    RouterError::BackendIo {
        backend: backend.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_password_token_is_empty_for_empty_password() {
        let scramble = [1u8; SCRAMBLE_SIZE];
        assert_eq!(native_password_token(b"", &scramble), [0u8; 20]);
    }

    #[test]
    fn native_password_token_is_deterministic() {
        let scramble = [7u8; SCRAMBLE_SIZE];
        let a = native_password_token(b"secret", &scramble);
        let b = native_password_token(b"secret", &scramble);
        assert_eq!(a, b);
        assert_ne!(a, native_password_token(b"other", &scramble));
    }

    #[test]
    fn parse_greeting_rejects_bad_protocol_version() {
        let err = parse_greeting(&[0x09], "be1").unwrap_err();
        assert!(matches!(err, RouterError::Protocol { .. }));
    }
}
