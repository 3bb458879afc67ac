//! Connection driver: accepts one client TCP connection, completes the
//! MySQL handshake and the router session's per-statement loop (§4.4),
//! and tears the session down cleanly on disconnect or COM_QUIT.

use std::sync::Arc;

use mysql_common::constants::{CapabilityFlags, StatusFlags};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::RouterConfig;
use crate::errors::{RouterError, RouterResult};
use crate::metrics::RouterMetrics;
use crate::protocol::mysql::constants::{CommandCode, PACKET_HEADER_LEN};
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers;
use crate::server::auth::{gen_user_salt, Authenticator};
use crate::session::RouterSession;
use crate::topology::TopologyHandle;

fn client_io_err(reason: impl Into<String>, source: std::io::Error) -> RouterError {
    let _ = reason;
    RouterError::BackendIo {
        backend: "client".to_string(),
        source,
    }
}

/// Drives one accepted connection end to end. Errors are logged and
/// swallowed here: the caller only needs to know the connection is over.
pub async fn serve_connection<A: Authenticator>(
    stream: TcpStream,
    conn_id: u64,
    authenticator: &A,
    config: Arc<RouterConfig>,
    topology: TopologyHandle,
    metrics: RouterMetrics,
) {
    match run(stream, conn_id, authenticator, config, topology, metrics).await {
        Ok(()) => debug!("connection {conn_id} closed"),
        Err(e) => warn!("connection {conn_id} ended with error: {e}"),
    }
}

async fn run<A: Authenticator>(
    stream: TcpStream,
    conn_id: u64,
    authenticator: &A,
    config: Arc<RouterConfig>,
    topology: TopologyHandle,
    metrics: RouterMetrics,
) -> RouterResult<()> {
    stream.set_nodelay(true).ok();
    let (read_half, write_half) = stream.into_split();
    let mut client_reader = PacketReader::new(read_half);
    let mut client_writer = PacketWriter::new(write_half);

    let scramble = gen_user_salt();
    let (seq, handshake_response, _raw) = authenticator
        .initial_handshake(conn_id, scramble, &mut client_reader, &mut client_writer)
        .await
        .map_err(|e| client_io_err("handshake", e))?;

    let deprecate_eof = handshake_response
        .client_flag
        .contains(CapabilityFlags::CLIENT_DEPRECATE_EOF);

    client_writer.set_seq(seq.wrapping_add(1));
    writers::write_ok_packet(&mut client_writer, 0, 0, StatusFlags::SERVER_STATUS_AUTOCOMMIT)
        .await
        .map_err(|e| client_io_err("post-handshake ok", e))?;
    client_writer
        .flush_all()
        .await
        .map_err(|e| client_io_err("post-handshake flush", e))?;

    debug!(
        "connection {conn_id} authenticated as {}",
        handshake_response.db_user_string()
    );

    let mut session = RouterSession::new(config, topology, metrics);

    loop {
        let next = client_reader
            .next_async()
            .await
            .map_err(|e| client_io_err("read", e))?;
        let Some((pkt_seq, packet)) = next else {
            break;
        };
        if packet.first().copied() == Some(CommandCode::ComQuit as u8) {
            debug!("connection {conn_id} received COM_QUIT");
            break;
        }

        client_writer.set_seq(pkt_seq.wrapping_add(1));
        let wire_len = packet.len() + PACKET_HEADER_LEN;
        session
            .handle_packet(&packet, wire_len, &mut client_writer, deprecate_eof)
            .await?;
        let _ = session.keepalive_tick().await;
    }

    Ok(())
}
