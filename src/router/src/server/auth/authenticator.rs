use crate::protocol::mysql::basic::{client_handshake_response, HandshakeResponse};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::{writers, Packet};
use crate::server::auth::Authenticator;
use crate::server::DEFAULT_BACKEND_VERSION;

use async_trait::async_trait;
use std::io::Error;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

pub struct RouterAuthenticator;

#[async_trait]
impl Authenticator for RouterAuthenticator {
    async fn initial_handshake<R, W>(
        &self,
        conn_id: u64,
        scramble: [u8; 20],
        client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
    ) -> Result<(u8, HandshakeResponse, Packet), Error>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        writers::write_initial_handshake(client_writer, conn_id, scramble, DEFAULT_BACKEND_VERSION)
            .await?;

        if let Some((seq, client_handshake_rsp_pkt)) = client_reader.next_async().await? {
            let (_, handshake_resp) = client_handshake_response(&client_handshake_rsp_pkt, false)
                .map_err(|e| Error::new(std::io::ErrorKind::InvalidData, format!("{e:?}")))?;
            Ok((seq, handshake_resp, client_handshake_rsp_pkt))
        } else {
            warn!("client disconnected during handshake");
            writers::write_err_packet(
                ErrorKind::ER_ACCESS_DENIED_ERROR,
                "peer terminated connection".as_bytes(),
                client_writer,
            )
            .await?;
            Err(Error::new(
                std::io::ErrorKind::PermissionDenied,
                "peer terminated connection",
            ))
        }
    }
}
