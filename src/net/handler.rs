//! Connection handler module
//!
//! Handles the lifecycle of one client connection:
//! - Admission through the per-host gate (refused sockets are simply dropped)
//! - A writer task draining the session's outbound queue
//! - A read loop feeding the handshake, then the frame dispatcher
//! - Teardown through the shared disconnect path, whatever ended the loop

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{NetworkError, Result};
use crate::net::dispatcher::decode_frames;
use crate::net::session::{Session, Stage};
use crate::protocol::handshake::{self, disconnect};
use crate::state::AppState;

/// Bytes read from the socket per call
const READ_BUFFER_SIZE: usize = 512;

/// Outbound messages queued before a client counts as unable to keep up
const OUTBOUND_QUEUE_SIZE: usize = 256;

/// Connection handler for processing client connections
pub struct ConnectionHandler {
    /// Shared application state
    state: Arc<AppState>,
}

impl ConnectionHandler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Serve one accepted TCP connection until it closes or misbehaves
    pub async fn handle_tcp(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let host = addr.ip().to_string();
        if !self.state.gate.enter(&host) {
            warn!(address = %addr, "Connection refused by admission gate");
            return Err(NetworkError::Refused(host).into());
        }
        if let Err(e) = stream.set_nodelay(true) {
            self.state.gate.exit(&host);
            return Err(e.into());
        }

        let (mut reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let session = self
            .state
            .session_manager
            .create_session(addr, Some(outbound_tx));
        tokio::spawn(write_loop(session.id, writer, outbound_rx));

        let result = self.read_loop(&mut reader, &session).await;
        match &result {
            Ok(()) => debug!(session_id = session.id, "Connection handler ending"),
            Err(e) => warn!(
                session_id = session.id,
                stage = %session.stage(),
                error = %e,
                "Connection error"
            ),
        }

        disconnect(&self.state, &session);
        result
    }

    async fn read_loop(&self, reader: &mut OwnedReadHalf, session: &Arc<Session>) -> Result<()> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            if session.is_closed() {
                return Ok(());
            }

            tokio::select! {
                read = reader.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        debug!(session_id = session.id, "Connection closed by client");
                        return Ok(());
                    }
                    trace!(session_id = session.id, bytes = n, "Received bytes");
                    session.append_inbound(&buf[..n])?;
                }
                _ = session.woken() => {}
            }

            self.process_inbound(session).await?;
        }
    }

    /// Run whatever stage the session is in over the buffered bytes
    async fn process_inbound(&self, session: &Arc<Session>) -> Result<()> {
        if session.stage() < Stage::LoggedIn {
            handshake::progress(&self.state, session).await?;
        }
        if session.stage() == Stage::LoggedIn {
            decode_frames(&self.state, session)?;
        }
        Ok(())
    }
}

/// Drain the outbound queue onto the socket. Ends once the session drops its sender.
async fn write_loop(session_id: u64, mut writer: OwnedWriteHalf, mut outbound_rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = outbound_rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            debug!(session_id = session_id, error = %e, "Write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
    trace!(session_id = session_id, "Writer finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::sync::broadcast;

    use crate::config::ServerConfig;
    use crate::game::persistence::MemoryPlayerStore;
    use crate::protocol::handshake::CONNECT_REPLY_SIZE;

    async fn serve_one() -> (Arc<AppState>, TcpStream) {
        let (shutdown_tx, _) = broadcast::channel(1);
        let state = Arc::new(
            AppState::with_store(
                ServerConfig::default(),
                shutdown_tx,
                Arc::new(MemoryPlayerStore::new()),
            )
            .unwrap(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_state = state.clone();
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let _ = ConnectionHandler::new(server_state).handle_tcp(stream, peer).await;
        });

        let client = TcpStream::connect(addr).await.unwrap();
        (state, client)
    }

    #[tokio::test]
    async fn test_connect_reply_over_socket() {
        let (state, mut client) = serve_one().await;
        client.write_all(&[14, 0]).await.unwrap();

        let mut reply = [0u8; CONNECT_REPLY_SIZE];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply[8], 0);
        assert_eq!(state.session_manager.count(), 1);
    }

    #[tokio::test]
    async fn test_bad_request_closes_connection() {
        let (state, mut client) = serve_one().await;
        client.write_all(&[15, 0]).await.unwrap();

        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .unwrap();
        assert!(read.map(|n| n == 0).unwrap_or(true));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.session_manager.count(), 0);
        assert_eq!(state.gate.connections("127.0.0.1"), 0);
    }
}
