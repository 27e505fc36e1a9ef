//! Tunnel Session
//!
//! Pumps bytes between one accepted local socket and its relay stream.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::error::SessionError;
use crate::metrics::ConnectionSnapshot;
use crate::protocol::constants::{MAX_DATA_LEN, MIN_READ_SIZE};
use crate::relay::{RelayClient, RelayReader, RelayWriter};
use crate::target::Target;
use crate::transport::{SocketReader, SocketTransport, SocketWriter};

/// One relayed local connection
pub struct TunnelSession {
    id: u64,
    transport: SocketTransport,
    client: RelayClient,
    target: Target,
}

impl TunnelSession {
    pub fn new(id: u64, transport: SocketTransport, client: RelayClient, target: Target) -> Self {
        Self {
            id,
            transport,
            client,
            target,
        }
    }

    /// Open the relay stream and copy in both directions until either side
    /// finishes. The socket and the relay stream are closed on every exit
    /// path.
    #[instrument(skip(self, cancel), fields(connection_id = self.id, client_addr = %self.transport.remote_addr()))]
    pub async fn run(self, cancel: CancellationToken) -> Result<ConnectionSnapshot, SessionError> {
        let statistics = self.transport.statistics();
        let (mut socket_reader, mut socket_writer) = self.transport.into_split();

        let stream = match self.client.open(&self.target, cancel.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                // The client sees a plain close
                socket_writer.shutdown().await;
                return Err(e.into());
            }
        };
        debug!(target = %self.target, "Relay stream open, pumping data");

        let (mut relay_reader, mut relay_writer) = stream.into_split();

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = upstream(&mut socket_reader, &mut relay_writer, &cancel) => result,
            result = downstream(&mut relay_reader, &mut socket_writer, &cancel) => result,
        };

        relay_writer.close().await;
        socket_writer.shutdown().await;

        let snapshot = statistics.snapshot();
        info!(
            bytes_up = snapshot.bytes_received,
            bytes_down = snapshot.bytes_sent,
            duration_ms = snapshot.duration_ms,
            "Tunnel session finished"
        );

        match result {
            Ok(()) | Err(SessionError::Cancelled) => Ok(snapshot),
            Err(e) => Err(e),
        }
    }
}

/// Local client to relay
async fn upstream(
    socket: &mut SocketReader,
    relay: &mut RelayWriter,
    cancel: &CancellationToken,
) -> Result<(), SessionError> {
    let mut buf = vec![0u8; MAX_DATA_LEN];
    loop {
        let n = socket.read(&mut buf, cancel).await?;
        if n == 0 {
            debug!("Client closed connection");
            return Ok(());
        }
        relay.write(&buf[..n]).await?;
    }
}

/// Relay to local client
async fn downstream(
    relay: &mut RelayReader,
    socket: &mut SocketWriter,
    cancel: &CancellationToken,
) -> Result<(), SessionError> {
    let mut buf = vec![0u8; MIN_READ_SIZE];
    loop {
        let n = relay.read(&mut buf).await?;
        if n == 0 {
            debug!("Relay closed stream");
            return Ok(());
        }
        socket.write_all(&buf[..n], cancel).await?;
    }
}
