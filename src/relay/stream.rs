//! Relay Stream
//!
//! A reliable, ordered byte stream over a relay session. One driver task owns
//! the relay channel and the [`RelaySession`]; readers and writers talk to it
//! over bounded channels.
//!
//! The driver:
//! - forwards received DATA payloads to the reader and ACKs them every
//!   `ack_threshold` bytes,
//! - sends write requests as DATA frames, keeping them in the replay buffer
//!   until the relay acknowledges them,
//! - stops taking writes while outstanding bytes are at or above the
//!   high-water mark and resumes once an ACK brings them down to the
//!   low-water mark,
//! - resumes the session on a new connection when the current one drops,
//!   replaying everything the relay has not acknowledged.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, trace, warn};

use crate::error::RelayError;
use crate::metrics::NetworkStatistics;
use crate::protocol::codec;
use crate::protocol::constants::{CLOSE_INVALID_DATA, CLOSE_NORMAL, MAX_DATA_LEN, MIN_READ_SIZE};
use crate::protocol::types::{CloseDisposition, Frame};
use crate::target::Target;
use crate::transport::{ChannelMessage, RelayChannel};

use super::backoff::Backoff;
use super::client::RelayClient;
use super::session::RelaySession;

/// Payload chunks buffered between the driver and the reader
const INBOUND_CAPACITY: usize = 16;
/// Write requests queued for the driver
const WRITE_QUEUE_CAPACITY: usize = 4;
/// Bound on sending the close frame of a stream
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a relay stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    Connected,
    Reconnecting,
    /// Ended by an orderly close from either side
    Closed,
    /// Ended by an unrecoverable error
    Failed(RelayError),
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Failed(_))
    }
}

struct WriteRequest {
    payload: Bytes,
    done: oneshot::Sender<()>,
}

/// State shared by the two halves of a stream
struct Shared {
    closed_locally: AtomicBool,
    close: CancellationToken,
    // Cancels the driver once both halves are gone
    _guard: DropGuard,
}

impl Shared {
    fn close(&self) {
        self.closed_locally.store(true, Ordering::SeqCst);
        self.close.cancel();
    }

    fn is_closed_locally(&self) -> bool {
        self.closed_locally.load(Ordering::SeqCst)
    }
}

/// A reliable byte stream to a target through the relay
pub struct RelayStream {
    reader: RelayReader,
    writer: RelayWriter,
}

impl RelayStream {
    pub(crate) fn spawn(
        client: RelayClient,
        target: Target,
        channel: Box<dyn RelayChannel>,
        session: RelaySession,
        cancel: CancellationToken,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (writes_tx, writes_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(StreamState::Connected);

        let shared = Arc::new(Shared {
            closed_locally: AtomicBool::new(false),
            close: cancel.clone(),
            _guard: cancel.clone().drop_guard(),
        });

        let driver = Driver {
            statistics: client.statistics().clone(),
            ack_threshold: client.config().ack_threshold.max(1),
            high_water_mark: client.config().flow_control.high_water_mark,
            low_water_mark: client.config().flow_control.low_water_mark,
            client,
            target,
            channel,
            session,
            writes: writes_rx,
            writes_open: true,
            inbound: inbound_tx,
            pending_inbound: None,
            state: state_tx,
            throttled: false,
            cancel,
        };
        tokio::spawn(driver.run());

        Self {
            reader: RelayReader {
                inbound: inbound_rx,
                state: state_rx.clone(),
                shared: shared.clone(),
            },
            writer: RelayWriter {
                writes: writes_tx,
                state: state_rx,
                shared,
            },
        }
    }

    /// See [`RelayReader::read`]
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, RelayError> {
        self.reader.read(buf).await
    }

    /// See [`RelayWriter::write`]
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), RelayError> {
        self.writer.write(buf).await
    }

    /// See [`RelayWriter::close`]
    pub async fn close(&mut self) {
        self.writer.close().await
    }

    pub fn state(&self) -> StreamState {
        self.reader.state.borrow().clone()
    }

    /// Split into halves usable from concurrent tasks
    pub fn into_split(self) -> (RelayReader, RelayWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayStream").field("state", &self.state()).finish()
    }
}

/// Read half of a [`RelayStream`]
pub struct RelayReader {
    inbound: mpsc::Receiver<Bytes>,
    state: watch::Receiver<StreamState>,
    shared: Arc<Shared>,
}

impl RelayReader {
    /// Read the next chunk of data into `buf`.
    ///
    /// `buf` must hold at least [`MIN_READ_SIZE`] bytes so a whole DATA
    /// payload always fits. Returns `Ok(0)` once the relay closed the stream
    /// in an orderly way.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, RelayError> {
        if buf.len() < MIN_READ_SIZE {
            return Err(RelayError::InvalidArgument(format!(
                "read buffer of {} bytes is smaller than the minimum of {}",
                buf.len(),
                MIN_READ_SIZE
            )));
        }
        if self.shared.is_closed_locally() {
            return Err(RelayError::StreamClosed);
        }

        loop {
            match self.inbound.recv().await {
                Some(chunk) if chunk.is_empty() => continue,
                Some(chunk) => {
                    let n = chunk.len();
                    buf[..n].copy_from_slice(&chunk);
                    return Ok(n);
                }
                None => return self.end_of_stream(),
            }
        }
    }

    fn end_of_stream(&self) -> Result<usize, RelayError> {
        if self.shared.is_closed_locally() {
            return Err(RelayError::StreamClosed);
        }
        match &*self.state.borrow() {
            StreamState::Closed => Ok(0),
            StreamState::Failed(e) => Err(e.clone()),
            _ => Err(RelayError::StreamClosed),
        }
    }
}

/// Write half of a [`RelayStream`]
pub struct RelayWriter {
    writes: mpsc::Sender<WriteRequest>,
    state: watch::Receiver<StreamState>,
    shared: Arc<Shared>,
}

impl RelayWriter {
    /// Write all of `buf`, split into DATA frames of at most
    /// [`MAX_DATA_LEN`] bytes.
    ///
    /// Suspends while the send window is full.
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), RelayError> {
        for chunk in buf.chunks(MAX_DATA_LEN) {
            if self.shared.is_closed_locally() {
                return Err(RelayError::StreamClosed);
            }

            let (done, accepted) = oneshot::channel();
            let request = WriteRequest {
                payload: Bytes::copy_from_slice(chunk),
                done,
            };
            if self.writes.send(request).await.is_err() {
                return Err(self.terminal_error().await);
            }
            if accepted.await.is_err() {
                return Err(self.terminal_error().await);
            }
        }
        Ok(())
    }

    /// Close the stream. Sends an orderly close to the relay and waits for
    /// the driver to finish. Idempotent.
    pub async fn close(&mut self) {
        self.shared.close();
        if self.state.wait_for(StreamState::is_terminal).await.is_err() {
            debug!("Relay stream driver already gone");
        }
    }

    /// Error for a write the driver dropped. The driver only drops a write
    /// on its way out, so its final state is set shortly after.
    async fn terminal_error(&mut self) -> RelayError {
        if self.shared.is_closed_locally() {
            return RelayError::StreamClosed;
        }
        if self.state.wait_for(StreamState::is_terminal).await.is_err() {
            trace!("Relay stream driver already gone");
        }
        match &*self.state.borrow() {
            StreamState::Failed(e) => e.clone(),
            _ => RelayError::StreamClosed,
        }
    }
}

/// Owns the relay channel and session of one stream
struct Driver {
    client: RelayClient,
    target: Target,
    channel: Box<dyn RelayChannel>,
    session: RelaySession,
    writes: mpsc::Receiver<WriteRequest>,
    writes_open: bool,
    inbound: mpsc::Sender<Bytes>,
    pending_inbound: Option<Bytes>,
    state: watch::Sender<StreamState>,
    throttled: bool,
    statistics: Arc<NetworkStatistics>,
    ack_threshold: u64,
    high_water_mark: u64,
    low_water_mark: u64,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        let result = self.drive().await;

        let final_state = match result {
            Ok(()) | Err(RelayError::StreamClosed) => {
                if self.cancel.is_cancelled() {
                    self.close_channel(CLOSE_NORMAL, "").await;
                }
                debug!(
                    sid = %self.session.sid(),
                    sent = self.session.bytes_sent(),
                    received = self.session.bytes_received(),
                    "Relay stream closed"
                );
                StreamState::Closed
            }
            Err(e) => {
                error!(sid = %self.session.sid(), error = %e, "Relay stream failed");
                if matches!(e, RelayError::ProtocolViolation(_)) {
                    self.close_channel(CLOSE_INVALID_DATA, "protocol violation").await;
                }
                StreamState::Failed(e)
            }
        };

        // Readers inspect the state once the inbound channel ends, so it must
        // be set before the sender is dropped with `self`.
        self.state.send_replace(final_state);
    }

    async fn drive(&mut self) -> Result<(), RelayError> {
        loop {
            // Reserve on a clone so the permit does not borrow `self`
            let inbound = self.inbound.clone();

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!(sid = %self.session.sid(), "Closing relay stream");
                    return Ok(());
                }

                permit = inbound.reserve(), if self.pending_inbound.is_some() => {
                    let chunk = self.pending_inbound.take();
                    match (permit, chunk) {
                        (Ok(permit), Some(chunk)) => permit.send(chunk),
                        // Reader is gone; keep the session alive for the writer
                        _ => trace!("Discarding data for dropped reader"),
                    }
                    self.maybe_ack().await?;
                }

                received = self.channel.receive(), if self.pending_inbound.is_none() => {
                    match received {
                        Ok(Some(ChannelMessage::Binary(message))) => self.handle_message(message).await?,
                        Ok(Some(ChannelMessage::Close { code, reason })) => {
                            match CloseDisposition::from_code(code) {
                                CloseDisposition::Orderly => {
                                    info!(sid = %self.session.sid(), code, "Relay closed stream");
                                    return Ok(());
                                }
                                CloseDisposition::Reconnect => {
                                    self.reconnect(format!("relay closed connection with code {}", code)).await?
                                }
                                disposition => {
                                    return Err(disposition
                                        .into_error(code, &reason)
                                        .unwrap_or(RelayError::StreamClosed));
                                }
                            }
                        }
                        Ok(None) => self.reconnect("relay connection ended".to_string()).await?,
                        Err(e) => self.reconnect(e.to_string()).await?,
                    }
                }

                request = self.writes.recv(), if self.writes_open && !self.throttled => {
                    match request {
                        Some(request) => self.send_data(request).await?,
                        None => {
                            trace!(sid = %self.session.sid(), "Writer dropped");
                            self.writes_open = false;
                        }
                    }
                }
            }
        }
    }

    async fn handle_message(&mut self, message: Bytes) -> Result<(), RelayError> {
        self.statistics.record_frame_received();

        match codec::decode(message)? {
            None => Ok(()),
            Some(Frame::Data(payload)) => {
                if payload.is_empty() {
                    return Ok(());
                }
                self.session.record_received(payload.len());
                self.statistics.record_data_received(payload.len());
                self.pending_inbound = Some(payload);
                Ok(())
            }
            Some(Frame::Ack(ack)) => {
                self.session.acknowledge(ack)?;
                self.update_throttle();
                Ok(())
            }
            Some(frame) => Err(RelayError::ProtocolViolation(format!(
                "unexpected {} on established session",
                frame.name()
            ))),
        }
    }

    async fn send_data(&mut self, request: WriteRequest) -> Result<(), RelayError> {
        let WriteRequest { payload, done } = request;
        let frame = codec::encode_data(&payload)?;
        let len = payload.len();

        self.session.record_sent(payload);
        self.statistics.record_data_sent(len);

        match self.send_message(frame).await {
            Ok(()) => self.statistics.record_frame_sent(),
            Err(RelayError::StreamClosed) => return Err(RelayError::StreamClosed),
            // The payload is in the replay buffer and goes out on the new connection
            Err(e) => self.reconnect(e.to_string()).await?,
        }

        self.update_throttle();
        let _ = done.send(());
        Ok(())
    }

    async fn maybe_ack(&mut self) -> Result<(), RelayError> {
        if self.session.unacknowledged_received() < self.ack_threshold {
            return Ok(());
        }

        let ack = self.session.take_ack();
        trace!(sid = %self.session.sid(), ack, "Sending ack");
        match self.send_message(codec::encode_ack(ack)).await {
            Ok(()) => {
                self.statistics.record_frame_sent();
                Ok(())
            }
            Err(RelayError::StreamClosed) => Err(RelayError::StreamClosed),
            // The reconnect URL carries the received count, so the ack is not lost
            Err(e) => self.reconnect(e.to_string()).await,
        }
    }

    fn update_throttle(&mut self) {
        let outstanding = self.session.outstanding();
        if !self.throttled && outstanding >= self.high_water_mark {
            debug!(sid = %self.session.sid(), outstanding, "Send window full, pausing writes");
            self.throttled = true;
        } else if self.throttled && outstanding <= self.low_water_mark {
            debug!(sid = %self.session.sid(), outstanding, "Send window drained, resuming writes");
            self.throttled = false;
        }
    }

    /// Resume the session on a new connection and replay unacknowledged data
    async fn reconnect(&mut self, reason: String) -> Result<(), RelayError> {
        warn!(sid = %self.session.sid(), reason = %reason, "Relay connection lost, reconnecting");
        self.state.send_replace(StreamState::Reconnecting);

        let mut backoff = Backoff::new(self.client.config().reconnect.clone());
        let mut last_error = reason;

        while let Some(delay) = backoff.next_delay() {
            if !delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(RelayError::StreamClosed),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let attempt = backoff.attempt();
            let resumed = tokio::select! {
                _ = self.cancel.cancelled() => return Err(RelayError::StreamClosed),
                resumed = self.client.resume(&self.target, self.session.sid(), self.session.bytes_received()) => resumed,
            };

            match resumed {
                Ok((channel, acked)) => {
                    self.channel = channel;
                    self.session.acknowledge(acked)?;

                    if let Err(e) = self.replay().await {
                        if e == RelayError::StreamClosed {
                            return Err(e);
                        }
                        warn!(sid = %self.session.sid(), attempt, error = %e, "Replay failed");
                        last_error = e.to_string();
                        continue;
                    }

                    self.update_throttle();
                    self.statistics.record_reconnect();
                    self.state.send_replace(StreamState::Connected);
                    info!(
                        sid = %self.session.sid(),
                        attempt,
                        acked,
                        replayed = self.session.replay_len(),
                        "Relay session resumed"
                    );
                    return Ok(());
                }
                Err(RelayError::ReconnectExhausted { reason, .. }) => {
                    return Err(RelayError::ReconnectExhausted { attempts: attempt, reason });
                }
                Err(e) if e.is_retryable() => {
                    warn!(sid = %self.session.sid(), attempt, error = %e, "Reconnect attempt failed");
                    last_error = e.to_string();
                }
                Err(e) => return Err(e),
            }
        }

        Err(RelayError::ReconnectExhausted {
            attempts: backoff.attempt(),
            reason: last_error,
        })
    }

    async fn replay(&mut self) -> Result<(), RelayError> {
        // Encode up front; sending needs `self` mutably
        let frames = self
            .session
            .replay_buffer()
            .map(|payload| codec::encode_data(payload))
            .collect::<Result<Vec<_>, _>>()?;
        for frame in frames {
            self.send_message(frame).await?;
            self.statistics.record_frame_sent();
        }
        Ok(())
    }

    /// Send one message on the current connection. A send that stalls for
    /// longer than the connect timeout counts as a dropped connection;
    /// cancellation yields `StreamClosed`.
    async fn send_message(&mut self, message: Bytes) -> Result<(), RelayError> {
        let limit = self.client.config().connect_timeout;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(RelayError::StreamClosed),
            sent = timeout(limit, self.channel.send(message)) => match sent {
                Ok(result) => result,
                Err(_) => Err(RelayError::Transport(format!("send stalled for {:?}", limit))),
            },
        }
    }

    async fn close_channel(&mut self, code: u16, reason: &str) {
        if timeout(CLOSE_TIMEOUT, self.channel.close(code, reason)).await.is_err() {
            warn!(sid = %self.session.sid(), code, "Timed out sending relay close");
        }
    }
}
