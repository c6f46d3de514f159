//! Stream-socket lifecycle and framed writes.

use crate::error::{ConnectionError, Error, LossReason, Result};
use crate::protocol::{Envelope, FrameCodec, FrameReader};
use crate::transport::dispatcher::Dispatcher;
use crate::transport::sequence::SequenceCounter;

use futures::SinkExt;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::FramedWrite;
use tracing::{debug, error, info, warn};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Configuration for a single connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Maximum frame payload accepted or sent.
    pub max_frame_size: usize,
    /// Size of each socket read.
    pub read_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_frame_size: crate::protocol::MAX_FRAME_SIZE,
            read_buffer_size: 64 * 1024,
        }
    }
}

/// Lifecycle of a connection.
///
/// `Disconnected → Connecting → Connected → (Closing → Closed | Faulted)`.
/// `Closed` and `Faulted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket yet.
    Disconnected,
    /// Socket connect in progress.
    Connecting,
    /// Frames can flow.
    Connected,
    /// Local close in progress.
    Closing,
    /// The stream ended cleanly.
    Closed,
    /// The stream failed or carried bad data.
    Faulted,
}

impl ConnectionState {
    /// True for states no connection ever leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Faulted)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP host and port.
    Tcp {
        /// Host name or address.
        host: String,
        /// Port.
        port: u16,
    },
    /// VSOCK context id and port. (Linux only)
    #[cfg(target_os = "linux")]
    Vsock {
        /// Context id of the peer.
        cid: u32,
        /// Port.
        port: u32,
    },
}

impl Endpoint {
    /// TCP endpoint.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            #[cfg(target_os = "linux")]
            Self::Vsock { cid, port } => write!(f, "vsock://{cid}:{port}"),
        }
    }
}

/// State shared between the connection handle and its read task.
struct Shared {
    state: watch::Sender<ConnectionState>,
    dispatcher: Dispatcher,
}

impl Shared {
    fn transition(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            info!("connection {} -> {}", state, next);
            *state = next;
            true
        })
    }

    fn lose(&self, terminal: ConnectionState, reason: LossReason) {
        self.transition(terminal);
        let cancelled = self.dispatcher.cancel_all(reason);
        debug!("connection teardown cancelled {} calls", cancelled);
    }
}

/// One stream-socket carrying framed envelopes.
///
/// Outgoing frames go through a single locked writer, so concurrent senders
/// never interleave bytes. A background task feeds incoming bytes through a
/// [`FrameReader`] into the [`Dispatcher`].
pub struct Connection {
    sink: tokio::sync::Mutex<FramedWrite<BoxedWriter, FrameCodec>>,
    sequence: SequenceCounter,
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("next_id", &self.sequence.peek())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect to `endpoint` and start reading.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the connect takes longer than
    /// `config.connect_timeout`, or [`ConnectionError::ConnectFailed`].
    pub async fn connect(
        endpoint: &Endpoint,
        config: &ConnectionConfig,
        dispatcher: Dispatcher,
    ) -> Result<Self> {
        info!(
            "connection {} -> {} ({})",
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            endpoint
        );

        match endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = timeout(
                    config.connect_timeout,
                    TcpStream::connect((host.as_str(), *port)),
                )
                .await
                .map_err(|_| Error::Timeout(config.connect_timeout))?
                .map_err(|e| ConnectionError::ConnectFailed {
                    endpoint: endpoint.to_string(),
                    source: e,
                })?;
                stream.set_nodelay(true)?;
                Ok(Self::from_stream(stream, config, dispatcher))
            }
            #[cfg(target_os = "linux")]
            Endpoint::Vsock { cid, port } => {
                let addr = tokio_vsock::VsockAddr::new(*cid, *port);
                let stream = timeout(
                    config.connect_timeout,
                    tokio_vsock::VsockStream::connect(addr),
                )
                .await
                .map_err(|_| Error::Timeout(config.connect_timeout))?
                .map_err(|e| ConnectionError::ConnectFailed {
                    endpoint: endpoint.to_string(),
                    source: e,
                })?;
                Ok(Self::from_stream(stream, config, dispatcher))
            }
        }
    }

    /// Wrap an already-connected stream and start reading.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<S>(stream: S, config: &ConnectionConfig, dispatcher: Dispatcher) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let read_half: BoxedReader = Box::new(read_half);
        let write_half: BoxedWriter = Box::new(write_half);
        let codec = FrameCodec::new().with_max_frame_size(config.max_frame_size);

        let (state, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared { state, dispatcher });
        shared.transition(ConnectionState::Connected);

        let reader = tokio::spawn(read_loop(
            read_half,
            FrameReader::with_codec(codec),
            Arc::clone(&shared),
            config.read_buffer_size.max(1),
        ));

        Self {
            sink: tokio::sync::Mutex::new(FramedWrite::new(write_half, codec)),
            sequence: SequenceCounter::new(),
            shared,
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Encode `envelope`, prefix its length and write it as one frame.
    ///
    /// Dropping the returned future while the frame is partly written faults
    /// the connection, since the peer can no longer find frame boundaries.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Lost`] once the connection is closing or
    /// gone, a codec error if the envelope cannot be framed, or the I/O
    /// error that faulted the connection.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.ensure_open()?;

        let id = envelope.id;
        let mut sink = self.sink.lock().await;
        // State may have changed while waiting for the writer.
        self.ensure_open()?;

        let mut write = PartialWrite {
            shared: &self.shared,
            id,
            armed: true,
        };
        let result = sink.send(envelope).await;
        write.armed = false;

        match result {
            Ok(()) => {
                debug!("sent envelope {}", id);
                Ok(())
            }
            Err(Error::Io(e)) => {
                error!("write failed for envelope {}: {}", id, e);
                self.shared
                    .lose(ConnectionState::Faulted, LossReason::Faulted(e.to_string()));
                Err(Error::Io(e))
            }
            // Nothing reached the socket; the stream is still in sync.
            Err(e) => Err(e),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        let state = self.state();
        match state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Faulted => {
                let reason = self
                    .shared
                    .dispatcher
                    .loss_reason()
                    .unwrap_or_else(|| match state {
                        ConnectionState::Faulted => {
                            LossReason::Faulted("connection faulted".to_string())
                        }
                        ConnectionState::Closed => LossReason::Closed,
                        _ => LossReason::ClosedByClient,
                    });
                Err(ConnectionError::Lost(reason).into())
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                Err(ConnectionError::NotConnected(state).into())
            }
        }
    }

    /// Close the connection and fail everything still outstanding.
    ///
    /// # Errors
    ///
    /// Returns the I/O error from shutting down the write half, after the
    /// connection has been torn down regardless.
    pub async fn close(&self) -> Result<()> {
        if !self.shared.transition(ConnectionState::Closing) {
            return Ok(());
        }

        let result = {
            let mut sink = self.sink.lock().await;
            SinkExt::<Envelope>::close(&mut *sink).await
        };

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.shared
            .lose(ConnectionState::Closed, LossReason::ClosedByClient);

        result
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver notified on every state transition.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Id source for outgoing requests.
    #[must_use]
    pub const fn sequence(&self) -> &SequenceCounter {
        &self.sequence
    }

    /// The dispatcher inbound envelopes are routed to.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
        if !self.state().is_terminal() {
            self.shared
                .lose(ConnectionState::Closed, LossReason::ClosedByClient);
        }
    }
}

/// Faults the connection if a frame write is abandoned before it finishes.
struct PartialWrite<'a> {
    shared: &'a Shared,
    id: u64,
    armed: bool,
}

impl Drop for PartialWrite<'_> {
    fn drop(&mut self) {
        if self.armed {
            error!("write of envelope {} abandoned mid-frame", self.id);
            self.shared.lose(
                ConnectionState::Faulted,
                LossReason::Faulted(format!("write of envelope {} abandoned mid-frame", self.id)),
            );
        }
    }
}

/// Feed socket chunks through the frame reader until the stream ends.
async fn read_loop(
    mut reader: BoxedReader,
    mut frames: FrameReader,
    shared: Arc<Shared>,
    buffer_size: usize,
) {
    let mut chunk = vec![0u8; buffer_size];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                if let Err(e) = frames.finish() {
                    warn!("stream ended mid-frame: {}", e);
                } else {
                    debug!("stream closed by peer");
                }
                shared.lose(ConnectionState::Closed, LossReason::Closed);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                error!("stream error: {}", e);
                shared.lose(ConnectionState::Faulted, LossReason::Faulted(e.to_string()));
                return;
            }
        };

        let dispatcher = &shared.dispatcher;
        if let Err(e) = frames.feed(&chunk[..n], |envelope| {
            debug!(
                "received {} envelope {} for service {}",
                envelope.body.kind(),
                envelope.id,
                envelope.service
            );
            dispatcher.on_envelope(envelope);
        }) {
            error!("fatal stream error, dropping connection: {}", e);
            shared.lose(ConnectionState::Faulted, LossReason::Faulted(e.to_string()));
            return;
        }
    }
}
