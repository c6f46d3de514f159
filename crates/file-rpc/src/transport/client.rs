//! RPC client implementation.

use crate::error::{Error, Result};
use crate::protocol::{Envelope, Value};
use crate::transport::connection::{Connection, ConnectionConfig, ConnectionState, Endpoint};
use crate::transport::dispatcher::{
    Dispatcher, DispatcherConfig, Subscription, UnsolicitedErrorPolicy,
};

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Configuration for the RPC client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Socket and framing configuration.
    pub connection: ConnectionConfig,
    /// Correlation table configuration.
    pub dispatcher: DispatcherConfig,
    /// Deadline applied by [`RpcClient::call`].
    pub default_timeout: Duration,
    /// Age after which unanswered calls are evicted by a background reaper.
    pub pending_ttl: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            dispatcher: DispatcherConfig::default(),
            default_timeout: Duration::from_secs(30),
            pending_ttl: None,
        }
    }
}

/// Builder for creating RPC clients.
#[derive(Debug, Default)]
pub struct ClientBuilder {
    endpoint: Option<Endpoint>,
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the endpoint to connect to.
    #[must_use]
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Connect over TCP.
    #[must_use]
    pub fn tcp(self, host: impl Into<String>, port: u16) -> Self {
        self.endpoint(Endpoint::tcp(host, port))
    }

    /// Connect over VSOCK. (Linux only)
    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn vsock(self, cid: u32, port: u32) -> Self {
        self.endpoint(Endpoint::Vsock { cid, port })
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default request timeout.
    #[must_use]
    pub const fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.connect_timeout = timeout;
        self
    }

    /// Set the maximum number of calls awaiting an answer.
    #[must_use]
    pub const fn max_pending(mut self, max: usize) -> Self {
        self.config.dispatcher.max_pending = max;
        self
    }

    /// Set the largest frame payload accepted or sent.
    #[must_use]
    pub const fn max_frame_size(mut self, size: usize) -> Self {
        self.config.connection.max_frame_size = size;
        self
    }

    /// Set the size of each socket read.
    #[must_use]
    pub const fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.connection.read_buffer_size = size;
        self
    }

    /// Evict calls left unanswered for longer than `ttl`.
    #[must_use]
    pub const fn pending_ttl(mut self, ttl: Duration) -> Self {
        self.config.pending_ttl = Some(ttl);
        self
    }

    /// Choose how error reports for unknown calls are handled.
    #[must_use]
    pub const fn unsolicited_errors(mut self, policy: UnsolicitedErrorPolicy) -> Self {
        self.config.dispatcher.unsolicited_errors = policy;
        self
    }

    /// Connect to the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if no endpoint was set or the connection fails.
    pub async fn connect(self) -> Result<RpcClient> {
        let endpoint = self.endpoint.as_ref().ok_or_else(|| {
            Error::from(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "endpoint not specified",
            ))
        })?;

        let dispatcher = Dispatcher::new(self.config.dispatcher.clone());
        let connection = Connection::connect(endpoint, &self.config.connection, dispatcher).await?;

        Ok(RpcClient::new(connection, self.config))
    }

    /// Build a client over an already-connected stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<S>(self, stream: S) -> RpcClient
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let dispatcher = Dispatcher::new(self.config.dispatcher.clone());
        let connection = Connection::from_stream(stream, &self.config.connection, dispatcher);

        RpcClient::new(connection, self.config)
    }
}

/// RPC client for making calls and receiving events.
#[derive(Debug)]
pub struct RpcClient {
    connection: Connection,
    config: ClientConfig,
    reaper: Option<JoinHandle<()>>,
}

impl RpcClient {
    /// Create a new client builder.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    fn new(connection: Connection, config: ClientConfig) -> Self {
        let reaper = config
            .pending_ttl
            .map(|ttl| tokio::spawn(reap(connection.dispatcher().clone(), ttl)));

        Self {
            connection,
            config,
            reaper,
        }
    }

    /// Call `method` on `service` and wait for its result, using the default
    /// timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] if the peer reports an error for this call,
    /// [`Error::Timeout`] if no answer arrives in time, or a connection error
    /// if the connection is or becomes unusable.
    pub async fn call(&self, service: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call_with_timeout(service, method, args, Some(self.config.default_timeout))
            .await
    }

    /// Call `method` on `service` with a per-call deadline, or none.
    ///
    /// The deadline covers writing the request as well as waiting for the
    /// answer. On timeout the call is evicted from the correlation table and a
    /// late answer is discarded; a request left half-written faults the
    /// connection.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    #[instrument(skip(self, args))]
    pub async fn call_with_timeout(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        let pending = self
            .connection
            .dispatcher()
            .register_next(self.connection.sequence())?;
        let id = pending.id();

        debug!(
            "Sending call {} (pending: {})",
            id,
            self.connection.dispatcher().pending_count()
        );

        // A failed or abandoned send drops `pending`, which clears its entry.
        let exchange = async {
            self.connection
                .send(Envelope::request(id, service, method, args))
                .await?;
            pending.await
        };

        match deadline {
            Some(deadline) => timeout(deadline, exchange).await.map_err(|_| {
                warn!("call {} timed out after {:?}", id, deadline);
                Error::Timeout(deadline)
            })?,
            None => exchange.await,
        }
    }

    /// Receive the arguments of every `name` event until unsubscribed or the
    /// connection is lost.
    #[must_use]
    pub fn subscribe(&self, name: impl Into<String>) -> Subscription {
        self.connection.dispatcher().subscribe(name)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Receiver notified on every connection state transition.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state_changes()
    }

    /// Number of calls awaiting an answer.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.connection.dispatcher().pending_count()
    }

    /// Client configuration.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Close the connection. Outstanding calls and subscriptions fail with a
    /// connection-lost error.
    ///
    /// # Errors
    ///
    /// Returns the I/O error from shutting down the socket.
    pub async fn close(&self) -> Result<()> {
        if let Some(reaper) = &self.reaper {
            reaper.abort();
        }
        self.connection.close().await
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
    }
}

/// Periodically evict calls older than `ttl` until the dispatcher closes.
async fn reap(dispatcher: Dispatcher, ttl: Duration) {
    let mut ticker = tokio::time::interval((ttl / 2).max(Duration::from_millis(1)));

    loop {
        ticker.tick().await;
        if dispatcher.is_closed() {
            return;
        }
        let reaped = dispatcher.reap_expired(ttl);
        if reaped > 0 {
            debug!("reaped {} expired calls", reaped);
        }
    }
}
