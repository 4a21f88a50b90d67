//! The connection engine: owns the stream, runs the receive worker, routes
//! messages to channels.
//!
//! Only the receive worker reads from the transport; senders share one
//! writer critical section. The worker reassembles fragments, emits acks,
//! consumes the capability handshake, and hands everything else to the
//! addressed channel. Decode anomalies are survived; only an unrecoverable
//! stream error closes the connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use dtx_archive::{Dict, Value};

use crate::channel::DtxChannel;
use crate::fragment::FragmentAssembler;
use crate::message::{DtxMessage, FrameHeader, MessageType};
use crate::transport::StreamTransport;
use crate::{AuxValue, DtxError, DEFAULT_TIMEOUT_MS, FRAME_HEADER_LEN, GLOBAL_CHANNEL_CODE};

/// Selector of the mandatory capability exchange.
pub const CAPABILITIES_SELECTOR: &str = "_notifyOfPublishedCapabilities:";
/// Selector used to open a channel on the peer.
pub const REQUEST_CHANNEL_SELECTOR: &str = "_requestChannelWithCode:identifier:";

/// Identifier of the implicit global channel.
const GLOBAL_CHANNEL_IDENTIFIER: &str = "_global_";

/// How much leading garbage the reader will skip while hunting for a frame
/// magic before declaring the stream corrupt.
const MAX_RESYNC_BYTES: usize = 1024 * 1024;

pub(crate) fn default_call_timeout() -> Duration {
    timeout_from_env("DTX_CALL_TIMEOUT_MS")
}

fn default_handshake_timeout() -> Duration {
    timeout_from_env("DTX_HANDSHAKE_TIMEOUT_MS")
}

fn timeout_from_env(var: &str) -> Duration {
    let ms = std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_TIMEOUT_MS);
    Duration::from_millis(ms)
}

/// Connection lifecycle. Only `Open` accepts `make_channel` and user sends;
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    HandshakePending,
    Open,
    Closing,
    Closed,
}

/// Default handler for messages addressed to unknown channel codes.
/// Handlers run in registration order until one returns `true`.
pub type UnroutedHandler = Arc<dyn Fn(&DtxMessage) -> bool + Send + Sync>;

/// A DTX connection over a duplex byte stream.
pub struct DtxConnection {
    inner: Arc<ConnectionInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct ConnectionInner {
    transport: StreamTransport,
    channels: Mutex<HashMap<i32, Arc<DtxChannel>>>,
    next_channel_code: AtomicI32,
    fragments: FragmentAssembler,
    state: Mutex<ConnectionState>,
    handshake_done: AtomicBool,
    handshake_notify: Notify,
    shutdown: Notify,
    unrouted_handlers: Mutex<Vec<UnroutedHandler>>,
}

impl DtxConnection {
    /// Wrap an established duplex stream. TLS, if any, already happened.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Self::with_transport(StreamTransport::new(stream))
    }

    pub fn with_transport(transport: StreamTransport) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                transport,
                channels: Mutex::new(HashMap::new()),
                next_channel_code: AtomicI32::new(1),
                fragments: FragmentAssembler::new(),
                state: Mutex::new(ConnectionState::Idle),
                handshake_done: AtomicBool::new(false),
                handshake_notify: Notify::new(),
                shutdown: Notify::new(),
                unrouted_handlers: Mutex::new(Vec::new()),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Connect with the default handshake timeout
    /// (`DTX_HANDSHAKE_TIMEOUT_MS`, 5000 ms unless overridden).
    pub async fn connect(&self) -> Result<(), DtxError> {
        self.connect_with_timeout(default_handshake_timeout()).await
    }

    /// Start the receive worker and perform the capability handshake.
    ///
    /// Publishes our capabilities on the global channel, then waits for the
    /// peer to publish its own. On timeout the connection stays down;
    /// [`disconnect`](Self::disconnect) still joins the worker.
    pub async fn connect_with_timeout(&self, timeout: Duration) -> Result<(), DtxError> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ConnectionState::Idle => *state = ConnectionState::Connecting,
                other => {
                    return Err(DtxError::InvalidArgument(format!(
                        "connect on a {other:?} connection"
                    )))
                }
            }
        }

        // The global channel must exist before the worker sees any traffic.
        let global = Arc::new(DtxChannel::new(
            Arc::downgrade(&self.inner),
            GLOBAL_CHANNEL_IDENTIFIER,
            GLOBAL_CHANNEL_CODE,
        ));
        self.inner
            .channels
            .lock()
            .insert(GLOBAL_CHANNEL_CODE, global.clone());

        let inner = self.inner.clone();
        *self.worker.lock() = Some(tokio::spawn(async move { inner.receive_loop().await }));
        *self.inner.state.lock() = ConnectionState::HandshakePending;

        let mut hello = DtxMessage::method(CAPABILITIES_SELECTOR);
        hello.expects_reply = false;
        hello.append_aux(AuxValue::archived(&capabilities()));
        global.send_async(hello).await?;

        let handshake = async {
            loop {
                let notified = self.inner.handshake_notify.notified();
                if self.inner.handshake_done.load(Ordering::Acquire) {
                    return;
                }
                notified.await;
            }
        };
        match tokio::time::timeout(timeout, handshake).await {
            Ok(()) => {
                *self.inner.state.lock() = ConnectionState::Open;
                tracing::debug!("connection open");
                Ok(())
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "peer never published capabilities"
                );
                Err(DtxError::Timeout)
            }
        }
    }

    /// The implicit channel 0, present for the connection's lifetime.
    pub fn global_channel(&self) -> Option<Arc<DtxChannel>> {
        self.inner.channel(GLOBAL_CHANNEL_CODE)
    }

    /// Open a channel on the peer.
    ///
    /// The channel is registered before the request goes out so the device's
    /// first reply can already be routed; it is removed again if the open
    /// fails.
    pub async fn make_channel(&self, identifier: &str) -> Result<Arc<DtxChannel>, DtxError> {
        if self.state() != ConnectionState::Open {
            return Err(DtxError::closed());
        }

        let global = self
            .global_channel()
            .ok_or_else(|| DtxError::Internal("no global channel".into()))?;

        // Channel codes are never reused, even after a failed open.
        let code = self.inner.next_channel_code.fetch_add(1, Ordering::SeqCst);
        let channel = Arc::new(DtxChannel::new(
            Arc::downgrade(&self.inner),
            identifier,
            code,
        ));
        self.inner.channels.lock().insert(code, channel.clone());

        let mut request = DtxMessage::method(REQUEST_CHANNEL_SELECTOR);
        request.append_aux(AuxValue::from(code));
        request.append_aux(AuxValue::from(identifier));

        let outcome = global.send_sync(request, default_call_timeout()).await;

        match outcome {
            Ok(Some(_reply)) => {
                tracing::debug!(identifier, code, "channel open");
                Ok(channel)
            }
            Ok(None) => {
                self.inner.channels.lock().remove(&code);
                tracing::warn!(identifier, code, "channel open timed out");
                Err(DtxError::Timeout)
            }
            Err(e) => {
                self.inner.channels.lock().remove(&code);
                Err(e)
            }
        }
    }

    /// Register a handler for messages addressed to channel codes this side
    /// never opened (the reserved -1 channel included). Handlers are tried
    /// in registration order until one claims the message.
    pub fn add_unrouted_handler<F>(&self, handler: F)
    where
        F: Fn(&DtxMessage) -> bool + Send + Sync + 'static,
    {
        self.inner.unrouted_handlers.lock().push(Arc::new(handler));
    }

    /// Send a message whose routing fields the caller has already filled.
    pub async fn send_message(&self, message: &DtxMessage) -> Result<(), DtxError> {
        self.inner.send_message(message).await
    }

    /// Tear the connection down: cancel every channel, close the transport,
    /// and join the receive worker. Idempotent; `Closed` is terminal.
    pub async fn disconnect(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Closed && self.worker.lock().is_none() {
                return;
            }
            *state = ConnectionState::Closing;
        }
        tracing::debug!("disconnecting");

        self.inner.cancel_all_channels();
        self.inner.transport.close().await;
        // One permit is stored if the worker is between reads, so the wakeup
        // cannot be lost.
        self.inner.shutdown.notify_one();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "receive worker join");
            }
        }

        self.inner.channels.lock().clear();
        self.inner.fragments.clear();
        *self.inner.state.lock() = ConnectionState::Closed;
    }
}

impl ConnectionInner {
    fn channel(&self, code: i32) -> Option<Arc<DtxChannel>> {
        self.channels.lock().get(&code).cloned()
    }

    fn is_sendable(&self) -> bool {
        matches!(
            *self.state.lock(),
            ConnectionState::Connecting | ConnectionState::HandshakePending | ConnectionState::Open
        )
    }

    pub(crate) async fn send_message(&self, message: &DtxMessage) -> Result<(), DtxError> {
        if !self.is_sendable() {
            return Err(DtxError::closed());
        }
        let frames = message.encode();
        self.transport.send_all(&frames).await?;
        Ok(())
    }

    fn cancel_all_channels(&self) {
        let channels: Vec<_> = self.channels.lock().values().cloned().collect();
        for channel in channels {
            channel.cancel();
        }
    }

    /// Fatal-path teardown driven by the worker itself: the transport is
    /// gone, so wake everyone and mark the connection closed. The worker's
    /// join handle stays for `disconnect`.
    async fn fail_connection(&self, error: &DtxError) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                // Expected during deliberate shutdown.
                return;
            }
            *state = ConnectionState::Closed;
        }
        tracing::warn!(%error, "connection lost");
        self.cancel_all_channels();
        self.transport.close().await;
    }

    async fn receive_loop(self: Arc<Self>) {
        tracing::debug!("receive worker started");
        loop {
            let shutdown = self.shutdown.notified();
            tokio::select! {
                _ = shutdown => break,
                received = self.read_one() => match received {
                    Ok(Some(message)) => self.route(message).await,
                    Ok(None) => {}
                    Err(e) => {
                        self.fail_connection(&e).await;
                        break;
                    }
                },
            }
        }
        tracing::debug!("receive worker stopped");
    }

    /// Read one frame; returns a complete message once reassembly allows.
    async fn read_one(&self) -> Result<Option<DtxMessage>, DtxError> {
        let header = self.read_frame_header().await?;
        let mut body = vec![0u8; header.body_len()];
        self.transport.read_exact(&mut body).await?;

        if header.fragment_count > 1 {
            let Some(assembled) = self.fragments.push(
                header.identifier,
                header.fragment_index,
                header.fragment_count,
                body,
            ) else {
                return Ok(None);
            };
            return Ok(Some(DtxMessage::decode(&header, &assembled)));
        }

        Ok(Some(DtxMessage::decode(&header, &body)))
    }

    /// Read a 32-byte frame header, sliding past garbage until a magic is
    /// found. More than 1 MiB of garbage declares the stream corrupt.
    async fn read_frame_header(&self) -> Result<FrameHeader, DtxError> {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        self.transport.read_exact(&mut buf).await?;

        let mut skipped = 0usize;
        while !FrameHeader::is_magic(&buf) {
            if skipped >= MAX_RESYNC_BYTES {
                return Err(DtxError::Protocol(format!(
                    "no frame magic within {MAX_RESYNC_BYTES} bytes"
                )));
            }
            buf.copy_within(1.., 0);
            self.transport
                .read_exact(&mut buf[FRAME_HEADER_LEN - 1..])
                .await?;
            skipped += 1;
        }
        if skipped > 0 {
            tracing::warn!(skipped, "resynchronized to frame magic");
        }

        FrameHeader::parse(&buf)
    }

    /// Steps 5–7 of the receive loop: ratchet, ack, consume the handshake,
    /// route to the channel or the unrouted-handler chain.
    async fn route(&self, message: DtxMessage) {
        let message_type = message.message_type();
        let server_originated =
            message.conversation_index == 0 && message_type != MessageType::Ack;

        if server_originated {
            if let Some(channel) = self.channel(message.channel_code) {
                channel.sync_identifier(message.identifier);
            }
        }

        // Acks go out before the message becomes visible to user code.
        if message.expects_reply && server_originated {
            let ack = DtxMessage::ack(
                message.identifier,
                message.channel_code,
                message.conversation_index,
            );
            if let Err(e) = self.send_message(&ack).await {
                tracing::warn!(error = %e, identifier = message.identifier, "ack send failed");
            }
        }

        if message_type == MessageType::Ack {
            tracing::trace!(identifier = message.identifier, "ack received");
            return;
        }

        // The capability handshake is engine-internal traffic.
        if message.channel_code == GLOBAL_CHANNEL_CODE
            && message.conversation_index == 0
            && message.selector().as_deref() == Some(CAPABILITIES_SELECTOR)
        {
            if !self.handshake_done.swap(true, Ordering::AcqRel) {
                tracing::debug!("peer capabilities received");
                // A stored permit survives the waiter not being parked yet.
                self.handshake_notify.notify_one();
            }
            return;
        }

        match self.channel(message.channel_code) {
            Some(channel) => channel.dispatch(message),
            None => {
                let handlers: Vec<_> = self.unrouted_handlers.lock().clone();
                let claimed = handlers.iter().any(|handler| handler(&message));
                if !claimed {
                    tracing::debug!(
                        channel = message.channel_code,
                        identifier = message.identifier,
                        "no handler for channel"
                    );
                }
            }
        }
    }
}

/// The capability mapping published during the handshake.
fn capabilities() -> Value {
    Value::Dict(Dict::from([
        (
            "com.apple.private.DTXBlockCompression".to_string(),
            Value::U64(2),
        ),
        ("com.apple.private.DTXConnection".to_string(), Value::U64(1)),
    ]))
    .with_class(
        "NSMutableDictionary",
        &["NSMutableDictionary", "NSDictionary", "NSObject"],
    )
}
