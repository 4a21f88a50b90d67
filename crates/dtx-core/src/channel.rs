//! Per-channel request/reply correlation and dispatch.
//!
//! A channel owns its identifier counter and its waiter map. Identifiers
//! only ever move forward: the counter is advanced past any identifier the
//! peer originates on the channel, which is the sole mechanism keeping the
//! two independent identifier streams from colliding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::connection::{default_call_timeout, ConnectionInner};
use crate::{DtxError, DtxMessage};

/// Callback invoked with messages the channel does not correlate to a
/// pending request.
pub type MessageHandler = Arc<dyn Fn(DtxMessage) + Send + Sync>;

pub struct DtxChannel {
    identifier: String,
    code: i32,
    /// Next outgoing message identifier; starts at 1 and only increases.
    next_message_id: AtomicU32,
    cancelled: AtomicBool,
    waiters: Mutex<HashMap<u32, oneshot::Sender<Option<DtxMessage>>>>,
    selector_handlers: Mutex<HashMap<String, MessageHandler>>,
    default_handler: Mutex<Option<MessageHandler>>,
    connection: Weak<ConnectionInner>,
}

impl std::fmt::Debug for DtxChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtxChannel")
            .field("identifier", &self.identifier)
            .field("code", &self.code)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Removes a registered waiter unless the call completed normally, so an
/// aborted or timed-out caller never leaks its map entry.
struct WaiterGuard<'a> {
    channel: &'a DtxChannel,
    id: u32,
    armed: bool,
}

impl WaiterGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.channel.waiters.lock().remove(&self.id).is_some() {
            tracing::debug!(
                channel = self.channel.code,
                identifier = self.id,
                "removed pending waiter"
            );
        }
    }
}

impl DtxChannel {
    pub(crate) fn new(connection: Weak<ConnectionInner>, identifier: &str, code: i32) -> Self {
        Self {
            identifier: identifier.to_string(),
            code,
            next_message_id: AtomicU32::new(1),
            cancelled: AtomicBool::new(false),
            waiters: Mutex::new(HashMap::new()),
            selector_handlers: Mutex::new(HashMap::new()),
            default_handler: Mutex::new(None),
            connection,
        }
    }

    /// The reverse-DNS identifier this channel was opened with.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Send a message and wait for its correlated reply.
    ///
    /// Returns `Ok(None)` when the deadline elapses or the channel is
    /// cancelled while waiting; a reply that arrives after that is logged
    /// and discarded by dispatch.
    pub async fn send_sync(
        &self,
        mut message: DtxMessage,
        timeout: Duration,
    ) -> Result<Option<DtxMessage>, DtxError> {
        if self.is_cancelled() {
            return Err(DtxError::Cancelled);
        }
        let connection = self.connection.upgrade().ok_or_else(DtxError::closed)?;

        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        message.identifier = id;
        message.channel_code = self.code;
        message.expects_reply = true;

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, tx);
        let mut guard = WaiterGuard {
            channel: self,
            id,
            armed: true,
        };

        tracing::debug!(channel = self.code, identifier = id, %message, "send_sync");
        connection.send_message(&message).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                guard.disarm();
                Ok(response)
            }
            Ok(Err(_)) => {
                // Sender dropped without fulfilling: the waiter map was torn
                // down underneath us.
                guard.disarm();
                Ok(None)
            }
            Err(_) => {
                tracing::warn!(
                    channel = self.code,
                    identifier = id,
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out waiting for reply"
                );
                Ok(None)
            }
        }
    }

    /// [`send_sync`](Self::send_sync) with the default call timeout
    /// (`DTX_CALL_TIMEOUT_MS`, 5000 ms unless overridden).
    pub async fn call(&self, message: DtxMessage) -> Result<Option<DtxMessage>, DtxError> {
        self.send_sync(message, default_call_timeout()).await
    }

    /// Send without expecting a reply. A no-op on a cancelled channel.
    pub async fn send_async(&self, mut message: DtxMessage) -> Result<(), DtxError> {
        if self.is_cancelled() {
            return Ok(());
        }
        let connection = self.connection.upgrade().ok_or_else(DtxError::closed)?;

        message.identifier = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        message.channel_code = self.code;
        message.expects_reply = false;

        tracing::debug!(channel = self.code, identifier = message.identifier, %message, "send_async");
        connection.send_message(&message).await
    }

    /// Handler for messages no selector handler claims.
    pub fn set_message_handler<F>(&self, handler: F)
    where
        F: Fn(DtxMessage) + Send + Sync + 'static,
    {
        *self.default_handler.lock() = Some(Arc::new(handler));
    }

    /// Handler for server messages with a specific selector.
    pub fn set_selector_handler<F>(&self, selector: &str, handler: F)
    where
        F: Fn(DtxMessage) + Send + Sync + 'static,
    {
        self.selector_handlers
            .lock()
            .insert(selector.to_string(), Arc::new(handler));
    }

    /// Cancel the channel: idempotent, wakes every outstanding waiter so
    /// its caller observes `None`.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(channel = self.code, identifier = %self.identifier, "cancelling channel");

        let drained: Vec<_> = {
            let mut waiters = self.waiters.lock();
            waiters.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(None);
        }
    }

    /// Advance the identifier counter past a server-originated identifier.
    pub(crate) fn sync_identifier(&self, received: u32) {
        let floor = received.saturating_add(1);
        let previous = self.next_message_id.fetch_max(floor, Ordering::SeqCst);
        if previous < floor {
            tracing::trace!(
                channel = self.code,
                received,
                next = floor,
                "identifier counter advanced"
            );
        }
    }

    /// Route a received message: replies fulfill waiters, everything else
    /// goes to handlers. Called from the connection's receive worker.
    pub(crate) fn dispatch(&self, message: DtxMessage) {
        if self.is_cancelled() {
            return;
        }

        if message.conversation_index > 0 {
            let waiter = self.waiters.lock().remove(&message.identifier);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(Some(message));
                }
                None => {
                    tracing::debug!(
                        channel = self.code,
                        identifier = message.identifier,
                        "discarding reply with no waiter"
                    );
                }
            }
            return;
        }

        if let Some(selector) = message.selector() {
            let handler = self.selector_handlers.lock().get(&selector).cloned();
            if let Some(handler) = handler {
                handler(message);
                return;
            }
        }

        let handler = self.default_handler.lock().clone();
        match handler {
            Some(handler) => handler(message),
            None => {
                tracing::trace!(channel = self.code, %message, "unhandled message")
            }
        }
    }

    /// Number of in-flight synchronous requests (diagnostics).
    pub fn pending_requests(&self) -> usize {
        self.waiters.lock().len()
    }
}
