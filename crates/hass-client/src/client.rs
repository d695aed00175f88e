//! The client facade: connection lifecycle, command round trips, event
//! listeners, reconnection.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use hass_wire::{Codec, CommandMessage, EventResultInfo, ResultMessage, ServerMessage};
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ClientConfig, ConnectionParameters};
use crate::correlation::PendingCommands;
use crate::dispatch::run_dispatch;
use crate::errors::{ClientError, check_result_error, codes};
use crate::pump::{PumpEnd, run_pump};
use crate::session::{self, WsStream};
use crate::state::{ConnectionState, StateTracker};
use crate::subscriptions::{EventCallback, ListenerId, SubscriptionRegistry, Topic};

type WsSink = SplitSink<WsStream, Message>;

/// One established socket and the tasks serving it.
///
/// A generation is superseded atomically: whoever takes it out of the slot
/// owns its teardown. `committed` flips once the connect attempt that
/// created the generation has finished; until then that attempt owns any
/// failure handling.
struct ActiveGeneration {
    number: u64,
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    cancel: CancellationToken,
    committed: bool,
    tasks: Vec<JoinHandle<()>>,
}

/// Persistent Home Assistant WebSocket client.
///
/// Cheap to clone; every clone drives the same underlying connection.
/// Commands are correlated over one shared socket, event subscriptions are
/// reference-counted per topic and replayed after a reconnect, and an
/// unexpectedly lost connection is re-established in the background unless
/// automatic reconnection is switched off.
#[derive(Clone)]
pub struct HassClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    codec: Codec,
    config: ClientConfig,
    automatic_reconnection: AtomicBool,
    disposed: AtomicBool,
    state: StateTracker,
    pending: Arc<PendingCommands>,
    subscriptions: Arc<SubscriptionRegistry>,
    /// Serializes connection attempts and close teardown.
    conn_gate: tokio::sync::Mutex<()>,
    generation: parking_lot::Mutex<Option<ActiveGeneration>>,
    generation_counter: AtomicU64,
    /// Parent token of every generation; cancelled by `close`/`dispose`.
    session_cancel: parking_lot::Mutex<Option<CancellationToken>>,
    params: parking_lot::Mutex<Option<ConnectionParameters>>,
    ha_version: parking_lot::RwLock<Option<String>>,
}

impl Default for HassClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl HassClient {
    /// Create a disconnected client with the given configuration.
    pub fn new(config: ClientConfig) -> Self {
        let state = StateTracker::new(config.state_channel_capacity);
        Self {
            inner: Arc::new(ClientInner {
                codec: Codec::new(),
                automatic_reconnection: AtomicBool::new(config.automatic_reconnection),
                config,
                disposed: AtomicBool::new(false),
                state,
                pending: Arc::new(PendingCommands::default()),
                subscriptions: Arc::new(SubscriptionRegistry::default()),
                conn_gate: tokio::sync::Mutex::new(()),
                generation: parking_lot::Mutex::new(None),
                generation_counter: AtomicU64::new(0),
                session_cancel: parking_lot::Mutex::new(None),
                params: parking_lot::Mutex::new(None),
                ha_version: parking_lot::RwLock::new(None),
            }),
        }
    }

    // ── Connection lifecycle ────────────────────────────────────────────

    /// Connect and authenticate, failing fast on the first error.
    ///
    /// See [`Self::connect_with`] for a retry budget.
    pub async fn connect(&self, params: ConnectionParameters) -> Result<(), ClientError> {
        self.connect_with(params, 0, None).await
    }

    /// Connect with a retry budget.
    ///
    /// Socket-level failures are retried up to `retries` times with the
    /// configured interval in between; a rejected access token is never
    /// retried. A negative budget retries forever and therefore requires a
    /// cancellation token so the loop stays stoppable.
    pub async fn connect_with(
        &self,
        params: ConnectionParameters,
        retries: i32,
        cancel: Option<CancellationToken>,
    ) -> Result<(), ClientError> {
        self.ensure_not_disposed()?;
        if retries < 0 && cancel.is_none() {
            return Err(ClientError::InvalidArgument {
                message: "a cancellation token is required when retrying indefinitely".into(),
            });
        }
        let caller_cancel = cancel.unwrap_or_default();
        let session_cancel = CancellationToken::new();
        let mut installed = false;
        let mut attempts_left = retries;

        loop {
            let gate = self.inner.conn_gate.lock().await;
            if !installed {
                if self.inner.state.current() != ConnectionState::Disconnected {
                    return Err(ClientError::AlreadyConnected);
                }
                *self.inner.session_cancel.lock() = Some(session_cancel.clone());
                *self.inner.params.lock() = Some(params.clone());
                installed = true;
            }
            let result = tokio::select! {
                () = caller_cancel.cancelled() => {
                    drop(gate);
                    self.abort_connect();
                    return Err(ClientError::Cancelled);
                }
                () = session_cancel.cancelled() => {
                    drop(gate);
                    self.abort_connect();
                    return Err(ClientError::Cancelled);
                }
                result = self.single_attempt(&params) => result,
            };
            drop(gate);

            match result {
                Ok(()) => return Ok(()),
                Err(ClientError::AlreadyConnected) => return Err(ClientError::AlreadyConnected),
                Err(err) if err.is_retryable() && (retries < 0 || attempts_left > 0) => {
                    if retries >= 0 {
                        attempts_left -= 1;
                    }
                    warn!(error = %err, "connection attempt failed; retrying");
                    tokio::select! {
                        () = caller_cancel.cancelled() => {
                            self.abort_connect();
                            return Err(ClientError::Cancelled);
                        }
                        () = session_cancel.cancelled() => {
                            self.abort_connect();
                            return Err(ClientError::Cancelled);
                        }
                        () = time::sleep(self.inner.config.retry_interval) => {}
                    }
                }
                Err(err) => {
                    self.inner.state.set(ConnectionState::Disconnected);
                    return Err(err);
                }
            }
        }
    }

    /// Close the session and stop its tasks.
    ///
    /// In-flight commands resolve with [`ClientError::ConnectionClosed`].
    /// Listener registrations survive; a later [`Self::connect`] replays
    /// them. Closing a disconnected client is a no-op.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.ensure_not_disposed()?;
        let session_cancel = self.inner.session_cancel.lock().take();
        if let Some(token) = &session_cancel {
            token.cancel();
        }
        let _gate = self.inner.conn_gate.lock().await;
        let generation = self.inner.generation.lock().take();
        if let Some(generation) = generation {
            {
                let mut sink = generation.sink.lock().await;
                if let Err(err) = sink.close().await {
                    debug!(error = %err, "socket close handshake failed");
                }
            }
            generation.cancel.cancel();
            let _ = futures::future::join_all(generation.tasks).await;
        }
        let _ = self.inner.pending.abort_all(|| ClientError::ConnectionClosed);
        *self.inner.params.lock() = None;
        self.inner.state.set(ConnectionState::Disconnected);
        info!("session closed");
        Ok(())
    }

    /// Tear everything down and make every future call fail fast.
    ///
    /// Unlike [`Self::close`] this is synchronous, drops all listener
    /// registrations, and is irreversible. In-flight commands resolve with
    /// [`ClientError::Disposed`].
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Resolve waiters before the token cascade so they observe the
        // disposal rather than a generic connection loss.
        let _ = self.inner.pending.abort_all(|| ClientError::Disposed);
        if let Some(token) = self.inner.session_cancel.lock().take() {
            token.cancel();
        }
        let generation = self.inner.generation.lock().take();
        if let Some(generation) = generation {
            generation.cancel.cancel();
        }
        *self.inner.params.lock() = None;
        self.inner.subscriptions.clear();
        self.inner.state.set(ConnectionState::Disconnected);
        info!("client disposed");
    }

    /// Wait until the client is [`ConnectionState::Connected`].
    ///
    /// Returns `false` when the timeout elapses or the session ends first.
    /// A zero timeout is rejected.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<bool, ClientError> {
        self.ensure_not_disposed()?;
        if timeout.is_zero() {
            return Err(ClientError::InvalidArgument {
                message: "timeout must be greater than zero".into(),
            });
        }
        // Subscribe before checking so a change between the check and the
        // wait cannot be missed.
        let mut rx = self.inner.state.subscribe();
        if self.inner.state.current() == ConnectionState::Connected {
            return Ok(true);
        }
        let deadline = time::Instant::now() + timeout;
        loop {
            match time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(ConnectionState::Connected)) => return Ok(true),
                // Disconnected mid-wait means the session ended.
                Ok(Ok(ConnectionState::Disconnected)) => return Ok(false),
                Ok(Ok(_)) => {}
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                    match self.inner.state.current() {
                        ConnectionState::Connected => return Ok(true),
                        ConnectionState::Disconnected => return Ok(false),
                        _ => {}
                    }
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return Ok(false),
            }
        }
    }

    // ── Commands ────────────────────────────────────────────────────────

    /// Send a command and wait for the server's answer.
    ///
    /// Fatal server error codes surface as errors; ordinary refusals come
    /// back as a result with `success == false` for the caller to inspect.
    #[instrument(skip_all, fields(command = %command.command_type()))]
    pub async fn send_command(
        &self,
        command: &CommandMessage,
        cancel: &CancellationToken,
    ) -> Result<ResultMessage, ClientError> {
        self.ensure_not_disposed()?;
        self.ensure_connected()?;
        let result = self.command_round_trip(command, cancel).await?;
        check_result_error(&result)?;
        Ok(result)
    }

    /// Send a command where only success or failure matters.
    pub async fn send_command_expecting_success(
        &self,
        command: &CommandMessage,
        cancel: &CancellationToken,
    ) -> Result<bool, ClientError> {
        Ok(self.send_command(command, cancel).await?.success)
    }

    /// Send a command and deserialize its `result` payload.
    ///
    /// A refusal (`success == false`) is promoted to an error here because
    /// there is no payload to return.
    pub async fn send_command_expecting_result<T: DeserializeOwned>(
        &self,
        command: &CommandMessage,
        cancel: &CancellationToken,
    ) -> Result<T, ClientError> {
        let result = self.send_command(command, cancel).await?;
        if !result.success {
            return Err(refusal_error(
                result,
                "command failed without error detail",
            ));
        }
        Ok(result.deserialize_result()?)
    }

    /// Application-level keepalive round trip.
    pub async fn ping(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        let _ = self.send_command(&CommandMessage::Ping, cancel).await?;
        Ok(())
    }

    // ── Event listeners ─────────────────────────────────────────────────

    /// Register `listener` for events on `topic`.
    ///
    /// The first listener on a topic subscribes on the wire; later
    /// listeners share that subscription. The returned handle detaches the
    /// listener via [`Self::remove_event_listener`].
    pub async fn add_event_listener<F>(
        &self,
        topic: Topic,
        listener: F,
        cancel: &CancellationToken,
    ) -> Result<ListenerId, ClientError>
    where
        F: Fn(&EventResultInfo) + Send + Sync + 'static,
    {
        self.ensure_not_disposed()?;
        let callback: EventCallback = Arc::new(listener);
        let _ops = self.inner.subscriptions.op_lock().lock().await;
        if let Some(id) = self
            .inner
            .subscriptions
            .add_local(&topic, Arc::clone(&callback))
        {
            debug!(%topic, "listener joined existing subscription");
            return Ok(id);
        }
        let command = CommandMessage::SubscribeEvents {
            event_type: topic.event_type().map(str::to_owned),
        };
        let result = self.send_command(&command, cancel).await?;
        if !result.success {
            return Err(refusal_error(
                result,
                "subscription refused without error detail",
            ));
        }
        let subscription = result.id;
        let id = self
            .inner
            .subscriptions
            .insert_topic(topic.clone(), subscription, callback);
        debug!(%topic, subscription, "subscribed");
        Ok(id)
    }

    /// Detach a listener. Returns whether it was still registered.
    ///
    /// When the last listener of a topic goes, the server-side subscription
    /// is cancelled too, best effort: local removal sticks even if the
    /// unsubscribe cannot be delivered.
    pub async fn remove_event_listener(
        &self,
        listener: ListenerId,
        cancel: &CancellationToken,
    ) -> Result<bool, ClientError> {
        self.ensure_not_disposed()?;
        let _ops = self.inner.subscriptions.op_lock().lock().await;
        let Some(removal) = self.inner.subscriptions.remove_listener(listener) else {
            return Ok(false);
        };
        let Some(subscription) = removal.unsubscribe else {
            return Ok(true);
        };
        if self.inner.state.current() == ConnectionState::Connected && !cancel.is_cancelled() {
            let command = CommandMessage::UnsubscribeEvents { subscription };
            match self.command_round_trip(&command, cancel).await {
                Ok(result) if result.success => {
                    debug!(topic = %removal.topic, subscription, "unsubscribed");
                }
                Ok(result) => {
                    warn!(
                        topic = %removal.topic,
                        subscription,
                        error = ?result.error,
                        "server refused unsubscribe"
                    );
                }
                Err(err) => {
                    warn!(
                        topic = %removal.topic,
                        subscription,
                        error = %err,
                        "unsubscribe not delivered"
                    );
                }
            }
        }
        Ok(true)
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// Current lifecycle state.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    /// Whether a session is established and ready for commands.
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Whether [`Self::dispose`] has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Relaxed)
    }

    /// Stream of connection state changes.
    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Whether the client reconnects by itself after losing the connection.
    pub fn automatic_reconnection(&self) -> bool {
        self.inner.automatic_reconnection.load(Ordering::Relaxed)
    }

    /// Toggle automatic reconnection at runtime.
    pub fn set_automatic_reconnection(&self, enabled: bool) {
        self.inner
            .automatic_reconnection
            .store(enabled, Ordering::Relaxed);
    }

    /// Server version reported during the last successful handshake.
    pub fn ha_version(&self) -> Option<String> {
        self.inner.ha_version.read().clone()
    }

    /// Commands currently waiting for an answer.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.count()
    }

    /// Total event listeners across all topics.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.listener_count()
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn ensure_not_disposed(&self) -> Result<(), ClientError> {
        if self.is_disposed() {
            Err(ClientError::Disposed)
        } else {
            Ok(())
        }
    }

    fn ensure_connected(&self) -> Result<(), ClientError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    /// One full connect: socket, handshake, tasks, replay.
    ///
    /// Runs with the connection gate held. On success the new generation is
    /// committed and the state is `Connected`.
    #[instrument(skip_all, fields(endpoint = %params.endpoint))]
    async fn single_attempt(&self, params: &ConnectionParameters) -> Result<(), ClientError> {
        if self.inner.state.current() == ConnectionState::Connected {
            return Err(ClientError::AlreadyConnected);
        }
        self.inner.state.set(ConnectionState::Connecting);
        let mut stream = session::open_socket(params).await?;
        self.inner.state.set(ConnectionState::Authenticating);
        let ha_version =
            session::authenticate(&mut stream, &params.access_token, self.inner.codec).await?;
        *self.inner.ha_version.write() = Some(ha_version);

        // Fresh socket, fresh id sequence.
        self.inner.pending.reset();

        let (sink, reader) = stream.split();
        let number = self.inner.generation_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let session_token = self
            .inner
            .session_cancel
            .lock()
            .clone()
            .unwrap_or_default();
        let cancel = session_token.child_token();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let dispatch_task = tokio::spawn(run_dispatch(
            events_rx,
            Arc::clone(&self.inner.subscriptions),
            cancel.clone(),
        ));
        let pump_task = {
            let client = self.clone();
            let pending = Arc::clone(&self.inner.pending);
            let codec = self.inner.codec;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let end = run_pump(reader, codec, pending, events_tx, cancel).await;
                client.on_generation_end(number, end).await;
            })
        };

        *self.inner.generation.lock() = Some(ActiveGeneration {
            number,
            sink: Arc::new(tokio::sync::Mutex::new(sink)),
            cancel,
            committed: false,
            tasks: vec![pump_task, dispatch_task],
        });

        if self.inner.subscriptions.topic_count() > 0 {
            self.inner.state.set(ConnectionState::Restoring);
            if let Err(err) = self.replay_subscriptions().await {
                self.teardown_generation(number);
                // A generation reaped mid-replay means the socket died.
                let err = match err {
                    ClientError::NotConnected => ClientError::ConnectionClosed,
                    err => err,
                };
                return Err(err);
            }
        }

        // The pump may have died during setup and reaped the slot already.
        let committed = {
            let mut slot = self.inner.generation.lock();
            match slot.as_mut() {
                Some(generation) if generation.number == number => {
                    generation.committed = true;
                    true
                }
                _ => false,
            }
        };
        if !committed {
            return Err(ClientError::ConnectionClosed);
        }
        self.inner.state.set(ConnectionState::Connected);
        info!(generation = number, "session established");
        Ok(())
    }

    /// Cleanup after a cancelled connect: kill any half-built generation
    /// and settle back to `Disconnected`.
    fn abort_connect(&self) {
        if let Some(token) = self.inner.session_cancel.lock().clone() {
            token.cancel();
        }
        if let Some(generation) = self.inner.generation.lock().take() {
            generation.cancel.cancel();
        }
        let _ = self.inner.pending.abort_all(|| ClientError::Cancelled);
        self.inner.state.set(ConnectionState::Disconnected);
    }

    /// Drop the generation created by a failed attempt, if it is still the
    /// current one.
    fn teardown_generation(&self, number: u64) {
        let generation = {
            let mut slot = self.inner.generation.lock();
            match slot.as_ref() {
                Some(active) if active.number == number => slot.take(),
                _ => None,
            }
        };
        if let Some(generation) = generation {
            generation.cancel.cancel();
        }
    }

    /// Runs on the pump task after the socket stops yielding frames.
    ///
    /// Returns a boxed future: the reconnect path re-enters
    /// `single_attempt`, which spawns the next generation's call back into
    /// this function, so a plain `async fn` here would have a recursive
    /// future type.
    fn on_generation_end(
        self,
        number: u64,
        end: PumpEnd,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            debug!(generation = number, outcome = ?end, "receive pump ended");
            let abandoned = self.inner.pending.abort_all(|| ClientError::ConnectionClosed);
            if abandoned > 0 {
                warn!(abandoned, "commands abandoned by connection loss");
            }
            if end == PumpEnd::Cancelled {
                // Whoever cancelled the generation owns the rest of the cleanup.
                return;
            }
            let generation = {
                let mut slot = self.inner.generation.lock();
                match slot.as_ref() {
                    Some(active) if active.number == number => slot.take(),
                    _ => None,
                }
            };
            let Some(generation) = generation else {
                return;
            };
            generation.cancel.cancel();
            if !generation.committed {
                // The connect attempt that built this generation is still
                // running and will see the empty slot.
                return;
            }

            let params = self.inner.params.lock().clone();
            let session_token = self.inner.session_cancel.lock().clone();
            let reconnect = self.inner.automatic_reconnection.load(Ordering::Relaxed)
                && !self.is_disposed()
                && session_token
                    .as_ref()
                    .is_some_and(|token| !token.is_cancelled());
            if let (true, Some(params), Some(session_token)) = (reconnect, params, session_token) {
                self.inner.state.set(ConnectionState::Restoring);
                info!("connection lost; reconnecting");
                self.reconnect_loop(&params, session_token).await;
            } else {
                self.inner.state.set(ConnectionState::Disconnected);
            }
        })
    }

    /// Re-establish a lost session, retrying socket failures forever until
    /// cancelled. A rejected token ends the loop in `Disconnected`.
    async fn reconnect_loop(
        &self,
        params: &ConnectionParameters,
        session_cancel: CancellationToken,
    ) {
        loop {
            if self.is_disposed() || session_cancel.is_cancelled() {
                return;
            }
            let attempt = async {
                let _gate = self.inner.conn_gate.lock().await;
                self.single_attempt(params).await
            };
            let result = tokio::select! {
                () = session_cancel.cancelled() => return,
                result = attempt => result,
            };
            match result {
                Ok(()) => {
                    info!("connection restored");
                    return;
                }
                Err(ClientError::AlreadyConnected) => return,
                Err(err) if err.is_retryable() => {
                    warn!(error = %err, "reconnection attempt failed; retrying");
                    self.inner.state.set(ConnectionState::Restoring);
                    tokio::select! {
                        () = session_cancel.cancelled() => return,
                        () = time::sleep(self.inner.config.retry_interval) => {}
                    }
                }
                Err(err) => {
                    error!(error = %err, "reconnection failed; giving up");
                    self.inner.state.set(ConnectionState::Disconnected);
                    return;
                }
            }
        }
    }

    /// Re-subscribe every registered topic on a fresh session.
    ///
    /// Loops on each topic until the server accepts it; a socket failure
    /// aborts the replay and with it the connection attempt.
    async fn replay_subscriptions(&self) -> Result<(), ClientError> {
        let _ops = self.inner.subscriptions.op_lock().lock().await;
        let targets = self.inner.subscriptions.replay_targets();
        info!(topics = targets.len(), "replaying event subscriptions");
        let cancel = CancellationToken::new();
        for topic in targets {
            loop {
                let command = CommandMessage::SubscribeEvents {
                    event_type: topic.event_type().map(str::to_owned),
                };
                let result = self.command_round_trip(&command, &cancel).await?;
                if result.success {
                    self.inner
                        .subscriptions
                        .update_subscription_id(&topic, result.id);
                    debug!(%topic, subscription = result.id, "subscription restored");
                    break;
                }
                warn!(%topic, error = ?result.error, "subscription replay refused; retrying");
            }
        }
        Ok(())
    }

    /// Send one command and classify the answer.
    async fn command_round_trip(
        &self,
        command: &CommandMessage,
        cancel: &CancellationToken,
    ) -> Result<ResultMessage, ClientError> {
        match self.send_via_generation(command, cancel).await? {
            ServerMessage::Result(result) => Ok(result),
            // A pong is a result in spirit; give it the same shape.
            ServerMessage::Pong { id } => Ok(ResultMessage {
                id,
                success: true,
                result: None,
                error: None,
            }),
            other => Err(ClientError::Protocol {
                message: format!(
                    "unexpected `{}` response to `{}` command",
                    other.message_type(),
                    command.command_type()
                ),
            }),
        }
    }

    /// Ship a command over the current generation and wait for its answer.
    ///
    /// The id is allocated while holding the sink, so ids leave the socket
    /// in increasing order.
    async fn send_via_generation(
        &self,
        command: &CommandMessage,
        cancel: &CancellationToken,
    ) -> Result<ServerMessage, ClientError> {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let (sink, generation_cancel) = {
            let slot = self.inner.generation.lock();
            let Some(generation) = slot.as_ref() else {
                return Err(ClientError::NotConnected);
            };
            (Arc::clone(&generation.sink), generation.cancel.clone())
        };

        let (id, rx) = {
            let mut guard = sink.lock().await;
            let (id, rx) = self.inner.pending.register();
            let frame = match self.inner.codec.encode_command(command, id) {
                Ok(frame) => frame,
                Err(err) => {
                    let _ = self.inner.pending.remove(id);
                    return Err(err.into());
                }
            };
            debug!(id, command = %command.command_type(), "sending command");
            if let Err(err) = guard.send(Message::text(frame)).await {
                let _ = self.inner.pending.remove(id);
                return Err(err.into());
            }
            (id, rx)
        };

        tokio::select! {
            // A delivered answer beats a cancellation that raced it.
            biased;
            answer = rx => match answer {
                Ok(answer) => answer,
                Err(_) => Err(ClientError::ConnectionClosed),
            },
            () = cancel.cancelled() => {
                let _ = self.inner.pending.remove(id);
                Err(ClientError::Cancelled)
            }
            () = generation_cancel.cancelled() => {
                let _ = self.inner.pending.remove(id);
                Err(ClientError::ConnectionClosed)
            }
        }
    }
}

/// Error for a refused command when the caller needed it to succeed.
fn refusal_error(result: ResultMessage, fallback: &str) -> ClientError {
    result.error.map_or_else(
        || ClientError::Command {
            code: codes::UNKNOWN_ERROR.to_owned(),
            message: fallback.to_owned(),
        },
        |error| ClientError::Command {
            code: error.code,
            message: error.message,
        },
    )
}
