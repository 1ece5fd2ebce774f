//! The messenger: dispatcher and host-side call API.
//!
//! A [`Messenger`] sits between a string-passing channel and the host's
//! methods. Inbound text goes into [`Messenger::received_request`];
//! outbound text comes out of [`MessengerIo::outbound`].
//!
//! ```text
//!   peer text ──→ received_request ──┬─ control    → ready / discard
//!                                    ├─ succeeded  → PendingTable::resolve
//!                                    ├─ failed     → PendingTable::reject
//!                                    └─ invoke     → registry → handler task
//!                                                              │
//!   outbound ←──────────────── succeeded / failed ←────────────┘
//!
//!   invoke_peer ──→ PendingTable::register ──→ outbound ──→ ... reply
//! ```
//!
//! # Failure semantics
//!
//! Nothing that arrives from the peer can make `received_request` fail.
//! Malformed frames and replies to unknown ids are reported on
//! [`MessengerIo::events`] and dropped. Errors while serving an `invoke`
//! (unknown method, bad arguments, a handler error or panic) always
//! become a `failed` reply with the same id.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tether_pending::{CallError, CancelReason, PendingTable, TimeoutSweeper};
use tether_protocol::{
    AbortSignalBody, Codec, ExceptionBody, InjectBody, InvokeBody, JsonCodec, Message,
    MessageKind, ObsoleteLevel, TypedValue, TypedValueKind, control,
};
use tether_registry::{DeprecationLevel, MethodMetadata, MethodRegistry, MethodSource, RegisteredMethod};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::marshal::{ABORT_SCOPE_PREFIX, HOST_CLOSURE_PREFIX, bytes_to_value, convert};
use crate::{Arg, Args, Handler, HandlerError, MessengerConfig, Position, SharedHandler, TetherError};

/// Error name of the reply sent when a handler panics.
pub const HANDLER_PANICKED: &str = "HandlerPanicked";

/// Error name of the reply sent when an `invoke` body can't be parsed.
pub const INVALID_INVOCATION: &str = "InvalidInvocation";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Out-of-band notifications that can't be attributed to any call.
#[derive(Debug, Clone, PartialEq)]
pub enum MessengerEvent {
    /// The peer sent `ready`: pending calls were cancelled and proxies
    /// re-injected.
    Ready,
    /// A frame could not be decoded and was dropped.
    Malformed { reason: String, frame: String },
    /// A reply arrived for an id that is not pending (late, duplicate, or
    /// made up).
    Spurious { id: String, kind: MessageKind },
}

/// The receiving ends a messenger produces.
pub struct MessengerIo {
    /// Encoded frames to deliver to the peer, in order.
    pub outbound: mpsc::UnboundedReceiver<String>,
    /// Out-of-band notifications.
    pub events: mpsc::UnboundedReceiver<MessengerEvent>,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Side table of live proxies the host handed to the peer.
#[derive(Default)]
struct ProxyTable {
    next_closure: AtomicU64,
    next_scope: AtomicU64,
    /// Outbound abort scopes, each with the token that stops its watcher.
    abort_scopes: Mutex<HashMap<String, CancellationToken>>,
}

impl ProxyTable {
    fn closure_token(&self) -> String {
        let n = self.next_closure.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{HOST_CLOSURE_PREFIX}{n}")
    }

    fn abort_scope(&self) -> String {
        let n = self.next_scope.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{ABORT_SCOPE_PREFIX}{n}")
    }

    fn scopes(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.abort_scopes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops every abort watcher. Returns how many were live.
    fn clear_scopes(&self) -> usize {
        let scopes: Vec<_> = self.scopes().drain().collect();
        for (_, stop) in &scopes {
            stop.cancel();
        }
        scopes.len()
    }
}

pub(crate) struct Inner {
    config: MessengerConfig,
    codec: JsonCodec,
    pub(crate) registry: MethodRegistry<SharedHandler>,
    pending: Arc<PendingTable>,
    proxies: ProxyTable,
    outbound: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedSender<MessengerEvent>,
    next_id: AtomicU64,
    sweeper: Mutex<Option<TimeoutSweeper>>,
    closed: CancellationToken,
}

// ---------------------------------------------------------------------------
// Messenger
// ---------------------------------------------------------------------------

/// One end of a Tether channel. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Messenger {
    inner: Arc<Inner>,
}

impl Messenger {
    /// Creates a messenger and the channels it writes to.
    ///
    /// Must be called within a Tokio runtime: the timeout sweeper and
    /// handler invocations run as spawned tasks.
    pub fn new(config: MessengerConfig) -> (Self, MessengerIo) {
        let config = config.validated();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let pending = Arc::new(PendingTable::new(config.sweep_config()));
        let sweeper = TimeoutSweeper::spawn(Arc::clone(&pending));

        info!(
            timeout = ?config.call_timeout,
            naming = ?config.naming,
            verbose_errors = config.verbose_errors,
            "messenger created"
        );

        let inner = Inner {
            registry: MethodRegistry::new(config.naming),
            config,
            codec: JsonCodec,
            pending,
            proxies: ProxyTable::default(),
            outbound: outbound_tx,
            events: events_tx,
            next_id: AtomicU64::new(1),
            sweeper: Mutex::new(sweeper),
            closed: CancellationToken::new(),
        };

        let io = MessengerIo {
            outbound: outbound_rx,
            events: events_rx,
        };
        (Self { inner: Arc::new(inner) }, io)
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Registers a method with default metadata (proxy injected).
    pub fn register(&self, name: &str, handler: impl Handler) -> Result<String, TetherError> {
        self.register_with(name, handler, MethodMetadata::default())
    }

    /// Registers a method and returns its normalized name. A method that
    /// asks for proxy injection is announced to the peer with `inject`.
    pub fn register_with(
        &self,
        name: &str,
        handler: impl Handler,
        metadata: MethodMetadata,
    ) -> Result<String, TetherError> {
        let handler: SharedHandler = Arc::new(handler);
        let name = self.inner.registry.register(name, handler, metadata.clone())?;
        if metadata.proxy_injection {
            self.inject(&name, &metadata);
        }
        Ok(name)
    }

    /// Removes a method. Returns `false` if it wasn't registered.
    pub fn unregister(&self, name: &str) -> bool {
        match self.inner.registry.unregister(name) {
            Some(method) => {
                self.retract(&method);
                true
            }
            None => false,
        }
    }

    /// Registers a bundle of methods under `scope` (see
    /// [`MethodRegistry::register_object`]).
    pub fn register_object(
        &self,
        scope: Option<&str>,
        source: &impl MethodSource<SharedHandler>,
    ) -> Result<Vec<String>, TetherError> {
        let registered = self.inner.registry.register_object(scope, source)?;
        for method in &registered {
            if method.metadata.proxy_injection {
                self.inject(&method.name, &method.metadata);
            }
        }
        Ok(registered.into_iter().map(|m| m.name).collect())
    }

    /// Removes exactly what [`Self::register_object`] registered.
    pub fn unregister_object(
        &self,
        scope: Option<&str>,
        source: &impl MethodSource<SharedHandler>,
    ) -> Result<Vec<String>, TetherError> {
        let removed = self.inner.registry.unregister_object(scope, source)?;
        for method in &removed {
            self.retract(method);
        }
        Ok(removed.into_iter().map(|m| m.name).collect())
    }

    /// Every registered name, hidden ones included, sorted.
    pub fn registered_methods(&self) -> Vec<String> {
        self.inner.registry.list()
    }

    fn inject(&self, name: &str, metadata: &MethodMetadata) {
        let body = InjectBody {
            name: name.to_owned(),
            obsolete: metadata.deprecation.as_ref().map(|d| match d.level {
                DeprecationLevel::Warning => ObsoleteLevel::Obsolete,
                DeprecationLevel::Error => ObsoleteLevel::Error,
            }),
            obsolete_message: metadata.deprecation.as_ref().map(|d| {
                format!("{name} is obsoleted: {}", d.message.as_deref().unwrap_or("(none)"))
            }),
        };
        let result = serde_json::to_value(&body)
            .map_err(|e| TetherError::Protocol(tether_protocol::ProtocolError::Encode(e)))
            .and_then(|body| self.send_control(control::INJECT, Some(body)));
        if let Err(e) = result {
            debug!(%name, error = %e, "inject not sent");
        }
    }

    fn retract(&self, method: &RegisteredMethod<SharedHandler>) {
        if !method.metadata.proxy_injection {
            return;
        }
        if let Err(e) = self.send_control(control::DELETE, Some(Value::from(method.name.as_str()))) {
            debug!(name = %method.name, error = %e, "delete not sent");
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    fn send(&self, message: &Message) -> Result<(), TetherError> {
        let text = self.inner.codec.encode_message(message)?;
        trace!(frame = %text, "sending");
        self.inner.outbound.send(text).map_err(|_| TetherError::Closed)
    }

    /// Sends a control message.
    pub fn send_control(&self, id: &str, body: Option<Value>) -> Result<(), TetherError> {
        self.send(&Message::control(id, body))
    }

    fn emit(&self, event: MessengerEvent) {
        // Nobody listening is fine.
        let _ = self.inner.events.send(event);
    }

    fn next_call_id(&self) -> String {
        format!("host_{}", self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Feeds one frame from the peer into the messenger.
    ///
    /// Never fails and never blocks on a handler: invocations run on their
    /// own tasks.
    pub fn received_request(&self, text: &str) {
        trace!(frame = %text, "received");
        let message = match self.inner.codec.decode_message(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "malformed message dropped");
                self.emit(MessengerEvent::Malformed {
                    reason: e.to_string(),
                    frame: text.to_owned(),
                });
                return;
            }
        };

        match message.kind {
            MessageKind::Control => self.handle_control(message),
            MessageKind::Succeeded => {
                let resolved = self.inner.pending.resolve(&message.id, message.body);
                self.settled_or_spurious(resolved, message.id, MessageKind::Succeeded);
            }
            MessageKind::Failed => {
                let error = match message.body_as::<ExceptionBody>() {
                    Ok(body) if body.is_cancellation() => CallError::Cancelled(CancelReason::Peer),
                    Ok(body) => CallError::Peer(body),
                    Err(e) => {
                        warn!(id = %message.id, error = %e, "failure reply without a usable body");
                        CallError::Peer(ExceptionBody::new("UnknownError", e.to_string()))
                    }
                };
                let rejected = self.inner.pending.settle(&message.id, Err(error));
                self.settled_or_spurious(rejected, message.id, MessageKind::Failed);
            }
            MessageKind::Invoke => self.handle_invoke(message),
        }
    }

    fn settled_or_spurious(&self, settled: bool, id: String, kind: MessageKind) {
        if settled {
            debug!(%id, %kind, "pending call settled");
        } else {
            warn!(%id, %kind, "spurious reply");
            self.emit(MessengerEvent::Spurious { id, kind });
        }
    }

    fn handle_control(&self, message: Message) {
        match message.id.as_str() {
            control::READY => self.on_ready(),
            control::DISCARD => {
                let token = message.body.as_ref().and_then(Value::as_str);
                match token {
                    Some(token) if token.starts_with(HOST_CLOSURE_PREFIX) => {
                        if self.inner.registry.unregister(token).is_some() {
                            debug!(%token, "host closure discarded by peer");
                        }
                    }
                    _ => debug!(body = ?message.body, "discard ignored"),
                }
            }
            other => debug!(id = %other, "unknown control message ignored"),
        }
    }

    /// The peer (re)started. Nothing it was working on survives, so every
    /// pending call is cancelled, host proxies it held are dropped, and
    /// injected methods are announced again.
    fn on_ready(&self) {
        let cancelled = self.inner.pending.cancel_all(CancelReason::PeerReset);
        let closures = self.drop_host_closures();
        let scopes = self.inner.proxies.clear_scopes();

        let methods = self.inner.registry.proxy_injected();
        for method in &methods {
            self.inject(&method.name, &method.metadata);
        }

        info!(
            cancelled,
            closures,
            scopes,
            injected = methods.len(),
            "peer ready"
        );
        self.emit(MessengerEvent::Ready);
    }

    fn drop_host_closures(&self) -> usize {
        self.inner
            .registry
            .remove_where(|name| name.starts_with(HOST_CLOSURE_PREFIX))
            .len()
    }

    fn handle_invoke(&self, message: Message) {
        let parsed = message.body_as::<InvokeBody>();
        let id = message.id;
        let body = match parsed {
            Ok(body) => body,
            Err(e) => {
                warn!(%id, error = %e, "invoke without a usable body");
                self.reply_failed(&id, ExceptionBody::new(INVALID_INVOCATION, e.to_string()));
                return;
            }
        };

        let Some(method) = self.inner.registry.lookup(&body.name) else {
            debug!(%id, name = %body.name, "invoke for unknown method");
            self.reply_failed(&id, ExceptionBody::invalid_method_name(&body.name));
            return;
        };

        if let Some(deprecation) = &method.metadata.deprecation {
            warn!(
                name = %method.name,
                level = ?deprecation.level,
                note = deprecation.message.as_deref().unwrap_or(""),
                "deprecated method invoked"
            );
        }

        debug!(%id, name = %method.name, args = body.args.len(), "invoking");
        let messenger = self.clone();
        tokio::spawn(async move {
            messenger.run_handler(id, method, body.args).await;
        });
    }

    async fn run_handler(self, id: String, method: RegisteredMethod<SharedHandler>, values: Vec<Value>) {
        let scopes = Arc::new(Mutex::new(Vec::new()));
        let args = Args::new(values, self.downgrade(), Arc::clone(&scopes));
        let handler = method.handler;

        let outcome = AssertUnwindSafe(async move { handler.call(args).await })
            .catch_unwind()
            .await;

        let scopes = std::mem::take(&mut *scopes.lock().unwrap_or_else(PoisonError::into_inner));
        for (name, cancel) in scopes {
            self.inner
                .registry
                .unregister_if(&name, |method| Arc::ptr_eq(&method.handler, &cancel));
        }

        let reply = match outcome {
            Ok(Ok(value)) => Ok(Message::succeeded(id.as_str(), value)),
            Ok(Err(error)) => {
                debug!(%id, name = %method.name, error = %error, "handler failed");
                Err(error)
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_owned());
                warn!(%id, name = %method.name, panic = %message, "handler panicked");
                Err(HandlerError::new(HANDLER_PANICKED, message))
            }
        };

        match reply {
            Ok(message) => {
                if let Err(e) = self.send(&message) {
                    debug!(%id, error = %e, "reply not sent");
                }
            }
            Err(error) => {
                let body = error.into_exception(self.inner.config.verbose_errors);
                self.reply_failed(&id, body);
            }
        }
    }

    fn reply_failed(&self, id: &str, body: ExceptionBody) {
        let result = Message::failed(id, &body)
            .map_err(TetherError::from)
            .and_then(|message| self.send(&message));
        if let Err(e) = result {
            debug!(%id, error = %e, "failure reply not sent");
        }
    }

    // -----------------------------------------------------------------------
    // Host-issued calls
    // -----------------------------------------------------------------------

    /// Calls a peer method and waits for its raw result (`None` for void).
    ///
    /// # Errors
    /// - [`CallError::Peer`] if the peer's handler raised.
    /// - [`CallError::Cancelled`] on timeout, peer reset, or shutdown.
    pub async fn invoke_peer(&self, name: &str, args: Vec<Arg>) -> Result<Option<Value>, TetherError> {
        self.invoke_peer_with_cancel(name, args, &CancellationToken::new()).await
    }

    /// Calls a peer method and converts its result into `R`.
    pub async fn invoke_peer_as<R: DeserializeOwned>(
        &self,
        name: &str,
        args: Vec<Arg>,
    ) -> Result<R, TetherError> {
        let value = self.invoke_peer(name, args).await?;
        Ok(convert(value.unwrap_or(Value::Null), Position::Result)?)
    }

    /// Calls a peer method that the caller can cancel.
    ///
    /// Cancelling `cancel` evicts the pending call at once and the caller
    /// sees [`CancelReason::Explicit`]. Nothing is sent to the peer; a
    /// late reply is reported as spurious.
    pub async fn invoke_peer_with_cancel(
        &self,
        name: &str,
        args: Vec<Arg>,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>, TetherError> {
        if self.inner.closed.is_cancelled() {
            return Err(TetherError::Closed);
        }
        if cancel.is_cancelled() {
            return Err(CallError::Cancelled(CancelReason::Explicit).into());
        }

        let id = self.next_call_id();
        let response = self.inner.pending.register(id.as_str())?;

        // Abort watchers for this call stop when `_settled` drops, i.e.
        // when the call completes or the caller gives up on it.
        let settled = CancellationToken::new();
        let _settled = settled.clone().drop_guard();
        let mut closures = Vec::new();
        let values = self.encode_args(args, &settled, &mut closures)?;

        // Closures are registered only after every argument encoded; a
        // failed send releases them.
        let tokens = self.register_closures(closures)?;
        let sent = Message::invoke(id.as_str(), &InvokeBody::new(name, values))
            .map_err(TetherError::from)
            .and_then(|message| self.send(&message));
        if let Err(e) = sent {
            self.release_closures(&tokens);
            return Err(e);
        }
        debug!(%id, %name, "peer invocation sent");

        tokio::select! {
            result = response => Ok(result?),
            () = cancel.cancelled() => {
                self.inner.pending.cancel(&id, CancelReason::Explicit);
                Err(CallError::Cancelled(CancelReason::Explicit).into())
            }
        }
    }

    /// Encodes outbound arguments. Closures get a token here but are
    /// collected into `closures` rather than registered.
    fn encode_args(
        &self,
        args: Vec<Arg>,
        settled: &CancellationToken,
        closures: &mut Vec<(String, SharedHandler)>,
    ) -> Result<Vec<Value>, TetherError> {
        args.into_iter()
            .map(|arg| match arg {
                Arg::Value(value) => Ok(value),
                Arg::Bytes(bytes) => Ok(bytes_to_value(&bytes)),
                Arg::Closure(handler) => {
                    let token = self.inner.proxies.closure_token();
                    closures.push((token.clone(), handler));
                    Ok(TypedValue::new(TypedValueKind::Closure, Value::from(token)).into_value())
                }
                Arg::Abort(token) => {
                    let scope = self.inner.proxies.abort_scope();
                    let aborted = token.is_cancelled();
                    if !aborted {
                        self.watch_abort(scope.clone(), token, settled.clone());
                    }
                    let body = serde_json::to_value(AbortSignalBody { scope, aborted })
                        .map_err(tether_protocol::ProtocolError::Encode)?;
                    Ok(TypedValue::new(TypedValueKind::AbortSignal, body).into_value())
                }
            })
            .collect()
    }

    /// Registers host closures as hidden methods. All or nothing.
    fn register_closures(&self, closures: Vec<(String, SharedHandler)>) -> Result<Vec<String>, TetherError> {
        let mut tokens = Vec::with_capacity(closures.len());
        for (token, handler) in closures {
            match self
                .inner
                .registry
                .register(&token, handler, MethodMetadata::hidden())
            {
                Ok(name) => tokens.push(name),
                Err(e) => {
                    self.release_closures(&tokens);
                    return Err(e.into());
                }
            }
        }
        Ok(tokens)
    }

    fn release_closures(&self, tokens: &[String]) {
        for token in tokens {
            self.inner.registry.unregister(token);
        }
        if !tokens.is_empty() {
            debug!(count = tokens.len(), "host closures released, call not sent");
        }
    }

    /// Mirrors a host cancellation token to the peer: when it fires while
    /// the call is outstanding, the peer is told to abort `scope`.
    fn watch_abort(&self, scope: String, token: CancellationToken, settled: CancellationToken) {
        self.inner.proxies.scopes().insert(scope.clone(), settled.clone());
        let messenger = self.downgrade();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = settled.cancelled() => {}
                () = token.cancelled() => {
                    if let Some(inner) = messenger.upgrade() {
                        let messenger = Messenger::from_inner(inner);
                        debug!(%scope, "abort signal fired, notifying peer");
                        let cancel = format!("{scope}.cancel");
                        if let Err(e) = messenger.invoke_peer(&cancel, Vec::new()).await {
                            debug!(%scope, error = %e, "peer abort not acknowledged");
                        }
                    }
                }
            }
            if let Some(inner) = messenger.upgrade() {
                inner.proxies.scopes().remove(&scope);
            }
        });
    }

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    /// Cancels every pending host-issued call. Returns how many there were.
    pub fn cancel_all_pending(&self) -> usize {
        self.cancel_all_pending_with(CancelReason::Explicit)
    }

    pub(crate) fn cancel_all_pending_with(&self, reason: CancelReason) -> usize {
        self.inner.pending.cancel_all(reason)
    }

    /// Number of host-issued calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Whether the call with correlation id `id` is still pending.
    pub fn is_pending(&self, id: &str) -> bool {
        self.inner.pending.contains(id)
    }

    /// Drops every host closure whose token the embedder no longer
    /// references. Returns how many were dropped.
    pub fn sweep_proxies(&self, still_referenced: impl Fn(&str) -> bool) -> usize {
        let swept = self
            .inner
            .registry
            .remove_where(|name| name.starts_with(HOST_CLOSURE_PREFIX) && !still_referenced(name))
            .len();
        if swept > 0 {
            debug!(swept, "host closures swept");
        }
        swept
    }

    /// Shuts the messenger down: pending calls are cancelled, the sweeper
    /// stops, proxies are released, and [`crate::serve`] returns.
    pub fn shutdown(&self) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        self.inner.closed.cancel();

        let cancelled = self.inner.pending.cancel_all(CancelReason::Shutdown);
        if let Some(sweeper) = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sweeper.stop();
        }
        let closures = self.drop_host_closures();
        let scopes = self.inner.proxies.clear_scopes();

        info!(cancelled, closures, scopes, "messenger shut down");
    }

    /// Resolves once [`Self::shutdown`] has been called.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}
