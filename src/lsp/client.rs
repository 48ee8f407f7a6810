//! Client session: the protocol state machine over one language server.
//!
//! A [`ClientSession`] owns the server process, the framed transport over its
//! stdio and the table of requests in flight. Three background tasks run per
//! session:
//!
//! - the **read loop**, the only consumer of inbound frames, which completes
//!   pending requests, answers server-initiated requests and queues
//!   notifications;
//! - the **writer**, the only producer of outbound frames, fed through a
//!   bounded channel so callers never touch the pipe directly;
//! - the **dispatcher**, which runs notification handlers in arrival order
//!   without blocking the read loop.
//!
//! # Example
//!
//! ```ignore
//! use jusu_lsp::lsp::{ClientSession, LaunchConfig};
//!
//! let session = ClientSession::builder(LaunchConfig::new("python").arg("lsp_server.py"))
//!     .build();
//! session.start().await?;
//! let hover = session.hover(uri, position).await?;
//! session.stop().await;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use futures::StreamExt;
use lsp_types::notification::{
    Cancel, DidChangeTextDocument, DidCloseTextDocument, DidOpenTextDocument,
    DidSaveTextDocument, Exit, Initialized, LogMessage, Notification, ShowMessage,
};
use lsp_types::request::{Completion, HoverRequest, Initialize, Request, Shutdown};
use lsp_types::{
    ClientCapabilities, ClientInfo, CompletionClientCapabilities, CompletionParams,
    CompletionResponse, DidChangeTextDocumentParams, DidCloseTextDocumentParams,
    DidOpenTextDocumentParams, DidSaveTextDocumentParams, Hover, HoverClientCapabilities,
    HoverParams, InitializeParams, InitializeResult, InitializedParams, LogMessageParams,
    MarkupKind, MessageType, PartialResultParams, Position,
    PublishDiagnosticsClientCapabilities, ServerCapabilities, TextDocumentClientCapabilities,
    TextDocumentContentChangeEvent, TextDocumentIdentifier, TextDocumentItem,
    TextDocumentPositionParams, TextDocumentSyncClientCapabilities, TraceValue, Url,
    VersionedTextDocumentIdentifier, WorkDoneProgressParams, WorkspaceFolder,
};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ProtocolError, SessionError, TransportError};

use super::launcher::{
    self, LaunchConfig, LaunchedProcess, ProcessHandle, SERVER_LOG_TARGET, Termination,
};
use super::pending::PendingTable;
use super::selector::DocumentSelector;
use super::transport::{FrameReader, FrameWriter, Transport};
use super::types::{IncomingMessage, OutgoingErrorResponse, OutgoingNotification, OutgoingRequest};

/// Capacity of the queue between callers and the writer task.
const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle state of a [`ClientSession`].
///
/// ```text
/// Uninitialized --start()--> Starting --handshake--> Running
///       |                       |                       |
///       |                  (failure)                 stop() / transport death
///       v                       v                       v
///    Stopped <------------------+------ Stopping <------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Constructed, never started.
    Uninitialized,
    /// Process spawned, initialize handshake in progress.
    Starting,
    /// Handshake complete; requests and notifications are accepted.
    Running,
    /// Graceful shutdown in progress.
    Stopping,
    /// Terminal.
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Asynchronous events a session reports to its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The transport failed while the session was running. Emitted at most
    /// once, after the server process has been released.
    Died(TransportError),
}

/// How [`ClientSession::stop`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The session was not running; nothing was torn down.
    NotRunning,
    /// The server acknowledged `shutdown` and exited on its own.
    Graceful,
    /// The server did not cooperate in time and was killed.
    Forced,
}

/// Timeouts and identity used by a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Bound on the initialize handshake.
    pub init_timeout: Duration,
    /// Bound on each request issued while running.
    pub request_timeout: Duration,
    /// Bound on the `shutdown` request and, separately, on process exit.
    pub shutdown_timeout: Duration,
    /// Name reported in `clientInfo`.
    pub client_name: String,
    /// Workspace folders announced during initialization.
    pub workspace_folders: Vec<WorkspaceFolder>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(2),
            client_name: "jusuplusplus".to_string(),
            workspace_folders: Vec::new(),
        }
    }
}

/// Builder for [`ClientSession`].
#[derive(Debug)]
pub struct ClientSessionBuilder {
    launch: LaunchConfig,
    selector: DocumentSelector,
    options: SessionOptions,
}

impl ClientSessionBuilder {
    /// Creates a builder with default selector and options.
    pub fn new(launch: LaunchConfig) -> Self {
        Self {
            launch,
            selector: DocumentSelector::default(),
            options: SessionOptions::default(),
        }
    }

    /// Sets the document selector.
    #[must_use]
    pub fn selector(mut self, selector: DocumentSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Replaces all options at once.
    #[must_use]
    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the initialization timeout.
    #[must_use]
    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.options.init_timeout = timeout;
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.options.request_timeout = timeout;
        self
    }

    /// Sets the shutdown timeout.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.options.shutdown_timeout = timeout;
        self
    }

    /// Adds a workspace folder.
    #[must_use]
    pub fn workspace_folder(mut self, uri: Url, name: impl Into<String>) -> Self {
        self.options.workspace_folders.push(WorkspaceFolder {
            uri,
            name: name.into(),
        });
        self
    }

    /// Builds an unstarted session.
    pub fn build(self) -> ClientSession {
        let (state, _) = watch::channel(SessionState::Uninitialized);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        ClientSession {
            launch: self.launch,
            selector: self.selector,
            shared: Arc::new(Shared {
                state,
                pending: PendingTable::new(),
                outbound: StdMutex::new(None),
                failure: StdMutex::new(None),
                next_id: AtomicU64::new(1),
                events: events_tx,
                handlers: RwLock::new(HashMap::new()),
                connection: Mutex::new(None),
                documents: Mutex::new(HashMap::new()),
                cleanup: StdMutex::new(None),
                grace: self.options.shutdown_timeout,
            }),
            options: self.options,
            lifecycle: Mutex::new(()),
            events: StdMutex::new(Some(events_rx)),
            capabilities: StdMutex::new(None),
        }
    }
}

type NotificationHandler = Arc<dyn Fn(Option<Value>) + Send + Sync>;
type QueuedNotification = (String, Option<Value>);

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the session handle and its background tasks.
struct Shared {
    state: watch::Sender<SessionState>,
    pending: PendingTable,
    outbound: StdMutex<Option<mpsc::Sender<Vec<u8>>>>,
    /// First transport failure; once set, no new request is admitted.
    failure: StdMutex<Option<TransportError>>,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<SessionEvent>,
    handlers: RwLock<HashMap<String, Vec<NotificationHandler>>>,
    connection: Mutex<Option<Connection>>,
    /// Open documents and their last sent version.
    documents: Mutex<HashMap<Url, i32>>,
    /// Release of the process after a transport death.
    cleanup: StdMutex<Option<JoinHandle<()>>>,
    grace: Duration,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Moves `from -> to` atomically, or reports the state actually observed.
    fn transition(
        &self,
        from: SessionState,
        to: SessionState,
        operation: &str,
    ) -> Result<(), ProtocolError> {
        let mut observed = from;
        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                observed = *state;
                false
            }
        });

        if changed {
            debug!(%from, %to, "session state changed");
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedState {
                operation: operation.to_string(),
                state: observed,
            })
        }
    }

    fn force_state(&self, to: SessionState) {
        let from = self.state.send_replace(to);
        if from != to {
            debug!(%from, %to, "session state changed");
        }
    }

    fn admit(&self, method: &str, allowed: &[SessionState]) -> Result<(), SessionError> {
        let state = self.state();
        if !allowed.contains(&state) {
            return Err(ProtocolError::UnexpectedState {
                operation: format!("send {method}"),
                state,
            }
            .into());
        }
        if let Some(failure) = lock(&self.failure).clone() {
            return Err(failure.into());
        }
        Ok(())
    }

    fn sender(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        lock(&self.outbound).clone()
    }

    fn close_outbound(&self) {
        lock(&self.outbound).take();
    }

    /// Queues a message, waiting at most `timeout` for room in the queue.
    async fn send_message(&self, body: Vec<u8>, timeout: Duration) -> Result<(), SessionError> {
        let closed = || TransportError::WriteFailed("writer is closed".to_string());
        let sender = self.sender().ok_or_else(closed)?;
        sender
            .send_timeout(body, timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => SessionError::Timeout(timeout),
                SendTimeoutError::Closed(_) => closed().into(),
            })
    }

    /// Queues a message without waiting; used from sync contexts and the
    /// read loop, which must never block on the writer.
    fn try_send_message(&self, body: Vec<u8>, what: &str) {
        let Some(sender) = self.sender() else {
            debug!(what, "writer closed, message not sent");
            return;
        };
        if let Err(e) = sender.try_send(body) {
            warn!(what, error = %e, "failed to queue message");
        }
    }

    async fn notify(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        allowed: &[SessionState],
    ) -> Result<(), SessionError> {
        self.admit(method, allowed)?;
        let body = serde_json::to_vec(&OutgoingNotification::new(method, params))?;
        debug!(method, "sending notification");
        self.send_message(body, timeout).await
    }

    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        allowed: &[SessionState],
    ) -> Result<Value, SessionError> {
        self.admit(method, allowed)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_vec(&OutgoingRequest::new(id, method, params))?;
        let receiver = self.pending.register(id);

        // A failure or stop may have drained the table between the first
        // check and the registration.
        if let Err(e) = self.admit(method, allowed) {
            self.pending.cancel(id);
            return Err(e);
        }
        let _guard = PendingGuard { shared: self, id };

        debug!(id, method, "sending request");
        let exchange = async {
            self.send_message(body, timeout).await?;
            receiver.await.map_err(|_| SessionError::Cancelled)?
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(id, method, timeout_ms = timeout.as_millis(), "request timed out");
                Err(SessionError::Timeout(timeout))
            }
        }
    }

    fn dispatch(&self, body: &[u8], notifications: &mpsc::UnboundedSender<QueuedNotification>) {
        let message = match IncomingMessage::parse(body) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "discarding inbound frame");
                return;
            }
        };

        match message {
            IncomingMessage::Response { id, outcome } => {
                let outcome = outcome.map_err(|e| SessionError::Server {
                    code: e.code,
                    message: e.message,
                });
                let delivered = id
                    .as_u64()
                    .is_some_and(|numeric| self.pending.complete(numeric, outcome));
                if delivered {
                    debug!(%id, "response delivered");
                } else {
                    let error = ProtocolError::UnknownResponseId(id.to_string());
                    warn!(%error, "discarding response");
                }
            }
            IncomingMessage::Request { id, method } => {
                debug!(%id, method, "rejecting server request");
                match serde_json::to_vec(&OutgoingErrorResponse::method_not_found(id, &method)) {
                    Ok(body) => self.try_send_message(body, "method-not-found reply"),
                    Err(e) => warn!(method, error = %e, "failed to encode reply"),
                }
            }
            IncomingMessage::Notification { method, params } => {
                log_server_message(&method, params.as_ref());
                if notifications.send((method, params)).is_err() {
                    debug!("notification dispatcher is gone");
                }
            }
        }
    }

    fn handlers_for(&self, method: &str) -> Vec<NotificationHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
            .unwrap_or_default()
    }

    /// Records a transport failure and fails everything waiting on it.
    ///
    /// While running, this also ends the session: the process is released
    /// and a single [`SessionEvent::Died`] follows.
    fn transport_failed(self: &Arc<Self>, error: TransportError) {
        {
            let mut failure = lock(&self.failure);
            if failure.is_some() {
                return;
            }
            *failure = Some(error.clone());
        }

        let failed = self.pending.fail_all(|| error.clone().into());
        let mut cleanup = lock(&self.cleanup);
        let was_running = self.state.send_if_modified(|state| {
            if *state == SessionState::Running {
                *state = SessionState::Stopped;
                true
            } else {
                false
            }
        });

        if !was_running {
            debug!(error = %error, failed, state = %self.state(), "transport closed");
            return;
        }

        error!(error = %error, failed, "language server connection lost");
        self.close_outbound();

        let shared = Arc::clone(self);
        *cleanup = Some(tokio::spawn(async move {
            let connection = shared.connection.lock().await.take();
            if let Some(connection) = connection {
                connection.shutdown(shared.grace).await;
            }
            shared.documents.lock().await.clear();
            let _ = shared.events.send(SessionEvent::Died(error));
        }));
    }
}

/// Removes a pending entry when the waiting future goes away early, and tells
/// the server the result is no longer wanted.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.shared.pending.cancel(self.id) {
            return;
        }
        debug!(id = self.id, "cancelling request");
        let cancel = OutgoingNotification::new(Cancel::METHOD, json!({ "id": self.id }));
        match serde_json::to_vec(&cancel) {
            Ok(body) => self.shared.try_send_message(body, Cancel::METHOD),
            Err(e) => warn!(error = %e, "failed to encode cancellation"),
        }
    }
}

fn log_server_message(method: &str, params: Option<&Value>) {
    if method != LogMessage::METHOD && method != ShowMessage::METHOD {
        return;
    }
    let Some(Ok(params)) = params.map(|p| serde_json::from_value::<LogMessageParams>(p.clone()))
    else {
        return;
    };

    let message = params.message;
    if params.typ == MessageType::ERROR {
        error!(target: SERVER_LOG_TARGET, method, "{message}");
    } else if params.typ == MessageType::WARNING {
        warn!(target: SERVER_LOG_TARGET, method, "{message}");
    } else if params.typ == MessageType::INFO {
        info!(target: SERVER_LOG_TARGET, method, "{message}");
    } else {
        debug!(target: SERVER_LOG_TARGET, method, "{message}");
    }
}

async fn read_loop<R>(
    shared: Arc<Shared>,
    reader: FrameReader<R>,
    notifications: mpsc::UnboundedSender<QueuedNotification>,
) where
    R: AsyncRead + Unpin,
{
    let frames = reader.into_stream();
    futures::pin_mut!(frames);

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(body) => shared.dispatch(&body, &notifications),
            Err(e) => {
                shared.transport_failed(e);
                return;
            }
        }
    }

    shared.transport_failed(TransportError::ReadFailed(
        "language server closed its output".to_string(),
    ));
}

async fn write_loop<W>(
    shared: Arc<Shared>,
    mut writer: FrameWriter<W>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(body) = outbound.recv().await {
        if let Err(e) = writer.write_frame(&body).await {
            writer.close().await;
            shared.transport_failed(e);
            return;
        }
    }
    writer.close().await;
}

async fn dispatch_notifications(
    shared: Arc<Shared>,
    mut queue: mpsc::UnboundedReceiver<QueuedNotification>,
) {
    while let Some((method, params)) = queue.recv().await {
        let handlers = shared.handlers_for(&method);
        if handlers.is_empty() {
            debug!(method, "no handler for notification");
            continue;
        }
        for handler in handlers {
            handler(params.clone());
        }
    }
}

/// The live resources of a started session.
struct Connection {
    process: Option<ProcessHandle>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl Connection {
    /// Releases the process and waits for the background tasks.
    ///
    /// Returns `true` if the process exited on its own.
    async fn shutdown(self, grace: Duration) -> bool {
        let exited = match self.process {
            Some(process) => {
                let pid = process.id();
                let termination = process.terminate(grace).await;
                debug!(?pid, ?termination, "language server released");
                matches!(termination, Termination::Exited(_))
            }
            None => true,
        };

        let deadline = tokio::time::Instant::now() + grace;
        for task in [self.writer, self.reader, self.dispatcher] {
            let abort = task.abort_handle();
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                abort.abort();
            }
        }
        exited
    }

    fn abort(self) {
        self.reader.abort();
        self.writer.abort();
        self.dispatcher.abort();
        // `process` drops here; kill-on-drop reaps it.
    }
}

/// A client session with one language server process.
pub struct ClientSession {
    launch: LaunchConfig,
    selector: DocumentSelector,
    options: SessionOptions,
    shared: Arc<Shared>,
    /// Serializes `start` and `stop`.
    lifecycle: Mutex<()>,
    events: StdMutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    capabilities: StdMutex<Option<ServerCapabilities>>,
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("launch", &self.launch)
            .field("selector", &self.selector)
            .field("state", &self.state())
            .field("pending", &self.pending_requests())
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    /// Creates a builder for a session that will launch `launch`.
    pub fn builder(launch: LaunchConfig) -> ClientSessionBuilder {
        ClientSessionBuilder::new(launch)
    }

    /// Launches the server and performs the initialize handshake.
    ///
    /// Either the session ends up `Running`, or the process is released and
    /// the session is `Stopped`.
    ///
    /// ## Errors
    /// - [`SessionError::Launch`] if the process cannot be started
    /// - [`SessionError::Protocol`] if the session was already started
    /// - any request error from `initialize`
    pub async fn start(&self) -> Result<(), SessionError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.shared
            .transition(SessionState::Uninitialized, SessionState::Starting, "start")?;

        info!(program = %self.launch.program, args = ?self.launch.args, "starting language server");
        let LaunchedProcess {
            handle,
            stdin,
            stdout,
        } = match launcher::launch(&self.launch) {
            Ok(process) => process,
            Err(e) => {
                error!(program = %self.launch.program, error = %e, "failed to launch language server");
                self.shared.force_state(SessionState::Stopped);
                return Err(e.into());
            }
        };
        info!(pid = ?handle.id(), "language server process started");

        self.establish(Some(handle), stdout, stdin).await;
        self.initialize_or_teardown().await
    }

    #[cfg(test)]
    async fn start_with_io<R, W>(&self, reader: R, writer: W) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let _lifecycle = self.lifecycle.lock().await;
        self.shared
            .transition(SessionState::Uninitialized, SessionState::Starting, "start")?;
        self.establish(None, reader, writer).await;
        self.initialize_or_teardown().await
    }

    async fn establish<R, W>(&self, process: Option<ProcessHandle>, reader: R, writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (frame_reader, frame_writer) = Transport::new(reader, writer).into_parts();
        let (outbound_tx, outbound_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        *lock(&self.shared.outbound) = Some(outbound_tx);

        let connection = Connection {
            process,
            reader: tokio::spawn(read_loop(Arc::clone(&self.shared), frame_reader, notify_tx)),
            writer: tokio::spawn(write_loop(Arc::clone(&self.shared), frame_writer, outbound_rx)),
            dispatcher: tokio::spawn(dispatch_notifications(Arc::clone(&self.shared), notify_rx)),
        };
        *self.shared.connection.lock().await = Some(connection);
    }

    async fn initialize_or_teardown(&self) -> Result<(), SessionError> {
        match self.initialize().await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "language server initialization failed");
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn initialize(&self) -> Result<(), SessionError> {
        let params = serde_json::to_value(self.initialize_params())?;
        let result = self
            .shared
            .call(
                Initialize::METHOD,
                params,
                self.options.init_timeout,
                &[SessionState::Starting],
            )
            .await?;
        let result: InitializeResult = serde_json::from_value(result)?;

        if let Some(server) = &result.server_info {
            info!(name = %server.name, version = ?server.version, "language server initialized");
        }
        *lock(&self.capabilities) = Some(result.capabilities);

        self.shared
            .transition(SessionState::Starting, SessionState::Running, "finish initialization")?;
        self.shared
            .notify(
                Initialized::METHOD,
                serde_json::to_value(InitializedParams {})?,
                self.options.init_timeout,
                &[SessionState::Running],
            )
            .await
    }

    fn initialize_params(&self) -> InitializeParams {
        let folders = &self.options.workspace_folders;
        InitializeParams {
            process_id: Some(std::process::id()),
            workspace_folders: (!folders.is_empty()).then(|| folders.clone()),
            capabilities: ClientCapabilities {
                text_document: Some(TextDocumentClientCapabilities {
                    synchronization: Some(TextDocumentSyncClientCapabilities {
                        dynamic_registration: Some(false),
                        will_save: Some(false),
                        will_save_wait_until: Some(false),
                        did_save: Some(true),
                    }),
                    completion: Some(CompletionClientCapabilities {
                        dynamic_registration: Some(false),
                        ..Default::default()
                    }),
                    hover: Some(HoverClientCapabilities {
                        dynamic_registration: Some(false),
                        content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
                    }),
                    publish_diagnostics: Some(PublishDiagnosticsClientCapabilities::default()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            trace: Some(TraceValue::Off),
            client_info: Some(ClientInfo {
                name: self.options.client_name.clone(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            ..Default::default()
        }
    }

    /// Releases every resource and leaves the session `Stopped`.
    ///
    /// Returns `true` if the process exited on its own.
    async fn teardown(&self) -> bool {
        self.shared.close_outbound();
        let connection = self.shared.connection.lock().await.take();
        let exited = match connection {
            Some(connection) => connection.shutdown(self.options.shutdown_timeout).await,
            None => true,
        };

        let failed = self.shared.pending.fail_all(|| SessionError::Stopped);
        if failed > 0 {
            debug!(failed, "failed requests still pending at teardown");
        }
        self.shared.force_state(SessionState::Stopped);
        self.shared.documents.lock().await.clear();
        exited
    }

    /// Shuts the server down: `shutdown`, then `exit`, then waits for the
    /// process, killing it if it does not leave in time.
    ///
    /// Calling this on a session that is not running is a no-op that leaves
    /// it `Stopped`; if the transport died, it first waits for the process
    /// to be released. Completes in bounded time.
    pub async fn stop(&self) -> StopOutcome {
        let _lifecycle = self.lifecycle.lock().await;
        if self
            .shared
            .transition(SessionState::Running, SessionState::Stopping, "stop")
            .is_err()
        {
            self.shared.force_state(SessionState::Stopped);
            let cleanup = lock(&self.shared.cleanup).take();
            if let Some(cleanup) = cleanup {
                debug!("waiting for the dead server to be released");
                if let Err(e) = cleanup.await {
                    warn!(error = %e, "server release task failed");
                }
            }
            return StopOutcome::NotRunning;
        }

        info!("stopping language server");
        let grace = self.options.shutdown_timeout;
        let farewell = async {
            let acknowledged = match self
                .shared
                .call(Shutdown::METHOD, Value::Null, grace, &[SessionState::Stopping])
                .await
            {
                Ok(_) => true,
                Err(e) => {
                    warn!(error = %e, "shutdown request failed");
                    false
                }
            };

            if let Err(e) = self
                .shared
                .notify(Exit::METHOD, Value::Null, grace, &[SessionState::Stopping])
                .await
            {
                debug!(error = %e, "exit notification not sent");
            }
            acknowledged
        };

        // The teardown below must run even if the writer queue never drains.
        let acknowledged = tokio::time::timeout(grace * 2, farewell)
            .await
            .unwrap_or_else(|_| {
                warn!("server did not take shutdown and exit in time");
                false
            });

        let exited = self.teardown().await;
        let outcome = if acknowledged && exited {
            StopOutcome::Graceful
        } else {
            StopOutcome::Forced
        };
        info!(?outcome, "language server stopped");
        outcome
    }

    /// Sends a typed request and waits for its result.
    ///
    /// Dropping the returned future cancels the request.
    ///
    /// ## Errors
    /// - [`ProtocolError::UnexpectedState`] unless the session is running
    /// - [`SessionError::Timeout`] after the request timeout
    /// - [`SessionError::Server`] if the server answered with an error
    /// - [`SessionError::Transport`] or [`SessionError::Stopped`] if the
    ///   session ended first
    pub async fn request<R>(&self, params: R::Params) -> Result<R::Result, SessionError>
    where
        R: Request,
    {
        let params = serde_json::to_value(params)?;
        let result = self
            .shared
            .call(
                R::METHOD,
                params,
                self.options.request_timeout,
                &[SessionState::Running],
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Sends a typed notification.
    ///
    /// ## Errors
    /// - [`ProtocolError::UnexpectedState`] unless running
    /// - [`SessionError::Timeout`] if the writer queue stays full for the
    ///   request timeout
    /// - transport errors
    pub async fn notify<N>(&self, params: N::Params) -> Result<(), SessionError>
    where
        N: Notification,
    {
        let params = serde_json::to_value(params)?;
        self.shared
            .notify(
                N::METHOD,
                params,
                self.options.request_timeout,
                &[SessionState::Running],
            )
            .await
    }

    /// `textDocument/hover`.
    /// ## Errors
    /// See [`request`](Self::request).
    pub async fn hover(&self, uri: Url, position: Position) -> Result<Option<Hover>, SessionError> {
        self.request::<HoverRequest>(HoverParams {
            text_document_position_params: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier { uri },
                position,
            },
            work_done_progress_params: WorkDoneProgressParams::default(),
        })
        .await
    }

    /// `textDocument/completion`.
    /// ## Errors
    /// See [`request`](Self::request).
    pub async fn completion(
        &self,
        uri: Url,
        position: Position,
    ) -> Result<Option<CompletionResponse>, SessionError> {
        self.request::<Completion>(CompletionParams {
            text_document_position: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier { uri },
                position,
            },
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: None,
        })
        .await
    }

    /// Opens a document with version 1.
    ///
    /// An already open document has its text replaced instead.
    /// ## Errors
    /// See [`notify`](Self::notify).
    pub async fn did_open(
        &self,
        uri: Url,
        language_id: &str,
        text: String,
    ) -> Result<(), SessionError> {
        let mut documents = self.shared.documents.lock().await;
        if documents.contains_key(&uri) {
            return self.send_change(&mut documents, uri, text).await;
        }

        self.notify::<DidOpenTextDocument>(DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: uri.clone(),
                language_id: language_id.to_string(),
                version: 1,
                text,
            },
        })
        .await?;
        debug!(%uri, "document opened");
        documents.insert(uri, 1);
        Ok(())
    }

    /// Sends the full new text of a document.
    ///
    /// A document that is not open yet is opened instead.
    ///
    /// ## Errors
    /// See [`notify`](Self::notify).
    pub async fn did_change(
        &self,
        uri: Url,
        language_id: &str,
        text: String,
    ) -> Result<(), SessionError> {
        let mut documents = self.shared.documents.lock().await;
        if !documents.contains_key(&uri) {
            drop(documents);
            return self.did_open(uri, language_id, text).await;
        }
        self.send_change(&mut documents, uri, text).await
    }

    async fn send_change(
        &self,
        documents: &mut HashMap<Url, i32>,
        uri: Url,
        text: String,
    ) -> Result<(), SessionError> {
        let version = documents.get(&uri).map_or(1, |v| v + 1);
        self.notify::<DidChangeTextDocument>(DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: uri.clone(),
                version,
            },
            content_changes: vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text,
            }],
        })
        .await?;
        documents.insert(uri, version);
        Ok(())
    }

    /// `textDocument/didSave`; ignored for documents that are not open.
    /// ## Errors
    /// See [`notify`](Self::notify).
    pub async fn did_save(&self, uri: Url) -> Result<(), SessionError> {
        let documents = self.shared.documents.lock().await;
        if !documents.contains_key(&uri) {
            return Ok(());
        }
        self.notify::<DidSaveTextDocument>(DidSaveTextDocumentParams {
            text_document: TextDocumentIdentifier { uri },
            text: None,
        })
        .await
    }

    /// `textDocument/didClose`; ignored for documents that are not open.
    /// ## Errors
    /// See [`notify`](Self::notify).
    pub async fn did_close(&self, uri: Url) -> Result<(), SessionError> {
        let mut documents = self.shared.documents.lock().await;
        if documents.remove(&uri).is_none() {
            return Ok(());
        }
        debug!(%uri, "document closed");
        self.notify::<DidCloseTextDocument>(DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier { uri },
        })
        .await
    }

    /// Version last sent for an open document.
    pub async fn document_version(&self, uri: &Url) -> Option<i32> {
        self.shared.documents.lock().await.get(uri).copied()
    }

    /// Registers a handler for a server notification.
    ///
    /// Handlers run on the dispatcher task in arrival order; they should not
    /// block.
    pub fn on_notification(
        &self,
        method: impl Into<String>,
        handler: impl Fn(Option<Value>) + Send + Sync + 'static,
    ) {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(method.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Registers a handler receiving decoded notification params.
    pub fn on_notification_typed<N>(&self, handler: impl Fn(N::Params) + Send + Sync + 'static)
    where
        N: Notification,
    {
        self.on_notification(N::METHOD, move |params| {
            match serde_json::from_value::<N::Params>(params.unwrap_or(Value::Null)) {
                Ok(params) => handler(params),
                Err(e) => warn!(method = N::METHOD, error = %e, "failed to decode notification"),
            }
        });
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Takes the event receiver. Returns `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        lock(&self.events).take()
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// Capabilities announced by the server during initialization.
    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        lock(&self.capabilities).clone()
    }

    /// OS process id of the running server.
    pub async fn process_id(&self) -> Option<u32> {
        self.shared
            .connection
            .lock()
            .await
            .as_ref()
            .and_then(|c| c.process.as_ref())
            .and_then(ProcessHandle::id)
    }

    /// The document selector this session serves.
    pub fn selector(&self) -> &DocumentSelector {
        &self.selector
    }

    /// The launch configuration this session was built with.
    pub fn launch_config(&self) -> &LaunchConfig {
        &self.launch
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.shared.close_outbound();
        if let Ok(mut connection) = self.shared.connection.try_lock() {
            if let Some(connection) = connection.take() {
                connection.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use lsp_types::HoverContents;
    use lsp_types::notification::PublishDiagnostics;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    use super::*;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// The server end of an in-memory session.
    struct FakeServer {
        reader: FrameReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        async fn recv(&mut self) -> Value {
            let frame = tokio::time::timeout(TEST_TIMEOUT, self.reader.read_frame())
                .await
                .expect("timed out waiting for a frame")
                .expect("read failed")
                .expect("client closed the stream");
            serde_json::from_slice(&frame).unwrap()
        }

        async fn expect(&mut self, method: &str) -> Value {
            let message = self.recv().await;
            assert_eq!(message["method"], method, "unexpected message: {message}");
            message
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.unwrap();
            self.writer.flush().await.unwrap();
        }

        async fn send(&mut self, message: Value) {
            let body = serde_json::to_vec(&message).unwrap();
            let header = format!("Content-Length: {}\r\n\r\n", body.len());
            self.send_raw(header.as_bytes()).await;
            self.send_raw(&body).await;
        }

        async fn reply(&mut self, id: &Value, result: Value) {
            self.send(json!({"jsonrpc": "2.0", "id": id, "result": result}))
                .await;
        }

        async fn handshake(&mut self) {
            let initialize = self.expect("initialize").await;
            assert_eq!(initialize["params"]["clientInfo"]["name"], "jusuplusplus");
            self.reply(
                &initialize["id"],
                json!({
                    "capabilities": {"hoverProvider": true, "textDocumentSync": 1},
                    "serverInfo": {"name": "jusu-server"}
                }),
            )
            .await;
            self.expect("initialized").await;
        }

        async fn accept_shutdown(mut self) {
            let shutdown = self.expect("shutdown").await;
            self.reply(&shutdown["id"], Value::Null).await;
            self.expect("exit").await;
        }
    }

    fn session() -> ClientSession {
        ClientSession::builder(LaunchConfig::new("jusu-test-server"))
            .request_timeout(TEST_TIMEOUT)
            .shutdown_timeout(Duration::from_millis(500))
            .build()
    }

    fn connect() -> (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>, FakeServer) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        (
            client_read,
            client_write,
            FakeServer {
                reader: FrameReader::new(server_read),
                writer: server_write,
            },
        )
    }

    async fn running() -> (ClientSession, FakeServer) {
        let session = session();
        let (reader, writer, mut server) = connect();
        let (started, ()) = tokio::join!(session.start_with_io(reader, writer), server.handshake());
        started.unwrap();
        assert_eq!(session.state(), SessionState::Running);
        (session, server)
    }

    fn hover_params(uri: &str) -> HoverParams {
        HoverParams {
            text_document_position_params: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier {
                    uri: Url::parse(uri).unwrap(),
                },
                position: Position::new(0, 0),
            },
            work_done_progress_params: WorkDoneProgressParams::default(),
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Uninitialized.to_string(), "uninitialized");
        assert_eq!(SessionState::Stopping.to_string(), "stopping");
    }

    #[test]
    fn test_builder_defaults() {
        let session = ClientSession::builder(LaunchConfig::new("python")).build();
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert_eq!(session.options.shutdown_timeout, Duration::from_secs(2));
        assert!(session.selector().matches("file", "jusu"));
        assert!(session.take_events().is_some());
        assert!(session.take_events().is_none());
    }

    #[tokio::test]
    async fn test_start_then_stop_is_graceful() {
        let (session, server) = running().await;
        assert!(session.capabilities().unwrap().hover_provider.is_some());

        let (outcome, ()) = tokio::join!(session.stop(), server.accept_shutdown());
        assert_eq!(outcome, StopOutcome::Graceful);
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (session, server) = running().await;
        let (first, ()) = tokio::join!(session.stop(), server.accept_shutdown());
        assert_eq!(first, StopOutcome::Graceful);

        assert_eq!(session.stop().await, StopOutcome::NotRunning);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_terminal() {
        let session = session();
        assert_eq!(session.stop().await, StopOutcome::NotRunning);
        assert_eq!(session.state(), SessionState::Stopped);

        let err = session.start().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::UnexpectedState {
                state: SessionState::Stopped,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (session, _server) = running().await;
        let err = session.start().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::UnexpectedState {
                state: SessionState::Running,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_launch_failure_leaves_session_stopped() {
        let session = ClientSession::builder(LaunchConfig::new("missing-binary")).build();
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, SessionError::Launch(_)));
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.process_id().await.is_none());
    }

    #[tokio::test]
    async fn test_request_before_running_is_rejected() {
        let session = session();
        let err = session
            .request::<HoverRequest>(hover_params("file:///a.jusu"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::UnexpectedState {
                state: SessionState::Uninitialized,
                ..
            })
        ));
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_init_error_response_stops_session() {
        let session = session();
        let (reader, writer, mut server) = connect();
        let server_side = async {
            let initialize = server.expect("initialize").await;
            server
                .send(json!({
                    "jsonrpc": "2.0",
                    "id": initialize["id"],
                    "error": {"code": -32603, "message": "boom"}
                }))
                .await;
        };
        let (started, ()) = tokio::join!(session.start_with_io(reader, writer), server_side);

        assert!(matches!(
            started.unwrap_err(),
            SessionError::Server { code: -32603, .. }
        ));
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_responses_matched_by_id_out_of_order() {
        let (session, mut server) = running().await;

        let server_side = async {
            let first = server.expect("textDocument/hover").await;
            let second = server.expect("textDocument/hover").await;
            for request in [&second, &first] {
                let uri = request["params"]["textDocument"]["uri"].clone();
                server
                    .reply(&request["id"], json!({"contents": uri}))
                    .await;
            }
        };
        let (a, b, ()) = tokio::join!(
            session.request::<HoverRequest>(hover_params("file:///a.jusu")),
            session.request::<HoverRequest>(hover_params("file:///b.jusu")),
            server_side
        );

        let contents = |hover: Option<Hover>| match hover.unwrap().contents {
            HoverContents::Scalar(lsp_types::MarkedString::String(s)) => s,
            other => panic!("unexpected contents: {other:?}"),
        };
        assert_eq!(contents(a.unwrap()), "file:///a.jusu");
        assert_eq!(contents(b.unwrap()), "file:///b.jusu");
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_unknown_response_id_is_discarded() {
        let (session, mut server) = running().await;
        server.reply(&json!(9999), json!({"stray": true})).await;

        let (hover, ()) = tokio::join!(
            session.request::<HoverRequest>(hover_params("file:///a.jusu")),
            async {
                let request = server.expect("textDocument/hover").await;
                server.reply(&request["id"], Value::Null).await;
            }
        );
        assert_eq!(hover.unwrap(), None);
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn test_server_error_response() {
        let (session, mut server) = running().await;
        let (result, ()) = tokio::join!(
            session.request::<HoverRequest>(hover_params("file:///a.jusu")),
            async {
                let request = server.expect("textDocument/hover").await;
                server
                    .send(json!({
                        "jsonrpc": "2.0",
                        "id": request["id"],
                        "error": {"code": -32602, "message": "bad position"}
                    }))
                    .await;
            }
        );
        assert!(matches!(
            result.unwrap_err(),
            SessionError::Server { code: -32602, ref message } if message == "bad position"
        ));
    }

    #[tokio::test]
    async fn test_notifications_dispatched_in_order() {
        let (session, mut server) = running().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.on_notification_typed::<PublishDiagnostics>(move |params| {
            let _ = tx.send(params.uri.to_string());
        });

        for name in ["a", "b", "c"] {
            server
                .send(json!({
                    "jsonrpc": "2.0",
                    "method": "textDocument/publishDiagnostics",
                    "params": {"uri": format!("file:///{name}.jusu"), "diagnostics": []}
                }))
                .await;
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(
            seen,
            vec!["file:///a.jusu", "file:///b.jusu", "file:///c.jusu"]
        );
    }

    #[tokio::test]
    async fn test_server_request_answered_with_method_not_found() {
        let (_session, mut server) = running().await;
        server
            .send(json!({
                "jsonrpc": "2.0",
                "id": "reg-1",
                "method": "client/registerCapability",
                "params": {"registrations": []}
            }))
            .await;

        let reply = server.recv().await;
        assert_eq!(reply["id"], "reg-1");
        assert_eq!(reply["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn test_request_timeout_sends_cancel() {
        let session = ClientSession::builder(LaunchConfig::new("jusu-test-server"))
            .request_timeout(Duration::from_millis(100))
            .build();
        let (reader, writer, mut server) = connect();
        let (started, ()) = tokio::join!(session.start_with_io(reader, writer), server.handshake());
        started.unwrap();

        let result = session
            .request::<HoverRequest>(hover_params("file:///a.jusu"))
            .await;
        assert!(matches!(result, Err(SessionError::Timeout(_))));
        assert_eq!(session.pending_requests(), 0);

        let request = server.expect("textDocument/hover").await;
        let cancel = server.expect("$/cancelRequest").await;
        assert_eq!(cancel["params"]["id"], request["id"]);

        // The late answer is an unknown id now and changes nothing.
        server.reply(&request["id"], Value::Null).await;
        tokio::task::yield_now().await;
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn test_dropping_request_cancels_it() {
        let (session, mut server) = running().await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            session.request::<HoverRequest>(hover_params("file:///a.jusu")),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(session.pending_requests(), 0);

        let request = server.expect("textDocument/hover").await;
        let cancel = server.expect("$/cancelRequest").await;
        assert_eq!(cancel["params"]["id"], request["id"]);
    }

    #[tokio::test]
    async fn test_transport_death_emits_single_died_event() {
        let (session, mut server) = running().await;
        let mut events = session.take_events().unwrap();
        let mut state = session.watch_state();

        server
            .send(json!({
                "jsonrpc": "2.0",
                "method": "window/logMessage",
                "params": {"type": 3, "message": "about to exit"}
            }))
            .await;
        drop(server);

        let event = tokio::time::timeout(TEST_TIMEOUT, events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SessionEvent::Died(TransportError::ReadFailed(_))));
        state
            .wait_for(|s| *s == SessionState::Stopped)
            .await
            .unwrap();
        assert!(events.try_recv().is_err());
        assert_eq!(session.stop().await, StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn test_malformed_frame_kills_session() {
        let (session, mut server) = running().await;
        let mut events = session.take_events().unwrap();

        server.send_raw(b"Content-Length: nope\r\n\r\n").await;

        let event = tokio::time::timeout(TEST_TIMEOUT, events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            SessionEvent::Died(TransportError::MalformedFrame(_))
        ));
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_transport_death_fails_pending_requests() {
        let (session, mut server) = running().await;

        let (result, ()) = tokio::join!(
            session.request::<HoverRequest>(hover_params("file:///a.jusu")),
            async {
                server.expect("textDocument/hover").await;
                drop(server);
            }
        );
        assert!(matches!(
            result,
            Err(SessionError::Transport(TransportError::ReadFailed(_)))
        ));
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_stop_without_shutdown_reply_is_forced() {
        let (session, mut server) = running().await;

        let (outcome, ()) = tokio::join!(session.stop(), async {
            server.expect("shutdown").await;
            // Never answer; keep the stream open until the client gives up.
            let _ = server.reader.read_frame().await;
        });
        assert_eq!(outcome, StopOutcome::Forced);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_rejects_new_requests() {
        let (session, mut server) = running().await;

        let (outcome, rejected) = tokio::join!(session.stop(), async {
            let shutdown = server.expect("shutdown").await;
            let rejected = session
                .request::<HoverRequest>(hover_params("file:///a.jusu"))
                .await;
            server.reply(&shutdown["id"], Value::Null).await;
            server.expect("exit").await;
            rejected
        });
        assert_eq!(outcome, StopOutcome::Graceful);
        assert!(matches!(
            rejected,
            Err(SessionError::Protocol(ProtocolError::UnexpectedState {
                state: SessionState::Stopping,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_document_sync_versions() {
        let (session, mut server) = running().await;
        let uri = Url::parse("file:///w/main.jusu").unwrap();

        session
            .did_change(uri.clone(), "jusu", "say 1".to_string())
            .await
            .unwrap();
        let open = server.expect("textDocument/didOpen").await;
        assert_eq!(open["params"]["textDocument"]["version"], 1);
        assert_eq!(open["params"]["textDocument"]["languageId"], "jusu");

        session
            .did_change(uri.clone(), "jusu", "say 2".to_string())
            .await
            .unwrap();
        let change = server.expect("textDocument/didChange").await;
        assert_eq!(change["params"]["textDocument"]["version"], 2);
        assert_eq!(change["params"]["contentChanges"][0]["text"], "say 2");
        assert_eq!(session.document_version(&uri).await, Some(2));

        session.did_save(uri.clone()).await.unwrap();
        server.expect("textDocument/didSave").await;

        session.did_close(uri.clone()).await.unwrap();
        server.expect("textDocument/didClose").await;
        assert_eq!(session.document_version(&uri).await, None);

        // Closing again is a no-op; the next frame is the hover below.
        session.did_close(uri.clone()).await.unwrap();
        let (_, ()) = tokio::join!(session.hover(uri, Position::new(0, 0)), async {
            let request = server.expect("textDocument/hover").await;
            server.reply(&request["id"], Value::Null).await;
        });
    }

    #[tokio::test]
    async fn test_stop_is_bounded_when_server_stops_reading() {
        let (session, server) = running().await;
        let session = Arc::new(session);
        let uri = Url::parse("file:///w/big.jusu").unwrap();
        let text = "say 1\n".repeat(200 * 1024 / 6);

        // Enough text to fill the pipe and the writer queue many times over.
        let flooding = Arc::clone(&session);
        let flood = tokio::spawn(async move {
            for _ in 0..200 {
                if flooding.did_change(uri.clone(), "jusu", text.clone()).await.is_err() {
                    return true;
                }
            }
            false
        });
        tokio::time::sleep(Duration::from_millis(500)).await;

        let outcome = tokio::time::timeout(TEST_TIMEOUT, session.stop())
            .await
            .expect("stop should finish in bounded time");
        assert_eq!(outcome, StopOutcome::Forced);
        assert_eq!(session.state(), SessionState::Stopped);

        let rejected = tokio::time::timeout(TEST_TIMEOUT, flood).await.unwrap().unwrap();
        assert!(rejected, "a blocked didChange should fail once the session stops");
        drop(server);
    }

    #[tokio::test]
    async fn test_stop_after_transport_death_waits_for_release() {
        let (session, mut server) = running().await;
        let mut events = session.take_events().unwrap();
        let mut state = session.watch_state();

        server.send_raw(b"Content-Length: nope\r\n\r\n").await;
        state
            .wait_for(|s| *s == SessionState::Stopped)
            .await
            .unwrap();

        assert_eq!(session.stop().await, StopOutcome::NotRunning);
        // The release finished before stop returned.
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::Died(TransportError::MalformedFrame(_)))
        ));
        assert!(session.process_id().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_fails_requests_still_in_flight() {
        let session = ClientSession::builder(LaunchConfig::new("jusu-test-server"))
            .request_timeout(Duration::from_secs(60))
            .shutdown_timeout(Duration::from_millis(200))
            .build();
        let (reader, writer, mut server) = connect();
        let (started, ()) = tokio::join!(session.start_with_io(reader, writer), server.handshake());
        started.unwrap();

        let begun = tokio::time::Instant::now();
        let (hover, outcome) = tokio::join!(
            session.request::<HoverRequest>(hover_params("file:///a.jusu")),
            async {
                server.expect("textDocument/hover").await;
                // Neither the hover nor the shutdown is ever answered.
                session.stop().await
            }
        );

        assert_eq!(outcome, StopOutcome::Forced);
        assert!(matches!(hover, Err(SessionError::Stopped)));
        assert!(begun.elapsed() < Duration::from_secs(3));
        assert_eq!(session.pending_requests(), 0);
        assert_eq!(session.state(), SessionState::Stopped);
        drop(server);
    }
}
