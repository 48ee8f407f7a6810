//! Activation and deactivation of the language client.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::lsp::{ClientSession, SessionEvent, StopOutcome};

use super::host::{DocumentEvent, DocumentEventKind, Host};

enum Slot {
    Idle,
    /// `start()` in progress; deactivations requested meanwhile wait here.
    Activating {
        deactivations: Vec<oneshot::Sender<StopOutcome>>,
    },
    Active {
        session: Arc<ClientSession>,
        watcher: JoinHandle<()>,
    },
}

/// Holder for the one session an extension load owns.
pub struct Extension {
    slot: Mutex<Slot>,
}

impl Default for Extension {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = match &*self.lock() {
            Slot::Idle => "idle",
            Slot::Activating { .. } => "activating",
            Slot::Active { .. } => "active",
        };
        f.debug_struct("Extension").field("slot", &slot).finish()
    }
}

impl Extension {
    /// Creates an extension with no session.
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Idle),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Leaves `Activating`, returning the deactivations requested meanwhile.
    fn settle(&self, next: Slot) -> Vec<oneshot::Sender<StopOutcome>> {
        match std::mem::replace(&mut *self.lock(), next) {
            Slot::Activating { deactivations } => deactivations,
            Slot::Idle | Slot::Active { .. } => Vec::new(),
        }
    }

    /// Builds the session from the host's settings and starts it.
    ///
    /// Failures are reported through [`Host::report_error`] as well as
    /// returned; the extension is left idle so activation can be retried.
    ///
    /// If [`deactivate`](Self::deactivate) is called before the server is
    /// up, the new session is stopped as soon as it starts and the pending
    /// deactivation resolves with the outcome.
    ///
    /// ## Errors
    /// - [`Error::AlreadyActive`] if a session is held or being started
    /// - [`Error::Config`] for invalid settings
    /// - [`Error::Session`] if the server fails to start
    /// - [`Error::Deactivated`] if deactivation was requested meanwhile
    pub async fn activate(&self, host: Arc<dyn Host>) -> Result<Arc<ClientSession>> {
        {
            let mut slot = self.lock();
            if !matches!(*slot, Slot::Idle) {
                return Err(Error::AlreadyActive);
            }
            *slot = Slot::Activating {
                deactivations: Vec::new(),
            };
        }
        let _activation = ActivationGuard(self);

        let session = match Self::start_session(host.as_ref()).await {
            Ok(session) => session,
            Err(e) => {
                let waiters = self.settle(Slot::Idle);
                host.report_error(&format!("language server failed to start: {}", failure_reason(&e)));
                resolve(waiters, StopOutcome::NotRunning);
                return Err(e);
            }
        };

        let deactivation_requested = {
            let mut slot = self.lock();
            let requested = matches!(
                &*slot,
                Slot::Activating { deactivations } if !deactivations.is_empty()
            );
            if !requested {
                let watcher = tokio::spawn(forward_events(session.take_events(), Arc::clone(&host)));
                *slot = Slot::Active {
                    session: Arc::clone(&session),
                    watcher,
                };
            }
            requested
        };
        if !deactivation_requested {
            return Ok(session);
        }

        info!("deactivated during activation, stopping the new session");
        let outcome = session.stop().await;
        resolve(self.settle(Slot::Idle), outcome);
        Err(Error::Deactivated)
    }

    async fn start_session(host: &dyn Host) -> Result<Arc<ClientSession>> {
        let settings = host.settings();
        settings
            .validate()
            .map_err(|e| Error::Config(format!("{e:#}")))?;

        let script = host.as_absolute_path(&settings.server_script);
        let session = Arc::new(
            ClientSession::builder(settings.launch_config(&script))
                .selector(settings.selector())
                .options(settings.session_options())
                .build(),
        );
        host.register_handlers(&session);

        info!(script = %script.display(), "activating language client");
        session.start().await?;
        Ok(session)
    }

    /// Stops the session, if any.
    ///
    /// The returned future resolves once teardown is complete, immediately
    /// when nothing was started. During activation it resolves once the
    /// session being started has been stopped again.
    pub fn deactivate(&self) -> BoxFuture<'static, StopOutcome> {
        let mut slot = self.lock();
        if let Slot::Activating { deactivations } = &mut *slot {
            let (tx, rx) = oneshot::channel();
            deactivations.push(tx);
            debug!("deactivation deferred until activation finishes");
            return async move { rx.await.unwrap_or(StopOutcome::NotRunning) }.boxed();
        }

        let previous = std::mem::replace(&mut *slot, Slot::Idle);
        drop(slot);
        match previous {
            Slot::Active { session, watcher } => async move {
                let outcome = session.stop().await;
                watcher.abort();
                debug!(?outcome, "language client deactivated");
                outcome
            }
            .boxed(),
            Slot::Idle | Slot::Activating { .. } => future::ready(StopOutcome::NotRunning).boxed(),
        }
    }

    /// Forwards a document event if the selector accepts it.
    ///
    /// Returns whether the event was forwarded.
    ///
    /// ## Errors
    /// [`Error::Session`] if the session is not running or the notification
    /// cannot be sent.
    pub async fn route(&self, event: DocumentEvent) -> Result<bool> {
        let Some(session) = self.session() else {
            return Ok(false);
        };
        if !session
            .selector()
            .matches(event.uri.scheme(), &event.language_id)
        {
            debug!(uri = %event.uri, language_id = %event.language_id, "document not served");
            return Ok(false);
        }

        let DocumentEvent {
            uri,
            language_id,
            kind,
        } = event;
        match kind {
            DocumentEventKind::Opened { text } => session.did_open(uri, &language_id, text).await?,
            DocumentEventKind::Changed { text } => {
                session.did_change(uri, &language_id, text).await?;
            }
            DocumentEventKind::Saved => session.did_save(uri).await?,
            DocumentEventKind::Closed => session.did_close(uri).await?,
        }
        Ok(true)
    }

    /// The active session.
    pub fn session(&self) -> Option<Arc<ClientSession>> {
        match &*self.lock() {
            Slot::Active { session, .. } => Some(Arc::clone(session)),
            Slot::Idle | Slot::Activating { .. } => None,
        }
    }

    /// Whether a session is held.
    pub fn is_active(&self) -> bool {
        matches!(*self.lock(), Slot::Active { .. })
    }
}

/// Returns an abandoned activation to `Idle`, releasing anyone waiting on it.
struct ActivationGuard<'a>(&'a Extension);

impl Drop for ActivationGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.0.lock();
        if matches!(*slot, Slot::Activating { .. }) {
            *slot = Slot::Idle;
        }
    }
}

fn resolve(waiters: Vec<oneshot::Sender<StopOutcome>>, outcome: StopOutcome) {
    for waiter in waiters {
        let _ = waiter.send(outcome);
    }
}

fn failure_reason(error: &Error) -> String {
    match error {
        Error::Session(inner) => inner.to_string(),
        other => other.to_string(),
    }
}

async fn forward_events(events: Option<mpsc::UnboundedReceiver<SessionEvent>>, host: Arc<dyn Host>) {
    let Some(mut events) = events else {
        return;
    };
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Died(reason) => {
                error!(%reason, "language server died");
                host.report_error(&format!("language server stopped unexpectedly: {reason}"));
            }
        }
    }
}

static EXTENSION: Extension = Extension::new();

/// The process-wide extension instance.
pub fn extension() -> &'static Extension {
    &EXTENSION
}

/// Activates the process-wide extension.
///
/// ## Errors
/// See [`Extension::activate`].
pub async fn activate(host: Arc<dyn Host>) -> Result<()> {
    EXTENSION.activate(host).await.map(|_| ())
}

/// Deactivates the process-wide extension.
pub fn deactivate() -> BoxFuture<'static, StopOutcome> {
    EXTENSION.deactivate()
}

/// Routes a document event through the process-wide extension.
///
/// ## Errors
/// See [`Extension::route`].
pub async fn route(event: DocumentEvent) -> Result<bool> {
    EXTENSION.route(event).await
}
