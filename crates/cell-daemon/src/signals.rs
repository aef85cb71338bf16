//! Signal handling for graceful daemon shutdown.
//!
//! SIGTERM and SIGINT flip the shutdown watch observed by the scan loop and
//! the pollers. SIGHUP asks for a configuration reload.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Signal types that the daemon handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM - Graceful termination request.
    Terminate,
    /// SIGINT - Interrupt (Ctrl+C).
    Interrupt,
    /// SIGHUP - Reload the counter settings.
    Hangup,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
            SignalKind::Hangup => write!(f, "SIGHUP"),
        }
    }
}

/// Shared state for signal handling.
#[derive(Debug)]
pub struct SignalState {
    shutdown: watch::Sender<bool>,
    reloads: mpsc::Sender<()>,
    /// Count of signals received (for diagnostics).
    signal_count: AtomicU32,
}

impl SignalState {
    /// Create the state and the receiving end of reload requests.
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (shutdown, _) = watch::channel(false);
        let (reloads, reload_rx) = mpsc::channel(1);
        let state = Self {
            shutdown,
            reloads,
            signal_count: AtomicU32::new(0),
        };
        (state, reload_rx)
    }

    /// Receiver that turns true once shutdown is requested.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Check if shutdown has been requested.
    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Get the total number of signals received.
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::Relaxed)
    }

    /// Act on a received signal.
    pub fn dispatch(&self, kind: SignalKind) {
        let count = self.signal_count.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(signal = %kind, count, "Signal received");
        match kind {
            SignalKind::Terminate | SignalKind::Interrupt => {
                if self.shutdown_requested() {
                    warn!(signal = %kind, "Shutdown already in progress");
                } else {
                    info!(signal = %kind, "Shutdown requested");
                }
                self.request_shutdown();
            }
            SignalKind::Hangup => {
                info!("Configuration reload requested");
                // A reload already queued covers this one.
                let _ = self.reloads.try_send(());
            }
        }
    }
}

/// Forwards process signals into a [`SignalState`].
#[derive(Debug)]
pub struct SignalHandler {
    state: Arc<SignalState>,
    reloads: Option<mpsc::Receiver<()>>,
    task: JoinHandle<()>,
}

impl SignalHandler {
    /// Register the handlers. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the OS error when a handler cannot be registered.
    pub fn install() -> std::io::Result<Self> {
        let (state, reloads) = SignalState::new();
        let state = Arc::new(state);
        let task = tokio::spawn(listen(Arc::clone(&state), Streams::register()?));
        Ok(Self {
            state,
            reloads: Some(reloads),
            task,
        })
    }

    /// Shared signal state.
    pub fn state(&self) -> &Arc<SignalState> {
        &self.state
    }

    /// Reload requests; `None` once taken.
    pub fn take_reloads(&mut self) -> Option<mpsc::Receiver<()>> {
        self.reloads.take()
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(unix)]
struct Streams {
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Streams {
    fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind as Unix};
        Ok(Self {
            terminate: signal(Unix::terminate())?,
            interrupt: signal(Unix::interrupt())?,
            hangup: signal(Unix::hangup())?,
        })
    }

    async fn next(&mut self) -> Option<SignalKind> {
        tokio::select! {
            s = self.terminate.recv() => s.map(|()| SignalKind::Terminate),
            s = self.interrupt.recv() => s.map(|()| SignalKind::Interrupt),
            s = self.hangup.recv() => s.map(|()| SignalKind::Hangup),
        }
    }
}

#[cfg(not(unix))]
struct Streams;

#[cfg(not(unix))]
impl Streams {
    #[allow(clippy::unnecessary_wraps)]
    fn register() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> Option<SignalKind> {
        tokio::signal::ctrl_c().await.ok().map(|()| SignalKind::Interrupt)
    }
}

async fn listen(state: Arc<SignalState>, mut streams: Streams) {
    while let Some(kind) = streams.next().await {
        state.dispatch(kind);
    }
    debug!("Signal streams closed");
}
