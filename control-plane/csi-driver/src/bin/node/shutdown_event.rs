use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::warn;

/// Shutdown event handler, which completes on SIGINT or SIGTERM.
pub(crate) struct Shutdown {
    sig_int: Signal,
    sig_term: Signal,
}

impl Shutdown {
    /// Register the signal handlers.
    pub(crate) fn new() -> std::io::Result<Self> {
        Ok(Self {
            sig_int: signal(SignalKind::interrupt())?,
            sig_term: signal(SignalKind::terminate())?,
        })
    }

    /// Returns the signal which triggered the shutdown.
    pub(crate) async fn wait_sig(&mut self) -> SignalKind {
        let kind = tokio::select! {
            _ = self.sig_int.recv() => SignalKind::interrupt(),
            _ = self.sig_term.recv() => SignalKind::terminate(),
        };
        warn!(signal = ?kind, "Signalled");
        kind
    }

    /// Helper async fn over `Self::wait_sig` with no return.
    pub(crate) async fn wait(mut self) {
        self.wait_sig().await;
    }
}
