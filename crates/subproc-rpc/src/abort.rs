//! Stop the runner when the process is told to quit.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Install handlers for SIGINT, SIGTERM, SIGHUP and SIGQUIT, then wait in a
/// task and run `on_abort` once a signal arrives.
///
/// Handlers are registered before this returns, so a signal delivered right
/// after the call is never handled by the default action. The task gives up
/// without acting when `until` is cancelled.
pub(crate) fn spawn_abort_listener<F>(
    on_abort: F,
    until: CancellationToken,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let mut signals = AbortSignals::install()?;
    Ok(tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = until.cancelled() => {}
            signal = signals.recv() => {
                tracing::warn!(signal, "Received abort signal, stopping runner");
                on_abort();
            }
        }
    }))
}

#[cfg(unix)]
struct AbortSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl AbortSignals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.hangup.recv() => "SIGHUP",
            _ = self.quit.recv() => "SIGQUIT",
        }
    }
}

#[cfg(not(unix))]
struct AbortSignals;

#[cfg(not(unix))]
impl AbortSignals {
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "ctrl-c",
            Err(e) => {
                tracing::warn!(error = %e, "Failed to wait for ctrl-c");
                std::future::pending().await
            }
        }
    }
}
