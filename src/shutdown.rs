//! Process signal handling.
//!
//! Two separate paths:
//! - hangup, interrupt, terminate and quit cancel the run's token, which
//!   every task watches for an orderly shutdown
//! - abort kills the process on the spot, skipping all cleanup

use std::io;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Cancel `token` when the first graceful-termination signal arrives.
///
/// Signal handlers are registered before this returns, so a signal sent
/// right after the call is not lost.
pub fn cancel_on_termination(token: CancellationToken) -> io::Result<()> {
    let termination = termination_signal()?;
    tokio::spawn(async move {
        let name = termination.await;
        info!(signal = name, "Termination requested");
        token.cancel();
    });
    Ok(())
}

/// Abort the process when SIGABRT arrives.
#[cfg(unix)]
pub fn abort_on_sigabrt() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut abort = signal(SignalKind::from_raw(libc::SIGABRT))?;
    tokio::spawn(async move {
        if abort.recv().await.is_some() {
            error!("ABORT! ABORT! ABORT!");
            std::process::abort();
        }
    });
    Ok(())
}

#[cfg(not(unix))]
pub fn abort_on_sigabrt() -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn termination_signal() -> io::Result<impl std::future::Future<Output = &'static str>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    Ok(async move {
        tokio::select! {
            _ = hangup.recv() => "SIGHUP",
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = quit.recv() => "SIGQUIT",
        }
    })
}

#[cfg(not(unix))]
fn termination_signal() -> io::Result<impl std::future::Future<Output = &'static str>> {
    Ok(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to wait for Ctrl-C");
        }
        "Ctrl-C"
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sighup_cancels_token() {
        let token = CancellationToken::new();
        cancel_on_termination(token.clone()).unwrap();

        // SAFETY: raising a signal this process has a handler for.
        unsafe {
            libc::raise(libc::SIGHUP);
        }

        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .expect("token not cancelled by SIGHUP");
    }
}
