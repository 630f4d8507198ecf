use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

#[derive(Debug)]
pub struct ShutdownController {
    forced: AtomicU8,
}

#[derive(Debug, Clone, Copy)]
pub enum ShutdownEvent {
    Graceful,
    Immediate,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            forced: AtomicU8::new(0),
        }
    }

    pub fn bump_forced(&self) -> u8 {
        self.forced.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Listen for SIGINT or SIGTERM; the first signal requests a graceful drain, a second
/// escalates to immediate exit.
pub fn spawn_signal_handler(shutdown: Arc<ShutdownController>, shutdown_tx: mpsc::UnboundedSender<ShutdownEvent>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing a SIGTERM handler should not fail");

        loop {
            #[cfg(unix)]
            let signaled = tokio::select! {
                res = tokio::signal::ctrl_c() => res.is_ok(),
                _ = sigterm.recv() => true,
            };
            #[cfg(not(unix))]
            let signaled = tokio::signal::ctrl_c().await.is_ok();

            if !signaled {
                return;
            }
            let n = shutdown.bump_forced();
            if n == 1 {
                let _ = shutdown_tx.send(ShutdownEvent::Graceful);
            } else {
                let _ = shutdown_tx.send(ShutdownEvent::Immediate);
                return;
            }
        }
    });
}
