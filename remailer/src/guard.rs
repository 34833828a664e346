//! Close Guard
//!
//! A shared close signal for one connection. Every pending read selects on
//! it, so closing the connection, or a watchdog deadline passing, fails the
//! read with [`MixError::ConnectionClosed`] instead of leaving it blocked.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{MixError, MixResult};

/// Close signal shared by the tasks of one connection
#[derive(Debug, Clone)]
pub struct CloseGuard {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for CloseGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseGuard {
    /// Open guard
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self { sender: Arc::new(sender), receiver }
    }

    /// Close; idempotent
    pub fn close(&self) {
        self.sender.send_replace(true);
    }

    /// Whether [`CloseGuard::close`] has been called
    pub fn is_closed(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once closed
    pub async fn closed(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Close after `deadline` unless closed first. Must be called inside a
    /// tokio runtime.
    pub fn arm(&self, deadline: Duration) -> JoinHandle<()> {
        let guard = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {
                    debug!(?deadline, "watchdog closing connection");
                    guard.close();
                }
                _ = guard.closed() => {}
            }
        })
    }

    /// Run `fut` unless the guard closes first
    pub async fn run<T, F>(&self, fut: F) -> MixResult<T>
    where
        F: Future<Output = MixResult<T>>,
    {
        if self.is_closed() {
            return Err(MixError::ConnectionClosed);
        }
        tokio::select! {
            result = fut => result,
            _ = self.closed() => Err(MixError::ConnectionClosed),
        }
    }

    /// [`CloseGuard::run`] bounded by `timeout`
    pub async fn run_with_timeout<T, F>(&self, timeout: Duration, fut: F) -> MixResult<T>
    where
        F: Future<Output = MixResult<T>>,
    {
        match tokio::time::timeout(timeout, self.run(fut)).await {
            Ok(result) => result,
            Err(_) => Err(MixError::Timeout),
        }
    }
}
