//! Key Pool
//!
//! Pre-generated 16-byte hop secrets. A background thread keeps a bounded
//! channel full; consumers take one key at a time and block, up to a
//! timeout, while the pool is empty.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use libmix_crypto::random_bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{MixError, MixResult, SECRET_LEN};

/// How long [`SecretSource::secret`] waits on an empty pool
pub const DEFAULT_TAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Where hop secrets come from
pub trait SecretSource: Send + Sync {
    /// One fresh secret
    fn secret(&self) -> MixResult<[u8; SECRET_LEN]>;
}

/// Secrets straight from the OS generator
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSecrets;

impl SecretSource for OsSecrets {
    fn secret(&self) -> MixResult<[u8; SECRET_LEN]> {
        Ok(random_bytes::<SECRET_LEN>()?)
    }
}

/// Bounded pool of pre-generated secrets
#[derive(Debug)]
pub struct KeyPool {
    receiver: Mutex<Option<Receiver<[u8; SECRET_LEN]>>>,
    shutdown: Arc<AtomicBool>,
    producer: Option<JoinHandle<()>>,
    capacity: usize,
}

impl KeyPool {
    /// Start a pool holding up to `capacity` keys
    pub fn new(capacity: usize) -> MixResult<Self> {
        if capacity == 0 {
            return Err(MixError::InvalidConfiguration("key pool capacity must be positive".into()));
        }
        let (tx, rx) = sync_channel(capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);

        let producer = std::thread::Builder::new()
            .name("key-pool".into())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let key = match random_bytes::<SECRET_LEN>() {
                        Ok(key) => key,
                        Err(e) => {
                            warn!(error = %e, "key pool producer stopped");
                            return;
                        }
                    };
                    // blocks while full; fails once the pool is dropped
                    if tx.send(key).is_err() {
                        return;
                    }
                }
            })
            .map_err(|e| MixError::Internal(format!("cannot start key pool: {}", e)))?;

        debug!(capacity, "key pool started");
        Ok(Self {
            receiver: Mutex::new(Some(rx)),
            shutdown,
            producer: Some(producer),
            capacity,
        })
    }

    /// Pool capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take one key, waiting up to `timeout`
    pub fn take(&self, timeout: Duration) -> MixResult<[u8; SECRET_LEN]> {
        let receiver = self.receiver.lock();
        let rx = receiver.as_ref().ok_or(MixError::ChannelClosed)?;
        match rx.recv_timeout(timeout) {
            Ok(key) => Ok(key),
            Err(RecvTimeoutError::Timeout) => Err(MixError::KeyPoolExhausted),
            Err(RecvTimeoutError::Disconnected) => Err(MixError::ChannelClosed),
        }
    }
}

impl SecretSource for KeyPool {
    fn secret(&self) -> MixResult<[u8; SECRET_LEN]> {
        self.take(DEFAULT_TAKE_TIMEOUT)
    }
}

impl Drop for KeyPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // unblock a producer waiting on a full channel
        self.receiver.lock().take();
        if let Some(handle) = self.producer.take() {
            let _ = handle.join();
        }
    }
}
