use crate::*;
use chrono::Utc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// A century. Longer periods are treated as this.
pub const MAX_RETENTION_DAYS: i64 = 36_500;

/// How long sealed blobs are kept before the sweeper destroys them
#[derive(Clone, Debug)]
pub struct RetentionPolicy {
    pub enabled: bool,
    pub retention: chrono::Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy {
            enabled: true,
            retention: chrono::Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }
}

impl RetentionPolicy {
    pub fn days(days: i64) -> Self {
        RetentionPolicy {
            enabled: true,
            retention: chrono::Duration::days(days.clamp(0, MAX_RETENTION_DAYS)),
        }
    }

    /// Securely delete every blob older than the retention period
    pub fn sweep(&self, store: &dyn BlobStore) -> Result<usize, Error> {
        if !self.enabled {
            debug!("blob retention disabled, nothing swept");
            return Ok(0);
        }

        let cutoff = match Utc::now().checked_sub_signed(self.retention) {
            Some(cutoff) => cutoff,
            None => {
                debug!("retention period reaches before the epoch, nothing swept");
                return Ok(0);
            }
        };
        let purged = store.purge_older_than(cutoff)?;
        if purged > 0 {
            info!("retention sweep deleted {} blob(s) older than {}", purged, cutoff);
        }
        Ok(purged)
    }
}

/// Background thread running a retention sweep at a fixed interval
pub struct RetentionSweeper {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RetentionSweeper {
    pub fn spawn(store: Arc<dyn BlobStore>, policy: RetentionPolicy, interval: Duration) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();

        let handle = thread::spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = policy.sweep(store.as_ref()) {
                        error!("retention sweep failed: {}", e);
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });

        RetentionSweeper {
            stop: Some(stop),
            handle: Some(handle),
        }
    }

    /// Stop the sweeper and wait for it to finish
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("retention sweeper thread panicked");
            }
        }
    }
}

impl Drop for RetentionSweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
