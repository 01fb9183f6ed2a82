//! Session keepalive.
//!
//! Writes an SSH_MSG_IGNORE through the session at a fixed interval so idle
//! connections are not dropped by middleboxes. Every write goes through the
//! normal send path, which is also where elapsed rekey limits are checked.

use crate::ssh::error::Result;
use crate::ssh::message::Message;
use rand::RngCore;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

/// Handle to a running keepalive loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct KeepaliveTask {
    interval: Duration,
    sent: Arc<AtomicU64>,
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl KeepaliveTask {
    /// Creates a stopped task.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            sent: Arc::new(AtomicU64::new(0)),
            stop: None,
            handle: None,
        }
    }

    /// Interval between keepalives.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Keepalives written so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Spawns the loop. `send` runs once per tick; the loop ends on the first
    /// error (the session is gone or failing) or when stopped.
    ///
    /// The first keepalive goes out one interval after start. Ticks missed
    /// while a send was blocked (e.g. during a key exchange) are not
    /// replayed.
    pub fn start<F, Fut>(&mut self, send: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.stop();
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let interval = self.interval;
        let sent = Arc::clone(&self.sent);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(?interval, "Keepalive started");

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }
                match send().await {
                    Ok(()) => {
                        let n = sent.fetch_add(1, Ordering::Relaxed) + 1;
                        trace!(sent = n, "Keepalive sent");
                    }
                    Err(e) => {
                        warn!(error = %e, "Keepalive failed, stopping");
                        break;
                    }
                }
            }
            debug!("Keepalive stopped");
        });

        self.stop = Some(stop_tx);
        self.handle = Some(handle);
    }

    /// Stops the loop, aborting a send in progress.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Whether the loop is still alive.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for KeepaliveTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds an SSH_MSG_IGNORE carrying `data_len` random bytes.
///
/// ```rust
/// use kestrel_proto::ssh::message::Message;
/// use kestrel_proto::ssh::session::keepalive_message;
///
/// match keepalive_message(16) {
///     Message::Ignore(data) => assert_eq!(data.len(), 16),
///     _ => unreachable!(),
/// }
/// ```
pub fn keepalive_message(data_len: usize) -> Message {
    let mut data = vec![0u8; data_len];
    rand::thread_rng().fill_bytes(&mut data);
    Message::Ignore(data)
}
