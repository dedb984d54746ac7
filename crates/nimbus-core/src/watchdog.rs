//! Fail-fast deadline enforcement.
//!
//! Some operations must finish in bounded time or the process is in a state
//! it cannot recover from: a mount whose in-flight filesystem calls never
//! drain would otherwise hang forever. [`Watchdog::arm`] returns a guard;
//! if the guard is still alive when its deadline passes, the watchdog logs
//! the offending operation and invokes its abort handler.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info_span};

/// Called when a deadline passes. Receives the label of the expired guard.
pub type AbortHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// The default handler: abort the process.
pub fn abort_process() -> AbortHandler {
    Arc::new(|label| {
        error!(label, "Watchdog deadline exceeded, aborting");
        std::process::abort();
    })
}

enum Command {
    Arm {
        id: u64,
        label: String,
        deadline: Instant,
    },
    Disarm {
        id: u64,
    },
    Stop,
}

/// Aborts the process when armed operations overrun their deadline.
pub struct Watchdog {
    commands: Sender<Command>,
    next_id: AtomicU64,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Starts a watchdog that calls `abort` on expiry.
    pub fn new(abort: AbortHandler) -> Self {
        let (commands, rx) = unbounded();
        let span = info_span!("watchdog");
        let thread = thread::Builder::new()
            .name("nimbus-watchdog".to_string())
            .spawn(move || {
                let _entered = span.enter();
                watch(&rx, &abort);
            })
            .expect("failed to spawn watchdog thread");

        Self {
            commands,
            next_id: AtomicU64::new(1),
            thread: Some(thread),
        }
    }

    /// Arms a deadline `timeout` from now.
    pub fn arm(&self, label: impl Into<String>, timeout: Duration) -> WatchdogGuard<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let label = label.into();
        debug!(id, label = %label, timeout_ms = timeout.as_millis(), "Watchdog armed");
        let _ = self.commands.send(Command::Arm {
            id,
            label,
            deadline: Instant::now() + timeout,
        });
        WatchdogGuard { watchdog: self, id }
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new(abort_process())
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Disarms its deadline when dropped.
#[must_use = "dropping the guard disarms the watchdog immediately"]
pub struct WatchdogGuard<'a> {
    watchdog: &'a Watchdog,
    id: u64,
}

impl Drop for WatchdogGuard<'_> {
    fn drop(&mut self) {
        let _ = self.watchdog.commands.send(Command::Disarm { id: self.id });
    }
}

fn watch(rx: &Receiver<Command>, abort: &AbortHandler) {
    let mut armed: HashMap<u64, (String, Instant)> = HashMap::new();

    loop {
        let next = armed.values().map(|(_, deadline)| *deadline).min();
        let received = match next {
            Some(deadline) => rx.recv_deadline(deadline),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(Command::Arm {
                id,
                label,
                deadline,
            }) => {
                armed.insert(id, (label, deadline));
            }
            Ok(Command::Disarm { id }) => {
                // Disarmed too late still counts as exceeded.
                if let Some((label, deadline)) = armed.remove(&id)
                    && deadline <= Instant::now()
                {
                    error!(id, label = %label, "Watchdog deadline exceeded");
                    abort(&label);
                }
            }
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                let now = Instant::now();
                let expired: Vec<u64> = armed
                    .iter()
                    .filter(|(_, (_, deadline))| *deadline <= now)
                    .map(|(id, _)| *id)
                    .collect();
                for id in expired {
                    if let Some((label, _)) = armed.remove(&id) {
                        error!(id, label = %label, "Watchdog deadline exceeded");
                        abort(&label);
                    }
                }
            }
        }
    }

    debug!("Watchdog stopped");
}
