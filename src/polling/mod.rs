//! Generic recurring polling primitive.
//!
//! A [`PollingHandler`] runs an async producer on an interval and hands each
//! result to a consumer callback. Every iteration claims a fresh cycle id;
//! the consumer only runs if the handler was not stopped and no newer cycle
//! was claimed while the producer was in flight. This is what makes
//! stop-then-in-flight-completion safe: the stale result is discarded
//! instead of being applied.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

enum Control {
    Skip(oneshot::Sender<()>),
    Stop,
}

struct Shared {
    stopped: AtomicBool,
    /// Id of the cycle currently allowed to apply its result. Stopping
    /// replaces it so an in-flight cycle can never pass the guard again.
    current_cycle: Mutex<Uuid>,
    interval_ms: AtomicU64,
}

/// Recurring task that polls a producer and feeds a consumer.
pub struct PollingHandler {
    shared: Arc<Shared>,
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

impl PollingHandler {
    /// Starts polling immediately: the first producer run happens right
    /// away, subsequent runs are scheduled `interval` after the previous
    /// cycle finished.
    pub fn new<T, P, Fut, C>(mut producer: P, interval: Duration, mut consumer: C) -> Self
    where
        T: Send + 'static,
        P: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        C: FnMut(T) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            stopped: AtomicBool::new(false),
            current_cycle: Mutex::new(Uuid::new_v4()),
            interval_ms: AtomicU64::new(interval.as_millis() as u64),
        });
        let (control, mut control_rx) = mpsc::unbounded_channel();

        let loop_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            let shared = loop_shared;
            let mut pending_acks: Vec<oneshot::Sender<()>> = Vec::new();

            loop {
                if shared.stopped.load(Ordering::SeqCst) {
                    break;
                }

                let cycle = {
                    let mut current = shared.current_cycle.lock().expect("cycle lock poisoned");
                    *current = Uuid::new_v4();
                    *current
                };

                match producer().await {
                    Ok(value) => {
                        let still_current = !shared.stopped.load(Ordering::SeqCst)
                            && *shared.current_cycle.lock().expect("cycle lock poisoned") == cycle;
                        if still_current {
                            consumer(value);
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "polling producer failed, skipping cycle");
                    }
                }

                for ack in pending_acks.drain(..) {
                    let _ = ack.send(());
                }

                if shared.stopped.load(Ordering::SeqCst) {
                    break;
                }

                let interval =
                    Duration::from_millis(shared.interval_ms.load(Ordering::SeqCst));
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    cmd = control_rx.recv() => match cmd {
                        Some(Control::Skip(ack)) => pending_acks.push(ack),
                        Some(Control::Stop) | None => break,
                    }
                }
            }
        });

        PollingHandler {
            shared,
            control,
            task,
        }
    }

    /// Stops the handler and invalidates the in-flight cycle so that a
    /// pending producer result is discarded instead of applied. Safe to call
    /// from inside the consumer callback.
    pub fn stop_polling(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        *self
            .shared
            .current_cycle
            .lock()
            .expect("cycle lock poisoned") = Uuid::new_v4();
        let _ = self.control.send(Control::Stop);
    }

    /// Forces an immediate cycle without waiting for the timer. Resolves
    /// once that cycle's consumer has run (or the handler was stopped).
    pub async fn skip_waiting(&self) {
        let (ack, done) = oneshot::channel();
        if self.control.send(Control::Skip(ack)).is_err() {
            return;
        }
        let _ = done.await;
    }

    /// Applies a new interval to all subsequent waits; the wait currently in
    /// progress still uses the old interval.
    pub fn change_polling_interval(&self, interval: Duration) {
        self.shared
            .interval_ms
            .store(interval.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Drop for PollingHandler {
    fn drop(&mut self) {
        self.stop_polling();
        self.task.abort();
    }
}
